use clap::Parser;
use tokio::task::JoinHandle;

use decoyd::app::App;
use decoyd::config::Config;
use decoyd::event::{Event, LogType};
use decoyd::logger::{CidrRange, Logger, LoggerSettings};
use decoyd::{modules, sink};

#[tokio::main]
async fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::default())
        .filter_level(log::LevelFilter::Info)
        .filter_module("russh", log::LevelFilter::Warn)
        .init();

    let app = App::parse();

    let path = match app.config.clone().or_else(Config::locate) {
        Some(path) => path,
        None => {
            log::error!(
                "No config file found; tried ./decoyd.toml, the user config directory and /etc/decoyd/decoyd.toml"
            );
            log::error!("Write one and enable at least one service; every service is off by default");
            std::process::exit(1);
        }
    };
    log::info!("Loading config from {}", path.display());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };

    let problems = config.check_values();
    if !problems.is_empty() {
        for problem in &problems {
            log::error!("config {}", problem);
        }
        log::error!("Refusing to start with {} bad setting(s)", problems.len());
        std::process::exit(1);
    }
    if app.validate {
        println!("{}: configuration is valid", path.display());
        return;
    }

    let mut settings = LoggerSettings::new(config.node_id());
    for entry in config.str_list("ip.ignorelist") {
        match CidrRange::parse(&entry) {
            Ok(range) => settings.ignore_ips.push(range),
            Err(err) => log::warn!("Skipping ignore list entry: {}", err),
        }
    }
    settings.ignore_logtypes = config
        .int_list("logtype.ignorelist")
        .into_iter()
        .filter_map(|n| u32::try_from(n).ok())
        .collect();
    settings.honeycreds = config.honeycreds();

    let sinks = match sink::build_sinks(&config.sink_specs()) {
        Ok(sinks) => sinks,
        Err(err) => {
            log::error!("config {}", err);
            std::process::exit(1);
        }
    };
    let (logger, dispatch) = Logger::start(settings, sinks);

    logger.log(Event::new(LogType::BOOT).data("msg", "decoyd running!!!"));

    let tasks = start_services(&config, &logger);
    if tasks.is_empty() {
        log::warn!("No services are enabled; nothing will ever be logged beyond the boot event");
    } else {
        log::info!("{} service task(s) running", tasks.len());
    }

    wait_for_shutdown().await;

    log::info!("Shutting down");
    for task in &tasks {
        task.abort();
    }
    logger.shutdown().await;
    if let Err(err) = dispatch.await {
        log::error!("Log dispatch ended badly: {:?}", err);
    }
    log::info!("decoyd shut down");
}

fn start_services(config: &Config, logger: &Logger) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    let single: &[(&str, fn(&Config, Logger) -> JoinHandle<()>)] = &[
        ("ftp", modules::ftp::start),
        ("ssh", modules::ssh::start),
        ("telnet", modules::telnet::start),
        ("http", modules::http::start),
        ("httpproxy", modules::httpproxy::start),
        ("mysql", modules::mysql::start),
        ("mssql", modules::mssql::start),
        ("redis", modules::redis::start),
        ("vnc", modules::vnc::start),
        ("rdp", modules::rdp::start),
        ("sip", modules::sip::start),
        ("snmp", modules::snmp::start),
        ("ntp", modules::ntp::start),
        ("tftp", modules::tftp::start),
        ("git", modules::git::start),
        ("smb", modules::smb::start),
    ];
    for (service, start) in single {
        if config.enabled(service) {
            tasks.push(start(config, logger.clone()));
        }
    }
    if config.enabled("tcpbanner") {
        tasks.extend(modules::tcpbanner::start(config, logger.clone()));
    }
    tasks
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to listen for SIGTERM");
        tokio::select! {
            _ = sigterm.recv() => log::info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => log::info!("Interrupt received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        log::info!("Interrupt received");
    }
}
