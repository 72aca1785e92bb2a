use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

/// Instances are numbered tcpbanner_1 through tcpbanner_<maxnum>.
const MAX_BANNERS: i64 = 10;

/// Captured payloads are clipped before logging.
const DATA_LIMIT: usize = 255;

/// Starts one listener per enabled tcpbanner_N instance. Default ports run
/// from 8001 upward.
pub fn start(config: &Config, logger: Logger) -> Vec<JoinHandle<()>> {
    let maxnum = config.int_or("tcpbanner.maxnum", MAX_BANNERS);
    let mut handles = Vec::new();
    for id in 1..=maxnum {
        let service = format!("tcpbanner_{}", id);
        if !config.enabled(&service) {
            continue;
        }
        let settings = Arc::new(BannerSettings::from_config(config, id));
        let addr = bind_addr(config, &service, 8000u16.saturating_add(id as u16));
        let logger = logger.clone();
        handles.push(serve_tcp(service, addr, None, move || {
            Box::new(BannerHandler::new(settings.clone(), logger.clone()))
        }));
    }
    handles
}

struct BannerSettings {
    id: String,
    accept_banner: Vec<u8>,
    send_banner: Vec<u8>,
    alert_string_enabled: bool,
    alert_string: Vec<u8>,
    keep_alive_enabled: bool,
    keep_alive_secret: Vec<u8>,
}

impl BannerSettings {
    fn from_config(config: &Config, id: i64) -> BannerSettings {
        let key = |name: &str| format!("tcpbanner_{}.{}", id, name);
        BannerSettings {
            id: id.to_string(),
            accept_banner: unescape(&config.str_or(&key("initbanner"), "")),
            send_banner: unescape(&config.str_or(&key("datareceivedbanner"), "")),
            alert_string_enabled: config.bool_or(&key("alertstring.enabled"), false),
            alert_string: unescape(&config.str_or(&key("alertstring.string"), "")),
            keep_alive_enabled: config.bool_or(&key("keep_alive.enabled"), false),
            keep_alive_secret: unescape(&config.str_or(&key("keep_alive_secret"), "")),
        }
    }
}

/// Banner strings come from the config file with literal backslash escapes
/// for line endings.
fn unescape(value: &str) -> Vec<u8> {
    value.replace("\\n", "\n").replace("\\r", "\r").into_bytes()
}

struct BannerHandler {
    settings: Arc<BannerSettings>,
    logger: Logger,
    /// Set once the keep-alive secret arrives. From then on the peer is a
    /// known prober and its traffic stops generating alerts.
    alert_muted: bool,
}

impl BannerHandler {
    fn new(settings: Arc<BannerSettings>, logger: Logger) -> BannerHandler {
        BannerHandler {
            settings,
            logger,
            alert_muted: false,
        }
    }

    fn event(&self, logtype: LogType, conn: &Conn, function: &str) -> Event {
        Event::with_endpoints(logtype, &conn.endpoints)
            .data("FUNCTION", function)
            .data("BANNER_ID", self.settings.id.as_str())
    }
}

#[async_trait]
impl ProtocolHandler for BannerHandler {
    async fn on_connect(&mut self, conn: &mut Conn) {
        let banner: String = String::from_utf8_lossy(&self.settings.accept_banner)
            .chars()
            .take(DATA_LIMIT)
            .collect();
        if self.settings.keep_alive_enabled {
            self.logger.log(
                self.event(LogType::TCP_BANNER_KEEP_ALIVE_CONNECTION_MADE, conn, "CONNECTION_MADE")
                    .data("DATA", banner.as_str()),
            );
        } else if !self.settings.alert_string_enabled {
            // With an alert string configured, a bare connection is not
            // interesting yet.
            self.logger.log(
                self.event(LogType::TCP_BANNER_CONNECTION_MADE, conn, "CONNECTION_MADE")
                    .data("DATA", banner.as_str()),
            );
        }
        conn.send(&self.settings.accept_banner).await;
    }

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        if self.alert_muted {
            conn.send(&self.settings.send_banner).await;
            return;
        }
        let data = &data[..data.len().min(DATA_LIMIT)];
        let text = String::from_utf8_lossy(rstrip(data)).into_owned();

        if self.settings.keep_alive_enabled {
            let secret = &self.settings.keep_alive_secret;
            if !secret.is_empty() && contains(data, secret) {
                self.alert_muted = true;
                self.logger.log(
                    self.event(LogType::TCP_BANNER_KEEP_ALIVE_SECRET_RECEIVED, conn, "DATA_RECEIVED")
                        .data("DATA", text.as_str())
                        .data("SECRET_STRING", String::from_utf8_lossy(secret).into_owned()),
                );
            } else {
                self.logger.log(
                    self.event(LogType::TCP_BANNER_KEEP_ALIVE_DATA_RECEIVED, conn, "DATA_RECEIVED")
                        .data("DATA", text.as_str()),
                );
            }
        } else if self.settings.alert_string_enabled {
            if contains(data, &self.settings.alert_string) {
                self.logger.log(
                    self.event(LogType::TCP_BANNER_DATA_RECEIVED, conn, "DATA_RECEIVED")
                        .data("DATA", text.as_str())
                        .data(
                            "ALERT_STRING",
                            String::from_utf8_lossy(&self.settings.alert_string).into_owned(),
                        ),
                );
            }
        } else {
            self.logger.log(
                self.event(LogType::TCP_BANNER_DATA_RECEIVED, conn, "DATA_RECEIVED")
                    .data("DATA", text.as_str()),
            );
        }
        conn.send(&self.settings.send_banner).await;
    }
}

fn rstrip(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &data[..end]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
