use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::honeycred::HoneyCred;
use crate::logger::CidrRange;

/// Services that own a single listener and accept a `<name>.port` override.
const SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 8023),
    ("http", 80),
    ("httpproxy", 8443),
    ("mysql", 3306),
    ("mssql", 1433),
    ("redis", 6379),
    ("vnc", 5900),
    ("rdp", 3389),
    ("sip", 5060),
    ("snmp", 161),
    ("ntp", 123),
    ("tftp", 69),
    ("git", 9418),
];

/// Banner listeners are named tcpbanner_1 through tcpbanner_10.
pub const TCP_BANNER_MAX_INSTANCES: u32 = 10;

pub fn tcp_banner_default_port(instance: u32) -> u16 {
    8000u16.saturating_add(instance as u16)
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigLoadError::Io(err) => write!(f, "could not read config file: {}", err),
            ConfigLoadError::Parse(err) => write!(f, "could not parse config file: {}", err),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

impl From<std::io::Error> for ConfigLoadError {
    fn from(err: std::io::Error) -> ConfigLoadError {
        ConfigLoadError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigLoadError {
    fn from(err: toml::de::Error) -> ConfigLoadError {
        ConfigLoadError::Parse(err)
    }
}

/// One rejected setting, reported with the key that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> ConfigError {
        ConfigError {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.key, self.message)
    }
}

/// Parsed configuration tree. Settings are addressed by dotted keys
/// ("ftp.port") and every getter carries the service default, so a minimal
/// file that only flips `enabled` switches is valid.
pub struct Config {
    root: toml::Value,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, ConfigLoadError> {
        let root: toml::Value = toml::from_str(text)?;
        Ok(Config { root })
    }

    pub fn load(path: &Path) -> Result<Config, ConfigLoadError> {
        let text = std::fs::read_to_string(path)?;
        Config::parse(&text)
    }

    /// First existing config file, checked working directory first, then the
    /// user config dir, then the system path.
    pub fn locate() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from("decoyd.toml")];
        if let Some(dirs) = ProjectDirs::from("", "", "decoyd") {
            candidates.push(dirs.config_dir().join("decoyd.toml"));
        }
        candidates.push(PathBuf::from("/etc/decoyd/decoyd.toml"));
        candidates.into_iter().find(|path| path.exists())
    }

    fn lookup(&self, key: &str) -> Option<&toml::Value> {
        let mut current = &self.root;
        for part in key.split('.') {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    pub fn opt_str(&self, key: &str) -> Option<String> {
        self.lookup(key)
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.opt_str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.lookup(key)
            .and_then(|value| value.as_bool())
            .unwrap_or(default)
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.lookup(key)
            .and_then(|value| value.as_integer())
            .unwrap_or(default)
    }

    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.lookup(key).and_then(|value| value.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn int_list(&self, key: &str) -> Vec<i64> {
        match self.lookup(key).and_then(|value| value.as_array()) {
            Some(items) => items.iter().filter_map(|value| value.as_integer()).collect(),
            None => Vec::new(),
        }
    }

    pub fn enabled(&self, service: &str) -> bool {
        self.bool_or(&format!("{}.enabled", service), false)
    }

    pub fn port(&self, service: &str, default: u16) -> u16 {
        let value = self.int_or(&format!("{}.port", service), i64::from(default));
        u16::try_from(value).unwrap_or(default)
    }

    /// The empty default means all interfaces.
    pub fn listen_addr(&self) -> IpAddr {
        let raw = self.str_or("device.listen_addr", "");
        if raw.is_empty() {
            return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        }
        raw.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn node_id(&self) -> String {
        self.str_or("device.node_id", "decoyd-1")
    }

    /// Sink definitions from the [[logger.sinks]] array, in file order.
    pub fn sink_specs(&self) -> Vec<toml::value::Table> {
        match self.lookup("logger.sinks").and_then(|value| value.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|value| value.as_table().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn honeycreds(&self) -> Vec<HoneyCred> {
        match self.lookup("honeycreds").and_then(|value| value.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|value| value.as_table())
                .map(|table| HoneyCred {
                    username: table
                        .get("username")
                        .and_then(|value| value.as_str())
                        .map(str::to_string),
                    password: table
                        .get("password")
                        .and_then(|value| value.as_str())
                        .map(str::to_string),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Validates every recognized setting and returns all problems at once,
    /// so a bad file gets fixed in one round.
    pub fn check_values(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if let Some(table) = self.root.as_table() {
            for (section, value) in table {
                let Some(entries) = value.as_table() else {
                    continue;
                };
                if let Some(enabled) = entries.get("enabled") {
                    if enabled.as_bool().is_none() {
                        errors.push(ConfigError::new(
                            format!("{}.enabled", section),
                            "must be a boolean",
                        ));
                    }
                }
                if let Some(port) = entries.get("port") {
                    match port.as_integer() {
                        Some(n) if (1..=65535).contains(&n) => {}
                        _ => errors.push(ConfigError::new(
                            format!("{}.port", section),
                            "must be an integer between 1 and 65535",
                        )),
                    }
                }
            }
        }

        if let Some(name) = self.opt_str("device.name") {
            if !matches_pattern(&name, r"^[A-Za-z0-9+#_-]{1,100}$") {
                errors.push(ConfigError::new(
                    "device.name",
                    "must be 1 to 100 characters from A-Za-z0-9+-#_",
                ));
            }
        }
        if let Some(desc) = self.opt_str("device.desc") {
            if !matches_pattern(&desc, r"^[A-Za-z0-9+#_ -]{1,100}$") {
                errors.push(ConfigError::new(
                    "device.desc",
                    "must be 1 to 100 characters from A-Za-z0-9+-#_ and space",
                ));
            }
        }
        if let Some(addr) = self.opt_str("device.listen_addr") {
            if !addr.is_empty() && addr.parse::<IpAddr>().is_err() {
                errors.push(ConfigError::new("device.listen_addr", "is not an IP address"));
            }
        }
        if let Some(version) = self.opt_str("ssh.version") {
            if version.len() > 253 || !version.starts_with("SSH-") {
                errors.push(ConfigError::new(
                    "ssh.version",
                    "must start with SSH- and be at most 253 characters",
                ));
            }
        }
        if let Some(banner) = self.opt_str("mysql.banner") {
            if !matches_pattern(&banner, r"^[3456]\.[-_~.+\w]+$") {
                errors.push(ConfigError::new(
                    "mysql.banner",
                    "does not look like a MySQL version string",
                ));
            }
        }
        if let Some(version) = self.opt_str("mssql.version") {
            if !crate::modules::mssql::VERSIONS.contains(&version.as_str()) {
                errors.push(ConfigError::new(
                    "mssql.version",
                    "must be one of 2008R2, 2012 or 2014",
                ));
            }
        }
        if let Some(skin) = self.opt_str("http.skin") {
            if !crate::modules::http::SKINS.contains(&skin.as_str()) {
                errors.push(ConfigError::new(
                    "http.skin",
                    format!("must be one of {}", crate::modules::http::SKINS.join(", ")),
                ));
            }
        }
        if let Some(skin) = self.opt_str("httpproxy.skin") {
            if !crate::modules::httpproxy::SKINS.contains(&skin.as_str()) {
                errors.push(ConfigError::new(
                    "httpproxy.skin",
                    format!("must be one of {}", crate::modules::httpproxy::SKINS.join(", ")),
                ));
            }
        }

        for entry in self.str_list("ip.ignorelist") {
            if CidrRange::parse(&entry).is_err() {
                errors.push(ConfigError::new(
                    "ip.ignorelist",
                    format!("invalid network {:?}", entry),
                ));
            }
        }

        for (index, spec) in self.sink_specs().iter().enumerate() {
            if let Err(message) = crate::sink::validate_spec(spec) {
                errors.push(ConfigError::new(format!("logger.sinks[{}]", index), message));
            }
        }

        if let Some(items) = self.lookup("honeycreds").and_then(|value| value.as_array()) {
            for (index, item) in items.iter().enumerate() {
                let usable = item
                    .as_table()
                    .map(|table| {
                        table.get("username").and_then(|v| v.as_str()).is_some()
                            || table.get("password").and_then(|v| v.as_str()).is_some()
                    })
                    .unwrap_or(false);
                if !usable {
                    errors.push(ConfigError::new(
                        format!("honeycreds[{}]", index),
                        "needs a username or password string",
                    ));
                }
            }
        }

        let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for (service, default_port) in SERVICES {
            if self.enabled(service) {
                by_port
                    .entry(self.port(service, *default_port))
                    .or_default()
                    .push((*service).to_string());
            }
        }
        if self.enabled("tcpbanner") {
            for instance in 1..=TCP_BANNER_MAX_INSTANCES {
                let name = format!("tcpbanner_{}", instance);
                if self.bool_or(&format!("{}.enabled", name), false) {
                    by_port
                        .entry(self.port(&name, tcp_banner_default_port(instance)))
                        .or_default()
                        .push(name);
                }
            }
        }
        for (port, services) in by_port {
            if services.len() > 1 {
                errors.push(ConfigError::new(
                    "ports",
                    format!(
                        "port {} is assigned to more than one service: {}",
                        port,
                        services.join(", ")
                    ),
                ));
            }
        }

        errors
    }
}

fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(err) => {
            log::error!("Bad validation pattern {:?}: {}", pattern, err);
            false
        }
    }
}
