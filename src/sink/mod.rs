use std::fmt;

use async_trait::async_trait;
use toml::value::Table;

use crate::config::ConfigError;
use crate::event::LogEvent;

mod console;
mod file;
mod hpfeeds;
mod socket;
mod webhook;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use hpfeeds::HpfeedsSink;
pub use socket::SocketSink;
pub use webhook::{WebhookSink, WebhookStyle};

pub const KINDS: &[&str] = &["console", "file", "tcp", "webhook", "slack", "teams", "hpfeeds"];

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Http(reqwest::Error),
    Status(u16),
    Protocol(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(err) => write!(f, "i/o failure: {}", err),
            SinkError::Http(err) => write!(f, "http failure: {}", err),
            SinkError::Status(code) => write!(f, "unexpected http status {}", code),
            SinkError::Protocol(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> SinkError {
        SinkError::Io(err)
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> SinkError {
        SinkError::Http(err)
    }
}

/// One event destination. Delivery errors are reported to the dispatch task,
/// which logs them and moves on; a failing sink never stalls the others.
#[async_trait]
pub trait Sink: Send {
    fn kind(&self) -> &'static str;

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError>;
}

/// Structural validation of one [[logger.sinks]] table, shared between
/// config checking and sink construction.
pub fn validate_spec(spec: &Table) -> Result<(), String> {
    let kind = spec
        .get("kind")
        .and_then(|value| value.as_str())
        .ok_or_else(|| String::from("missing sink kind"))?;
    let need = |key: &str| -> Result<String, String> {
        match spec.get(key).and_then(|value| value.as_str()) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(format!("{} sink needs a {:?} string", kind, key)),
        }
    };
    let need_port = || -> Result<u16, String> {
        match spec.get("port").and_then(|value| value.as_integer()) {
            Some(n) if (1..=65535).contains(&n) => Ok(n as u16),
            _ => Err(format!("{} sink needs a port between 1 and 65535", kind)),
        }
    };
    match kind {
        "console" => Ok(()),
        "file" => {
            need("path")?;
            Ok(())
        }
        "tcp" => {
            need("host")?;
            need_port()?;
            Ok(())
        }
        "webhook" | "slack" | "teams" => {
            need("url")?;
            Ok(())
        }
        "hpfeeds" => {
            need("host")?;
            need_port()?;
            let ident = need("ident")?;
            need("secret")?;
            let channel = need("channel")?;
            if ident.len() > 255 || channel.len() > 255 {
                return Err(String::from("hpfeeds ident and channel must fit in 255 bytes"));
            }
            Ok(())
        }
        other => Err(format!("unknown sink kind {:?}", other)),
    }
}

/// Turns validated sink specs into live sinks. No specs at all means a lone
/// console sink, so a bare config still shows events somewhere.
pub fn build_sinks(specs: &[Table]) -> Result<Vec<Box<dyn Sink>>, ConfigError> {
    if specs.is_empty() {
        return Ok(vec![Box::new(ConsoleSink::new())]);
    }
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let key = format!("logger.sinks[{}]", index);
        validate_spec(spec).map_err(|message| ConfigError::new(&key, message))?;
        let text = |field: &str| {
            spec.get(field)
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let port = spec
            .get("port")
            .and_then(|value| value.as_integer())
            .unwrap_or_default() as u16;
        let kind = text("kind");
        let sink: Box<dyn Sink> = match kind.as_str() {
            "console" => Box::new(ConsoleSink::new()),
            "file" => Box::new(
                FileSink::open(&text("path"))
                    .map_err(|err| ConfigError::new(&key, format!("cannot open log file: {}", err)))?,
            ),
            "tcp" => Box::new(SocketSink::start(text("host"), port)),
            "webhook" => Box::new(
                WebhookSink::new(WebhookStyle::Generic, text("url"))
                    .map_err(|err| ConfigError::new(&key, err.to_string()))?,
            ),
            "slack" => Box::new(
                WebhookSink::new(WebhookStyle::Slack, text("url"))
                    .map_err(|err| ConfigError::new(&key, err.to_string()))?,
            ),
            "teams" => Box::new(
                WebhookSink::new(WebhookStyle::Teams, text("url"))
                    .map_err(|err| ConfigError::new(&key, err.to_string()))?,
            ),
            "hpfeeds" => Box::new(HpfeedsSink::new(
                text("host"),
                port,
                text("ident"),
                text("secret"),
                text("channel"),
            )),
            other => {
                return Err(ConfigError::new(&key, format!("unknown sink kind {:?}", other)));
            }
        };
        sinks.push(sink);
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(text: &str) -> Table {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn console_needs_nothing() {
        assert!(validate_spec(&spec("kind = \"console\"")).is_ok());
    }

    #[test]
    fn file_needs_a_path() {
        assert!(validate_spec(&spec("kind = \"file\"")).is_err());
        assert!(validate_spec(&spec("kind = \"file\"\npath = \"/tmp/x.log\"")).is_ok());
    }

    #[test]
    fn tcp_needs_host_and_port() {
        assert!(validate_spec(&spec("kind = \"tcp\"\nhost = \"10.0.0.1\"")).is_err());
        assert!(validate_spec(&spec("kind = \"tcp\"\nhost = \"10.0.0.1\"\nport = 4444")).is_ok());
        assert!(validate_spec(&spec("kind = \"tcp\"\nhost = \"10.0.0.1\"\nport = 444444")).is_err());
    }

    #[test]
    fn hpfeeds_needs_credentials() {
        let incomplete = "kind = \"hpfeeds\"\nhost = \"h\"\nport = 10000\nident = \"i\"";
        assert!(validate_spec(&spec(incomplete)).is_err());
        let complete =
            "kind = \"hpfeeds\"\nhost = \"h\"\nport = 10000\nident = \"i\"\nsecret = \"s\"\nchannel = \"c\"";
        assert!(validate_spec(&spec(complete)).is_ok());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(validate_spec(&spec("kind = \"syslog\"")).is_err());
        assert!(validate_spec(&spec("path = \"/tmp/x\"")).is_err());
    }
}
