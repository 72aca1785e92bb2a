use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::event::{Event, LogEvent};
use crate::honeycred::{self, HoneyCred};
use crate::sink::Sink;

const QUEUE_DEPTH: usize = 100;

/// An IPv4 network in "address/bits" form. A bare address means /32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: u32,
    mask: u32,
}

#[derive(Debug)]
pub struct BadNetwork(pub String);

impl fmt::Display for BadNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid network specification {:?}", self.0)
    }
}

impl std::error::Error for BadNetwork {}

impl CidrRange {
    pub fn parse(text: &str) -> Result<CidrRange, BadNetwork> {
        let (addr_part, bits_part) = match text.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits)),
            None => (text, None),
        };
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| BadNetwork(text.to_string()))?;
        let bits: u32 = match bits_part {
            Some(raw) => raw.parse().map_err(|_| BadNetwork(text.to_string()))?,
            None => 32,
        };
        if bits > 32 {
            return Err(BadNetwork(text.to_string()));
        }
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        Ok(CidrRange {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask) == self.network
    }
}

/// Filter and annotation state for the pipeline, fixed at start-up.
pub struct LoggerSettings {
    pub node_id: String,
    pub ignore_ips: Vec<CidrRange>,
    pub ignore_logtypes: HashSet<u32>,
    pub honeycreds: Vec<HoneyCred>,
}

impl LoggerSettings {
    pub fn new(node_id: impl Into<String>) -> LoggerSettings {
        LoggerSettings {
            node_id: node_id.into(),
            ignore_ips: Vec::new(),
            ignore_logtypes: HashSet::new(),
            honeycreds: Vec::new(),
        }
    }
}

enum LoggerMessage {
    Event(LogEvent),
    Shutdown,
}

struct LoggerShared {
    node_id: String,
    ignore_ips: Vec<CidrRange>,
    ignore_logtypes: HashSet<u32>,
    honeycreds: Vec<HoneyCred>,
}

/// Handle every service logs through. Cloning is cheap; all clones feed the
/// same dispatch task.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::Sender<LoggerMessage>,
    shared: Arc<LoggerShared>,
}

impl Logger {
    /// Spawns the dispatch task that fans events out to `sinks` and returns
    /// the logging handle plus the task handle to await at shutdown.
    pub fn start(settings: LoggerSettings, sinks: Vec<Box<dyn Sink>>) -> (Logger, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::new(LoggerShared {
            node_id: settings.node_id,
            ignore_ips: settings.ignore_ips,
            ignore_logtypes: settings.ignore_logtypes,
            honeycreds: settings.honeycreds,
        });
        let task = tokio::spawn(run_dispatch(rx, sinks));
        (Logger { tx, shared }, task)
    }

    /// Annotates, sanitizes, filters, and enqueues. Never blocks the caller;
    /// a full queue drops the event with a diagnostic.
    pub fn log(&self, mut event: Event) {
        self.annotate(&mut event);
        let event = event.sanitize(&self.shared.node_id);
        if self.should_drop(&event) {
            log::trace!(
                "Ignoring event type {} from {:?}",
                event.logtype.0,
                event.src_host
            );
            return;
        }
        match self.tx.try_send(LoggerMessage::Event(event)) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Log queue is full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                log::error!("Log dispatch has stopped, dropping event");
            }
        }
    }

    pub async fn shutdown(&self) {
        if self.tx.send(LoggerMessage::Shutdown).await.is_err() {
            log::debug!("Log dispatch already stopped");
        }
    }

    fn annotate(&self, event: &mut Event) {
        if self.shared.honeycreds.is_empty() {
            return;
        }
        let username = event.logdata.get("USERNAME").and_then(Value::as_str);
        let password = event.logdata.get("PASSWORD").and_then(Value::as_str);
        if username.is_none() && password.is_none() {
            return;
        }
        let hit = honeycred::matches_any(&self.shared.honeycreds, username, password);
        event.logdata.insert(String::from("honeycred"), Value::Bool(hit));
    }

    fn should_drop(&self, event: &LogEvent) -> bool {
        if self.shared.ignore_logtypes.contains(&event.logtype.0) {
            return true;
        }
        if let Ok(ip) = event.src_host.parse::<Ipv4Addr>() {
            if self.shared.ignore_ips.iter().any(|range| range.contains(ip)) {
                return true;
            }
        }
        false
    }
}

async fn run_dispatch(mut rx: mpsc::Receiver<LoggerMessage>, mut sinks: Vec<Box<dyn Sink>>) {
    while let Some(message) = rx.recv().await {
        match message {
            LoggerMessage::Event(event) => {
                for sink in sinks.iter_mut() {
                    match sink.deliver(&event).await {
                        Ok(_) => {}
                        Err(err) => {
                            log::error!("{} sink failed to deliver event: {}", sink.kind(), err);
                        }
                    }
                }
            }
            LoggerMessage::Shutdown => break,
        }
    }
    log::info!("Log dispatch stopped");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sink::SinkError;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct CaptureSink {
        tx: UnboundedSender<LogEvent>,
    }

    #[async_trait::async_trait]
    impl Sink for CaptureSink {
        fn kind(&self) -> &'static str {
            "capture"
        }

        async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
            let _ = self.tx.send(event.clone());
            Ok(())
        }
    }

    pub(crate) fn capture_logger() -> (Logger, UnboundedReceiver<LogEvent>) {
        capture_logger_with(LoggerSettings::new("node-test"))
    }

    pub(crate) fn capture_logger_with(
        settings: LoggerSettings,
    ) -> (Logger, UnboundedReceiver<LogEvent>) {
        let (tx, rx) = unbounded_channel();
        let (logger, _task) = Logger::start(settings, vec![Box::new(CaptureSink { tx })]);
        (logger, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{capture_logger, capture_logger_with};
    use super::*;
    use crate::event::LogType;

    fn ip(text: &str) -> Ipv4Addr {
        text.parse().unwrap()
    }

    #[test]
    fn bare_address_means_slash_32() {
        let range = CidrRange::parse("127.0.0.1").unwrap();
        assert!(range.contains(ip("127.0.0.1")));
        assert!(!range.contains(ip("127.0.0.2")));
    }

    #[test]
    fn prefix_masks_apply() {
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(range.contains(ip("10.255.1.2")));
        assert!(!range.contains(ip("11.0.0.1")));

        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(ip("203.0.113.9")));
    }

    #[test]
    fn bad_networks_are_rejected() {
        assert!(CidrRange::parse("not-an-ip").is_err());
        assert!(CidrRange::parse("10.0.0.0/33").is_err());
        assert!(CidrRange::parse("10.0.0.0/x").is_err());
        assert!(CidrRange::parse("10.0.0.256/8").is_err());
    }

    #[tokio::test]
    async fn ignored_source_network_is_dropped() {
        let mut settings = LoggerSettings::new("node-test");
        settings.ignore_ips = vec![CidrRange::parse("127.0.0.1/32").unwrap()];
        let (logger, mut rx) = capture_logger_with(settings);

        let mut dropped = Event::new(LogType::FTP_LOGIN_ATTEMPT);
        dropped.src_host = Some(String::from("127.0.0.1"));
        logger.log(dropped);

        let mut kept = Event::new(LogType::FTP_LOGIN_ATTEMPT);
        kept.src_host = Some(String::from("127.0.0.2"));
        logger.log(kept);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.src_host, "127.0.0.2");
    }

    #[tokio::test]
    async fn non_ipv4_source_is_not_filtered() {
        let mut settings = LoggerSettings::new("node-test");
        settings.ignore_ips = vec![CidrRange::parse("0.0.0.0/0").unwrap()];
        let (logger, mut rx) = capture_logger_with(settings);

        let mut event = Event::new(LogType::MSG);
        event.src_host = Some(String::from("::1"));
        logger.log(event);

        assert_eq!(rx.recv().await.unwrap().src_host, "::1");
    }

    #[tokio::test]
    async fn ignored_logtypes_are_dropped() {
        let mut settings = LoggerSettings::new("node-test");
        settings.ignore_logtypes = HashSet::from([LogType::PING.0]);
        let (logger, mut rx) = capture_logger_with(settings);

        logger.log(Event::new(LogType::PING));
        logger.log(Event::new(LogType::MSG));

        assert_eq!(rx.recv().await.unwrap().logtype, LogType::MSG);
    }

    #[tokio::test]
    async fn node_id_is_stamped() {
        let (logger, mut rx) = capture_logger();
        logger.log(Event::new(LogType::MSG).data("msg", "hi"));
        assert_eq!(rx.recv().await.unwrap().node_id, "node-test");
    }

    #[tokio::test]
    async fn honeycred_annotation() {
        let mut settings = LoggerSettings::new("node-test");
        settings.honeycreds = vec![HoneyCred {
            username: Some(String::from("admin")),
            password: Some(String::from("hunter2")),
        }];
        let (logger, mut rx) = capture_logger_with(settings);

        logger.log(
            Event::new(LogType::FTP_LOGIN_ATTEMPT)
                .data("USERNAME", "admin")
                .data("PASSWORD", "hunter2"),
        );
        logger.log(
            Event::new(LogType::FTP_LOGIN_ATTEMPT)
                .data("USERNAME", "admin")
                .data("PASSWORD", "wrong"),
        );
        logger.log(Event::new(LogType::MSG).data("msg", "no creds here"));

        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.logdata.get("honeycred"), Some(&Value::Bool(true)));
        let miss = rx.recv().await.unwrap();
        assert_eq!(miss.logdata.get("honeycred"), Some(&Value::Bool(false)));
        let plain = rx.recv().await.unwrap();
        assert!(plain.logdata.get("honeycred").is_none());
    }
}
