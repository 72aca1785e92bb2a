use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, DatagramHandler};
use crate::transport::{serve_udp, Endpoints};

const DEFAULT_PORT: u16 = 5060;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "sip", DEFAULT_PORT);
    serve_udp("sip", addr, Arc::new(SipHandler { logger }))
}

/// Log-only SIP endpoint. Scanners like sipvicious identify themselves in
/// the headers, so the whole header block is captured. Nothing is ever sent
/// back.
struct SipHandler {
    logger: Logger,
}

#[async_trait]
impl DatagramHandler for SipHandler {
    async fn on_datagram(&self, data: &[u8], endpoints: &Endpoints) -> Option<Vec<u8>> {
        let Some(headers) = parse_headers(data) else {
            log::trace!("sip datagram from {} was not SIP", endpoints.peer);
            return None;
        };
        self.logger.log(
            Event::with_endpoints(LogType::SIP_REQUEST, endpoints).data("HEADERS", headers),
        );
        None
    }
}

/// Header block of a SIP request or response as a name to value-list map.
/// Names are lowercased and folded continuation lines are joined, the way
/// most SIP stacks normalize them. Returns None when the datagram does not
/// carry a SIP start line.
fn parse_headers(data: &[u8]) -> Option<Map<String, Value>> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

    let start = lines.next()?;
    let is_request = start.ends_with(" SIP/2.0");
    let is_response = start.starts_with("SIP/2.0 ");
    if !is_request && !is_response {
        return None;
    }

    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous value.
            if let Some(last) = headers.last_mut().and_then(|(_, values)| values.last_mut()) {
                last.push(' ');
                last.push_str(line.trim());
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        match headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => headers.push((name, vec![value])),
        }
    }

    let mut map = Map::new();
    for (name, values) in headers {
        map.insert(name, Value::from(values));
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use serde_json::json;

    fn endpoints() -> Endpoints {
        Endpoints {
            local: "127.0.0.1:5060".parse().unwrap(),
            peer: "198.51.100.7:5061".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn options_probe_headers_are_captured() {
        let (logger, mut events) = capture_logger();
        let handler = SipHandler { logger };
        let probe = b"OPTIONS sip:100@203.0.113.9 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 198.51.100.7:5061;branch=z9hG4bK-1\r\n\
            From: \"sipvicious\" <sip:100@1.1.1.1>\r\n\
            To: \"sipvicious\" <sip:100@1.1.1.1>\r\n\
            Max-Forwards: 70\r\n\
            Content-Length: 0\r\n\r\n";
        let reply = handler.on_datagram(probe, &endpoints()).await;
        assert!(reply.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.logtype, LogType::SIP_REQUEST);
        let headers = event.logdata.get("HEADERS").unwrap();
        assert_eq!(headers["via"], json!(["SIP/2.0/UDP 198.51.100.7:5061;branch=z9hG4bK-1"]));
        assert_eq!(headers["max-forwards"], json!(["70"]));
        assert_eq!(event.src_host, "198.51.100.7");
    }

    #[test]
    fn repeated_headers_keep_every_value() {
        let headers = parse_headers(
            b"INVITE sip:a@b SIP/2.0\r\nVia: one\r\nVia: two\r\nSubject: first\r\n and rest\r\n\r\n",
        )
        .unwrap();
        assert_eq!(headers["via"], json!(["one", "two"]));
        assert_eq!(headers["subject"], json!(["first and rest"]));
    }

    #[test]
    fn responses_parse_too() {
        let headers = parse_headers(b"SIP/2.0 200 OK\r\nCSeq: 1 OPTIONS\r\n\r\n").unwrap();
        assert_eq!(headers["cseq"], json!(["1 OPTIONS"]));
    }

    #[tokio::test]
    async fn junk_is_dropped_without_logging() {
        let (logger, mut events) = capture_logger();
        let handler = SipHandler { logger };
        assert!(handler.on_datagram(b"\x00\x01\x02GET /", &endpoints()).await.is_none());
        assert!(handler.on_datagram(b"", &endpoints()).await.is_none());
        assert!(events.try_recv().is_err());
    }
}
