use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 3389;

// TPKT length field sanity bounds. A connection request is a few dozen
// bytes; anything bigger is not one.
const MIN_TPKT: usize = 11;
const MAX_TPKT: usize = 4096;

const X224_CONNECTION_REQUEST: u8 = 0xe0;
const X224_CONNECTION_CONFIRM: u8 = 0xd0;
const NEG_REQUEST: u8 = 0x01;
const NEG_FAILURE: u8 = 0x03;
const SSL_REQUIRED_BY_SERVER: u32 = 0x0000_0001;

/// SRC-REF offered in our connection confirm, matching what Windows
/// terminal servers put on the wire.
const SRC_REF: u16 = 0x1234;

const COOKIE_PREFIX: &[u8] = b"Cookie: mstshash=";

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "rdp", DEFAULT_PORT);
    serve_tcp("rdp", addr, None, move || {
        Box::new(RdpHandler::new(logger.clone()))
    })
}

struct RdpHandler {
    logger: Logger,
    buf: Vec<u8>,
}

impl RdpHandler {
    fn new(logger: Logger) -> RdpHandler {
        RdpHandler {
            logger,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for RdpHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        match parse_connection_request(&self.buf) {
            Parsed::Incomplete => {
                if self.buf.len() > MAX_TPKT {
                    conn.close();
                }
            }
            Parsed::Invalid(reason) => {
                log::debug!("rdp client {} sent a bad request: {}", conn.endpoints.peer, reason);
                conn.close();
            }
            Parsed::Complete(request, _consumed) => {
                self.logger.log(
                    Event::with_endpoints(LogType::RDP, &conn.endpoints)
                        .data("USERNAME", request.username.as_deref().unwrap_or("")),
                );
                conn.send(&connection_confirm(&request)).await;
                conn.close();
            }
        }
    }
}

struct ConnectionRequest {
    src_ref: u16,
    username: Option<String>,
    negotiation: bool,
}

/// TPKT header plus an X.224 Connection Request. The variable part can
/// carry a `Cookie: mstshash=<user>` token and a negotiation request TLV.
fn parse_connection_request(buf: &[u8]) -> Parsed<ConnectionRequest> {
    if buf.len() < 4 {
        return Parsed::Incomplete;
    }
    if buf[0] != 3 {
        return Parsed::Invalid(format!("TPKT version {}", buf[0]));
    }
    let total = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if !(MIN_TPKT..=MAX_TPKT).contains(&total) {
        return Parsed::Invalid(format!("implausible TPKT length {}", total));
    }
    if buf.len() < total {
        return Parsed::Incomplete;
    }

    let tpdu = &buf[4..total];
    let li = usize::from(tpdu[0]);
    if li + 1 > tpdu.len() {
        return Parsed::Invalid(String::from("length indicator overruns the packet"));
    }
    if li < 6 {
        return Parsed::Invalid(format!("connection request too short for X.224 ({})", li));
    }
    if tpdu[1] & 0xf0 != X224_CONNECTION_REQUEST {
        return Parsed::Invalid(format!("X.224 code {:#04x} is not a connection request", tpdu[1]));
    }
    let src_ref = u16::from_be_bytes([tpdu[4], tpdu[5]]);
    let payload = &tpdu[7..li + 1];

    let username = find(payload, COOKIE_PREFIX).map(|start| {
        let value = &payload[start + COOKIE_PREFIX.len()..];
        let end = value
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(value.len());
        String::from_utf8_lossy(&value[..end]).into_owned()
    });

    // When present, the negotiation request is the fixed 8-byte tail of
    // the TPDU.
    let negotiation = payload.len() >= 8 && {
        let tail = &payload[payload.len() - 8..];
        tail[0] == NEG_REQUEST && u16::from_le_bytes([tail[2], tail[3]]) == 8
    };

    Parsed::Complete(
        ConnectionRequest {
            src_ref,
            username,
            negotiation,
        },
        total,
    )
}

/// X.224 Connection Confirm. Clients that asked for protocol negotiation
/// get a failure TLV demanding TLS, which is how an NLA-only terminal
/// server greets a plaintext connection. Older clients get a bare confirm.
fn connection_confirm(request: &ConnectionRequest) -> Vec<u8> {
    let mut tpdu = vec![X224_CONNECTION_CONFIRM];
    tpdu.extend_from_slice(&request.src_ref.to_be_bytes());
    tpdu.extend_from_slice(&SRC_REF.to_be_bytes());
    tpdu.push(0);
    if request.negotiation {
        tpdu.push(NEG_FAILURE);
        tpdu.push(0);
        tpdu.extend_from_slice(&8u16.to_le_bytes());
        tpdu.extend_from_slice(&SSL_REQUIRED_BY_SERVER.to_le_bytes());
    }

    let mut out = Vec::with_capacity(tpdu.len() + 5);
    out.extend_from_slice(&[3, 0]);
    out.extend_from_slice(&((tpdu.len() as u16 + 5).to_be_bytes()));
    out.push(tpdu.len() as u8);
    out.extend_from_slice(&tpdu);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use crate::transport::{drive_connection, tcp_pair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn connection_request(src_ref: u16, cookie: &[u8], neg: &[u8]) -> Vec<u8> {
        let mut tpdu = vec![X224_CONNECTION_REQUEST, 0x00, 0x00];
        tpdu.extend_from_slice(&src_ref.to_be_bytes());
        tpdu.push(0x00);
        tpdu.extend_from_slice(cookie);
        tpdu.extend_from_slice(neg);
        let mut out = vec![3, 0];
        out.extend_from_slice(&((tpdu.len() as u16 + 5).to_be_bytes()));
        out.push(tpdu.len() as u8);
        out.extend_from_slice(&tpdu);
        out
    }

    #[test]
    fn connection_requests_reassemble_from_any_split() {
        let neg = [NEG_REQUEST, 0, 8, 0, 3, 0, 0, 0];
        let packet = connection_request(0xabcd, b"Cookie: mstshash=ned\r\n", &neg);
        for cut in 0..packet.len() {
            assert!(
                matches!(parse_connection_request(&packet[..cut]), Parsed::Incomplete),
                "cut at {}",
                cut
            );
        }
        match parse_connection_request(&packet) {
            Parsed::Complete(request, consumed) => {
                assert_eq!(consumed, packet.len());
                assert_eq!(request.src_ref, 0xabcd);
                assert_eq!(request.username.as_deref(), Some("ned"));
                assert!(request.negotiation);
            }
            _ => panic!("expected a complete connection request"),
        }
    }

    #[test]
    fn bad_headers_are_rejected() {
        assert!(matches!(
            parse_connection_request(&[2, 0, 0, 11, 0, 0, 0, 0, 0, 0, 0]),
            Parsed::Invalid(_)
        ));
        // Claimed TPKT length below the X.224 minimum.
        assert!(matches!(
            parse_connection_request(&[3, 0, 0, 5, 0]),
            Parsed::Invalid(_)
        ));
        // Length indicator pointing past the end of the packet.
        assert!(matches!(
            parse_connection_request(&[3, 0, 0, 11, 200, 0xe0, 0, 0, 0, 0, 0]),
            Parsed::Invalid(_)
        ));
        // Length indicator too small to hold the fixed X.224 fields.
        assert!(matches!(
            parse_connection_request(&[3, 0, 0, 11, 2, 0xe0, 0, 0, 0, 0, 0]),
            Parsed::Invalid(_)
        ));
        // Right framing, wrong TPDU code.
        assert!(matches!(
            parse_connection_request(&[3, 0, 0, 11, 6, 0x80, 0, 0, 0, 0, 0]),
            Parsed::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn connection_attempts_are_logged_and_refused() {
        let (logger, mut events) = capture_logger();
        let (mut client, server) = tcp_pair().await;
        tokio::spawn(drive_connection(Box::new(RdpHandler::new(logger)), server, None));

        let neg = [NEG_REQUEST, 0, 8, 0, 3, 0, 0, 0];
        let packet = connection_request(0xabcd, b"Cookie: mstshash=ned\r\n", &neg);
        client.write_all(&packet).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            vec![
                3, 0, 0, 19, 14, X224_CONNECTION_CONFIRM, 0xab, 0xcd, 0x12, 0x34, 0,
                NEG_FAILURE, 0, 8, 0, 1, 0, 0, 0,
            ]
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.logtype, LogType::RDP);
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "ned");
    }

    #[tokio::test]
    async fn cookieless_requests_get_a_bare_confirm() {
        let (logger, mut events) = capture_logger();
        let (mut client, server) = tcp_pair().await;
        tokio::spawn(drive_connection(Box::new(RdpHandler::new(logger)), server, None));

        let packet = connection_request(0x0001, b"", b"");
        client.write_all(&packet).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            vec![3, 0, 0, 11, 6, X224_CONNECTION_CONFIRM, 0x00, 0x01, 0x12, 0x34, 0]
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "");
    }

    #[tokio::test]
    async fn garbage_closes_without_a_reply() {
        let (logger, mut events) = capture_logger();
        let (mut client, server) = tcp_pair().await;
        tokio::spawn(drive_connection(Box::new(RdpHandler::new(logger)), server, None));

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert!(events.try_recv().is_err());
    }
}
