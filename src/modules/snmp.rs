use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, DatagramHandler};
use crate::transport::{serve_udp, Endpoints};

const DEFAULT_PORT: u16 = 161;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "snmp", DEFAULT_PORT);
    serve_udp("snmp", addr, Arc::new(SnmpHandler { logger }))
}

/// Log-only SNMP agent: walks just enough BER to recover the community
/// string and the requested OIDs, then stays silent.
struct SnmpHandler {
    logger: Logger,
}

#[async_trait]
impl DatagramHandler for SnmpHandler {
    async fn on_datagram(&self, data: &[u8], endpoints: &Endpoints) -> Option<Vec<u8>> {
        let Some(query) = parse_message(data) else {
            log::trace!("snmp datagram from {} did not parse", endpoints.peer);
            return None;
        };
        self.logger.log(
            Event::with_endpoints(LogType::SNMP_CMD, endpoints)
                .data("REQUESTS", query.oids)
                .data("COMMUNITY_STRING", query.community.as_str()),
        );
        None
    }
}

struct Query {
    community: String,
    oids: Vec<String>,
}

/// SNMPv1/v2c message: SEQUENCE(version, community, PDU(request-id,
/// error-status, error-index, SEQUENCE of varbinds)). Every length field
/// is bounds-checked against the actual datagram before slicing.
fn parse_message(data: &[u8]) -> Option<Query> {
    let mut outer = Reader::new(data);
    let message = outer.expect(TAG_SEQUENCE)?;

    let mut message = Reader::new(message);
    message.expect(TAG_INTEGER)?;
    let community = message.expect(TAG_OCTET_STRING)?;
    let (tag, pdu) = message.take_tlv()?;
    // GetRequest through GetBulkRequest arrive as context-constructed tags.
    if tag & 0xe0 != 0xa0 {
        return None;
    }

    let mut pdu = Reader::new(pdu);
    pdu.expect(TAG_INTEGER)?;
    pdu.expect(TAG_INTEGER)?;
    pdu.expect(TAG_INTEGER)?;
    let bindings = pdu.expect(TAG_SEQUENCE)?;

    let mut bindings = Reader::new(bindings);
    let mut oids = Vec::new();
    while !bindings.is_empty() {
        let binding = bindings.expect(TAG_SEQUENCE)?;
        let mut binding = Reader::new(binding);
        let oid = binding.expect(TAG_OID)?;
        oids.push(decode_oid(oid)?);
    }

    Some(Query {
        community: String::from_utf8_lossy(community).into_owned(),
        oids,
    })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Next TLV, or None if the buffer runs out or a length field points
    /// past the end.
    fn take_tlv(&mut self) -> Option<(u8, &'a [u8])> {
        let tag = *self.data.get(self.pos)?;
        let first = *self.data.get(self.pos + 1)?;
        self.pos += 2;
        let len = if first < 0x80 {
            usize::from(first)
        } else {
            // Long form. Two length bytes cover anything that fits in a
            // datagram.
            let count = usize::from(first & 0x7f);
            if count == 0 || count > 2 {
                return None;
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = len << 8 | usize::from(*self.data.get(self.pos)?);
                self.pos += 1;
            }
            len
        };
        let start = self.pos;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        self.pos = end;
        Some((tag, &self.data[start..end]))
    }

    fn expect(&mut self, expected: u8) -> Option<&'a [u8]> {
        let (tag, value) = self.take_tlv()?;
        if tag == expected {
            Some(value)
        } else {
            None
        }
    }
}

/// Dotted-decimal form of a BER object identifier.
fn decode_oid(bytes: &[u8]) -> Option<String> {
    let (&first, rest) = bytes.split_first()?;
    if rest.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        return None;
    }
    let mut parts = vec![u32::from(first / 40), u32::from(first % 40)];
    let mut value: u32 = 0;
    for &b in rest {
        value = value.checked_mul(128)? | u32::from(b & 0x7f);
        if b & 0x80 == 0 {
            parts.push(value);
            value = 0;
        }
    }
    let text: Vec<String> = parts.iter().map(|part| part.to_string()).collect();
    Some(text.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use serde_json::json;

    // GetRequest for sysDescr.0 with community "public".
    const SYS_DESCR_GET: &[u8] = &[
        0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, 0x70, 0x75, 0x62, 0x6c, 0x69, 0x63, 0xa0, 0x19,
        0x02, 0x01, 0x1f, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
        0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
    ];

    fn endpoints() -> Endpoints {
        Endpoints {
            local: "127.0.0.1:161".parse().unwrap(),
            peer: "198.51.100.7:35000".parse().unwrap(),
        }
    }

    #[test]
    fn oid_decoding() {
        assert_eq!(
            decode_oid(&[0x2b, 6, 1, 2, 1, 1, 1, 0]).unwrap(),
            "1.3.6.1.2.1.1.1.0"
        );
        assert_eq!(decode_oid(&[0x2b, 6, 1, 4, 1, 0x8f, 0x65]).unwrap(), "1.3.6.1.4.1.2021");
        // Trailing continuation bit means a truncated subidentifier.
        assert!(decode_oid(&[0x2b, 0x8f]).is_none());
        assert!(decode_oid(&[]).is_none());
    }

    #[test]
    fn community_and_oids_parse() {
        let query = parse_message(SYS_DESCR_GET).unwrap();
        assert_eq!(query.community, "public");
        assert_eq!(query.oids, vec!["1.3.6.1.2.1.1.1.0"]);
    }

    #[test]
    fn hostile_lengths_do_not_slice_past_the_end() {
        // Outer sequence claiming far more than the datagram holds.
        assert!(parse_message(&[0x30, 0x82, 0xff, 0xff, 0x02]).is_none());
        // Five length bytes is beyond anything a datagram needs.
        assert!(parse_message(&[0x30, 0x85, 1, 1, 1, 1, 1]).is_none());
        assert!(parse_message(&[]).is_none());
        assert!(parse_message(b"public").is_none());
    }

    #[tokio::test]
    async fn queries_are_logged_and_never_answered() {
        let (logger, mut events) = capture_logger();
        let handler = SnmpHandler { logger };
        let reply = handler.on_datagram(SYS_DESCR_GET, &endpoints()).await;
        assert!(reply.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.logtype, LogType::SNMP_CMD);
        assert_eq!(event.logdata.get("REQUESTS").unwrap(), &json!(["1.3.6.1.2.1.1.1.0"]));
        assert_eq!(event.logdata.get("COMMUNITY_STRING").unwrap(), "public");
    }

    #[tokio::test]
    async fn junk_is_dropped() {
        let (logger, mut events) = capture_logger();
        let handler = SnmpHandler { logger };
        assert!(handler.on_datagram(b"\x99\xff\x00", &endpoints()).await.is_none());
        assert!(events.try_recv().is_err());
    }
}
