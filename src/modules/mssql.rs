use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 1433;
const DEFAULT_VERSION: &str = "2012";
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const VERSIONS: &[&str] = &["2008R2", "2012", "2014"];

const TDS_HEADER_LEN: usize = 8;
const MAX_PACKET: usize = 4096;

const TDS_TYPE_RESPONSE: u8 = 0x04;
const TDS_TYPE_LOGIN7: u8 = 0x10;
const TDS_TYPE_SSPI: u8 = 0x11;
const TDS_TYPE_PRELOGIN: u8 = 0x12;

const PRELOGIN_VERSION: u8 = 0x00;
const PRELOGIN_ENCRYPTION: u8 = 0x01;
const PRELOGIN_INSTOPT: u8 = 0x02;
const PRELOGIN_THREADID: u8 = 0x03;
const PRELOGIN_MARS: u8 = 0x04;
const PRELOGIN_TRACEID: u8 = 0x05;

// nmap's ms-sql-info probe, sent as a PRELOGIN packet with packet id 0.
const NMAP_PROBE_PAYLOAD: [u8; 44] = [
    0x00, 0x00, 0x15, 0x00, 0x06, 0x01, 0x00, 0x1b, 0x00, 0x01, 0x02, 0x00, 0x1c, 0x00, 0x0c,
    0x03, 0x00, 0x28, 0x00, 0x04, 0xff, 0x08, 0x00, 0x01, 0x55, 0x00, 0x00, 0x00, b'M', b'S',
    b'S', b'Q', b'L', b'S', b'e', b'r', b'v', b'e', b'r', 0x00, 0x48, 0x0f, 0x00, 0x00,
];

// Canned PRELOGIN responses captured from real servers, fingerprinted by
// nmap as the respective releases.
const PROBE_RESPONSE_2008R2: [u8; 33] = [
    0x04, 0x01, 0x00, 0x2e, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x15, 0x00, 0x06, 0x01, 0x00,
    0x1b, 0x00, 0x01, 0x02, 0x00, 0x1c, 0x00, 0x01, 0x03, 0x00, 0x1d, 0x00, 0x00, 0xff, 0x0a,
    0x32, 0x10, 0xb4,
];
const PROBE_RESPONSE_2012: [u8; 33] = [
    0x04, 0x01, 0x00, 0x25, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x15, 0x00, 0x06, 0x01, 0x00,
    0x1b, 0x00, 0x01, 0x02, 0x00, 0x1c, 0x00, 0x01, 0x03, 0x00, 0x1d, 0x00, 0x00, 0xff, 0x0b,
    0x00, 0x0c, 0x38,
];
const PROBE_RESPONSE_2014: [u8; 33] = [
    0x04, 0x01, 0x00, 0x25, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x15, 0x00, 0x06, 0x01, 0x00,
    0x1b, 0x00, 0x01, 0x02, 0x00, 0x1c, 0x00, 0x01, 0x03, 0x00, 0x1d, 0x00, 0x00, 0xff, 0x0c,
    0x00, 0x07, 0xd0,
];

// Trailing DONE token observed on the wire after a login error.
const DONE_TOKEN: [u8; 13] = [
    0xfd, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let version = config.str_or("mssql.version", DEFAULT_VERSION);
    let addr = bind_addr(config, "mssql", DEFAULT_PORT);
    serve_tcp("mssql", addr, Some(IDLE_TIMEOUT), move || {
        Box::new(MssqlHandler::new(version.clone(), logger.clone()))
    })
}

#[derive(Debug)]
struct TdsPacket {
    ptype: u8,
    status: u8,
    spid: u16,
    packetid: u8,
    window: u8,
    payload: Vec<u8>,
}

struct MssqlHandler {
    version: String,
    logger: Logger,
    buf: Vec<u8>,
}

impl MssqlHandler {
    fn new(version: String, logger: Logger) -> MssqlHandler {
        MssqlHandler {
            version,
            logger,
            buf: Vec::new(),
        }
    }

    async fn process(&mut self, conn: &mut Conn, tds: TdsPacket) {
        if is_nmap_probe(&tds) {
            conn.send(version_response(&self.version)).await;
            return;
        }
        match tds.ptype {
            TDS_TYPE_PRELOGIN => {
                let reply = TdsPacket {
                    ptype: TDS_TYPE_RESPONSE,
                    status: 0x01,
                    spid: 0,
                    packetid: 1,
                    window: 0,
                    payload: prelogin_response(),
                };
                conn.send(&build_packet(&reply)).await;
            }
            TDS_TYPE_LOGIN7 => {
                let Some(login) = parse_login7(&tds.payload) else {
                    log::debug!(
                        "mssql client {} sent an unparseable LOGIN7 packet",
                        conn.endpoints.peer
                    );
                    conn.close();
                    return;
                };
                let message = if login.ntlm.is_some() {
                    self.logger.log(
                        Event::with_endpoints(LogType::MSSQL_LOGIN_WINAUTH, &conn.endpoints)
                            .data("USERNAME", "")
                            .data("PASSWORD", ""),
                    );
                    String::from("Login failed.")
                } else {
                    let mut username = String::new();
                    let mut event =
                        Event::with_endpoints(LogType::MSSQL_LOGIN_SQLAUTH, &conn.endpoints);
                    for (name, value) in &login.text {
                        if *name == "UserName" {
                            username = value.clone();
                        }
                        event = event.data(*name, value.as_str());
                    }
                    self.logger.log(event);
                    format!("Login failed for user {}.", username)
                };
                send_login_error(conn, &message, "").await;
            }
            TDS_TYPE_SSPI => match parse_ntlm_response(&tds.payload) {
                Some(auth) => {
                    self.logger.log(
                        Event::with_endpoints(LogType::MSSQL_LOGIN_WINAUTH, &conn.endpoints)
                            .data("USERNAME", auth.username.as_str())
                            .data("HOSTNAME", auth.hostname.as_str())
                            .data("DOMAINNAME", auth.domain.as_str()),
                    );
                    let message =
                        format!("Login failed for user {}\\{}.", auth.domain, auth.username);
                    send_login_error(conn, &message, &auth.hostname).await;
                }
                None => conn.close(),
            },
            _ => conn.close(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for MssqlHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while !conn.is_closing() {
            match parse_tds(&self.buf) {
                Parsed::Incomplete => return,
                Parsed::Invalid(reason) => {
                    log::debug!("mssql client {} framing error: {}", conn.endpoints.peer, reason);
                    conn.close();
                    return;
                }
                Parsed::Complete(tds, consumed) => {
                    self.buf.drain(..consumed);
                    self.process(conn, tds).await;
                }
            }
        }
    }
}

async fn send_login_error(conn: &mut Conn, message: &str, server_name: &str) {
    let mut payload = build_error(message, server_name);
    payload.extend_from_slice(&DONE_TOKEN);
    let reply = TdsPacket {
        ptype: TDS_TYPE_RESPONSE,
        status: 0x01,
        spid: 54,
        packetid: 1,
        window: 0,
        payload,
    };
    conn.send(&build_packet(&reply)).await;
}

fn is_nmap_probe(tds: &TdsPacket) -> bool {
    tds.ptype == TDS_TYPE_PRELOGIN
        && tds.status == 1
        && tds.spid == 0
        && tds.packetid == 0
        && tds.window == 0
        && tds.payload == NMAP_PROBE_PAYLOAD
}

fn version_response(version: &str) -> &'static [u8] {
    match version {
        "2008R2" => &PROBE_RESPONSE_2008R2,
        "2014" => &PROBE_RESPONSE_2014,
        _ => &PROBE_RESPONSE_2012,
    }
}

/// One TDS packet: type, status, u16 big-endian total length, spid, packet
/// id, window, then payload.
fn parse_tds(buf: &[u8]) -> Parsed<TdsPacket> {
    if buf.len() < TDS_HEADER_LEN {
        return Parsed::Incomplete;
    }
    let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if !(TDS_HEADER_LEN..=MAX_PACKET).contains(&total) {
        return Parsed::Invalid(format!("implausible TDS length {}", total));
    }
    if buf.len() < total {
        return Parsed::Incomplete;
    }
    let tds = TdsPacket {
        ptype: buf[0],
        status: buf[1],
        spid: u16::from_be_bytes([buf[4], buf[5]]),
        packetid: buf[6],
        window: buf[7],
        payload: buf[TDS_HEADER_LEN..total].to_vec(),
    };
    Parsed::Complete(tds, total)
}

fn build_packet(tds: &TdsPacket) -> Vec<u8> {
    let total = (tds.payload.len() + TDS_HEADER_LEN) as u16;
    let mut packet = Vec::with_capacity(total as usize);
    packet.push(tds.ptype);
    packet.push(tds.status);
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&tds.spid.to_be_bytes());
    packet.push(tds.packetid);
    packet.push(tds.window);
    packet.extend_from_slice(&tds.payload);
    packet
}

/// PRELOGIN response advertising version 12.0.4100, no encryption, no MARS.
/// Layout is a table of (token, u16 offset, u16 length) entries closed by
/// 0xff, followed by the option data.
fn prelogin_response() -> Vec<u8> {
    let options: &[(u8, &[u8])] = &[
        (PRELOGIN_VERSION, &[0x0c, 0x00, 0x10, 0x04, 0x00, 0x00]),
        (PRELOGIN_ENCRYPTION, &[0x02]),
        (PRELOGIN_INSTOPT, &[0x00]),
        (PRELOGIN_THREADID, &[]),
        (PRELOGIN_MARS, &[0x00]),
        (PRELOGIN_TRACEID, &[]),
    ];
    let base = options.len() * 5 + 1;
    let mut header = Vec::with_capacity(base);
    let mut data = Vec::new();
    for (token, optdata) in options {
        header.push(*token);
        header.extend_from_slice(&((base + data.len()) as u16).to_be_bytes());
        header.extend_from_slice(&(optdata.len() as u16).to_be_bytes());
        data.extend_from_slice(optdata);
    }
    header.push(0xff);
    header.extend_from_slice(&data);
    header
}

struct Login7 {
    text: Vec<(&'static str, String)>,
    ntlm: Option<Vec<u8>>,
}

// Offsets of the (ibField, cchField) pairs within the fixed LOGIN7 header.
const LOGIN7_HEADER_LEN: usize = 94;
const LOGIN7_TEXT_FIELDS: [(&str, usize); 8] = [
    ("HostName", 36),
    ("UserName", 40),
    ("Password", 44),
    ("AppName", 48),
    ("ServerName", 52),
    ("CltIntName", 60),
    ("Language", 64),
    ("Database", 68),
];
const LOGIN7_SSPI_AT: usize = 78;

/// The LOGIN7 header values are little endian regardless of what the
/// byte-order flag claims. Offsets are relative to the start of the
/// payload, lengths count UTF-16 characters.
fn parse_login7(payload: &[u8]) -> Option<Login7> {
    if payload.len() < LOGIN7_HEADER_LEN {
        return None;
    }
    let u16_at = |at: usize| u16::from_le_bytes([payload[at], payload[at + 1]]) as usize;

    let mut text = Vec::new();
    for (name, ib_at) in LOGIN7_TEXT_FIELDS {
        let offset = u16_at(ib_at);
        let chars = u16_at(ib_at + 2);
        let Some(raw) = payload.get(offset..offset + chars * 2) else {
            continue;
        };
        let value = if name == "Password" {
            let decoded: Vec<u8> = raw.iter().map(|&b| decode_password_byte(b)).collect();
            utf16_le(&decoded)
        } else {
            utf16_le(raw)
        };
        text.push((name, value));
    }

    let sspi_offset = u16_at(LOGIN7_SSPI_AT);
    let sspi_len = u16_at(LOGIN7_SSPI_AT + 2);
    let ntlm = if sspi_len == 0 {
        None
    } else {
        let start = sspi_offset.min(payload.len());
        let end = (sspi_offset + sspi_len).min(payload.len());
        Some(payload[start..end].to_vec())
    };
    Some(Login7 { text, ntlm })
}

// Password bytes arrive XORed with 0xA5 and nibble-swapped.
fn decode_password_byte(b: u8) -> u8 {
    let b = b ^ 0xa5;
    (b & 0x0f) << 4 | b >> 4
}

fn utf16_le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn utf16_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// ERROR token 18456 severity 14, the response a real server gives a failed
/// login. The token length reproduces what servers send even though it
/// overcounts by the fixed fields.
fn build_error(message: &str, server_name: &str) -> Vec<u8> {
    let msg = utf16_bytes(message);
    let server = utf16_bytes(server_name);
    let length = (17 + msg.len() + server.len()) as u16;

    let mut out = Vec::with_capacity(length as usize + 3);
    out.push(0xaa);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&18456i32.to_le_bytes());
    out.push(1);
    out.push(14);
    out.extend_from_slice(&((msg.len() / 2) as u16).to_le_bytes());
    out.extend_from_slice(&msg);
    out.push((server.len() / 2) as u8);
    out.extend_from_slice(&server);
    out.push(0);
    out.extend_from_slice(&1i32.to_le_bytes());
    out
}

struct NtlmAuth {
    username: String,
    hostname: String,
    domain: String,
}

/// Digs the NTLMSSP AUTHENTICATE message out of an SSPI packet and reads
/// the domain, user and workstation fields from their (length, offset)
/// descriptors.
fn parse_ntlm_response(payload: &[u8]) -> Option<NtlmAuth> {
    const SIGNATURE: &[u8] = b"NTLMSSP\x00";
    let start = payload
        .windows(SIGNATURE.len())
        .position(|window| window == SIGNATURE)?;
    let msg = &payload[start..];
    if msg.len() < 52 {
        return None;
    }
    if u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]) != 3 {
        return None;
    }
    let field = |at: usize| -> Option<String> {
        let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
        let offset = u32::from_le_bytes([msg[at + 4], msg[at + 5], msg[at + 6], msg[at + 7]]) as usize;
        msg.get(offset..offset + len).map(utf16_le)
    };
    Some(NtlmAuth {
        domain: field(28)?,
        username: field(36)?,
        hostname: field(44)?,
    })
}
