use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{to_hex, Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 3306;
const DEFAULT_BANNER: &str = "5.5.43-0ubuntu0.14.04.1";
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

// A real handshake response is well under 1 KiB.
const MAX_PACKET: usize = 64 * 1024;

const ERR_ACCESS_DENIED: u16 = 1045;
const ERR_PACKETS_OUT_OF_ORDER: u16 = 1156;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let banner = config.str_or("mysql.banner", DEFAULT_BANNER);
    let addr = bind_addr(config, "mysql", DEFAULT_PORT);
    serve_tcp("mysql", addr, Some(IDLE_TIMEOUT), move || {
        Box::new(MysqlHandler::new(banner.clone(), logger.clone()))
    })
}

/// Speaks just the first exchange of the MySQL client/server protocol: a
/// server greeting, one client handshake response, and an access-denied
/// error.
struct MysqlHandler {
    banner: String,
    logger: Logger,
    buf: Vec<u8>,
}

impl MysqlHandler {
    fn new(banner: String, logger: Logger) -> MysqlHandler {
        MysqlHandler {
            banner,
            logger,
            buf: Vec::new(),
        }
    }

    async fn handle_packet(&mut self, conn: &mut Conn, seq: u8, payload: &[u8]) {
        if seq != 1 {
            conn.send(&error_packet(2, ERR_PACKETS_OUT_OF_ORDER, "08S01", "Got packets out of order"))
                .await;
            conn.close();
            return;
        }
        match parse_auth(payload) {
            Ok((username, auth)) => {
                self.logger.log(
                    Event::with_endpoints(LogType::MYSQL_LOGIN_ATTEMPT, &conn.endpoints)
                        .data("USERNAME", username.as_str())
                        .data("PASSWORD", to_hex(&auth).as_str()),
                );
                let using_password = if auth.is_empty() { "NO" } else { "YES" };
                let message = format!(
                    "Access denied for user '{}'@'{}' (using password: {})",
                    username,
                    conn.endpoints.peer.ip(),
                    using_password
                );
                conn.send(&error_packet(2, ERR_ACCESS_DENIED, "28000", &message)).await;
                conn.close();
            }
            Err(reason) => {
                log::debug!(
                    "mysql client {} sent a bad handshake response: {}",
                    conn.endpoints.peer,
                    reason
                );
                conn.close();
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for MysqlHandler {
    async fn on_connect(&mut self, conn: &mut Conn) {
        let mut salt = [0u8; 20];
        {
            let mut rng = rand::rng();
            for byte in salt.iter_mut() {
                *byte = rng.random_range(0x21..=0x7e);
            }
        }
        conn.send(&greeting(&self.banner, next_thread_id(), &salt)).await;
    }

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while !conn.is_closing() {
            match parse_packet(&self.buf) {
                Parsed::Incomplete => return,
                Parsed::Invalid(reason) => {
                    log::debug!("mysql client {} framing error: {}", conn.endpoints.peer, reason);
                    conn.close();
                    return;
                }
                Parsed::Complete((seq, payload), consumed) => {
                    self.buf.drain(..consumed);
                    self.handle_packet(conn, seq, &payload).await;
                }
            }
        }
    }
}

fn next_thread_id() -> u32 {
    static THREAD_ID: OnceLock<AtomicU32> = OnceLock::new();
    THREAD_ID
        .get_or_init(|| AtomicU32::new(rand::rng().random_range(0x0100_0000..0x0fff_ffff)))
        .fetch_add(1, Ordering::Relaxed)
}

/// Protocol-10 handshake for a 5.x server: 20 salt bytes split 8/12 around
/// the capability flags, mysql_native_password auth.
fn greeting(banner: &str, thread_id: u32, salt: &[u8; 20]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + banner.len());
    payload.push(0x0a);
    payload.extend_from_slice(banner.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&thread_id.to_le_bytes());
    payload.extend_from_slice(&salt[..8]);
    payload.push(0);
    payload.extend_from_slice(&[0xff, 0xf7]);
    payload.push(0x08);
    payload.extend_from_slice(&[0x02, 0x00]);
    payload.extend_from_slice(&[0x0f, 0x80]);
    payload.push(0x15);
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend_from_slice(&salt[8..]);
    payload.push(0);
    payload.extend_from_slice(b"mysql_native_password\x00");
    wrap_packet(0, &payload)
}

fn wrap_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut packet = Vec::with_capacity(len + 4);
    packet.push((len & 0xff) as u8);
    packet.push(((len >> 8) & 0xff) as u8);
    packet.push(((len >> 16) & 0xff) as u8);
    packet.push(seq);
    packet.extend_from_slice(payload);
    packet
}

fn error_packet(seq: u8, code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(0xff);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(state.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    wrap_packet(seq, &payload)
}

/// One length-prefixed packet: 3-byte little-endian payload length plus a
/// sequence byte.
fn parse_packet(buf: &[u8]) -> Parsed<(u8, Vec<u8>)> {
    if buf.len() < 4 {
        return Parsed::Incomplete;
    }
    let len = buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16;
    if len > MAX_PACKET {
        return Parsed::Invalid(format!("implausible packet length {}", len));
    }
    let total = 4 + len;
    if buf.len() < total {
        return Parsed::Incomplete;
    }
    Parsed::Complete((buf[3], buf[4..total].to_vec()), total)
}

/// Pulls the username and raw auth response out of a protocol-4.1 handshake
/// response: 32 fixed header bytes, NUL-terminated user, length-prefixed
/// auth data.
fn parse_auth(payload: &[u8]) -> Result<(String, Vec<u8>), String> {
    let tail = payload
        .get(32..)
        .ok_or_else(|| String::from("handshake response too short"))?;
    let nul = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| String::from("username is not NUL terminated"))?;
    let username = String::from_utf8_lossy(&tail[..nul]).into_owned();
    let rest = &tail[nul + 1..];
    let (auth_len, rest) = rest
        .split_first()
        .ok_or_else(|| String::from("auth length is missing"))?;
    let auth = rest
        .get(..*auth_len as usize)
        .ok_or_else(|| String::from("auth data is truncated"))?;
    Ok((username, auth.to_vec()))
}
