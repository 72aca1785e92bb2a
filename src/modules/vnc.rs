use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{to_hex, Event, LogType};
use crate::logger::Logger;
use crate::modules::des::Des;
use crate::modules::{bind_addr, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 5900;
const SERVER_VERSION: &[u8] = b"RFB 003.008\n";

// Tried against every challenge response so the alert can name the
// password when a scanner guesses from the usual list.
const COMMON_PASSWORDS: &[&str] = &[
    "111111",
    "password",
    "123456",
    "1234",
    "administrator",
    "root",
    "passw0rd",
];

const AUTH_FAILURE: &[u8] = b"\x00\x00\x00\x01\x00\x00\x00\x16Authentication failure";

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "vnc", DEFAULT_PORT);
    serve_tcp("vnc", addr, None, move || Box::new(VncHandler::new(logger.clone())))
}

enum VncState {
    Handshake,
    Security,
    Auth,
    Done,
}

/// RFB 3.8 up to the authentication result. Only the VNC security type is
/// offered, and the challenge response is always refused.
struct VncHandler {
    logger: Logger,
    state: VncState,
    challenge: [u8; 16],
    buf: Vec<u8>,
}

impl VncHandler {
    fn new(logger: Logger) -> VncHandler {
        VncHandler {
            logger,
            state: VncState::Handshake,
            challenge: [0u8; 16],
            buf: Vec::new(),
        }
    }

    async fn handle_auth_response(&mut self, conn: &mut Conn, response: &[u8]) {
        let mut event = Event::with_endpoints(LogType::VNC, &conn.endpoints)
            .data("VNC Server Challenge", to_hex(&self.challenge).as_str())
            .data("VNC Client Response", to_hex(response).as_str());
        event = match matched_password(&self.challenge, response) {
            Some(password) => event.data("VNC Password", password),
            None => event.data("VNC Password", "<Password was not in the common list>"),
        };
        self.logger.log(event);
        conn.send(AUTH_FAILURE).await;
        conn.close();
    }
}

#[async_trait]
impl ProtocolHandler for VncHandler {
    async fn on_connect(&mut self, conn: &mut Conn) {
        conn.send(SERVER_VERSION).await;
    }

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while !conn.is_closing() {
            match self.state {
                VncState::Handshake => {
                    if self.buf.len() < SERVER_VERSION.len() {
                        return;
                    }
                    let version: Vec<u8> = self.buf.drain(..SERVER_VERSION.len()).collect();
                    if version != SERVER_VERSION {
                        log::debug!(
                            "vnc client {} offered an unsupported version",
                            conn.endpoints.peer
                        );
                        conn.close();
                        return;
                    }
                    conn.send(b"\x01\x02").await;
                    self.state = VncState::Security;
                }
                VncState::Security => {
                    if self.buf.is_empty() {
                        return;
                    }
                    if self.buf.remove(0) != 0x02 {
                        conn.close();
                        return;
                    }
                    rand::rng().fill(&mut self.challenge[..]);
                    conn.send(&self.challenge).await;
                    self.state = VncState::Auth;
                }
                VncState::Auth => {
                    if self.buf.len() < 16 {
                        return;
                    }
                    let response: Vec<u8> = self.buf.drain(..16).collect();
                    self.handle_auth_response(conn, &response).await;
                    self.state = VncState::Done;
                }
                VncState::Done => return,
            }
        }
    }
}

// RFB keys the cipher with the password NUL-padded to eight bytes and
// every byte bit-mirrored.
fn vnc_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    key
}

fn matched_password(challenge: &[u8; 16], response: &[u8]) -> Option<&'static str> {
    for password in COMMON_PASSWORDS {
        let des = Des::new(vnc_key(password));
        let mut decrypted = [0u8; 16];
        for (chunk, output) in response.chunks_exact(8).zip(decrypted.chunks_exact_mut(8)) {
            let block: [u8; 8] = chunk.try_into().unwrap_or_default();
            output.copy_from_slice(&des.decrypt_block(block));
        }
        if decrypted == *challenge {
            return Some(password);
        }
    }
    None
}
