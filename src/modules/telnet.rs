use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, take_line, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 8023;
const MAX_LINE: usize = 16 * 1024;

// WILL ECHO, WILL SUPPRESS-GO-AHEAD, WILL BINARY, DO BINARY, DO NAWS. Nmap
// matches this greeting as a Cisco IOS telnetd.
const PREAMBLE: &[u8] = b"\xff\xfb\x01\xff\xfb\x03\xff\xfb\x00\xff\xfd\x00\xff\xfd\x1f\r\n";
const WILL_ECHO: &[u8] = b"\xff\xfb\x01";
const WONT_ECHO: &[u8] = b"\xff\xfc\x01";

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let banner = config.str_or("telnet.banner", "");
    let addr = bind_addr(config, "telnet", DEFAULT_PORT);
    serve_tcp("telnet", addr, None, move || {
        Box::new(TelnetHandler::new(banner.clone(), logger.clone()))
    })
}

enum TelnetState {
    User,
    Password(String),
}

/// Username/password prompt loop. Echo is negotiated off for the password
/// line and every attempt is refused.
struct TelnetHandler {
    banner: String,
    logger: Logger,
    state: TelnetState,
    iac: IacFilter,
    buf: Vec<u8>,
}

impl TelnetHandler {
    fn new(banner: String, logger: Logger) -> TelnetHandler {
        TelnetHandler {
            banner,
            logger,
            state: TelnetState::User,
            iac: IacFilter::new(),
            buf: Vec::new(),
        }
    }

    async fn handle_line(&mut self, conn: &mut Conn, line: Vec<u8>) {
        let text = String::from_utf8_lossy(&line).into_owned();
        let state = std::mem::replace(&mut self.state, TelnetState::User);
        self.state = match state {
            TelnetState::User => {
                conn.send(WILL_ECHO).await;
                conn.send(b"Password: ").await;
                TelnetState::Password(text)
            }
            TelnetState::Password(username) => {
                self.logger.log(
                    Event::with_endpoints(LogType::TELNET_LOGIN_ATTEMPT, &conn.endpoints)
                        .data("USERNAME", username.as_str())
                        .data("PASSWORD", text.as_str()),
                );
                conn.send(WONT_ECHO).await;
                conn.send(b"\nAuthentication failed.\n").await;
                conn.send(b"Username: ").await;
                TelnetState::User
            }
        };
    }
}

#[async_trait]
impl ProtocolHandler for TelnetHandler {
    async fn on_connect(&mut self, conn: &mut Conn) {
        conn.send(PREAMBLE).await;
        if !self.banner.is_empty() {
            conn.send(format!("{}\n", self.banner).as_bytes()).await;
        }
        conn.send(b"User Access Verification\r\n\r\nUsername: ").await;
    }

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.iac.feed(data, &mut self.buf);
        if self.buf.len() > MAX_LINE {
            conn.close();
            return;
        }
        while let Some(line) = take_line(&mut self.buf) {
            self.handle_line(conn, line).await;
            if conn.is_closing() {
                return;
            }
        }
    }
}

enum IacState {
    Data,
    Command,
    Option,
    Subnegotiation,
    SubnegotiationIac,
}

/// Removes telnet command sequences from the input stream, leaving only user
/// keystrokes. Sequences may arrive split across reads, so the filter keeps
/// its position between feeds.
struct IacFilter {
    state: IacState,
}

impl IacFilter {
    fn new() -> IacFilter {
        IacFilter {
            state: IacState::Data,
        }
    }

    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &byte in data {
            self.state = match self.state {
                IacState::Data => {
                    if byte == 0xff {
                        IacState::Command
                    } else {
                        out.push(byte);
                        IacState::Data
                    }
                }
                IacState::Command => match byte {
                    // escaped literal 0xff
                    0xff => {
                        out.push(0xff);
                        IacState::Data
                    }
                    0xfa => IacState::Subnegotiation,
                    0xfb..=0xfe => IacState::Option,
                    _ => IacState::Data,
                },
                IacState::Option => IacState::Data,
                IacState::Subnegotiation => {
                    if byte == 0xff {
                        IacState::SubnegotiationIac
                    } else {
                        IacState::Subnegotiation
                    }
                }
                IacState::SubnegotiationIac => {
                    if byte == 0xf0 {
                        IacState::Data
                    } else {
                        IacState::Subnegotiation
                    }
                }
            };
        }
    }
}
