use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, take_line, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 21;
const MAX_LINE: usize = 16 * 1024;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let banner = config.str_or("ftp.banner", "FTP Ready.");
    let log_initiated = config.bool_or("ftp.log_auth_attempt_initiated", false);
    let addr = bind_addr(config, "ftp", DEFAULT_PORT);
    serve_tcp("ftp", addr, None, move || {
        Box::new(FtpHandler::new(banner.clone(), log_initiated, logger.clone()))
    })
}

enum FtpState {
    NeedUser,
    NeedPass(String),
}

/// Control-channel dialogue up to and including the PASS command. Every
/// authentication attempt fails, so the session never leaves the login
/// states.
struct FtpHandler {
    banner: String,
    log_initiated: bool,
    logger: Logger,
    state: FtpState,
    buf: Vec<u8>,
}

impl FtpHandler {
    fn new(banner: String, log_initiated: bool, logger: Logger) -> FtpHandler {
        FtpHandler {
            banner,
            log_initiated,
            logger,
            state: FtpState::NeedUser,
            buf: Vec::new(),
        }
    }

    async fn handle_line(&mut self, conn: &mut Conn, line: Vec<u8>) {
        let text = String::from_utf8_lossy(&line).into_owned();
        let (cmd, arg) = split_command(&text);
        let state = std::mem::replace(&mut self.state, FtpState::NeedUser);
        self.state = match state {
            FtpState::NeedUser => match cmd.as_str() {
                "USER" if arg.is_empty() => {
                    reply(conn, "500 Syntax error: USER requires an argument").await;
                    FtpState::NeedUser
                }
                "USER" if arg == "anonymous" => {
                    reply(conn, "331 Guest login ok, type your email address as password.").await;
                    FtpState::NeedPass(arg)
                }
                "USER" => {
                    reply(conn, &format!("331 Password required for {}.", arg)).await;
                    FtpState::NeedPass(arg)
                }
                "PASS" => {
                    reply(conn, "503 Incorrect sequence of commands: USER required before PASS")
                        .await;
                    FtpState::NeedUser
                }
                "QUIT" => {
                    reply(conn, "221 Goodbye.").await;
                    conn.close();
                    FtpState::NeedUser
                }
                _ => {
                    reply(conn, "530 Please login with USER and PASS.").await;
                    FtpState::NeedUser
                }
            },
            FtpState::NeedPass(user) => match cmd.as_str() {
                "PASS" => {
                    if self.log_initiated {
                        self.logger.log(Event::with_endpoints(
                            LogType::FTP_AUTH_ATTEMPT_INITIATED,
                            &conn.endpoints,
                        ));
                    }
                    self.logger.log(
                        Event::with_endpoints(LogType::FTP_LOGIN_ATTEMPT, &conn.endpoints)
                            .data("USERNAME", user.as_str())
                            .data("PASSWORD", arg.as_str()),
                    );
                    reply(conn, "530 Sorry, Authentication failed.").await;
                    FtpState::NeedUser
                }
                "QUIT" => {
                    reply(conn, "221 Goodbye.").await;
                    conn.close();
                    FtpState::NeedUser
                }
                _ => {
                    reply(conn, "503 Incorrect sequence of commands: PASS required after USER")
                        .await;
                    FtpState::NeedPass(user)
                }
            },
        };
    }
}

#[async_trait]
impl ProtocolHandler for FtpHandler {
    async fn on_connect(&mut self, conn: &mut Conn) {
        let greeting = format!("220 {}\r\n", self.banner);
        conn.send(greeting.as_bytes()).await;
    }

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
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

async fn reply(conn: &mut Conn, text: &str) {
    conn.send(format!("{}\r\n", text).as_bytes()).await;
}

fn split_command(text: &str) -> (String, String) {
    match text.split_once(' ') {
        Some((cmd, arg)) => (cmd.to_ascii_uppercase(), arg.to_string()),
        None => (text.to_ascii_uppercase(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use crate::transport::{drive_connection, tcp_pair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_session(logger: Logger) -> TcpStream {
        let (client, server) = tcp_pair().await;
        let handler = FtpHandler::new(String::from("FTP Ready."), false, logger);
        tokio::spawn(drive_connection(Box::new(handler), server, None));
        client
    }

    async fn expect(client: &mut TcpStream, wanted: &str) {
        let mut got = Vec::new();
        while got.len() < wanted.len() {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "peer closed while waiting for {:?}", wanted);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(String::from_utf8_lossy(&got), wanted);
    }

    #[tokio::test]
    async fn anonymous_login_attempt_is_captured() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(logger).await;
        let local_port = client.local_addr().unwrap().port();
        let server_port = client.peer_addr().unwrap().port();

        expect(&mut client, "220 FTP Ready.\r\n").await;
        client.write_all(b"USER anonymous\r\n").await.unwrap();
        expect(
            &mut client,
            "331 Guest login ok, type your email address as password.\r\n",
        )
        .await;
        client.write_all(b"PASS x@y\r\n").await.unwrap();
        expect(&mut client, "530 Sorry, Authentication failed.\r\n").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.logtype, LogType::FTP_LOGIN_ATTEMPT);
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "anonymous");
        assert_eq!(event.logdata.get("PASSWORD").unwrap(), "x@y");
        assert_eq!(event.src_port, i32::from(local_port));
        assert_eq!(event.dst_port, i32::from(server_port));
    }

    #[tokio::test]
    async fn named_user_is_prompted_by_name() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(logger).await;

        expect(&mut client, "220 FTP Ready.\r\n").await;
        client.write_all(b"user bob\r\n").await.unwrap();
        expect(&mut client, "331 Password required for bob.\r\n").await;
        client.write_all(b"PASS hunter2\r\n").await.unwrap();
        expect(&mut client, "530 Sorry, Authentication failed.\r\n").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "bob");
        assert_eq!(event.logdata.get("PASSWORD").unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn command_sequencing_is_enforced() {
        let (logger, _events) = capture_logger();
        let mut client = start_session(logger).await;

        expect(&mut client, "220 FTP Ready.\r\n").await;
        client.write_all(b"PASS early\r\n").await.unwrap();
        expect(
            &mut client,
            "503 Incorrect sequence of commands: USER required before PASS\r\n",
        )
        .await;
        client.write_all(b"LIST\r\n").await.unwrap();
        expect(&mut client, "530 Please login with USER and PASS.\r\n").await;
        client.write_all(b"USER bob\r\n").await.unwrap();
        expect(&mut client, "331 Password required for bob.\r\n").await;
        client.write_all(b"LIST\r\n").await.unwrap();
        expect(
            &mut client,
            "503 Incorrect sequence of commands: PASS required after USER\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn quit_says_goodbye_and_disconnects() {
        let (logger, _events) = capture_logger();
        let mut client = start_session(logger).await;

        expect(&mut client, "220 FTP Ready.\r\n").await;
        client.write_all(b"QUIT\r\n").await.unwrap();
        expect(&mut client, "221 Goodbye.\r\n").await;
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn byte_at_a_time_delivery_still_parses() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(logger).await;

        expect(&mut client, "220 FTP Ready.\r\n").await;
        for byte in b"USER bob\r\n".iter() {
            client.write_all(&[*byte]).await.unwrap();
        }
        expect(&mut client, "331 Password required for bob.\r\n").await;
        for byte in b"PASS pw\r\n".iter() {
            client.write_all(&[*byte]).await.unwrap();
        }
        expect(&mut client, "530 Sorry, Authentication failed.\r\n").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "bob");
        assert_eq!(event.logdata.get("PASSWORD").unwrap(), "pw");
    }

    #[test]
    fn command_splitting() {
        assert_eq!(split_command("USER bob"), (String::from("USER"), String::from("bob")));
        assert_eq!(
            split_command("pass two words"),
            (String::from("PASS"), String::from("two words"))
        );
        assert_eq!(split_command("QUIT"), (String::from("QUIT"), String::new()));
    }
}
