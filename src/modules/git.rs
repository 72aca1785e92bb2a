use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 9418;

const UPLOAD_PACK: &[u8] = b"git-upload-pack ";

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "git", DEFAULT_PORT);
    serve_tcp("git", addr, None, move || {
        Box::new(GitHandler::new(logger.clone()))
    })
}

struct GitHandler {
    logger: Logger,
    buf: Vec<u8>,
}

impl GitHandler {
    fn new(logger: Logger) -> GitHandler {
        GitHandler {
            logger,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for GitHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        match parse_request(&self.buf) {
            Parsed::Incomplete => {}
            Parsed::Invalid(reason) => {
                // Anything that is not a clone request is dropped without
                // a reply; the real daemon is equally terse.
                log::debug!("git client {} rejected: {}", conn.endpoints.peer, reason);
                conn.close();
            }
            Parsed::Complete(request, _consumed) => {
                self.logger.log(
                    Event::with_endpoints(LogType::GIT_CLONE_REQUEST, &conn.endpoints)
                        .data("REPO", request.repo.as_str())
                        .data("HOST", request.host.as_str()),
                );
                conn.send(&error_reply(&request.repo)).await;
                conn.close();
            }
        }
    }
}

struct CloneRequest {
    repo: String,
    host: String,
}

/// One pkt-line holding a `git-upload-pack <path>\0host=<host>\0` request.
/// The four hex digits up front give the total line length including
/// themselves.
fn parse_request(buf: &[u8]) -> Parsed<CloneRequest> {
    if buf.len() < 4 {
        return Parsed::Incomplete;
    }
    let Some(total) = std::str::from_utf8(&buf[..4])
        .ok()
        .and_then(|hex| usize::from_str_radix(hex, 16).ok())
    else {
        return Parsed::Invalid(String::from("length prefix is not hex"));
    };
    if total < 4 + UPLOAD_PACK.len() {
        return Parsed::Invalid(format!("pkt-line length {} too short for a request", total));
    }
    if buf.len() < total {
        return Parsed::Incomplete;
    }
    let payload = &buf[4..total];
    let Some(rest) = payload.strip_prefix(UPLOAD_PACK) else {
        return Parsed::Invalid(String::from("not a git-upload-pack request"));
    };

    let mut params = rest.split(|&b| b == 0);
    let repo = String::from_utf8_lossy(params.next().unwrap_or(b"")).into_owned();
    let repo = repo.strip_prefix('/').unwrap_or(&repo).to_string();
    let host = params
        .find_map(|param| param.strip_prefix(b"host="))
        .map(|value| String::from_utf8_lossy(value).into_owned())
        .unwrap_or_default();
    Parsed::Complete(CloneRequest { repo, host }, total)
}

fn error_reply(repo: &str) -> Vec<u8> {
    let message = format!("ERR no such repository: {}\n", repo);
    format!("{:04x}{}", message.len() + 4, message).into_bytes()
}
