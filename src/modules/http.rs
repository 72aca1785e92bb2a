use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 80;
const DEFAULT_BANNER: &str = "Apache/2.2.22 (Ubuntu)";
const DEFAULT_SKIN: &str = "basicLogin";
const NOT_SUPPLIED: &str = "<not supplied>";

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 64 * 1024;

const START_ERR: &str = "<!--STARTERR-->";
const END_ERR: &str = "<!--ENDERR-->";

pub(crate) const SKINS: &[&str] = &["basicLogin", "nasLogin"];

const BASIC_LOGIN_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Login</title>
<style>
body { background: #f0f0f0; font-family: Verdana, Arial, sans-serif; font-size: 12px; }
.box { width: 280px; margin: 120px auto; padding: 24px; background: #fff; border: 1px solid #ccc; }
.box h1 { font-size: 15px; margin: 0 0 14px 0; }
.box input { width: 100%; margin-bottom: 10px; padding: 4px; }
.alert { color: #b00; margin-bottom: 10px; }
</style>
</head>
<body>
<div class="box">
<h1>Please log in</h1>
<!--STARTERR-->
<p class="alert">Invalid username or password</p>
<!--ENDERR-->
<form method="POST" action="/index.html">
<input type="text" name="username" placeholder="Username">
<input type="password" name="password" placeholder="Password">
<input type="submit" value="Sign in">
</form>
</div>
</body>
</html>
"#;

const NAS_LOGIN_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>NAS - Login</title>
<style>
body { background: #2f3b4c; font-family: "Segoe UI", Helvetica, sans-serif; }
.panel { width: 340px; margin: 110px auto; padding: 30px; background: #fff; border-radius: 4px; }
.panel h1 { font-size: 18px; font-weight: normal; color: #333; }
.panel input { width: 100%; margin-bottom: 12px; padding: 6px; border: 1px solid #bbb; }
.panel .warn { color: #c33; font-size: 12px; margin-bottom: 12px; }
button { width: 100%; padding: 7px; background: #1a73b5; color: #fff; border: 0; }
</style>
</head>
<body>
<div class="panel">
<h1>DiskStation</h1>
<!--STARTERR-->
<div class="warn">You cannot login to the system because the account or password is invalid.</div>
<!--ENDERR-->
<form method="POST" action="/index.html">
<input type="text" name="username" placeholder="Username">
<input type="password" name="password" placeholder="Password">
<button type="submit">Log in</button>
</form>
</div>
</body>
</html>
"#;

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>404 Not Found</title>
</head><body>
<h1>Not Found</h1>
<p>The requested URL [[URL]] was not found on this server.</p>
<hr>
<address>[[BANNER]] Server</address>
</body></html>
"#;

const REDIRECT_PAGE: &str = r#"<html><head><title>Moved Permanently</title></head>
<body><h1>Moved Permanently</h1><p>The document has moved <a href="/index.html">here</a>.</p></body></html>
"#;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let skin = config.str_or("http.skin", DEFAULT_SKIN);
    let banner = config.str_or("http.banner", DEFAULT_BANNER);
    let pages = Arc::new(Pages::build(skin, banner));
    let addr = bind_addr(config, "http", DEFAULT_PORT);
    serve_tcp("http", addr, None, move || {
        Box::new(HttpHandler::new(pages.clone(), logger.clone()))
    })
}

/// Skin pages rendered once at start-up. The index page carries an error
/// block between marker comments: hidden on the login page, shown after a
/// failed login.
struct Pages {
    skin: String,
    banner: String,
    login: String,
    failed: String,
}

impl Pages {
    fn build(skin: String, banner: String) -> Pages {
        let index = match skin.as_str() {
            "nasLogin" => NAS_LOGIN_INDEX,
            _ => BASIC_LOGIN_INDEX,
        };
        let login = match (index.find(START_ERR), index.find(END_ERR)) {
            (Some(start), Some(end)) if end >= start => {
                let mut out = String::with_capacity(index.len());
                out.push_str(&index[..start]);
                out.push_str(&index[end + END_ERR.len()..]);
                out
            }
            _ => index.to_string(),
        };
        let failed = index.replace(START_ERR, "").replace(END_ERR, "");
        Pages {
            skin,
            banner,
            login,
            failed,
        }
    }

    fn not_found(&self, path: &str) -> String {
        let escaped = path.replace('<', "&lt;").replace('>', "&gt;");
        NOT_FOUND_PAGE
            .replace("[[URL]]", &escaped)
            .replace("[[BANNER]]", &self.banner)
    }
}

struct HttpHandler {
    pages: Arc<Pages>,
    logger: Logger,
    buf: Vec<u8>,
}

impl HttpHandler {
    fn new(pages: Arc<Pages>, logger: Logger) -> HttpHandler {
        HttpHandler {
            pages,
            logger,
            buf: Vec::new(),
        }
    }

    async fn handle_request(&mut self, conn: &mut Conn, request: HttpRequest) {
        let hostname = match &request.host {
            Some(host) => strip_port(host).to_string(),
            None => conn.endpoints.local.ip().to_string(),
        };
        let useragent = request.user_agent.clone().unwrap_or_else(|| String::from(NOT_SUPPLIED));
        let head_only = request.method == "HEAD";

        match (request.method.as_str(), request.path.as_str()) {
            ("GET" | "HEAD" | "POST", "/") => {
                self.respond(
                    conn,
                    "301 Moved Permanently",
                    &[("Location", "/index.html")],
                    REDIRECT_PAGE,
                    head_only,
                )
                .await;
            }
            ("GET" | "HEAD", "/index.html") => {
                self.logger.log(
                    Event::with_endpoints(LogType::HTTP_GET, &conn.endpoints)
                        .data("SKIN", self.pages.skin.as_str())
                        .data("HOSTNAME", hostname.as_str())
                        .data("PATH", request.path.as_str())
                        .data("USERAGENT", useragent.as_str()),
                );
                let body = self.pages.login.clone();
                self.respond(conn, "200 OK", &[], &body, head_only).await;
            }
            ("POST", "/index.html") => {
                let body = String::from_utf8_lossy(&request.body);
                let username =
                    form_value(&body, "username").unwrap_or_else(|| String::from(NOT_SUPPLIED));
                let password =
                    form_value(&body, "password").unwrap_or_else(|| String::from(NOT_SUPPLIED));
                self.logger.log(
                    Event::with_endpoints(LogType::HTTP_POST_LOGIN_ATTEMPT, &conn.endpoints)
                        .data("USERNAME", username.as_str())
                        .data("PASSWORD", password.as_str())
                        .data("SKIN", self.pages.skin.as_str())
                        .data("HOSTNAME", hostname.as_str())
                        .data("PATH", request.path.as_str())
                        .data("USERAGENT", useragent.as_str()),
                );
                let page = self.pages.failed.clone();
                self.respond(conn, "200 OK", &[], &page, false).await;
            }
            ("GET" | "HEAD" | "POST", _) => {
                let body = self.pages.not_found(&request.path);
                self.respond(conn, "404 Not Found", &[], &body, head_only).await;
            }
            _ => {
                self.respond(conn, "501 Not Implemented", &[], "", false).await;
            }
        }

        if request.wants_close() {
            conn.close();
        }
    }

    async fn respond(
        &self,
        conn: &mut Conn,
        status: &str,
        extra: &[(&str, &str)],
        body: &str,
        head_only: bool,
    ) {
        let mut response = format!("HTTP/1.1 {}\r\n", status);
        response.push_str(&format!("Server: {}\r\n", self.pages.banner));
        for (name, value) in extra {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("Content-Type: text/html\r\n");
        response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        if !head_only {
            response.push_str(body);
        }
        conn.send(response.as_bytes()).await;
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while !conn.is_closing() {
            match parse_request(&self.buf) {
                Parsed::Incomplete => return,
                Parsed::Invalid(reason) => {
                    log::debug!("http client {} sent a bad request: {}", conn.endpoints.peer, reason);
                    self.respond(conn, "400 Bad Request", &[], "", false).await;
                    conn.close();
                    return;
                }
                Parsed::Complete(request, consumed) => {
                    self.buf.drain(..consumed);
                    self.handle_request(conn, request).await;
                }
            }
        }
    }
}

pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) version: String,
    pub(crate) host: Option<String>,
    pub(crate) user_agent: Option<String>,
    pub(crate) connection: Option<String>,
    pub(crate) proxy_authorization: Option<String>,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn wants_close(&self) -> bool {
        let connection = self
            .connection
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        if self.version == "HTTP/1.0" {
            connection != "keep-alive"
        } else {
            connection == "close"
        }
    }
}

fn head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// One request: head plus a Content-Length delimited body. The query string
/// is stripped from the logged path.
pub(crate) fn parse_request(buf: &[u8]) -> Parsed<HttpRequest> {
    let Some((head_len, delim_len)) = head_end(buf) else {
        if buf.len() > MAX_HEAD {
            return Parsed::Invalid(String::from("request head too large"));
        }
        return Parsed::Incomplete;
    };
    let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
    let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let Some(method) = parts.next() else {
        return Parsed::Invalid(String::from("empty request line"));
    };
    let Some(target) = parts.next() else {
        return Parsed::Invalid(String::from("request line has no target"));
    };
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();
    let path = target.split('?').next().unwrap_or("").to_string();

    let mut host = None;
    let mut user_agent = None;
    let mut connection = None;
    let mut proxy_authorization = None;
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "host" => host = Some(value.to_string()),
            "user-agent" => user_agent = Some(value.to_string()),
            "connection" => connection = Some(value.to_string()),
            "proxy-authorization" => proxy_authorization = Some(value.to_string()),
            "content-length" => match value.parse() {
                Ok(length) => content_length = length,
                Err(_) => return Parsed::Invalid(String::from("bad content length")),
            },
            _ => {}
        }
    }
    if content_length > MAX_BODY {
        return Parsed::Invalid(String::from("request body too large"));
    }

    let body_start = head_len + delim_len;
    let total = body_start + content_length;
    if buf.len() < total {
        return Parsed::Incomplete;
    }
    Parsed::Complete(
        HttpRequest {
            method: method.to_string(),
            target: target.to_string(),
            path,
            version,
            host,
            user_agent,
            connection,
            proxy_authorization,
            body: buf[body_start..total].to_vec(),
        },
        total,
    )
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    host.split(':').next().unwrap_or("")
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn urldecode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn form_value(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if urldecode(name) == key {
            return Some(urldecode(value));
        }
    }
    None
}
