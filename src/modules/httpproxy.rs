use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::http::{parse_request, HttpRequest};
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 8443;
const DEFAULT_SKIN: &str = "squid";
const INVALID_TOKEN: &str = "Invalid auth-token submitted";

const MAX_BUFFERED: usize = 64 * 1024;

pub(crate) const SKINS: &[&str] = &["squid", "ms-isa"];

/// One proxy personality: the canned headers and refusal page of a real
/// product, replayed verbatim for every request.
struct Profile {
    /// Realm offered when no httpproxy.banner is configured.
    realm: &'static str,
    headers: &'static [(&'static str, &'static str)],
    status_reason: &'static str,
    /// ISA answers in HTTP/1.1 no matter what the client spoke.
    force_http11: bool,
    error_page: &'static str,
}

const SQUID: Profile = Profile {
    realm: "Squid proxy-caching web server",
    headers: &[
        ("Server", "squid/3.3.8"),
        ("Mime-Version", "1.0"),
        ("Vary", "Accept-Language"),
        ("Via", "1.1 localhost (squid/3.3.8)"),
        ("X-Cache", "MISS from localhost"),
        ("X-Cache-Lookup", "NONE from localhost"),
        ("X-Squid-Error", "ERR_CACHE_ACCESS_DENIED 0"),
    ],
    status_reason: "Proxy Authentication Required",
    force_http11: false,
    error_page: SQUID_ERROR_PAGE,
};

// The doubled space inside the parenthesis is what ISA Server really sends.
const MS_ISA: Profile = Profile {
    realm: "",
    headers: &[
        ("Via", "1.1 localhost"),
        ("Proxy-Authenticate", "Basic"),
        ("Pragma", "no-cache"),
        ("Cache-Control", "no-cache"),
    ],
    status_reason: "Proxy Authentication Required ( The ISA Server requires authorization to fulfill the request. Access to the Web Proxy service is denied.  )",
    force_http11: true,
    error_page: ISA_ERROR_PAGE,
};

const SQUID_ERROR_PAGE: &str = r#"<!DOCTYPE html PUBLIC "-//W3C//DTD HTML 4.01//EN" "http://www.w3.org/TR/html4/strict.dtd">
<html><head>
<meta http-equiv="Content-Type" content="text/html; charset=utf-8">
<title>ERROR: Cache Access Denied</title>
</head><body id="ERR_CACHE_ACCESS_DENIED">
<div id="titles">
<h1>ERROR</h1>
<h2>Cache Access Denied.</h2>
</div>
<hr>
<div id="content">
<p>The following error was encountered while trying to retrieve the URL: <a href="[[URL]]">[[URL]]</a></p>
<blockquote id="error">
<p><b>Cache Access Denied.</b></p>
</blockquote>
<p>Sorry, you are not currently allowed to request [[URL]] from this cache until you have authenticated yourself.</p>
<p>Please contact the <a href="mailto:webmaster">cache administrator</a> if you have difficulties authenticating yourself.</p>
</div>
<hr>
<div id="footer">
<p>Generated [[DATE]] by localhost (squid/3.3.8)</p>
</div>
</body></html>
"#;

const ISA_ERROR_PAGE: &str = r#"<html><head>
<meta http-equiv="Content-Type" content="text/html; charset=windows-1252">
<title>The page cannot be displayed</title>
</head><body>
<h1>The page cannot be displayed</h1>
<p>Authentication is required to view this page. The Web Proxy service is denied for [[CLIENTIP]].</p>
<hr>
<p>Error Code: 407 Proxy Authentication Required. The ISA Server requires authorization to fulfill the request. Access to the Web Proxy service is denied. (12209)</p>
<p>Date: [[DATE]]</p>
</body></html>
"#;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let skin = config.str_or("httpproxy.skin", DEFAULT_SKIN);
    let banner = config.str_or("httpproxy.banner", "");
    let addr = bind_addr(config, "httpproxy", DEFAULT_PORT);
    serve_tcp("httpproxy", addr, None, move || {
        Box::new(ProxyHandler::new(&skin, &banner, logger.clone()))
    })
}

struct ProxyHandler {
    profile: &'static Profile,
    realm: String,
    logger: Logger,
    buf: Vec<u8>,
}

impl ProxyHandler {
    fn new(skin: &str, banner: &str, logger: Logger) -> ProxyHandler {
        let profile = match skin {
            "ms-isa" => &MS_ISA,
            _ => &SQUID,
        };
        let realm = if banner.is_empty() {
            profile.realm.to_string()
        } else {
            banner.to_string()
        };
        ProxyHandler {
            profile,
            realm,
            logger,
            buf: Vec::new(),
        }
    }

    async fn handle_request(&mut self, conn: &mut Conn, request: HttpRequest) {
        if let Some(auth) = &request.proxy_authorization {
            let (username, password) = parse_credentials(auth);
            self.logger.log(
                Event::with_endpoints(LogType::HTTPPROXY_LOGIN_ATTEMPT, &conn.endpoints)
                    .data("USERNAME", username.as_str())
                    .data("PASSWORD", password.as_str()),
            );
        }
        self.refuse(conn, &request).await;
        if request.wants_close() {
            conn.close();
        }
    }

    /// Every request gets the same answer: 407 plus the profile's headers
    /// and error page. The page carries the requested URL and the client
    /// address the way the real products render them.
    async fn refuse(&self, conn: &mut Conn, request: &HttpRequest) {
        let proto = if self.profile.force_http11 {
            "HTTP/1.1"
        } else {
            request.version.as_str()
        };
        let url = request.target.replace('<', "&lt;").replace('>', "&gt;");
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let body = self
            .profile
            .error_page
            .replace("[[URL]]", &url)
            .replace("[[DATE]]", &date)
            .replace("[[CLIENTIP]]", &conn.endpoints.peer.ip().to_string());

        let mut response = format!("{} 407 {}\r\n", proto, self.profile.status_reason);
        for (name, value) in self.profile.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("Content-Type: text/html\r\n");
        response.push_str(&format!("Proxy-Authenticate: Basic realm=\"{}\"\r\n", self.realm));
        response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        if request.method != "HEAD" {
            response.push_str(&body);
        }
        conn.send(response.as_bytes()).await;
    }
}

#[async_trait]
impl ProtocolHandler for ProxyHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED {
            conn.close();
            return;
        }
        while !conn.is_closing() {
            match parse_request(&self.buf) {
                Parsed::Incomplete => return,
                Parsed::Invalid(reason) => {
                    log::debug!(
                        "httpproxy client {} sent a bad request: {}",
                        conn.endpoints.peer,
                        reason
                    );
                    conn.send(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
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

/// Pulls the username and password out of a Proxy-Authorization value.
/// Anything other than well-formed Basic credentials is reported as an
/// invalid token so the attempt still shows up in the log.
fn parse_credentials(header: &str) -> (String, String) {
    let invalid = || (String::from(INVALID_TOKEN), String::new());
    let mut parts = header.split_whitespace();
    let (Some(scheme), Some(token)) = (parts.next(), parts.next()) else {
        return invalid();
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return invalid();
    }
    let Some(decoded) = base64_decode(token) else {
        return invalid();
    };
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    match decoded.split_once(':') {
        Some((username, password)) => (username.to_string(), password.to_string()),
        None => invalid(),
    }
}

/// Standard-alphabet base64. Decoding stops at the first padding byte and
/// any character outside the alphabet rejects the whole token.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in input.as_bytes() {
        let value = match b {
            b'A'..=b'Z' => b - b'A',
            b'a'..=b'z' => b - b'a' + 26,
            b'0'..=b'9' => b - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            b'=' => break,
            _ => return None,
        };
        acc = (acc << 6) | u32::from(value);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use crate::transport::{drive_connection, tcp_pair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_session(skin: &str, banner: &str, logger: Logger) -> TcpStream {
        let (client, server) = tcp_pair().await;
        tokio::spawn(drive_connection(
            Box::new(ProxyHandler::new(skin, banner, logger)),
            server,
            None,
        ));
        client
    }

    async fn read_response(client: &mut TcpStream) -> (String, String) {
        let mut raw = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            client.read_exact(&mut byte).await.unwrap();
            raw.push(byte[0]);
            if raw.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8(raw).unwrap();
        let content_length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        let mut body = vec![0u8; content_length];
        client.read_exact(&mut body).await.unwrap();
        (head, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn base64_tokens_decode() {
        assert_eq!(base64_decode("Ym9iOnNlY3JldA==").unwrap(), b"bob:secret");
        assert_eq!(base64_decode("Ym9i").unwrap(), b"bob");
        assert_eq!(base64_decode("").unwrap(), b"");
        assert!(base64_decode("not!base64").is_none());
    }

    #[test]
    fn credentials_come_out_of_basic_tokens() {
        assert_eq!(
            parse_credentials("Basic Ym9iOnNlY3JldA=="),
            (String::from("bob"), String::from("secret"))
        );
        assert_eq!(
            parse_credentials("basic Ym9iOnNlY3JldA=="),
            (String::from("bob"), String::from("secret"))
        );
        let invalid = (String::from(INVALID_TOKEN), String::new());
        assert_eq!(parse_credentials("Bearer xyz"), invalid);
        assert_eq!(parse_credentials("Basic ????"), invalid);
        assert_eq!(parse_credentials("Basic Ym9i"), invalid);
        assert_eq!(parse_credentials("Basic"), invalid);
    }

    #[tokio::test]
    async fn every_request_is_refused() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(DEFAULT_SKIN, "", logger).await;
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(head.contains("Server: squid/3.3.8\r\n"));
        assert!(head.contains("X-Squid-Error: ERR_CACHE_ACCESS_DENIED 0\r\n"));
        assert!(head.contains("Proxy-Authenticate: Basic realm=\"Squid proxy-caching web server\"\r\n"));
        assert!(body.contains("http://example.com/"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn submitted_credentials_are_captured() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(DEFAULT_SKIN, "", logger).await;
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic Ym9iOnNlY3JldA==\r\n\r\n",
            )
            .await
            .unwrap();
        let (head, _body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 407"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.logtype, LogType::HTTPPROXY_LOGIN_ATTEMPT);
        assert_eq!(event.logdata.get("USERNAME").unwrap(), "bob");
        assert_eq!(event.logdata.get("PASSWORD").unwrap(), "secret");
    }

    #[tokio::test]
    async fn garbage_tokens_are_still_reported() {
        let (logger, mut events) = capture_logger();
        let mut client = start_session(DEFAULT_SKIN, "", logger).await;
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic ????\r\n\r\n",
            )
            .await
            .unwrap();
        read_response(&mut client).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.logdata.get("USERNAME").unwrap(), INVALID_TOKEN);
        assert_eq!(event.logdata.get("PASSWORD").unwrap(), "");
    }

    #[tokio::test]
    async fn isa_skin_forces_http11() {
        let (logger, _events) = capture_logger();
        let mut client = start_session("ms-isa", "", logger).await;
        client
            .write_all(b"GET http://example.com/ HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with(
            "HTTP/1.1 407 Proxy Authentication Required ( The ISA Server requires authorization"
        ));
        assert!(head.contains("Via: 1.1 localhost\r\n"));
        assert!(head.contains("Proxy-Authenticate: Basic\r\n"));
        assert!(head.contains("Proxy-Authenticate: Basic realm=\"\"\r\n"));
        assert!(body.contains("12209"));

        // HTTP/1.0 without keep-alive ends the connection after the reply.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn configured_banner_overrides_the_realm() {
        let (logger, _events) = capture_logger();
        let mut client = start_session(DEFAULT_SKIN, "Corp internet gateway", logger).await;
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let (head, _body) = read_response(&mut client).await;
        assert!(head.contains("Proxy-Authenticate: Basic realm=\"Corp internet gateway\"\r\n"));
    }
}
