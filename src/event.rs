use chrono::{Local, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::transport::Endpoints;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Numeric event category. The values are shared with downstream log
/// consumers and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogType(pub u32);

impl LogType {
    pub const BOOT: LogType = LogType(1000);
    pub const MSG: LogType = LogType(1001);
    pub const DEBUG: LogType = LogType(1002);
    pub const ERROR: LogType = LogType(1003);
    pub const PING: LogType = LogType(1004);
    pub const CONFIG_SAVE: LogType = LogType(1005);
    pub const EXAMPLE: LogType = LogType(1006);
    pub const FTP_LOGIN_ATTEMPT: LogType = LogType(2000);
    pub const FTP_AUTH_ATTEMPT_INITIATED: LogType = LogType(2001);
    pub const HTTP_GET: LogType = LogType(3000);
    pub const HTTP_POST_LOGIN_ATTEMPT: LogType = LogType(3001);
    pub const SSH_NEW_CONNECTION: LogType = LogType(4000);
    pub const SSH_REMOTE_VERSION_SENT: LogType = LogType(4001);
    pub const SSH_LOGIN_ATTEMPT: LogType = LogType(4002);
    pub const SMB_FILE_OPEN: LogType = LogType(5000);
    pub const PORT_SYN: LogType = LogType(5001);
    pub const PORT_NMAP_OS: LogType = LogType(5002);
    pub const PORT_NMAP_NULL: LogType = LogType(5003);
    pub const PORT_NMAP_XMAS: LogType = LogType(5004);
    pub const PORT_NMAP_FIN: LogType = LogType(5005);
    pub const TELNET_LOGIN_ATTEMPT: LogType = LogType(6001);
    pub const HTTPPROXY_LOGIN_ATTEMPT: LogType = LogType(7001);
    pub const MYSQL_LOGIN_ATTEMPT: LogType = LogType(8001);
    pub const MSSQL_LOGIN_SQLAUTH: LogType = LogType(9001);
    pub const MSSQL_LOGIN_WINAUTH: LogType = LogType(9002);
    pub const TFTP: LogType = LogType(10001);
    pub const NTP_MONLIST: LogType = LogType(11001);
    pub const VNC: LogType = LogType(12001);
    pub const SNMP_CMD: LogType = LogType(13001);
    pub const RDP: LogType = LogType(14001);
    pub const SIP_REQUEST: LogType = LogType(15001);
    pub const GIT_CLONE_REQUEST: LogType = LogType(16001);
    pub const REDIS_COMMAND: LogType = LogType(17001);
    pub const TCP_BANNER_CONNECTION_MADE: LogType = LogType(18001);
    pub const TCP_BANNER_KEEP_ALIVE_CONNECTION_MADE: LogType = LogType(18002);
    pub const TCP_BANNER_KEEP_ALIVE_SECRET_RECEIVED: LogType = LogType(18003);
    pub const TCP_BANNER_KEEP_ALIVE_DATA_RECEIVED: LogType = LogType(18004);
    pub const TCP_BANNER_DATA_RECEIVED: LogType = LogType(18005);
    pub const USER_0: LogType = LogType(99000);
    pub const USER_1: LogType = LogType(99001);
    pub const USER_2: LogType = LogType(99002);
    pub const USER_3: LogType = LogType(99003);
    pub const USER_4: LogType = LogType(99004);
    pub const USER_5: LogType = LogType(99005);
    pub const USER_6: LogType = LogType(99006);
    pub const USER_7: LogType = LogType(99007);
    pub const USER_8: LogType = LogType(99008);
    pub const USER_9: LogType = LogType(99009);
}

impl Serialize for LogType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

/// A fully sanitized event, ready for sink delivery. Never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub dst_host: String,
    pub dst_port: i32,
    pub local_time: String,
    pub logdata: Map<String, Value>,
    pub logtype: LogType,
    pub node_id: String,
    pub src_host: String,
    pub src_port: i32,
    pub utc_time: String,
}

impl LogEvent {
    /// One JSON object with deterministically sorted keys, as written by the
    /// file and socket sinks (no trailing newline).
    pub fn to_json(&self) -> String {
        match serde_json::to_value(self) {
            Ok(value) => value.to_string(),
            Err(err) => {
                log::error!("Failed to serialize log event: {}", err);
                String::from("{}")
            }
        }
    }
}

/// A partially populated event as produced by protocol handlers. Every field
/// a handler does not know is filled in by [`Event::sanitize`].
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub logtype: Option<LogType>,
    pub logdata: Map<String, Value>,
    pub src_host: Option<String>,
    pub src_port: Option<i32>,
    pub dst_host: Option<String>,
    pub dst_port: Option<i32>,
    pub node_id: Option<String>,
    pub local_time: Option<String>,
    pub utc_time: Option<String>,
}

impl Event {
    pub fn new(logtype: LogType) -> Event {
        Event {
            logtype: Some(logtype),
            ..Default::default()
        }
    }

    /// Event with src/dst pre-filled from the connection endpoints.
    pub fn with_endpoints(logtype: LogType, endpoints: &Endpoints) -> Event {
        let mut event = Event::new(logtype);
        event.src_host = Some(endpoints.peer.ip().to_string());
        event.src_port = Some(endpoints.peer.port() as i32);
        event.dst_host = Some(endpoints.local.ip().to_string());
        event.dst_port = Some(endpoints.local.port() as i32);
        event
    }

    pub fn data(mut self, key: &str, value: impl Into<Value>) -> Event {
        self.logdata.insert(key.to_string(), value.into());
        self
    }

    /// Fills every missing field with its default. Fields that are already
    /// present are left untouched, so sanitizing twice is a no-op.
    pub fn sanitize(self, node_id: &str) -> LogEvent {
        LogEvent {
            node_id: self.node_id.unwrap_or_else(|| node_id.to_string()),
            local_time: self
                .local_time
                .unwrap_or_else(|| Local::now().format(TIME_FORMAT).to_string()),
            utc_time: self
                .utc_time
                .unwrap_or_else(|| Utc::now().format(TIME_FORMAT).to_string()),
            src_host: self.src_host.unwrap_or_default(),
            src_port: self.src_port.unwrap_or(-1),
            dst_host: self.dst_host.unwrap_or_default(),
            dst_port: self.dst_port.unwrap_or(-1),
            logtype: self.logtype.unwrap_or(LogType::MSG),
            logdata: self.logdata,
        }
    }
}

/// Lowercase hex, as captured credentials and challenges appear in logdata.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
