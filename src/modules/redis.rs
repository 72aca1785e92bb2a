use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, Parsed, ProtocolHandler};
use crate::transport::{serve_tcp, Conn};

const DEFAULT_PORT: u16 = 6379;
const DEFAULT_MAX_ARG_LENGTH: i64 = 30;

const MAX_REQUEST: usize = 64 * 1024;
const MAX_MULTIBULK: i64 = 1024 * 1024;
const MAX_BULK: i64 = 1024 * 1024;

/// Argument count bounds per command, after the command word itself.
/// None means unbounded.
const COMMANDS: &[(&str, u32, Option<u32>)] = &[
    ("APPEND", 2, Some(2)),
    ("AUTH", 1, Some(1)),
    ("BGREWRITEAOF", 0, Some(0)),
    ("BGSAVE", 0, None),
    ("BITCOUNT", 1, None),
    ("BITFIELD", 1, None),
    ("BITOP", 3, None),
    ("BITPOS", 2, None),
    ("BLPOP", 2, None),
    ("BRPOP", 2, None),
    ("BRPOPLPUSH", 3, Some(3)),
    ("COMMAND", 0, None),
    ("DBSIZE", 0, Some(0)),
    ("DECR", 1, Some(1)),
    ("DECRBY", 2, Some(2)),
    ("DEL", 1, None),
    ("DISCARD", 0, Some(0)),
    ("DUMP", 1, Some(1)),
    ("ECHO", 1, Some(1)),
    ("EVAL", 2, None),
    ("EVALSHA", 2, None),
    ("EXEC", 0, Some(0)),
    ("EXISTS", 1, None),
    ("EXPIRE", 2, Some(2)),
    ("EXPIREAT", 2, Some(2)),
    ("FLUSHALL", 0, Some(0)),
    ("FLUSHDB", 0, Some(0)),
    ("GEOADD", 4, None),
    ("GEODIST", 3, None),
    ("GEOHASH", 1, None),
    ("GEOPOS", 1, None),
    ("GEORADIUS", 5, None),
    ("GEORADIUSBYMEMBER", 4, None),
    ("GET", 1, Some(1)),
    ("GETBIT", 2, Some(2)),
    ("GETRANGE", 3, Some(3)),
    ("GETSET", 2, Some(2)),
    ("HDEL", 2, None),
    ("HEXISTS", 2, Some(2)),
    ("HGET", 2, Some(2)),
    ("HGETALL", 1, Some(1)),
    ("HINCRBY", 3, Some(3)),
    ("HINCRBYFLOAT", 3, Some(3)),
    ("HKEYS", 1, Some(1)),
    ("HLEN", 1, Some(1)),
    ("HMGET", 2, None),
    ("HMSET", 3, None),
    ("HSCAN", 2, None),
    ("HSET", 3, Some(3)),
    ("HSETNX", 3, Some(3)),
    ("HSTRLEN", 2, Some(2)),
    ("HVALS", 1, Some(1)),
    ("INCR", 1, Some(1)),
    ("INCRBY", 2, Some(2)),
    ("INCRBYFLOAT", 2, Some(2)),
    ("INFO", 0, None),
    ("KEYS", 1, Some(1)),
    ("LASTSAVE", 0, Some(0)),
    ("LINDEX", 2, Some(2)),
    ("LINSERT", 4, Some(4)),
    ("LLEN", 1, Some(1)),
    ("LPOP", 1, Some(1)),
    ("LPUSH", 2, None),
    ("LPUSHX", 2, Some(2)),
    ("LRANGE", 3, Some(3)),
    ("LREM", 3, Some(3)),
    ("LSET", 3, Some(3)),
    ("LTRIM", 3, Some(3)),
    ("MGET", 1, None),
    ("MIGRATE", 5, None),
    ("MONITOR", 0, Some(0)),
    ("MOVE", 2, Some(2)),
    ("MSET", 2, None),
    ("MSETNX", 2, None),
    ("MULTI", 0, Some(0)),
    ("OBJECT", 2, Some(2)),
    ("PERSIST", 1, Some(1)),
    ("PEXPIRE", 2, Some(2)),
    ("PEXPIREAT", 2, Some(2)),
    ("PFADD", 1, None),
    ("PFCOUNT", 1, None),
    ("PFMERGE", 1, None),
    ("PING", 0, None),
    ("PSETEX", 3, Some(3)),
    ("PSUBSCRIBE", 1, None),
    ("PTTL", 1, Some(1)),
    ("PUBLISH", 2, Some(2)),
    ("PUBSUB", 1, None),
    ("PUNSUBSCRIBE", 0, None),
    ("QUIT", 0, None),
    ("RANDOMKEY", 0, Some(0)),
    ("READONLY", 0, Some(0)),
    ("READWRITE", 0, Some(0)),
    ("RENAME", 2, Some(2)),
    ("RENAMENX", 2, Some(2)),
    ("RESTORE", 3, None),
    ("ROLE", 0, Some(0)),
    ("RPOP", 1, Some(1)),
    ("RPOPLPUSH", 2, Some(2)),
    ("RPUSH", 2, None),
    ("RPUSHX", 2, Some(2)),
    ("SADD", 2, None),
    ("SAVE", 0, Some(0)),
    ("SCAN", 1, None),
    ("SCARD", 1, Some(1)),
    ("SDIFF", 1, None),
    ("SDIFFSTORE", 2, None),
    ("SELECT", 1, Some(1)),
    ("SET", 2, None),
    ("SETBIT", 3, Some(3)),
    ("SETEX", 3, Some(3)),
    ("SETNX", 2, Some(2)),
    ("SETRANGE", 3, Some(3)),
    ("SHUTDOWN", 0, None),
    ("SINTER", 1, None),
    ("SINTERSTORE", 2, None),
    ("SISMEMBER", 2, Some(2)),
    ("SLAVEOF", 2, Some(2)),
    ("SLOWLOG", 1, None),
    ("SMEMBERS", 1, Some(1)),
    ("SMOVE", 3, Some(3)),
    ("SORT", 1, None),
    ("SPOP", 1, None),
    ("SRANDMEMBER", 1, None),
    ("SREM", 2, None),
    ("SSCAN", 2, None),
    ("STRLEN", 1, Some(1)),
    ("SUBSCRIBE", 1, None),
    ("SUNION", 1, None),
    ("SUNIONSTORE", 2, None),
    ("SYNC", 0, Some(0)),
    ("TIME", 0, Some(0)),
    ("TOUCH", 1, None),
    ("TTL", 1, Some(1)),
    ("TYPE", 1, Some(1)),
    ("UNSUBSCRIBE", 0, None),
    ("UNWATCH", 0, Some(0)),
    ("WAIT", 2, Some(2)),
    ("WATCH", 1, None),
    ("ZADD", 3, None),
    ("ZCARD", 1, Some(1)),
    ("ZCOUNT", 3, Some(3)),
    ("ZINCRBY", 3, Some(3)),
    ("ZINTERSTORE", 3, None),
    ("ZLEXCOUNT", 3, Some(3)),
    ("ZRANGE", 3, None),
    ("ZRANGEBYLEX", 3, None),
    ("ZRANGEBYSCORE", 3, None),
    ("ZRANK", 2, Some(2)),
    ("ZREM", 2, None),
    ("ZREMRANGEBYLEX", 3, Some(3)),
    ("ZREMRANGEBYRANK", 3, Some(3)),
    ("ZREMRANGEBYSCORE", 3, Some(3)),
    ("ZREVRANGE", 3, None),
    ("ZREVRANGEBYLEX", 3, None),
    ("ZREVRANGEBYSCORE", 3, None),
    ("ZREVRANK", 2, Some(2)),
    ("ZSCAN", 2, None),
    ("ZSCORE", 2, Some(2)),
    ("ZUNIONSTORE", 3, None),
];

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let max_arg_length = config
        .int_or("redis.max_arg_length", DEFAULT_MAX_ARG_LENGTH)
        .max(0) as usize;
    let addr = bind_addr(config, "redis", DEFAULT_PORT);
    serve_tcp("redis", addr, None, move || {
        Box::new(RedisHandler::new(max_arg_length, logger.clone()))
    })
}

/// Parses RESP requests and inline commands, then refuses everything with
/// an auth error the way a password-protected server would.
struct RedisHandler {
    logger: Logger,
    max_arg_length: usize,
    buf: Vec<u8>,
}

impl RedisHandler {
    fn new(max_arg_length: usize, logger: Logger) -> RedisHandler {
        RedisHandler {
            logger,
            max_arg_length,
            buf: Vec::new(),
        }
    }

    async fn respond(&self, conn: &mut Conn, cmd: &str, args: &[String]) {
        let upper = cmd.to_uppercase();
        let reply = match command_arity(&upper) {
            None => format!("-ERR unknown command '{}'\r\n", upper.to_lowercase()),
            Some((min, max)) => {
                let count = args.len() as u32;
                if count < min || max.is_some_and(|m| count > m) {
                    format!(
                        "-ERR wrong number of arguments for '{}' command\r\n",
                        upper.to_lowercase()
                    )
                } else if upper == "QUIT" {
                    conn.send(b"+OK\r\n").await;
                    conn.close();
                    return;
                } else if upper == "AUTH" {
                    String::from("-ERR invalid password\r\n")
                } else {
                    String::from("-NOAUTH Authentication required.\r\n")
                }
            }
        };
        self.log_command(conn, &upper, args);
        conn.send(reply.as_bytes()).await;
    }

    fn log_command(&self, conn: &Conn, cmd: &str, args: &[String]) {
        let mut joined = args.join(" ");
        if joined.len() > self.max_arg_length {
            let extra = joined.len() - self.max_arg_length;
            let mut cut = self.max_arg_length;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str(&format!("... ({} more bytes)", extra));
        }
        self.logger.log(
            Event::with_endpoints(LogType::REDIS_COMMAND, &conn.endpoints)
                .data("CMD", cmd)
                .data("ARGS", joined.as_str()),
        );
    }
}

#[async_trait]
impl ProtocolHandler for RedisHandler {
    async fn on_connect(&mut self, _conn: &mut Conn) {}

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]) {
        self.buf.extend_from_slice(data);
        while !conn.is_closing() && !self.buf.is_empty() {
            let parsed = if self.buf[0] == b'*' {
                parse_resp(&self.buf)
            } else {
                parse_inline(&self.buf)
            };
            match parsed {
                Parsed::Incomplete => {
                    if self.buf.len() > MAX_REQUEST {
                        log::debug!(
                            "redis client {} overflowed the request buffer",
                            conn.endpoints.peer
                        );
                        conn.close();
                    }
                    return;
                }
                Parsed::Invalid(reason) => {
                    conn.send(format!("-ERR Protocol error: {}\r\n", reason).as_bytes()).await;
                    conn.close();
                    return;
                }
                Parsed::Complete(tokens, consumed) => {
                    self.buf.drain(..consumed);
                    if let Some((cmd, args)) = tokens.split_first() {
                        self.respond(conn, cmd, args).await;
                    }
                }
            }
        }
    }
}

fn command_arity(cmd: &str) -> Option<(u32, Option<u32>)> {
    COMMANDS
        .iter()
        .find(|(name, _, _)| *name == cmd)
        .map(|&(_, min, max)| (min, max))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_int(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Multibulk request: `*<count>\r\n` then count bulk strings of the form
/// `$<len>\r\n<bytes>\r\n`. A non-positive count parses to an empty command.
fn parse_resp(buf: &[u8]) -> Parsed<Vec<String>> {
    let Some(header_end) = find_crlf(buf) else {
        return Parsed::Incomplete;
    };
    let count = match parse_int(&buf[1..header_end]) {
        Some(count) if count <= MAX_MULTIBULK => count,
        _ => return Parsed::Invalid(String::from("invalid multibulk length")),
    };
    let mut pos = header_end + 2;
    if count <= 0 {
        return Parsed::Complete(Vec::new(), pos);
    }

    let mut tokens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let rest = &buf[pos..];
        let Some(&first) = rest.first() else {
            return Parsed::Incomplete;
        };
        if first != b'$' {
            return Parsed::Invalid(format!("expected '$', got '{}'", first as char));
        }
        let Some(len_end) = find_crlf(rest) else {
            return Parsed::Incomplete;
        };
        let len = match parse_int(&rest[1..len_end]) {
            Some(len) if (0..=MAX_BULK).contains(&len) => len as usize,
            _ => return Parsed::Invalid(String::from("invalid bulk length")),
        };
        let start = len_end + 2;
        if rest.len() < start + len + 2 {
            return Parsed::Incomplete;
        }
        if &rest[start + len..start + len + 2] != b"\r\n" {
            return Parsed::Invalid(String::from("invalid bulk length"));
        }
        tokens.push(String::from_utf8_lossy(&rest[start..start + len]).into_owned());
        pos += start + len + 2;
    }
    Parsed::Complete(tokens, pos)
}

/// Inline commands buffer until a newline, then split shell-style.
fn parse_inline(buf: &[u8]) -> Parsed<Vec<String>> {
    let Some(end) = buf.iter().position(|&b| b == b'\n') else {
        return Parsed::Incomplete;
    };
    let line = String::from_utf8_lossy(&buf[..end]);
    match split_inline(&line) {
        Ok(tokens) => Parsed::Complete(tokens, end + 1),
        Err(reason) => Parsed::Invalid(reason),
    }
}

/// Whitespace-separated tokens with single quotes taken literally, double
/// quotes honoring backslash escapes, and bare backslashes escaping the
/// next character.
fn split_inline(line: &str) -> Result<Vec<String>, String> {
    let unbalanced = || String::from("unbalanced quotes in request");
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut have_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\r' => {
                if have_token {
                    tokens.push(std::mem::take(&mut current));
                    have_token = false;
                }
            }
            '\'' => {
                have_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(unbalanced()),
                    }
                }
            }
            '"' => {
                have_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(unbalanced()),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(unbalanced()),
                    }
                }
            }
            '\\' => {
                have_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(unbalanced()),
                }
            }
            other => {
                have_token = true;
                current.push(other);
            }
        }
    }
    if have_token {
        tokens.push(current);
    }
    Ok(tokens)
}
