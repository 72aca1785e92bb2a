use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Sink, SinkError};
use crate::event::LogEvent;

const OP_ERROR: u8 = 0;
const OP_INFO: u8 = 1;
const OP_AUTH: u8 = 2;
const OP_PUBLISH: u8 = 3;

const MAX_FRAME: u32 = 1024 * 1024;

/// Publishes events to an hpfeeds broker. Frames are u32 big-endian
/// total-length prefixed; the broker greets with an info frame whose nonce is
/// signed into the auth reply as sha1(nonce || secret). The connection is
/// made lazily and rebuilt on the next event after any failure, one attempt
/// per event.
pub struct HpfeedsSink {
    host: String,
    port: u16,
    ident: String,
    secret: String,
    channel: String,
    stream: Option<TcpStream>,
}

impl HpfeedsSink {
    pub fn new(host: String, port: u16, ident: String, secret: String, channel: String) -> HpfeedsSink {
        HpfeedsSink {
            host,
            port,
            ident,
            secret,
            channel,
            stream: None,
        }
    }

    async fn connect(&self) -> Result<TcpStream, SinkError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (op, payload) = read_frame(&mut stream).await?;
        match op {
            OP_INFO => {}
            OP_ERROR => {
                return Err(SinkError::Protocol(format!(
                    "broker error: {}",
                    String::from_utf8_lossy(&payload)
                )));
            }
            other => {
                return Err(SinkError::Protocol(format!(
                    "expected broker info, got opcode {}",
                    other
                )));
            }
        }
        let nonce = info_nonce(&payload)?;
        write_frame(&mut stream, OP_AUTH, &auth_frame(&self.ident, &nonce, &self.secret)).await?;
        log::info!("Authenticated to hpfeeds broker {}:{}", self.host, self.port);
        Ok(stream)
    }
}

#[async_trait]
impl Sink for HpfeedsSink {
    fn kind(&self) -> &'static str {
        "hpfeeds"
    }

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        if self.stream.is_none() {
            self.stream = Some(self.connect().await?);
        }
        let frame = publish_frame(&self.ident, &self.channel, event.to_json().as_bytes());
        let result = match self.stream.as_mut() {
            Some(stream) => write_frame(stream, OP_PUBLISH, &frame).await,
            None => Err(SinkError::Protocol(String::from("not connected"))),
        };
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

fn info_nonce(payload: &[u8]) -> Result<Vec<u8>, SinkError> {
    let name_len = *payload
        .first()
        .ok_or_else(|| SinkError::Protocol(String::from("empty broker info frame")))?
        as usize;
    let nonce = payload
        .get(1 + name_len..)
        .ok_or_else(|| SinkError::Protocol(String::from("truncated broker info frame")))?;
    Ok(nonce.to_vec())
}

fn auth_frame(ident: &str, nonce: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut frame = Vec::with_capacity(1 + ident.len() + digest.len());
    frame.push(ident.len() as u8);
    frame.extend_from_slice(ident.as_bytes());
    frame.extend_from_slice(&digest);
    frame
}

fn publish_frame(ident: &str, channel: &str, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + ident.len() + channel.len() + data.len());
    frame.push(ident.len() as u8);
    frame.extend_from_slice(ident.as_bytes());
    frame.push(channel.len() as u8);
    frame.extend_from_slice(channel.as_bytes());
    frame.extend_from_slice(data);
    frame
}

async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), SinkError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let total = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if !(5..=MAX_FRAME).contains(&total) {
        return Err(SinkError::Protocol(format!("implausible frame length {}", total)));
    }
    let mut payload = vec![0u8; (total - 5) as usize];
    stream.read_exact(&mut payload).await?;
    Ok((header[4], payload))
}

async fn write_frame(stream: &mut TcpStream, op: u8, payload: &[u8]) -> Result<(), SinkError> {
    let total = (payload.len() + 5) as u32;
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.push(op);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}
