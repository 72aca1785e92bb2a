use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{Sink, SinkError};
use crate::event::LogEvent;

const SEND_QUEUE_DEPTH: usize = 1000;
const MAX_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Streams newline-delimited JSON over a persistent TCP connection. The
/// writer task owns the socket: a failed write closes it, waits, reconnects,
/// and retries the same message up to [`MAX_ATTEMPTS`] times before dropping
/// it. Retries happen off the dispatch path so other sinks keep flowing.
pub struct SocketSink {
    tx: mpsc::Sender<String>,
}

impl SocketSink {
    pub fn start(host: String, port: u16) -> SocketSink {
        SocketSink::with_retry_delay(host, port, RETRY_DELAY)
    }

    pub fn with_retry_delay(host: String, port: u16, retry_delay: Duration) -> SocketSink {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        tokio::spawn(run_writer(host, port, retry_delay, rx));
        SocketSink { tx }
    }
}

#[async_trait]
impl Sink for SocketSink {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        match self.tx.try_send(event.to_json()) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(SinkError::Protocol(String::from("send queue is full")))
            }
            Err(TrySendError::Closed(_)) => {
                Err(SinkError::Protocol(String::from("send task has stopped")))
            }
        }
    }
}

async fn run_writer(
    host: String,
    port: u16,
    retry_delay: Duration,
    mut rx: mpsc::Receiver<String>,
) {
    let mut stream: Option<TcpStream> = None;
    while let Some(line) = rx.recv().await {
        let payload = format!("{}\n", line);
        let mut delivered = false;
        for _ in 0..MAX_ATTEMPTS {
            let connected = match stream.as_mut() {
                Some(connected) => connected,
                None => match TcpStream::connect((host.as_str(), port)).await {
                    Ok(fresh) => {
                        log::info!("Connected log stream to {}:{}", host, port);
                        stream.insert(fresh)
                    }
                    Err(err) => {
                        log::debug!("Could not connect log stream to {}:{}: {}", host, port, err);
                        tokio::time::sleep(retry_delay).await;
                        continue;
                    }
                },
            };
            match connected.write_all(payload.as_bytes()).await {
                Ok(_) => {
                    delivered = true;
                    break;
                }
                Err(err) => {
                    log::debug!("Log stream write to {}:{} failed: {}", host, port, err);
                    stream = None;
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
        if !delivered {
            log::error!("Dropping log message due to too many failed sends");
        }
    }
}
