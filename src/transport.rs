use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::modules::{DatagramHandler, ProtocolHandler};

/// Both ends of an accepted connection or received datagram.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Write side of a live connection, handed to protocol handlers. Writes are
/// best effort. A failed write marks the connection as closing so handlers
/// stop feeding a dead peer.
pub struct Conn {
    write: OwnedWriteHalf,
    pub endpoints: Endpoints,
    closing: bool,
}

impl Conn {
    pub async fn send(&mut self, bytes: &[u8]) {
        if self.closing {
            return;
        }
        match self.write.write_all(bytes).await {
            Ok(_) => {}
            Err(err) => {
                log::debug!("Write to {} failed: {}", self.endpoints.peer, err);
                self.closing = true;
            }
        }
    }

    /// Requests connection teardown once the current handler call returns.
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Binds a TCP listener and serves each accepted connection with a fresh
/// handler from `factory`. A bind failure is logged and leaves the rest of
/// the process running.
pub fn serve_tcp<F>(
    name: impl Into<String>,
    addr: SocketAddr,
    idle_timeout: Option<Duration>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Box<dyn ProtocolHandler> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => {
                log::info!("{} listening on {}", name, addr);
                listener
            }
            Err(err) => {
                log::error!("{} failed to bind {}: {}", name, addr, err);
                return;
            }
        };
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::trace!("{} connection from {}", name, peer);
                    tokio::spawn(drive_connection(factory(), stream, idle_timeout));
                }
                Err(err) => {
                    log::error!("{} accept failed: {}", name, err);
                }
            }
        }
    })
}

/// Runs the read loop for one connection: on_connect, then on_data for every
/// chunk until the peer disconnects, the handler closes, or the idle timeout
/// fires.
pub(crate) async fn drive_connection(
    mut handler: Box<dyn ProtocolHandler>,
    stream: TcpStream,
    idle_timeout: Option<Duration>,
) {
    let endpoints = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(peer)) => Endpoints { local, peer },
        _ => return,
    };
    let (mut read, write) = stream.into_split();
    let mut conn = Conn {
        write,
        endpoints,
        closing: false,
    };
    handler.on_connect(&mut conn).await;
    let mut buf = [0u8; 4096];
    while !conn.is_closing() {
        let read_result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, read.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => {
                    log::trace!("Connection from {} idled out", endpoints.peer);
                    break;
                }
            },
            None => read.read(&mut buf).await,
        };
        match read_result {
            Ok(0) => break,
            Ok(n) => handler.on_data(&mut conn, &buf[..n]).await,
            Err(err) => {
                log::trace!("Read from {} failed: {}", endpoints.peer, err);
                break;
            }
        }
    }
    handler.on_close(&endpoints).await;
}

/// Binds a UDP socket and answers each datagram with whatever the handler
/// returns.
pub fn serve_udp(
    name: impl Into<String>,
    addr: SocketAddr,
    handler: Arc<dyn DatagramHandler>,
) -> JoinHandle<()> {
    let name = name.into();
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => {
                log::info!("{} listening on {}", name, addr);
                socket
            }
            Err(err) => {
                log::error!("{} failed to bind {}: {}", name, addr, err);
                return;
            }
        };
        let local = socket.local_addr().unwrap_or(addr);
        let mut buf = [0u8; 4096];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let endpoints = Endpoints { local, peer };
                    if let Some(reply) = handler.on_datagram(&buf[..len], &endpoints).await {
                        match socket.send_to(&reply, peer).await {
                            Ok(_) => {}
                            Err(err) => {
                                log::trace!("{} reply to {} failed: {}", name, peer, err);
                            }
                        }
                    }
                }
                Err(err) => {
                    log::error!("{} receive failed: {}", name, err);
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}
