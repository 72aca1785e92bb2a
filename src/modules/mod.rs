use std::net::SocketAddr;

use async_trait::async_trait;

use crate::config::Config;
use crate::transport::{Conn, Endpoints};

mod des;

pub mod ftp;
pub mod git;
pub mod http;
pub mod httpproxy;
pub mod mssql;
pub mod mysql;
pub mod ntp;
pub mod rdp;
pub mod redis;
pub mod sip;
pub mod smb;
pub mod snmp;
pub mod ssh;
pub mod tcpbanner;
pub mod telnet;
pub mod tftp;
pub mod vnc;

/// One TCP connection's worth of protocol state. A fresh handler is built per
/// connection, so implementations keep their parse state in `self` without
/// any locking.
#[async_trait]
pub trait ProtocolHandler: Send {
    async fn on_connect(&mut self, conn: &mut Conn);

    async fn on_data(&mut self, conn: &mut Conn, data: &[u8]);

    async fn on_close(&mut self, _endpoints: &Endpoints) {}
}

/// Stateless request/reply handling for datagram services. One handler
/// instance serves every packet on the socket.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Returns the reply to send back, or None to stay silent.
    async fn on_datagram(&self, data: &[u8], endpoints: &Endpoints) -> Option<Vec<u8>>;
}

/// Outcome of trying to parse one protocol unit out of a reassembly buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// A complete unit, plus how many buffered bytes it consumed.
    Complete(T, usize),
    /// Not enough bytes yet. Keep the buffer and wait for more.
    Incomplete,
    /// The input can never become valid. The reason is reported to the peer
    /// or logged, depending on the protocol.
    Invalid(String),
}

/// Listen address for a service: the shared device listen address plus the
/// service's configured port.
pub fn bind_addr(config: &Config, service: &str, default_port: u16) -> SocketAddr {
    SocketAddr::new(config.listen_addr(), config.port(service, default_port))
}

/// Pops one newline-terminated line off the front of `buf`, stripping the
/// trailing `\n` or `\r\n`. Returns None until a full line has arrived.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}
