use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, DatagramHandler};
use crate::transport::{serve_udp, Endpoints};

const DEFAULT_PORT: u16 = 69;

const OPCODE_READ: [u8; 2] = [0, 1];
const OPCODE_WRITE: [u8; 2] = [0, 2];

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "tftp", DEFAULT_PORT);
    serve_udp("tftp", addr, Arc::new(TftpHandler { logger }))
}

/// Log-only TFTP server: read and write requests are captured, everything
/// else is discarded without a reply.
struct TftpHandler {
    logger: Logger,
}

#[async_trait]
impl DatagramHandler for TftpHandler {
    async fn on_datagram(&self, data: &[u8], endpoints: &Endpoints) -> Option<Vec<u8>> {
        if data.len() < 5 {
            return None;
        }
        let opcode = match [data[0], data[1]] {
            OPCODE_READ => "READ",
            OPCODE_WRITE => "WRITE",
            _ => return None,
        };
        // Filename and mode, NUL terminated. Requests carrying options
        // split into more fields and are dropped.
        let mut parts = data[2..].split(|&b| b == 0);
        let (Some(filename), Some(mode), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        self.logger.log(
            Event::with_endpoints(LogType::TFTP, endpoints)
                .data("FILENAME", String::from_utf8_lossy(filename).into_owned())
                .data("OPCODE", opcode)
                .data("MODE", String::from_utf8_lossy(mode).into_owned()),
        );
        None
    }
}
