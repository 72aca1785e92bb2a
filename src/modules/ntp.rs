use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::{bind_addr, DatagramHandler};
use crate::transport::{serve_udp, Endpoints};

const DEFAULT_PORT: u16 = 123;

/// Request code byte of a mode 7 MON_GETLIST_1 packet.
const MONLIST: u8 = 0x2a;

pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "ntp", DEFAULT_PORT);
    serve_udp("ntp", addr, Arc::new(NtpHandler { logger }))
}

/// Log-only NTP server. Ordinary time queries are ignored; monlist probes
/// are the recon and DDoS-amplification signal worth alerting on.
struct NtpHandler {
    logger: Logger,
}

#[async_trait]
impl DatagramHandler for NtpHandler {
    async fn on_datagram(&self, data: &[u8], endpoints: &Endpoints) -> Option<Vec<u8>> {
        if data.len() >= 4 && data[3] == MONLIST {
            self.logger.log(
                Event::with_endpoints(LogType::NTP_MONLIST, endpoints).data("NTP CMD", "monlist"),
            );
        }
        None
    }
}
