use async_trait::async_trait;

use super::{Sink, SinkError};
use crate::event::LogEvent;

/// Writes one JSON object per line to stdout.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> ConsoleSink {
        ConsoleSink
    }
}

impl Default for ConsoleSink {
    fn default() -> ConsoleSink {
        ConsoleSink::new()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn kind(&self) -> &'static str {
        "console"
    }

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        println!("{}", event.to_json());
        Ok(())
    }
}
