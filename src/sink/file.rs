use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{Sink, SinkError};
use crate::event::LogEvent;

/// Appends one JSON object per line to a log file. The file is opened once at
/// start-up; rotation is left to external tooling.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<FileSink> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileSink {
            file: tokio::fs::File::from_std(file),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        let mut line = event.to_json();
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
