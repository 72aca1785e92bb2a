use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::take_line;

const DEFAULT_AUDIT_FILE: &str = "/var/log/samba-audit.log";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bytes pulled from the audit file per poll, so a burst cannot balloon
/// memory.
const MAX_CHUNK: u64 = 1024 * 1024;

/// SMB alerting rides on a real Samba install: smbd's full_audit VFS module
/// writes one pipe-separated line per file operation and this module tails
/// that file. There is no SMB wire protocol spoken here.
pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let path = PathBuf::from(config.str_or("smb.auditfile", DEFAULT_AUDIT_FILE));
    tokio::spawn(async move {
        log::info!("smb tailing audit file {}", path.display());
        tail_audit_log(&path, &logger, POLL_INTERVAL).await;
    })
}

/// Follows the audit file from its current end. Truncation or rotation
/// resets to the top of the new file; a missing file is retried forever so
/// smbd may start after us.
pub(crate) async fn tail_audit_log(path: &Path, logger: &Logger, poll: Duration) {
    let mut pos = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let mut carry: Vec<u8> = Vec::new();
    loop {
        tokio::time::sleep(poll).await;
        let len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                pos = 0;
                carry.clear();
                continue;
            }
        };
        if len < pos {
            pos = 0;
            carry.clear();
        }
        if len == pos {
            continue;
        }
        let end = len.min(pos + MAX_CHUNK);
        match read_range(path, pos, end).await {
            Ok(chunk) => {
                pos = end;
                carry.extend_from_slice(&chunk);
                while let Some(line) = take_line(&mut carry) {
                    if let Some(event) = parse_audit_line(&String::from_utf8_lossy(&line)) {
                        logger.log(event);
                    }
                }
            }
            Err(err) => {
                log::debug!("smb audit read failed: {}", err);
            }
        }
    }
}

async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn audit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // user|remote ip|local ip|remote name|share|local name|smb version|
        // arch|timestamp|domain|action|status|filename
        Regex::new(
            r"smbd_audit: ([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|(.*)",
        )
        .expect("audit pattern compiles")
    })
}

/// One smbd_audit syslog line, or None for anything else in the file.
fn parse_audit_line(line: &str) -> Option<Event> {
    let fields = audit_pattern().captures(line)?;
    let field = |index: usize| fields.get(index).map(|m| m.as_str()).unwrap_or("");

    let mut event = Event::new(LogType::SMB_FILE_OPEN)
        .data("USER", field(1))
        .data("REMOTENAME", field(4))
        .data("SHARENAME", field(5))
        .data("LOCALNAME", field(6))
        .data("SMBVER", field(7))
        .data("SMBARCH", field(8))
        .data("DOMAIN", field(10))
        .data("AUDITACTION", field(11))
        .data("STATUS", field(12))
        .data("FILENAME", field(13));
    event.src_host = Some(field(2).to_string());
    event.src_port = Some(-1);
    event.dst_host = Some(field(3).to_string());
    event.dst_port = Some(445);
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;
    use std::io::Write;

    const SAMPLE: &str = "Jul 22 04:42:07 bait smbd_audit: ned|198.51.100.7|192.0.2.9|EVILCORP-PC|openshare|bait|SMB2_10|x64|2026/07/22 04:42:07|EVILCORP|pread|ok|docs/passwords.txt";

    #[test]
    fn audit_lines_parse() {
        let event = parse_audit_line(SAMPLE).unwrap();
        assert_eq!(event.logtype, Some(LogType::SMB_FILE_OPEN));
        assert_eq!(event.src_host.as_deref(), Some("198.51.100.7"));
        assert_eq!(event.dst_host.as_deref(), Some("192.0.2.9"));
        assert_eq!(event.dst_port, Some(445));
        assert_eq!(event.logdata.get("USER").unwrap(), "ned");
        assert_eq!(event.logdata.get("SHARENAME").unwrap(), "openshare");
        assert_eq!(event.logdata.get("AUDITACTION").unwrap(), "pread");
        assert_eq!(event.logdata.get("STATUS").unwrap(), "ok");
        assert_eq!(event.logdata.get("FILENAME").unwrap(), "docs/passwords.txt");
    }

    #[test]
    fn filenames_keep_their_pipes() {
        let line = format!("{}|with|pipes", SAMPLE);
        let event = parse_audit_line(&line).unwrap();
        assert_eq!(
            event.logdata.get("FILENAME").unwrap(),
            "docs/passwords.txt|with|pipes"
        );
    }

    #[test]
    fn unrelated_lines_are_skipped() {
        assert!(parse_audit_line("Jul 22 04:42:07 bait smbd[91]: connect to service").is_none());
        assert!(parse_audit_line("smbd_audit: too|few|fields").is_none());
        assert!(parse_audit_line("").is_none());
    }

    #[tokio::test]
    async fn tailer_reports_appended_lines_only() {
        let path = std::env::temp_dir().join(format!("decoyd-smb-test-{}.log", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "{}", SAMPLE).unwrap();
        }

        let (logger, mut events) = capture_logger();
        let tail_path = path.clone();
        let task = tokio::spawn(async move {
            tail_audit_log(&tail_path, &logger, Duration::from_millis(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "preexisting lines are not replayed");

        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{}", SAMPLE.replace("ned", "kim")).unwrap();
            writeln!(file, "Jul 22 04:43:01 bait CRON[7]: session opened").unwrap();
        }
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("tailer picks up the new line")
            .unwrap();
        assert_eq!(event.logtype, LogType::SMB_FILE_OPEN);
        assert_eq!(event.logdata.get("USER").unwrap(), "kim");

        // The CRON line right behind it must not produce anything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        task.abort();
        let _ = std::fs::remove_file(&path);
    }
}
