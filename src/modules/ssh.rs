use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::signature::rand_core::OsRng;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Server};
use russh::SshId;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, LogType};
use crate::logger::Logger;
use crate::modules::bind_addr;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_VERSION: &str = "SSH-2.0-OpenSSH_5.1p1 Debian-5";
const KEY_FILE: &str = "ssh_host_ed25519_key";

/// Real SSH transport, fake everything behind it. russh runs the key exchange
/// and userauth; every authentication attempt is recorded and refused, so no
/// channel ever opens.
pub fn start(config: &Config, logger: Logger) -> JoinHandle<()> {
    let addr = bind_addr(config, "ssh", DEFAULT_PORT);
    let version = config.str_or("ssh.version", DEFAULT_VERSION);
    let key_dir = config.str_or("ssh.key_dir", "");
    tokio::spawn(async move {
        let ssh_config = Arc::new(russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            server_id: SshId::Standard(version.clone()),
            keys: vec![host_key(&key_dir)],
            ..Default::default()
        });
        let mut server = SshServer {
            logger,
            version,
            local: addr,
            sessions: 0,
        };
        log::info!("ssh listening on {}", addr);
        if let Err(err) = server.run_on_address(ssh_config, addr).await {
            log::error!("ssh listener on {} failed: {}", addr, err);
        }
    })
}

/// Host key for the configured key directory. A missing or unusable directory
/// degrades to an ephemeral key so the listener still comes up, at the cost of
/// clients seeing a new fingerprint after a restart.
fn host_key(key_dir: &str) -> PrivateKey {
    if key_dir.is_empty() {
        log::debug!("ssh.key_dir is not set, using an ephemeral host key");
        return fresh_key();
    }
    let dir = Path::new(key_dir);
    if !dir.is_dir() {
        log::warn!(
            "ssh.key_dir {} is not a directory, using an ephemeral host key",
            dir.display()
        );
        return fresh_key();
    }
    load_or_create_key(dir.join(KEY_FILE))
}

fn fresh_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn load_or_create_key(path: PathBuf) -> PrivateKey {
    match std::fs::read(&path) {
        Ok(buffer) if buffer.is_empty() => {
            log::warn!("host key file {} is empty, replacing it", path.display());
            persist_fresh_key(path)
        }
        Ok(buffer) => match PrivateKey::from_bytes(buffer.as_slice()) {
            Ok(key) => {
                log::debug!("loaded ssh host key from {}", path.display());
                key
            }
            Err(err) => {
                log::warn!(
                    "host key file {} did not parse: {}; using an ephemeral key",
                    path.display(),
                    err
                );
                fresh_key()
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => persist_fresh_key(path),
        Err(err) => {
            log::warn!(
                "could not read host key file {}: {}; using an ephemeral key",
                path.display(),
                err
            );
            fresh_key()
        }
    }
}

fn persist_fresh_key(path: PathBuf) -> PrivateKey {
    let key = fresh_key();
    match key.to_bytes() {
        Ok(bytes) => match std::fs::write(&path, bytes) {
            Ok(()) => log::debug!("wrote new ssh host key to {}", path.display()),
            Err(err) => {
                log::warn!("could not persist ssh host key to {}: {}", path.display(), err)
            }
        },
        Err(err) => log::warn!("could not serialize ssh host key: {}", err),
    }
    key
}

struct SshServer {
    logger: Logger,
    version: String,
    local: SocketAddr,
    sessions: u64,
}

impl Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        let session = self.sessions;
        self.sessions += 1;
        log::debug!("ssh session {} opened by {:?}", session, peer);

        let mut event =
            Event::new(LogType::SSH_NEW_CONNECTION).data("SESSION", session.to_string());
        event.dst_host = Some(self.local.ip().to_string());
        event.dst_port = Some(i32::from(self.local.port()));
        if let Some(peer) = peer {
            event.src_host = Some(peer.ip().to_string());
            event.src_port = Some(i32::from(peer.port()));
        }
        self.logger.log(event);

        SshSession {
            logger: self.logger.clone(),
            version: self.version.clone(),
            local: self.local,
            peer,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        match error {
            russh::Error::Disconnect => {}
            err => log::debug!("ssh session ended with error: {}", err),
        }
    }
}

struct SshSession {
    logger: Logger,
    version: String,
    local: SocketAddr,
    peer: Option<SocketAddr>,
}

impl SshSession {
    fn attempt(&self) -> Event {
        let mut event = Event::new(LogType::SSH_LOGIN_ATTEMPT);
        event.dst_host = Some(self.local.ip().to_string());
        event.dst_port = Some(i32::from(self.local.port()));
        if let Some(peer) = self.peer {
            event.src_host = Some(peer.ip().to_string());
            event.src_port = Some(i32::from(peer.port()));
        }
        event
    }
}

impl Handler for SshSession {
    type Error = russh::Error;

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async move {
            log::debug!("ssh password attempt for {:?} from {:?}", user, self.peer);
            let event = self
                .attempt()
                .data("USERNAME", user)
                .data("PASSWORD", password)
                .data("LOCALVERSION", self.version.as_str());
            self.logger.log(event);
            Ok(Auth::reject())
        }
    }

    fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        async move {
            let fingerprint = public_key.key_data().fingerprint(HashAlg::Sha256);
            log::debug!("ssh public key attempt for {:?} from {:?}", user, self.peer);
            let event = self
                .attempt()
                .data("USERNAME", user)
                .data("KEY", fingerprint.to_string());
            self.logger.log(event);
            Ok(Auth::reject())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::test_support::capture_logger;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("decoyd-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fingerprint(key: &PrivateKey) -> String {
        key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    fn test_server(logger: Logger) -> SshServer {
        SshServer {
            logger,
            version: String::from(DEFAULT_VERSION),
            local: "192.0.2.1:22".parse().unwrap(),
            sessions: 0,
        }
    }

    fn peer() -> SocketAddr {
        "198.51.100.9:50200".parse().unwrap()
    }

    #[test]
    fn host_keys_persist_between_runs() {
        let dir = scratch_dir("ssh-keys-persist");
        let first = load_or_create_key(dir.join(KEY_FILE));
        assert!(dir.join(KEY_FILE).exists());
        let second = load_or_create_key(dir.join(KEY_FILE));
        assert_eq!(fingerprint(&first), fingerprint(&second));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_key_files_are_replaced() {
        let dir = scratch_dir("ssh-keys-empty");
        std::fs::write(dir.join(KEY_FILE), b"").unwrap();
        let first = load_or_create_key(dir.join(KEY_FILE));
        let second = load_or_create_key(dir.join(KEY_FILE));
        assert_eq!(fingerprint(&first), fingerprint(&second));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_key_files_fall_back_to_ephemeral() {
        let dir = scratch_dir("ssh-keys-corrupt");
        std::fs::write(dir.join(KEY_FILE), b"not a key").unwrap();
        let first = load_or_create_key(dir.join(KEY_FILE));
        let second = load_or_create_key(dir.join(KEY_FILE));
        assert_ne!(fingerprint(&first), fingerprint(&second));
        assert_eq!(std::fs::read(dir.join(KEY_FILE)).unwrap(), b"not a key");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_key_dir_means_ephemeral() {
        let first = host_key("");
        let second = host_key("/nonexistent/decoyd-key-dir");
        assert_ne!(fingerprint(&first), fingerprint(&second));
    }

    #[tokio::test]
    async fn connections_are_numbered() {
        let (logger, mut events) = capture_logger();
        let mut server = test_server(logger);

        server.new_client(Some(peer()));
        server.new_client(None);

        let first = events.recv().await.unwrap();
        assert_eq!(first.logtype, LogType::SSH_NEW_CONNECTION);
        assert_eq!(first.logdata.get("SESSION").unwrap(), "0");
        assert_eq!(first.src_host, "198.51.100.9");
        assert_eq!(first.src_port, 50200);
        assert_eq!(first.dst_port, 22);

        let second = events.recv().await.unwrap();
        assert_eq!(second.logdata.get("SESSION").unwrap(), "1");
        assert_eq!(second.src_host, "");
        assert_eq!(second.src_port, -1);
    }

    #[tokio::test]
    async fn password_attempts_are_logged_and_refused() {
        let (logger, mut events) = capture_logger();
        let mut server = test_server(logger);
        let mut session = server.new_client(Some(peer()));

        let auth = session.auth_password("root", "hunter2").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));

        let connected = events.recv().await.unwrap();
        assert_eq!(connected.logtype, LogType::SSH_NEW_CONNECTION);

        let attempt = events.recv().await.unwrap();
        assert_eq!(attempt.logtype, LogType::SSH_LOGIN_ATTEMPT);
        assert_eq!(attempt.logdata.get("USERNAME").unwrap(), "root");
        assert_eq!(attempt.logdata.get("PASSWORD").unwrap(), "hunter2");
        assert_eq!(attempt.logdata.get("LOCALVERSION").unwrap(), DEFAULT_VERSION);
        assert_eq!(attempt.src_host, "198.51.100.9");
    }

    #[tokio::test]
    async fn public_key_attempts_are_fingerprinted_and_refused() {
        let (logger, mut events) = capture_logger();
        let mut server = test_server(logger);
        let mut session = server.new_client(Some(peer()));

        let key = fresh_key();
        let expected = fingerprint(&key);
        let auth = session.auth_publickey("git", key.public_key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));

        events.recv().await.unwrap();
        let attempt = events.recv().await.unwrap();
        assert_eq!(attempt.logtype, LogType::SSH_LOGIN_ATTEMPT);
        assert_eq!(attempt.logdata.get("USERNAME").unwrap(), "git");
        assert_eq!(attempt.logdata.get("KEY").unwrap(), expected.as_str());
        assert!(expected.starts_with("SHA256:"));
        assert!(attempt.logdata.get("PASSWORD").is_none());
    }
}
