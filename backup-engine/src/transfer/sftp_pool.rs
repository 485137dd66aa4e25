//! Pooled SFTP sessions.
//!
//! The pool is sized `workers + 2`. Checkout never blocks for long: an
//! exhausted pool is retried with a short pause so a stuck connection cannot
//! park a worker forever. Connections are validated when they go back into
//! the pool and dropped once they reach `MAX_LIFETIME`.

use crate::config::SftpStorage;
use crate::utils::errors::{EngineError, Result};
use r2d2::{ManageConnection, Pool, PooledConnection};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(1);
const CHECKOUT_PAUSE: Duration = Duration::from_millis(200);
const CHECKOUT_ATTEMPTS: u32 = 30;
const MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);
const IO_TIMEOUT_MS: u32 = 60_000;

pub struct SftpConnection {
    // keeps the transport alive for `sftp`
    _session: ssh2::Session,
    pub sftp: ssh2::Sftp,
}

#[derive(Debug, PartialEq)]
enum Credentials<'a> {
    Key { path: &'a Path, passphrase: Option<&'a str> },
    Password(&'a str),
}

/// A key file wins over the password; the login password never unlocks the key.
fn credentials(s: &SftpStorage) -> Result<Credentials<'_>> {
    match (&s.key_filename, &s.password) {
        (Some(path), _) => Ok(Credentials::Key {
            path: path.as_path(),
            passphrase: s.key_passphrase.as_deref(),
        }),
        (None, Some(password)) => Ok(Credentials::Password(password)),
        (None, None) => Err(EngineError::Config("sftp storage has no credentials".to_string())),
    }
}

pub struct SftpManager {
    settings: SftpStorage,
}

impl SftpManager {
    pub fn new(settings: SftpStorage) -> Self {
        Self { settings }
    }

    fn open(&self) -> Result<SftpConnection> {
        let s = &self.settings;
        let tcp = TcpStream::connect((s.hostname.as_str(), s.port))?;
        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(IO_TIMEOUT_MS);
        session.handshake()?;

        match credentials(s)? {
            Credentials::Key { path, passphrase } => {
                session.userauth_pubkey_file(&s.username, None, path, passphrase)?
            }
            Credentials::Password(password) => session.userauth_password(&s.username, password)?,
        }
        if !session.authenticated() {
            return Err(EngineError::Config(format!(
                "SSH authentication failed for {}@{}",
                s.username, s.hostname
            )));
        }

        let sftp = session.sftp()?;
        debug!(host = %s.hostname, "Opened SFTP session");
        Ok(SftpConnection {
            _session: session,
            sftp,
        })
    }
}

impl ManageConnection for SftpManager {
    type Connection = SftpConnection;
    type Error = EngineError;

    fn connect(&self) -> Result<SftpConnection> {
        self.open()
    }

    fn is_valid(&self, conn: &mut SftpConnection) -> Result<()> {
        conn.sftp.stat(Path::new(&self.settings.backup_dir))?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut SftpConnection) -> bool {
        conn.sftp.stat(Path::new(&self.settings.backup_dir)).is_err()
    }
}

pub type SftpPool = Pool<SftpManager>;
pub type PooledSftp = PooledConnection<SftpManager>;

pub fn create_pool(settings: SftpStorage, workers: usize) -> Result<SftpPool> {
    Pool::builder()
        .max_size((workers + 2) as u32)
        .min_idle(Some(0))
        .connection_timeout(CHECKOUT_TIMEOUT)
        .max_lifetime(Some(MAX_LIFETIME))
        .test_on_check_out(false)
        .build(SftpManager::new(settings))
        .map_err(|e| EngineError::Pool(e.to_string()))
}

/// Take a connection, pausing between short checkout attempts. Blocking;
/// call from `spawn_blocking`.
pub fn checkout(pool: &SftpPool) -> Result<PooledSftp> {
    let mut last_error = String::new();
    for attempt in 1..=CHECKOUT_ATTEMPTS {
        match pool.get_timeout(CHECKOUT_TIMEOUT) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                last_error = e.to_string();
                if attempt % 10 == 0 {
                    warn!("Waiting for an SFTP connection ({} attempts): {}", attempt, last_error);
                }
                std::thread::sleep(CHECKOUT_PAUSE);
            }
        }
    }
    Err(EngineError::Pool(format!(
        "no SFTP connection after {} attempts: {}",
        CHECKOUT_ATTEMPTS, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(password: Option<&str>, key: Option<&str>, passphrase: Option<&str>) -> SftpStorage {
        SftpStorage {
            hostname: "h".into(),
            port: 22,
            username: "u".into(),
            password: password.map(str::to_string),
            key_filename: key.map(PathBuf::from),
            key_passphrase: passphrase.map(str::to_string),
            backup_dir: "/b".into(),
        }
    }

    #[test]
    fn test_key_never_unlocked_with_login_password() {
        let s = settings(Some("login"), Some("/keys/id"), None);
        assert_eq!(
            credentials(&s).unwrap(),
            Credentials::Key {
                path: Path::new("/keys/id"),
                passphrase: None
            }
        );

        let s = settings(Some("login"), Some("/keys/id"), Some("unlock"));
        assert_eq!(
            credentials(&s).unwrap(),
            Credentials::Key {
                path: Path::new("/keys/id"),
                passphrase: Some("unlock")
            }
        );
    }

    #[test]
    fn test_password_login() {
        assert_eq!(credentials(&settings(Some("pw"), None, None)).unwrap(), Credentials::Password("pw"));
        assert!(matches!(credentials(&settings(None, None, None)), Err(EngineError::Config(_))));
    }
}
