//! Remote command sessions.
//!
//! The prober only sees `Session`; the daemon plugs in `ssh::SshSessionFactory`
//! and tests plug in scripted fakes.

pub mod ssh;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    /// Public key auth. `password` is tried when the key is refused.
    Key {
        path: PathBuf,
        passphrase: Option<String>,
        password: Option<String>,
    },
}

impl Auth {
    pub fn password(&self) -> Option<&str> {
        match self {
            Auth::Password(password) => Some(password),
            Auth::Key { password, .. } => password.as_deref(),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        match self {
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
            Auth::Key {
                path,
                passphrase,
                password,
            } => f
                .debug_struct("Key")
                .field("path", path)
                .field("passphrase", &redact(passphrase))
                .field("password", &redact(password))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
    pub strict_host_key_check: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load private key {path}: {source}")]
    Key {
        path: String,
        source: russh::keys::Error,
    },
    #[error("{action} on {host} failed: {source}")]
    Ssh {
        host: String,
        action: &'static str,
        source: russh::Error,
    },
    #[error("{host} rejected the credentials of {user}")]
    AuthRejected { host: String, user: String },
    #[error("{action} on {host} timed out after {after:?}")]
    Timeout {
        host: String,
        action: &'static str,
        after: Duration,
    },
    #[error("{action} on {host} failed ({status}): {stderr}")]
    Failed {
        host: String,
        action: &'static str,
        status: String,
        stderr: String,
    },
    #[error("session to {0} is not open")]
    NotOpen(String),
}

/// One connection to one device. Implementations tear the connection down
/// when dropped without `close`, so an aborted probe leaks nothing.
#[async_trait]
pub trait Session: Send {
    async fn open(&mut self) -> Result<(), SessionError>;
    async fn send_command(&mut self, command: &str) -> Result<String, SessionError>;
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Builds unopened sessions; no I/O happens until `Session::open`.
pub trait SessionFactory: Send + Sync {
    fn connect(&self, params: &ConnectionParams) -> Box<dyn Session>;
}
