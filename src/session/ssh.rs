use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{self, ssh_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Auth, ConnectionParams, Session, SessionError, SessionFactory};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR: u32 = 1;

/// One russh connection per session. Every command runs on its own exec
/// channel, so no prompt handling is needed.
#[derive(Debug, Clone)]
pub struct SshSessionFactory {
    connect_timeout: Duration,
}

impl SshSessionFactory {
    /// `connect_timeout` covers TCP, key exchange and authentication.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl SessionFactory for SshSessionFactory {
    fn connect(&self, params: &ConnectionParams) -> Box<dyn Session> {
        Box::new(SshSession {
            params: params.clone(),
            connect_timeout: self.connect_timeout,
            handle: None,
        })
    }
}

struct HostKeys {
    host: String,
    port: u16,
    strict: bool,
}

impl client::Handler for HostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, "host key is not in known_hosts");
                Ok(false)
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "host key check failed");
                Ok(false)
            }
        }
    }
}

pub struct SshSession {
    params: ConnectionParams,
    connect_timeout: Duration,
    handle: Option<Handle<HostKeys>>,
}

#[derive(Debug, Default)]
struct ExecOutput {
    status: Option<u32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl SshSession {
    fn ssh_error(&self, action: &'static str) -> impl FnOnce(russh::Error) -> SessionError + '_ {
        move |source| SessionError::Ssh {
            host: self.params.hostname.clone(),
            action,
            source,
        }
    }

    fn timed_out(&self, action: &'static str, after: Duration) -> SessionError {
        SessionError::Timeout {
            host: self.params.hostname.clone(),
            action,
            after,
        }
    }

    async fn handshake(&self, key: Option<PrivateKey>) -> Result<Handle<HostKeys>, SessionError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(COMMAND_TIMEOUT),
            ..Default::default()
        });
        let handler = HostKeys {
            host: self.params.hostname.clone(),
            port: self.params.port,
            strict: self.params.strict_host_key_check,
        };
        let mut handle = client::connect(
            config,
            (self.params.hostname.as_str(), self.params.port),
            handler,
        )
        .await
        .map_err(self.ssh_error("connect"))?;

        if !self.authenticate(&mut handle, key).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(SessionError::AuthRejected {
                host: self.params.hostname.clone(),
                user: self.params.username.clone(),
            });
        }
        Ok(handle)
    }

    /// Key first when there is one, then the password.
    async fn authenticate(
        &self,
        handle: &mut Handle<HostKeys>,
        key: Option<PrivateKey>,
    ) -> Result<bool, SessionError> {
        let user = self.params.username.as_str();

        if let Some(key) = key {
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(self.ssh_error("authenticate"))?
                .flatten();
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await
                .map_err(self.ssh_error("authenticate"))?;
            if result.success() {
                return Ok(true);
            }
            debug!(host = %self.params.hostname, "public key refused");
        }

        let Some(password) = self.params.auth.password() else {
            return Ok(false);
        };
        let result = handle
            .authenticate_password(user, password)
            .await
            .map_err(self.ssh_error("authenticate"))?;
        Ok(result.success())
    }
}

#[async_trait]
impl Session for SshSession {
    async fn open(&mut self) -> Result<(), SessionError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let key = match &self.params.auth {
            Auth::Key {
                path, passphrase, ..
            } => Some(load_key(path, passphrase.as_deref())?),
            Auth::Password(_) => None,
        };

        let limit = self.connect_timeout;
        let handle = timeout(limit, self.handshake(key))
            .await
            .map_err(|_| self.timed_out("connect", limit))??;
        self.handle = Some(handle);
        debug!(host = %self.params.hostname, "ssh session established");
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String, SessionError> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(SessionError::NotOpen(self.params.hostname.clone()));
        };
        let output = timeout(COMMAND_TIMEOUT, exec(handle, command))
            .await
            .map_err(|_| self.timed_out("command", COMMAND_TIMEOUT))?
            .map_err(self.ssh_error("command"))?;

        match output.status {
            Some(status) if status != 0 => Err(SessionError::Failed {
                host: self.params.hostname.clone(),
                action: "command",
                status: format!("exit status: {status}"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            _ => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let limit = self.connect_timeout;
        timeout(limit, handle.disconnect(Disconnect::ByApplication, "", "en"))
            .await
            .map_err(|_| self.timed_out("close", limit))?
            .map_err(self.ssh_error("close"))?;
        debug!(host = %self.params.hostname, "ssh session closed");
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // Reached when a probe is aborted between open and close.
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!(host = %self.params.hostname, "dropping open ssh session");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
            });
        }
    }
}

fn load_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, SessionError> {
    keys::load_secret_key(path, passphrase).map_err(|source| SessionError::Key {
        path: path.display().to_string(),
        source,
    })
}

async fn exec(handle: &Handle<HostKeys>, command: &str) -> Result<ExecOutput, russh::Error> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut output = ExecOutput::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR => {
                output.stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => output.status = Some(exit_status),
            _ => {}
        }
    }
    Ok(output)
}
