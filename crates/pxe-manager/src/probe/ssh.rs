//! SSH remote shell backed by libssh2.

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::debug;

use super::{ProbeError, RemoteShell};
use crate::config::SshConfig;

/// libssh2's `LIBSSH2_ERROR_TIMEOUT`.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Runs commands over SSH, one session per call.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    port: u16,
    connect_timeout: Duration,
}

impl SshShell {
    /// Create a shell from the configured credentials.
    #[must_use]
    pub fn new(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            key_path: config.key_path.clone(),
            port: config.port,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    fn connect(&self, host: &str) -> Result<Session, ProbeError> {
        let target = (host, self.port)
            .to_socket_addrs()
            .map_err(|_| ProbeError::Resolve(host.to_string()))?
            .next()
            .ok_or_else(|| ProbeError::Resolve(host.to_string()))?;

        let tcp = TcpStream::connect_timeout(&target, self.connect_timeout).map_err(|e| {
            match e.kind() {
                ErrorKind::ConnectionRefused => ProbeError::Refused(host.to_string()),
                ErrorKind::TimedOut | ErrorKind::WouldBlock => ProbeError::Timeout(host.to_string()),
                _ => ProbeError::Connect {
                    host: host.to_string(),
                    message: e.to_string(),
                },
            }
        })?;

        let connect_error = |e: ssh2::Error| {
            if matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
                ProbeError::Timeout(host.to_string())
            } else {
                ProbeError::Connect {
                    host: host.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let mut session = Session::new().map_err(connect_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.connect_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(connect_error)?;

        let auth = match (&self.key_path, &self.password) {
            (Some(key), passphrase) => {
                session.userauth_pubkey_file(&self.user, None, key, passphrase.as_deref())
            }
            (None, Some(password)) => session.userauth_password(&self.user, password),
            (None, None) => session.userauth_agent(&self.user),
        };
        if auth.is_err() || !session.authenticated() {
            return Err(ProbeError::Auth {
                host: host.to_string(),
                user: self.user.clone(),
            });
        }

        Ok(session)
    }

    fn exec_blocking(&self, host: &str, command: &str) -> Result<String, ProbeError> {
        let session = self.connect(host)?;
        debug!(host = %host, command = %command, "Running remote command");

        let exec_error = |message: String| ProbeError::Exec {
            host: host.to_string(),
            message,
        };

        let mut channel = session
            .channel_session()
            .map_err(|e| exec_error(e.to_string()))?;
        channel.exec(command).map_err(|e| exec_error(e.to_string()))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| exec_error(e.to_string()))?;
        channel.wait_close().map_err(|e| exec_error(e.to_string()))?;

        match channel.exit_status() {
            Ok(0) => Ok(output),
            Ok(code) => Err(exec_error(format!("'{command}' exited with {code}"))),
            Err(e) => Err(exec_error(e.to_string())),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, address: &str, command: &str) -> Result<String, ProbeError> {
        let shell = self.clone();
        let host = address.to_string();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || shell.exec_blocking(&host, &command))
            .await
            .map_err(|e| ProbeError::Connect {
                host: address.to_string(),
                message: format!("probe task failed: {e}"),
            })?
    }
}
