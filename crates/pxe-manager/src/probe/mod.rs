//! Post-install readiness verification.
//!
//! SSH reachability alone does not prove a host was reinstalled: a host that
//! never netbooted answers on its old image just the same. Before kickstart a
//! marker file is placed on the old image; the destructive install wipes it.
//! A host that comes back with the marker still present did not install.

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ReadinessConfig;

/// Marker file placed before kickstart.
pub const MARKER_FILE: &str = "kickstart.check";

/// Errors raised by the remote shell.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Nothing listening on the SSH port.
    #[error("Connection refused by {0}")]
    Refused(String),

    /// The host answered but rejected the credentials.
    #[error("Authentication failed for {user}@{host}")]
    Auth { host: String, user: String },

    /// Connect or handshake did not finish in time.
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    /// The address does not resolve.
    #[error("Cannot resolve {0}")]
    Resolve(String),

    /// Any other connection failure.
    #[error("Connection to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// Connected, but running the command failed.
    #[error("Command failed on {host}: {message}")]
    Exec { host: String, message: String },

    /// The marker check printed something unexpected.
    #[error("Unexpected marker check output from {host}: {output:?}")]
    UnexpectedOutput { host: String, output: String },
}

impl ProbeError {
    /// Whether the failure means "not reachable (yet)", which is retried.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::Refused(_)
                | Self::Auth { .. }
                | Self::Timeout(_)
                | Self::Resolve(_)
                | Self::Connect { .. }
        )
    }
}

/// Outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Reachable and the marker is gone: the install ran.
    Ready,
    /// Never reachable within the attempt budget.
    Unreachable {
        /// Attempts made.
        attempts: u32,
    },
    /// Reachable, but the marker survived: the install did not run.
    MarkerPresent,
}

impl Readiness {
    /// Whether the host can be handed over.
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// Runs a command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Connect to `address`, run `command`, and return its stdout.
    async fn exec(&self, address: &str, command: &str) -> Result<String, ProbeError>;
}

/// Pre-flight and post-install checks the coordinator relies on.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Place the marker file on the host's current image.
    async fn place_marker(&self, address: &str) -> Result<(), ProbeError>;

    /// Poll the host until it is reachable, then check the marker.
    async fn is_ready(&self, address: &str) -> Result<Readiness, ProbeError>;
}

/// [`ReadinessProbe`] over any [`RemoteShell`].
pub struct ShellProbe<S> {
    shell: S,
    attempts: u32,
    interval: Duration,
    preflight_attempts: u32,
    preflight_interval: Duration,
}

impl<S: RemoteShell> ShellProbe<S> {
    /// Create a probe with the configured budgets.
    #[must_use]
    pub fn new(shell: S, config: &ReadinessConfig) -> Self {
        Self {
            shell,
            attempts: config.attempts.max(1),
            interval: config.interval(),
            preflight_attempts: config.preflight_attempts.max(1),
            preflight_interval: config.preflight_interval(),
        }
    }

    /// The underlying shell.
    #[must_use]
    pub fn shell(&self) -> &S {
        &self.shell
    }

    fn place_command() -> String {
        format!("touch {MARKER_FILE}")
    }

    fn check_command() -> String {
        format!("test -e {MARKER_FILE} && echo present || echo absent")
    }
}

#[async_trait]
impl<S: RemoteShell> ReadinessProbe for ShellProbe<S> {
    async fn place_marker(&self, address: &str) -> Result<(), ProbeError> {
        let command = Self::place_command();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shell.exec(address, &command).await {
                Ok(_) => {
                    debug!(address = %address, "Marker placed");
                    return Ok(());
                }
                Err(e) if e.is_connect_failure() && attempt < self.preflight_attempts => {
                    debug!(
                        address = %address,
                        error = %e,
                        "Pre-flight attempt {attempt}/{} failed",
                        self.preflight_attempts
                    );
                    tokio::time::sleep(self.preflight_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn is_ready(&self, address: &str) -> Result<Readiness, ProbeError> {
        info!(
            address = %address,
            attempts = self.attempts,
            interval_secs = self.interval.as_secs(),
            "Waiting for host to come back"
        );

        let command = Self::check_command();
        for attempt in 1..=self.attempts {
            match self.shell.exec(address, &command).await {
                Ok(output) => {
                    return match output.trim() {
                        "absent" => {
                            info!(address = %address, attempt, "Host reinstalled");
                            Ok(Readiness::Ready)
                        }
                        "present" => {
                            warn!(address = %address, "Marker survived, install did not run");
                            Ok(Readiness::MarkerPresent)
                        }
                        other => Err(ProbeError::UnexpectedOutput {
                            host: address.to_string(),
                            output: other.to_string(),
                        }),
                    };
                }
                Err(e) if e.is_connect_failure() => {
                    debug!(address = %address, attempt, error = %e, "Host not reachable yet");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.interval).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(address = %address, attempts = self.attempts, "Host never came back");
        Ok(Readiness::Unreachable {
            attempts: self.attempts,
        })
    }
}
