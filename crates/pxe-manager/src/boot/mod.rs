//! Network-boot controller abstraction.
//!
//! The coordinator only ever fires triggers at the controller: assign a
//! profile, enable netboot, power-cycle. None of these confirm that the host
//! actually rebooted; the readiness probe is the completion signal.

pub mod cobbler;
pub mod xmlrpc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur talking to the boot controller.
#[derive(Error, Debug)]
pub enum BootError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The controller answered with an XML-RPC fault.
    #[error("Fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// The response was not what the protocol promises.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The controller does not know the system.
    #[error("System not found: {0}")]
    SystemNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// What the controller knows about a system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemRecord {
    /// System name (the hostname).
    pub name: String,
    /// Assigned boot profile.
    pub profile: Option<String>,
    /// Addresses of the configured interfaces, in interface-name order.
    pub addresses: Vec<String>,
}

/// Trait for network-boot control planes.
#[async_trait]
pub trait NetworkBootController: Send + Sync {
    /// Resolve a hostname to the controller's handle for it.
    async fn find_system(&self, hostname: &str) -> Result<String, BootError>;

    /// Fetch the controller's record of a system.
    async fn get_system(&self, hostname: &str) -> Result<SystemRecord, BootError>;

    /// Assign the boot profile used on the next netboot.
    async fn assign_profile(&self, hostname: &str, profile: &str) -> Result<(), BootError>;

    /// Enable or disable netboot for the next power cycle.
    async fn set_netboot_enabled(&self, hostname: &str, enabled: bool) -> Result<(), BootError>;

    /// Power-cycle the given systems. Fire and forget.
    async fn power_cycle(&self, hostnames: &[String]) -> Result<(), BootError>;

    /// Address the readiness probe should connect to.
    ///
    /// Falls back to the hostname when the controller has no interface
    /// address on record.
    async fn system_address(&self, hostname: &str) -> Result<String, BootError> {
        let system = self.get_system(hostname).await?;
        let address = system
            .addresses
            .into_iter()
            .find(|a| !a.is_empty())
            .unwrap_or_else(|| hostname.to_string());
        debug!(hostname = %hostname, address = %address, "Resolved probe address");
        Ok(address)
    }

    /// Assign `profile`, enable netboot and power-cycle the host.
    async fn kickstart(&self, hostname: &str, profile: &str) -> Result<(), BootError> {
        info!(hostname = %hostname, profile = %profile, "Kickstarting host");
        self.assign_profile(hostname, profile).await?;
        self.set_netboot_enabled(hostname, true).await?;
        self.power_cycle(&[hostname.to_string()]).await?;
        Ok(())
    }
}
