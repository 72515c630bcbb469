//! Bare metal host and address reservation for QA provisioning.
//!
//! This crate reserves hosts from a shared pool kept in an external
//! resource datastore, kickstarts them through a network-boot controller
//! (Cobbler), and verifies over SSH that the installation actually ran
//! before handing the hosts back. Hosts that fail verification are
//! quarantined and replaced one at a time.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use pxe_manager::boot::cobbler::Cobbler;
//! use pxe_manager::probe::{ssh::SshShell, ShellProbe};
//! use pxe_manager::reservation::{ReservationCoordinator, ReservationRequest};
//! use pxe_manager::store::eve::EveStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = pxe_manager::ManagerConfig::default();
//!     let hosts = Arc::new(EveStore::machines(&config.store)?);
//!     let boot = Arc::new(Cobbler::new(&config.cobbler)?);
//!     let probe = Arc::new(ShellProbe::new(SshShell::new(&config.ssh), &config.readiness));
//!
//!     let coordinator = ReservationCoordinator::new(hosts, boot, probe, &config);
//!     let request = ReservationRequest::new("qa", "job-42", 2, "centos7");
//!     let hosts = coordinator.reserve(&request, &Default::default()).await?;
//!     println!("reserved {hosts:?}");
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addresses;
pub mod boot;
pub mod config;
pub mod probe;
pub mod reservation;
pub mod resources;
pub mod store;
pub mod tags;

pub use addresses::AddressPool;
pub use config::ManagerConfig;
pub use reservation::{ReservationCoordinator, ReservationError, ReservationRequest};
pub use resources::{AddressResource, HostResource, HostState};
pub use tags::{TagValue, Tags};
