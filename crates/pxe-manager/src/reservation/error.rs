//! Reservation failure taxonomy.

use thiserror::Error;

use crate::boot::BootError;
use crate::store::StoreError;

/// Why a reservation call did not return a fully satisfied set.
///
/// Partial success is never returned: any error means every resource the
/// call had claimed has been handed back.
#[derive(Error, Debug)]
pub enum ReservationError {
    /// The pool itself is exhausted.
    #[error("Insufficient resources: requested {requested}, {available} available")]
    InsufficientResources { requested: usize, available: usize },

    /// The pool has enough idle resources, but too few match the tags.
    #[error(
        "Insufficient resources matching tags: requested {requested}, \
         {matching} of {idle} idle resources match"
    )]
    InsufficientTaggedResources {
        requested: usize,
        matching: usize,
        idle: usize,
    },

    /// The network-boot controller could not be reached or refused a call.
    #[error("Boot controller unavailable: {0}")]
    BootControllerUnavailable(#[from] BootError),

    /// The resource datastore could not be reached or refused a write.
    #[error("Resource store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The last replacement allowed never came back up.
    #[error("{hostname} did not come back after {attempts} attempts and no replacements remain")]
    ProbeTimeout { hostname: String, attempts: u32 },

    /// Replacement budget spent; `hostname` is the host that failed last.
    #[error("Replacement budget of {budget} exhausted, last failed host {hostname}")]
    ReplacementsExhausted { budget: u32, hostname: String },

    /// The caller cancelled the reservation or its deadline passed.
    #[error("Reservation cancelled")]
    Cancelled,

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ReservationError {
    /// Whether relaxing the request's tags could help.
    #[must_use]
    pub fn is_tag_constrained(&self) -> bool {
        matches!(self, Self::InsufficientTaggedResources { .. })
    }
}
