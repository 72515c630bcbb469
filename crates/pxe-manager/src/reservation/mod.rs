//! Host reservation and lifecycle.
//!
//! A reservation walks each host through `idle -> pxe -> in_use`. Hosts that
//! cannot be reached before kickstart go to `needs_repair`; hosts that do not
//! come back reinstalled go to `pxe_failed`. Both are replaced one at a time
//! until the request is satisfied or the replacement budget runs out.

mod coordinator;
mod error;
mod events;

pub use coordinator::{ReservationCoordinator, ReservationRequest};
pub use error::ReservationError;
pub use events::{EventSink, ReservationEvent, TransitionReason};
