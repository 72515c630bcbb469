//! Structured state-transition events.
//!
//! Every state change the coordinator makes is logged under the
//! `pxe_manager::transition` target and, when a channel is attached, sent to
//! it so an external sink can consume the stream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::resources::HostState;

/// Why a host changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Claimed for a request.
    Claimed,
    /// Came back with the marker gone.
    Verified,
    /// Could not be reached to place the marker.
    PreflightUnreachable,
    /// The boot controller has no such system.
    UnknownToBootController,
    /// Never came back within the probe budget.
    NeverCameBack,
    /// Came back with the marker still present.
    MarkerSurvived,
    /// The probe itself failed after connecting.
    ProbeFailed,
    /// Released by its owner.
    Released,
    /// Handed back because the reservation failed or was cancelled.
    Aborted,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Claimed => "claimed",
            Self::Verified => "verified",
            Self::PreflightUnreachable => "preflight_unreachable",
            Self::UnknownToBootController => "unknown_to_boot_controller",
            Self::NeverCameBack => "never_came_back",
            Self::MarkerSurvived => "marker_survived",
            Self::ProbeFailed => "probe_failed",
            Self::Released => "released",
            Self::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

/// Something observable the coordinator did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReservationEvent {
    /// A host changed state.
    Transition {
        hostname: String,
        from: HostState,
        to: HostState,
        reason: TransitionReason,
        at: DateTime<Utc>,
    },
    /// A failed host is being backfilled.
    ReplacementRequested {
        job_id: String,
        failed: String,
        count: usize,
    },
}

/// Destination for [`ReservationEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<ReservationEvent>>,
}

impl EventSink {
    /// Forward events to `tx` as well as the log.
    #[must_use]
    pub fn channel(tx: UnboundedSender<ReservationEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Record a state change.
    pub fn transition(&self, hostname: &str, from: HostState, to: HostState, reason: TransitionReason) {
        info!(
            target: "pxe_manager::transition",
            hostname = %hostname,
            from = %from,
            to = %to,
            reason = %reason,
            "State transition"
        );
        self.send(ReservationEvent::Transition {
            hostname: hostname.to_string(),
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }

    /// Record a replacement request.
    pub fn replacement(&self, job_id: &str, failed: &str, count: usize) {
        info!(
            target: "pxe_manager::transition",
            job_id = %job_id,
            failed = %failed,
            count,
            "Replacement requested"
        );
        self.send(ReservationEvent::ReplacementRequested {
            job_id: job_id.to_string(),
            failed: failed.to_string(),
            count,
        });
    }

    fn send(&self, event: ReservationEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::channel(tx);
        sink.transition("h1", HostState::Idle, HostState::Booting, TransitionReason::Claimed);
        sink.replacement("job-1", "h1", 1);

        match rx.try_recv().unwrap() {
            ReservationEvent::Transition { hostname, from, to, reason, .. } => {
                assert_eq!(hostname, "h1");
                assert_eq!(from, HostState::Idle);
                assert_eq!(to, HostState::Booting);
                assert_eq!(reason, TransitionReason::Claimed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            ReservationEvent::ReplacementRequested {
                job_id: "job-1".into(),
                failed: "h1".into(),
                count: 1,
            }
        );
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = EventSink::default();
        sink.replacement("job-1", "h1", 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ReservationEvent::ReplacementRequested {
            job_id: "job-1".into(),
            failed: "h1".into(),
            count: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "replacement_requested");
        assert_eq!(json["count"], 1);
    }
}
