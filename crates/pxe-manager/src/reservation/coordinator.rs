//! Host reservation: claim, kickstart, verify, replace.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ReservationError;
use super::events::{EventSink, ReservationEvent, TransitionReason};
use crate::boot::{BootError, NetworkBootController};
use crate::config::{DistroMap, ManagerConfig};
use crate::probe::{ProbeError, Readiness, ReadinessProbe};
use crate::resources::{HostResource, HostState, Record};
use crate::store::{ResourceStore, StoreError};
use crate::tags::{self, TagValue, Tags};

/// A request for `count` hosts installed with `distro`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    /// Requester identity written to claimed hosts.
    pub owner: String,
    /// Job the hosts are reserved for. Release is keyed on it.
    pub job_id: String,
    /// Number of hosts wanted.
    pub count: usize,
    /// Distribution name, mapped to a boot profile.
    pub distro: String,
    /// Capability requirements.
    pub tags: Tags,
}

impl ReservationRequest {
    /// Create an untagged request.
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        job_id: impl Into<String>,
        count: usize,
        distro: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            job_id: job_id.into(),
            count,
            distro: distro.into(),
            tags: Tags::new(),
        }
    }

    /// Replace the capability requirements.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Add one capability requirement.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), ReservationError> {
        let problem = if self.count == 0 {
            "count must be at least 1"
        } else if self.owner.is_empty() {
            "owner is empty"
        } else if self.job_id.is_empty() {
            "job_id is empty"
        } else if self.distro.is_empty() {
            "distro is empty"
        } else {
            return Ok(());
        };
        Err(ReservationError::InvalidRequest(problem.to_string()))
    }
}

/// A host that has been claimed and kickstarted.
#[derive(Debug)]
struct Kickstarted {
    hostname: String,
    address: String,
}

/// Why a claimed host was dropped from the request.
#[derive(Debug)]
enum HostFailure {
    Preflight(ProbeError),
    UnknownSystem,
    Verify(Readiness),
    Probe(ProbeError),
    /// Someone else rewrote the host while it was booting.
    Lost,
}

impl HostFailure {
    fn reason(&self) -> TransitionReason {
        match self {
            Self::Preflight(_) => TransitionReason::PreflightUnreachable,
            Self::UnknownSystem => TransitionReason::UnknownToBootController,
            Self::Verify(Readiness::Unreachable { .. }) => TransitionReason::NeverCameBack,
            Self::Verify(Readiness::MarkerPresent) => TransitionReason::MarkerSurvived,
            Self::Verify(Readiness::Ready) => TransitionReason::Verified,
            Self::Probe(_) => TransitionReason::ProbeFailed,
            Self::Lost => TransitionReason::Aborted,
        }
    }
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preflight(e) => write!(f, "pre-flight failed: {e}"),
            Self::UnknownSystem => f.write_str("unknown to the boot controller"),
            Self::Verify(Readiness::Unreachable { attempts }) => {
                write!(f, "unreachable after {attempts} attempts")
            }
            Self::Verify(Readiness::MarkerPresent) => f.write_str("came back without reinstalling"),
            Self::Verify(Readiness::Ready) => f.write_str("ready"),
            Self::Probe(e) => write!(f, "probe failed: {e}"),
            Self::Lost => f.write_str("taken over by another writer"),
        }
    }
}

/// Bookkeeping for one `reserve` call.
struct Fulfilment<'a> {
    request: &'a ReservationRequest,
    profile: &'a str,
    /// Hosts currently held by this call, with the state they were left in.
    held: BTreeMap<String, HostState>,
    /// Verified hosts, in the order they came back.
    ready: Vec<String>,
    replacements: u32,
}

impl<'a> Fulfilment<'a> {
    fn new(request: &'a ReservationRequest, profile: &'a str) -> Self {
        Self {
            request,
            profile,
            held: BTreeMap::new(),
            ready: Vec::with_capacity(request.count),
            replacements: 0,
        }
    }
}

/// Reserves hosts and drives them through kickstart and verification.
pub struct ReservationCoordinator {
    hosts: Arc<dyn ResourceStore<HostResource>>,
    boot: Arc<dyn NetworkBootController>,
    probe: Arc<dyn ReadinessProbe>,
    distros: DistroMap,
    settle: Duration,
    max_replacements: u32,
    max_parallel_probes: usize,
    events: EventSink,
}

impl ReservationCoordinator {
    /// Create a coordinator over the given collaborators.
    #[must_use]
    pub fn new(
        hosts: Arc<dyn ResourceStore<HostResource>>,
        boot: Arc<dyn NetworkBootController>,
        probe: Arc<dyn ReadinessProbe>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            hosts,
            boot,
            probe,
            distros: config.distros.clone(),
            settle: config.readiness.settle(),
            max_replacements: config.reservation.max_replacements,
            max_parallel_probes: config.reservation.max_parallel_probes.max(1),
            events: EventSink::default(),
        }
    }

    /// Send transition and replacement events to `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: tokio::sync::mpsc::UnboundedSender<ReservationEvent>) -> Self {
        self.events = EventSink::channel(tx);
        self
    }

    /// Reserve `request.count` hosts, install them, and return their
    /// hostnames once every one has been verified.
    ///
    /// Either the full set is returned or nothing is held: on any error, or
    /// when `cancel` fires, every host this call still holds goes back to
    /// the pool.
    ///
    /// # Errors
    /// See [`ReservationError`].
    pub async fn reserve(
        &self,
        request: &ReservationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ReservationError> {
        request.validate()?;
        let profile = self.distros.resolve(&request.distro);
        info!(
            owner = %request.owner,
            job_id = %request.job_id,
            count = request.count,
            distro = %request.distro,
            profile = %profile,
            tags = ?request.tags,
            "Reserving hosts"
        );

        let mut run = Fulfilment::new(request, profile);
        match self.fulfil(&mut run, cancel).await {
            Ok(()) => {
                info!(
                    job_id = %request.job_id,
                    hosts = ?run.ready,
                    replacements = run.replacements,
                    "Reservation complete"
                );
                Ok(run.ready)
            }
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "Reservation failed, releasing held hosts");
                self.abandon(&mut run).await;
                Err(e)
            }
        }
    }

    /// Release every host reserved for `job_id`, whatever state it is in.
    ///
    /// Returns how many hosts were released. Releasing a job that holds
    /// nothing is not an error.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the datastore fails.
    pub async fn release_job(&self, job_id: &str) -> Result<usize, ReservationError> {
        let held = self.hosts.find("job_id", job_id).await?;
        let mut released = 0;
        for record in held {
            let hostname = record.resource.hostname;
            let previous = self
                .transition(&hostname, |host| {
                    if host.job_id != job_id {
                        return false;
                    }
                    host.release();
                    true
                })
                .await?;
            if let Some(from) = previous {
                self.events
                    .transition(&hostname, from, HostState::Idle, TransitionReason::Released);
                released += 1;
            }
        }
        info!(job_id = %job_id, released, "Released job");
        Ok(released)
    }

    /// Put a single host back into the pool, clearing any owner and any
    /// failure state. Returns 1 if the host was reset, 0 if it was already
    /// idle.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the host does not
    /// exist or the datastore fails.
    pub async fn release_host(&self, hostname: &str) -> Result<usize, ReservationError> {
        let previous = self
            .transition(hostname, |host| {
                if host.state == HostState::Idle && host.owner.is_empty() && host.job_id.is_empty() {
                    return false;
                }
                host.release();
                true
            })
            .await?;
        if let Some(from) = previous {
            self.events
                .transition(hostname, from, HostState::Idle, TransitionReason::Released);
        }
        Ok(usize::from(previous.is_some()))
    }

    /// Hosts currently reserved for `job_id`.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the datastore fails.
    pub async fn job_hosts(&self, job_id: &str) -> Result<Vec<HostResource>, ReservationError> {
        Ok(self
            .hosts
            .find("job_id", job_id)
            .await?
            .into_iter()
            .map(|record| record.resource)
            .collect())
    }

    async fn fulfil(
        &self,
        run: &mut Fulfilment<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ReservationError> {
        let mut wanted = run.request.count;
        let mut round = 0u32;
        while wanted > 0 {
            round += 1;
            debug!(job_id = %run.request.job_id, round, wanted, "Claim round");

            let batch = self.claim(run, wanted, cancel).await?;
            self.settle(cancel).await?;
            let failures = self.verify(run, batch, cancel).await?;

            // Each failed host is backfilled by its own single-host
            // replacement; the next round claims them together.
            wanted = 0;
            for (hostname, failure) in failures {
                self.request_replacement(run, &hostname, &failure)?;
                wanted += 1;
            }
        }
        Ok(())
    }

    /// Claim and kickstart `wanted` hosts.
    ///
    /// Hosts lost to a concurrent claim are skipped. Hosts that fail before
    /// kickstart are quarantined and backfilled from the same candidate list.
    async fn claim(
        &self,
        run: &mut Fulfilment<'_>,
        wanted: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Kickstarted>, ReservationError> {
        let request = run.request;
        let idle = self.hosts.find("state", HostState::Idle.as_str()).await?;
        let idle_count = idle.len();
        let mut candidates: Vec<Record<HostResource>> = idle
            .into_iter()
            .filter(|record| tags::matches(&record.resource.tags, &request.tags))
            .collect();

        if candidates.len() < wanted {
            return Err(if candidates.len() < idle_count {
                ReservationError::InsufficientTaggedResources {
                    requested: wanted,
                    matching: candidates.len(),
                    idle: idle_count,
                }
            } else {
                ReservationError::InsufficientResources {
                    requested: wanted,
                    available: idle_count,
                }
            });
        }

        // Concurrent requesters would otherwise all race for the same first
        // few documents.
        candidates.shuffle(&mut rand::thread_rng());

        let mut batch = Vec::with_capacity(wanted);
        let mut candidates = candidates.into_iter();
        while batch.len() < wanted {
            if cancel.is_cancelled() {
                return Err(ReservationError::Cancelled);
            }
            let Some(mut candidate) = candidates.next() else {
                return Err(ReservationError::InsufficientResources {
                    requested: wanted,
                    available: batch.len(),
                });
            };

            let hostname = candidate.resource.hostname.clone();
            candidate.resource.claim(&request.owner, &request.job_id);
            match self.hosts.update(&candidate).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(hostname = %hostname, "Claimed by someone else, trying next candidate");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            run.held.insert(hostname.clone(), HostState::Booting);
            self.events.transition(
                &hostname,
                HostState::Idle,
                HostState::Booting,
                TransitionReason::Claimed,
            );

            match self.prepare(&hostname, run.profile).await? {
                Ok(address) => batch.push(Kickstarted { hostname, address }),
                Err(failure) => {
                    self.quarantine(run, &hostname, HostState::NeedsRepair, failure.reason())
                        .await?;
                    self.request_replacement(run, &hostname, &failure)?;
                }
            }
        }
        Ok(batch)
    }

    /// Resolve the probe address, place the marker and kickstart.
    ///
    /// The inner error is a per-host failure; the outer one aborts the
    /// request.
    async fn prepare(
        &self,
        hostname: &str,
        profile: &str,
    ) -> Result<Result<String, HostFailure>, ReservationError> {
        let address = match self.boot.system_address(hostname).await {
            Ok(address) => address,
            Err(BootError::SystemNotFound(_)) => return Ok(Err(HostFailure::UnknownSystem)),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.probe.place_marker(&address).await {
            warn!(hostname = %hostname, address = %address, error = %e, "Pre-flight marker failed");
            return Ok(Err(HostFailure::Preflight(e)));
        }

        match self.boot.kickstart(hostname, profile).await {
            Ok(()) => Ok(Ok(address)),
            Err(BootError::SystemNotFound(_)) => Ok(Err(HostFailure::UnknownSystem)),
            Err(e) => Err(e.into()),
        }
    }

    /// Give kickstarted hosts time to actually go down before probing, so
    /// the old image is not mistaken for the new one.
    async fn settle(&self, cancel: &CancellationToken) -> Result<(), ReservationError> {
        if self.settle.is_zero() {
            return Ok(());
        }
        info!(settle_secs = self.settle.as_secs(), "Waiting for kickstarted hosts to go down");
        tokio::select! {
            () = cancel.cancelled() => Err(ReservationError::Cancelled),
            () = tokio::time::sleep(self.settle) => Ok(()),
        }
    }

    /// Probe every host in `batch` concurrently and record the outcomes.
    ///
    /// Returns the hosts that failed; they are already quarantined.
    async fn verify(
        &self,
        run: &mut Fulfilment<'_>,
        batch: Vec<Kickstarted>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, HostFailure)>, ReservationError> {
        let probe = &self.probe;
        let checks = stream::iter(batch)
            .map(move |host| async move {
                let outcome = probe.is_ready(&host.address).await;
                (host, outcome)
            })
            .buffer_unordered(self.max_parallel_probes)
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            () = cancel.cancelled() => None,
            outcomes = checks => Some(outcomes),
        };
        let Some(outcomes) = outcomes else {
            return Err(ReservationError::Cancelled);
        };

        let mut failures = Vec::new();
        for (host, outcome) in outcomes {
            let failure = match outcome {
                Ok(Readiness::Ready) => {
                    if self.mark_in_use(run, &host.hostname).await? {
                        run.ready.push(host.hostname);
                    } else {
                        failures.push((host.hostname, HostFailure::Lost));
                    }
                    continue;
                }
                Ok(readiness) => HostFailure::Verify(readiness),
                Err(e) => HostFailure::Probe(e),
            };
            warn!(hostname = %host.hostname, address = %host.address, cause = %failure, "Host failed verification");
            self.quarantine(run, &host.hostname, HostState::BootFailed, failure.reason())
                .await?;
            failures.push((host.hostname, failure));
        }
        Ok(failures)
    }

    /// Hand a verified host to its owner. Returns `false` if the host is no
    /// longer held by this request.
    async fn mark_in_use(
        &self,
        run: &mut Fulfilment<'_>,
        hostname: &str,
    ) -> Result<bool, ReservationError> {
        let job_id = run.request.job_id.as_str();
        let previous = self
            .transition(hostname, |host| {
                if !host.is_held_by(job_id) {
                    return false;
                }
                host.state = HostState::InUse;
                true
            })
            .await?;

        if let Some(from) = previous {
            run.held.insert(hostname.to_string(), HostState::InUse);
            self.events
                .transition(hostname, from, HostState::InUse, TransitionReason::Verified);
            Ok(true)
        } else {
            warn!(hostname = %hostname, job_id = %job_id, "Host no longer held by this job");
            run.held.remove(hostname);
            Ok(false)
        }
    }

    /// Move a held host into a failure state and let go of it.
    async fn quarantine(
        &self,
        run: &mut Fulfilment<'_>,
        hostname: &str,
        state: HostState,
        reason: TransitionReason,
    ) -> Result<(), ReservationError> {
        let job_id = run.request.job_id.as_str();
        let previous = self
            .transition(hostname, |host| {
                if !host.is_held_by(job_id) {
                    return false;
                }
                host.quarantine(state);
                true
            })
            .await?;

        run.held.remove(hostname);
        if let Some(from) = previous {
            self.events.transition(hostname, from, state, reason);
        }
        Ok(())
    }

    fn request_replacement(
        &self,
        run: &mut Fulfilment<'_>,
        hostname: &str,
        failure: &HostFailure,
    ) -> Result<(), ReservationError> {
        if run.replacements >= self.max_replacements {
            warn!(
                job_id = %run.request.job_id,
                hostname = %hostname,
                budget = self.max_replacements,
                "No replacements left"
            );
            return Err(match failure {
                HostFailure::Verify(Readiness::Unreachable { attempts }) => {
                    ReservationError::ProbeTimeout {
                        hostname: hostname.to_string(),
                        attempts: *attempts,
                    }
                }
                _ => ReservationError::ReplacementsExhausted {
                    budget: self.max_replacements,
                    hostname: hostname.to_string(),
                },
            });
        }

        run.replacements += 1;
        info!(
            job_id = %run.request.job_id,
            failed = %hostname,
            cause = %failure,
            replacement = run.replacements,
            budget = self.max_replacements,
            "Requesting replacement host"
        );
        self.events.replacement(&run.request.job_id, hostname, 1);
        Ok(())
    }

    /// Release whatever this call still holds after a failure.
    ///
    /// Errors are logged rather than returned so they do not mask the
    /// failure that caused the abort.
    async fn abandon(&self, run: &mut Fulfilment<'_>) {
        let job_id = run.request.job_id.as_str();
        for hostname in std::mem::take(&mut run.held).into_keys() {
            let released = self
                .transition(&hostname, |host| {
                    if !host.is_held_by(job_id) {
                        return false;
                    }
                    host.release();
                    true
                })
                .await;
            match released {
                Ok(Some(from)) => {
                    self.events
                        .transition(&hostname, from, HostState::Idle, TransitionReason::Aborted);
                }
                Ok(None) => debug!(hostname = %hostname, "Host already let go"),
                Err(e) => warn!(hostname = %hostname, error = %e, "Failed to release host"),
            }
        }
        run.ready.clear();
    }

    /// Apply `change` to a host through a conditional write.
    ///
    /// Returns the state the host was in when the write landed, or `None`
    /// if `change` declined to write.
    async fn transition<F>(&self, hostname: &str, change: F) -> Result<Option<HostState>, StoreError>
    where
        F: Fn(&mut HostResource) -> bool + Send + Sync,
    {
        let previous = Mutex::new(None);
        let apply = |host: &mut HostResource| {
            let from = host.state;
            let changed = change(host);
            if let Ok(mut slot) = previous.lock() {
                *slot = changed.then_some(from);
            }
            changed
        };
        self.hosts.modify(hostname, &apply).await?;
        Ok(previous.into_inner().ok().flatten())
    }
}
