//! Integration tests for the reservation coordinator.
//!
//! The coordinator runs against the in-memory store and fakes for the boot
//! controller and readiness probe. Time is paused, so the settle interval and
//! probe delays complete instantly while still being measurable.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pxe_manager::boot::{BootError, NetworkBootController, SystemRecord};
use pxe_manager::probe::{ProbeError, Readiness, ReadinessProbe};
use pxe_manager::reservation::{ReservationEvent, TransitionReason};
use pxe_manager::resources::Record;
use pxe_manager::store::memory::MemoryStore;
use pxe_manager::store::{ResourceStore, StoreError};
use pxe_manager::tags::TagValue;
use pxe_manager::{
    HostResource, HostState, ManagerConfig, ReservationCoordinator, ReservationError,
    ReservationRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fakes
// =============================================================================

/// Boot controller that records what it was asked to do.
#[derive(Default)]
struct FakeBoot {
    profiles: Mutex<Vec<(String, String)>>,
    rebooted: Mutex<Vec<String>>,
    /// Fail every power cycle as if the controller were down.
    power_down: bool,
}

impl FakeBoot {
    fn rebooted(&self) -> Vec<String> {
        self.rebooted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkBootController for FakeBoot {
    async fn find_system(&self, hostname: &str) -> Result<String, BootError> {
        Ok(format!("system::{hostname}"))
    }

    async fn get_system(&self, hostname: &str) -> Result<SystemRecord, BootError> {
        // No interface addresses: the probe connects to the hostname.
        Ok(SystemRecord {
            name: hostname.to_string(),
            ..SystemRecord::default()
        })
    }

    async fn assign_profile(&self, hostname: &str, profile: &str) -> Result<(), BootError> {
        self.profiles
            .lock()
            .unwrap()
            .push((hostname.to_string(), profile.to_string()));
        Ok(())
    }

    async fn set_netboot_enabled(&self, _hostname: &str, _enabled: bool) -> Result<(), BootError> {
        Ok(())
    }

    async fn power_cycle(&self, hostnames: &[String]) -> Result<(), BootError> {
        if self.power_down {
            return Err(BootError::Api {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        self.rebooted.lock().unwrap().extend_from_slice(hostnames);
        Ok(())
    }
}

/// Probe whose first few answers are scripted; everything after is ready.
#[derive(Default)]
struct FakeProbe {
    preflight_failures: Mutex<usize>,
    check_outcomes: Mutex<VecDeque<Readiness>>,
    check_delay: Duration,
    checked: Mutex<Vec<String>>,
}

impl FakeProbe {
    fn failing_checks(outcomes: Vec<Readiness>) -> Self {
        Self {
            check_outcomes: Mutex::new(outcomes.into()),
            ..Self::default()
        }
    }

    fn failing_preflight(count: usize) -> Self {
        Self {
            preflight_failures: Mutex::new(count),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            check_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn place_marker(&self, address: &str) -> Result<(), ProbeError> {
        let mut failures = self.preflight_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ProbeError::Refused(address.to_string()));
        }
        Ok(())
    }

    async fn is_ready(&self, address: &str) -> Result<Readiness, ProbeError> {
        self.checked.lock().unwrap().push(address.to_string());
        let scripted = self.check_outcomes.lock().unwrap().pop_front();
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        Ok(scripted.unwrap_or(Readiness::Ready))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    store: Arc<MemoryStore<HostResource>>,
    boot: Arc<FakeBoot>,
    probe: Arc<FakeProbe>,
    coordinator: ReservationCoordinator,
    events: UnboundedReceiver<ReservationEvent>,
}

impl Harness {
    fn new(hosts: Vec<HostResource>, boot: FakeBoot, probe: FakeProbe) -> Self {
        Self::with_config(hosts, boot, probe, &ManagerConfig::default())
    }

    fn with_config(
        hosts: Vec<HostResource>,
        boot: FakeBoot,
        probe: FakeProbe,
        config: &ManagerConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(hosts));
        let boot = Arc::new(boot);
        let probe = Arc::new(probe);
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        let coordinator =
            ReservationCoordinator::new(store.clone(), boot.clone(), probe.clone(), config)
                .with_events(tx);
        Self {
            store,
            boot,
            probe,
            coordinator,
            events,
        }
    }

    async fn host(&self, hostname: &str) -> HostResource {
        self.store.get(hostname).await.unwrap().resource
    }

    async fn count_in(&self, state: HostState) -> usize {
        self.store.find("state", state.as_str()).await.unwrap().len()
    }

    fn drain_events(&mut self) -> Vec<ReservationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn gib(n: i64) -> TagValue {
    TagValue::Integer(n << 30)
}

fn host(name: &str, tags: &[(&str, TagValue)]) -> HostResource {
    HostResource::new(name).with_tags(
        tags.iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect(),
    )
}

fn plain_hosts(count: usize) -> Vec<HostResource> {
    (1..=count).map(|n| HostResource::new(format!("h{n}"))).collect()
}

fn replacements(events: &[ReservationEvent]) -> Vec<(String, usize)> {
    events
        .iter()
        .filter_map(|event| match event {
            ReservationEvent::ReplacementRequested { failed, count, .. } => {
                Some((failed.clone(), *count))
            }
            ReservationEvent::Transition { .. } => None,
        })
        .collect()
}

fn transitions(events: &[ReservationEvent], hostname: &str) -> Vec<(HostState, HostState)> {
    events
        .iter()
        .filter_map(|event| match event {
            ReservationEvent::Transition { hostname: h, from, to, .. } if h == hostname => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect()
}

/// Hosts that ended up in `state` according to the event stream.
fn moved_to(events: &[ReservationEvent], state: HostState) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ReservationEvent::Transition { hostname, to, .. } if *to == state => {
                Some(hostname.clone())
            }
            _ => None,
        })
        .collect()
}

fn request(count: usize) -> ReservationRequest {
    ReservationRequest::new("qa", "job-42", count, "centos7")
}

// =============================================================================
// Successful reservations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_memory_tagged_scenario() {
    let hosts = vec![
        host("h1", &[("memory", gib(16))]),
        host("h2", &[("memory", gib(8))]),
        host("h3", &[("memory", gib(16))]),
    ];
    let mut harness = Harness::new(hosts, FakeBoot::default(), FakeProbe::default());

    let started = Instant::now();
    let request = request(2).with_tag("memory", gib(14));
    let mut reserved = harness
        .coordinator
        .reserve(&request, &CancellationToken::new())
        .await
        .unwrap();
    reserved.sort();

    assert_eq!(reserved, vec!["h1", "h3"]);
    // One settle interval for the whole batch.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(300) && waited < Duration::from_secs(301));

    let events = harness.drain_events();
    for name in ["h1", "h3"] {
        assert_eq!(
            transitions(&events, name),
            vec![
                (HostState::Idle, HostState::Booting),
                (HostState::Booting, HostState::InUse)
            ]
        );
        let host = harness.host(name).await;
        assert_eq!(host.state, HostState::InUse);
        assert_eq!(host.owner, "qa");
        assert_eq!(host.job_id, "job-42");
    }
    assert_eq!(harness.host("h2").await.state, HostState::Idle);
    assert!(replacements(&events).is_empty());

    let profiles = harness.boot.profiles.lock().unwrap().clone();
    assert_eq!(profiles.len(), 2);
    assert!(profiles
        .iter()
        .all(|(_, profile)| profile == "centos7-x86_64-raid0"));
}

#[tokio::test(start_paused = true)]
async fn test_returns_exactly_count_distinct_hosts() {
    let harness = Harness::new(plain_hosts(5), FakeBoot::default(), FakeProbe::default());

    let reserved = harness
        .coordinator
        .reserve(&request(3), &CancellationToken::new())
        .await
        .unwrap();

    let distinct: BTreeSet<_> = reserved.iter().collect();
    assert_eq!(reserved.len(), 3);
    assert_eq!(distinct.len(), 3);
    assert_eq!(harness.count_in(HostState::InUse).await, 3);
    assert_eq!(harness.count_in(HostState::Idle).await, 2);
    assert_eq!(harness.boot.rebooted().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_probes_run_concurrently() {
    let harness = Harness::new(
        plain_hosts(3),
        FakeBoot::default(),
        FakeProbe::slow(Duration::from_secs(900)),
    );

    let started = Instant::now();
    harness
        .coordinator
        .reserve(&request(3), &CancellationToken::new())
        .await
        .unwrap();

    // Settle plus one probe duration, not three.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1200) && waited < Duration::from_secs(1201));
    assert_eq!(harness.probe.checked.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_never_share_hosts() {
    let store = Arc::new(MemoryStore::new(plain_hosts(4)));
    let boot = Arc::new(FakeBoot::default());
    let probe = Arc::new(FakeProbe::default());
    let config = ManagerConfig::default();
    let first = ReservationCoordinator::new(store.clone(), boot.clone(), probe.clone(), &config);
    let second = ReservationCoordinator::new(store.clone(), boot, probe, &config);

    let cancel = CancellationToken::new();
    let request_a = ReservationRequest::new("qa", "job-a", 2, "centos7");
    let request_b = ReservationRequest::new("qa", "job-b", 2, "centos7");
    let (a, b) = tokio::join!(
        first.reserve(&request_a, &cancel),
        second.reserve(&request_b, &cancel)
    );

    let a: BTreeSet<_> = a.unwrap().into_iter().collect();
    let b: BTreeSet<_> = b.unwrap().into_iter().collect();
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
    assert!(a.is_disjoint(&b));
    for name in &a {
        assert_eq!(store.get(name).await.unwrap().resource.job_id, "job-a");
    }
}

/// Host store where another job claims the first host written to, just
/// before the write lands.
struct Contended {
    inner: MemoryStore<HostResource>,
    stolen: Mutex<Option<String>>,
}

impl Contended {
    fn new(hosts: Vec<HostResource>) -> Self {
        Self {
            inner: MemoryStore::new(hosts),
            stolen: Mutex::new(None),
        }
    }

    fn stolen(&self) -> Option<String> {
        self.stolen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceStore<HostResource> for Contended {
    async fn find(&self, field: &str, value: &str) -> Result<Vec<Record<HostResource>>, StoreError> {
        self.inner.find(field, value).await
    }

    async fn get(&self, key: &str) -> Result<Record<HostResource>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<Record<HostResource>>, StoreError> {
        self.inner.list().await
    }

    async fn create(&self, resource: &HostResource) -> Result<(), StoreError> {
        self.inner.create(resource).await
    }

    async fn update(&self, record: &Record<HostResource>) -> Result<Record<HostResource>, StoreError> {
        let first = {
            let mut stolen = self.stolen.lock().unwrap();
            if stolen.is_none() {
                *stolen = Some(record.resource.hostname.clone());
                true
            } else {
                false
            }
        };
        if first {
            let mut theirs = self.inner.get(&record.resource.hostname).await?;
            theirs.resource.claim("someone-else", "job-other");
            self.inner.update(&theirs).await?;
        }
        self.inner.update(record).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_host_taken_during_claim_is_skipped() {
    let store = Arc::new(Contended::new(plain_hosts(3)));
    let boot = Arc::new(FakeBoot::default());
    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let coordinator = ReservationCoordinator::new(
        store.clone(),
        boot.clone(),
        Arc::new(FakeProbe::default()),
        &ManagerConfig::default(),
    )
    .with_events(tx);

    let reserved = coordinator
        .reserve(&request(2), &CancellationToken::new())
        .await
        .unwrap();

    let stolen = store.stolen().unwrap();
    assert_eq!(reserved.len(), 2);
    assert!(!reserved.contains(&stolen));

    let taken = store.get(&stolen).await.unwrap().resource;
    assert_eq!(taken.job_id, "job-other");
    assert_eq!(taken.owner, "someone-else");
    for name in &reserved {
        assert_eq!(store.get(name).await.unwrap().resource.state, HostState::InUse);
    }

    // Losing the race is not a failure: no replacement, no kickstart.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(replacements(&seen).is_empty());
    assert!(transitions(&seen, &stolen).is_empty());
    assert!(!boot.rebooted().contains(&stolen));
    assert_eq!(boot.rebooted().len(), 2);
}

// =============================================================================
// Replacement
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_failure_requests_one_replacement() {
    let mut harness = Harness::new(
        plain_hosts(4),
        FakeBoot::default(),
        FakeProbe::failing_checks(vec![Readiness::MarkerPresent]),
    );

    let started = Instant::now();
    let reserved = harness
        .coordinator
        .reserve(&request(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reserved.len(), 3);

    let events = harness.drain_events();
    let replaced = replacements(&events);
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].1, 1);

    let failed = moved_to(&events, HostState::BootFailed);
    assert_eq!(failed, vec![replaced[0].0.clone()]);
    assert!(!reserved.contains(&failed[0]));

    // Three initial kickstarts and one for the replacement.
    assert_eq!(harness.boot.rebooted().len(), 4);
    // The replacement gets its own settle interval.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(600) && waited < Duration::from_secs(601));
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_quarantines_and_replaces_with_same_tags() {
    let hosts = vec![
        host("a1", &[("cores", TagValue::Integer(16))]),
        host("a2", &[("cores", TagValue::Integer(16))]),
        host("a3", &[("cores", TagValue::Integer(32))]),
        host("b1", &[("cores", TagValue::Integer(4))]),
    ];
    let mut harness = Harness::new(
        hosts,
        FakeBoot::default(),
        FakeProbe::failing_checks(vec![Readiness::Unreachable { attempts: 45 }]),
    );

    let reserved = harness
        .coordinator
        .reserve(
            &request(2).with_tag("cores", TagValue::Integer(8)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reserved.len(), 2);
    assert!(!reserved.contains(&"b1".to_string()));
    assert_eq!(harness.host("b1").await.state, HostState::Idle);

    let events = harness.drain_events();
    let replaced = replacements(&events);
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].1, 1);

    let failed = harness.host(&replaced[0].0).await;
    assert_eq!(failed.state, HostState::BootFailed);
    assert!(failed.owner.is_empty());
    assert!(failed.job_id.is_empty());
    assert!(events.iter().any(|event| matches!(
        event,
        ReservationEvent::Transition { to: HostState::BootFailed, reason: TransitionReason::NeverCameBack, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_preflight_failure_marks_needs_repair() {
    let mut harness = Harness::new(
        plain_hosts(3),
        FakeBoot::default(),
        FakeProbe::failing_preflight(1),
    );

    let started = Instant::now();
    let reserved = harness
        .coordinator
        .reserve(&request(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reserved.len(), 2);

    let events = harness.drain_events();
    let broken = moved_to(&events, HostState::NeedsRepair);
    assert_eq!(broken.len(), 1);
    assert_eq!(replacements(&events), vec![(broken[0].clone(), 1)]);

    let host = harness.host(&broken[0]).await;
    assert_eq!(host.state, HostState::NeedsRepair);
    assert!(host.owner.is_empty());
    // Never kickstarted, and backfilled within the same batch.
    assert!(!harness.boot.rebooted().contains(&broken[0]));
    assert!(started.elapsed() < Duration::from_secs(301));
}

#[tokio::test(start_paused = true)]
async fn test_replacement_budget_is_bounded() {
    let mut config = ManagerConfig::default();
    config.reservation.max_replacements = 1;
    let mut harness = Harness::with_config(
        plain_hosts(3),
        FakeBoot::default(),
        FakeProbe::failing_checks(vec![
            Readiness::Unreachable { attempts: 45 },
            Readiness::Unreachable { attempts: 45 },
        ]),
        &config,
    );

    let err = harness
        .coordinator
        .reserve(&request(1), &CancellationToken::new())
        .await
        .unwrap_err();

    let events = harness.drain_events();
    let replaced = replacements(&events);
    assert_eq!(replaced.len(), 1);
    match err {
        ReservationError::ProbeTimeout { hostname, attempts } => {
            assert_eq!(attempts, 45);
            assert_ne!(hostname, replaced[0].0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.count_in(HostState::BootFailed).await, 2);
    assert_eq!(harness.count_in(HostState::Idle).await, 1);
    assert!(harness.coordinator.job_hosts("job-42").await.unwrap().is_empty());
}

// =============================================================================
// Failures and release
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tag_shortfall_is_reported_distinctly() {
    let hosts = vec![
        host("h1", &[("cores", TagValue::Integer(4))]),
        host("h2", &[("cores", TagValue::Integer(4))]),
        host("h3", &[("cores", TagValue::Integer(4))]),
    ];
    let harness = Harness::new(hosts, FakeBoot::default(), FakeProbe::default());
    let cancel = CancellationToken::new();

    let err = harness
        .coordinator
        .reserve(&request(1).with_tag("cores", TagValue::Integer(8)), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_tag_constrained());
    assert!(matches!(
        err,
        ReservationError::InsufficientTaggedResources { requested: 1, matching: 0, idle: 3 }
    ));

    let err = harness
        .coordinator
        .reserve(&request(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReservationError::InsufficientResources { requested: 5, available: 3 }
    ));

    assert_eq!(harness.count_in(HostState::Idle).await, 3);
    assert!(harness.boot.rebooted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_release_job_is_idempotent() {
    let harness = Harness::new(plain_hosts(3), FakeBoot::default(), FakeProbe::default());
    harness
        .coordinator
        .reserve(&request(2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.coordinator.release_job("job-42").await.unwrap(), 2);
    let once = harness.store.snapshot().await;
    assert_eq!(harness.coordinator.release_job("job-42").await.unwrap(), 0);
    let twice = harness.store.snapshot().await;

    assert_eq!(once, twice);
    assert!(twice.iter().all(|host| host.state == HostState::Idle && host.owner.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_release_host_clears_failure_state() {
    let mut broken = HostResource::new("h1");
    broken.quarantine(HostState::NeedsRepair);
    let harness = Harness::new(vec![broken], FakeBoot::default(), FakeProbe::default());

    assert_eq!(harness.coordinator.release_host("h1").await.unwrap(), 1);
    assert_eq!(harness.host("h1").await.state, HostState::Idle);
    assert_eq!(harness.coordinator.release_host("h1").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_boot_controller_failure_releases_claimed_hosts() {
    let boot = FakeBoot {
        power_down: true,
        ..FakeBoot::default()
    };
    let mut harness = Harness::new(plain_hosts(3), boot, FakeProbe::default());

    let err = harness
        .coordinator
        .reserve(&request(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::BootControllerUnavailable(_)));

    assert_eq!(harness.count_in(HostState::Idle).await, 3);
    assert!(harness
        .store
        .snapshot()
        .await
        .iter()
        .all(|host| host.owner.is_empty() && host.job_id.is_empty()));

    let events = harness.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        ReservationEvent::Transition { from: HostState::Booting, to: HostState::Idle, reason: TransitionReason::Aborted, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_releases_everything() {
    let harness = Harness::new(plain_hosts(3), FakeBoot::default(), FakeProbe::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let err = harness
        .coordinator
        .reserve(&request(2), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ReservationError::Cancelled));
    assert_eq!(harness.count_in(HostState::Idle).await, 3);
    // Both were kickstarted before the cancel arrived; neither was probed.
    assert_eq!(harness.boot.rebooted().len(), 2);
    assert!(harness.probe.checked.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_touches_nothing() {
    let harness = Harness::new(plain_hosts(1), FakeBoot::default(), FakeProbe::default());
    let err = harness
        .coordinator
        .reserve(&request(0), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::InvalidRequest(_)));
    assert_eq!(harness.count_in(HostState::Idle).await, 1);
}
