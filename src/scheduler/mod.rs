//! Bounded-concurrency test scheduler
//!
//! A manual run marks every candidate `Testing`, then starts a fixed pool of
//! workers that keep pulling record ids from one shared FIFO queue until it
//! is empty or the run is stopped. Stopping is cooperative: in-flight probes
//! always finish and are applied, nothing new is started, and every record
//! still marked `Testing` goes back to `Untested`.
//!
//! The unattended periodic mode lives in [`auto`].

pub mod auto;

use crate::config::TestSettings;
use crate::error::{ProbeError, SchedulerError};
use crate::inventory::SharedInventory;
use crate::proxy::{ProbeReport, ProbeTarget, Prober, ProxyRecord, ProxyStatus, RecordId, LATENCY_UNKNOWN};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use auto::AutoTester;

/// Latency above which a reachable proxy counts as slow
pub const SLOW_THRESHOLD_MS: i64 = 1000;

/// Relative amplitude of the noise applied to the speed estimate
pub const SPEED_JITTER: f64 = 0.10;

/// Progress counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestProgress {
    pub total: usize,
    pub tested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TestProgress {
    /// Share of candidates probed, 0-100
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.tested as f64 / self.total as f64 * 100.0
    }
}

/// Final report of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub progress: TestProgress,
    pub cancelled: bool,
    /// Records that went back from `Testing` to `Untested`
    pub reverted: usize,
}

/// Events emitted during a manual run
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started { total: usize },
    Tested { id: RecordId, status: ProxyStatus, progress: TestProgress },
    Finished(RunSummary),
}

/// Latency-derived score, 0-100
pub fn score_for_latency(latency_ms: i64) -> u8 {
    let score = (100.0 - latency_ms.max(0) as f64 / 20.0).round();
    score.clamp(0.0, 100.0) as u8
}

/// Synthetic speed estimate in KB/s.
///
/// This is not a bandwidth measurement: it is `max(50, 2000 - latency)`
/// scaled by `1 + jitter` (jitter clamped to ±[`SPEED_JITTER`]) so that
/// repeated tests of the same proxy do not show identical figures.
pub fn speed_for_latency(latency_ms: i64, jitter: f64) -> u32 {
    let base = (2000 - latency_ms.max(0)).max(50) as f64;
    let jitter = jitter.clamp(-SPEED_JITTER, SPEED_JITTER);
    (base * (1.0 + jitter)).round().max(0.0) as u32
}

/// Fold a probe outcome into a record; returns whether the probe succeeded
///
/// A latency above `timeout_ms` counts as a failure. Geolocation is only
/// copied when the prober returned a publishable (non-private) address.
pub fn apply_outcome(
    record: &mut ProxyRecord,
    outcome: &Result<ProbeReport, ProbeError>,
    timeout_ms: u64,
    jitter: f64,
    now: DateTime<Utc>,
) -> bool {
    record.last_tested_at = Some(now);

    let report = match outcome {
        Ok(report) if report.latency_ms >= 0 && report.latency_ms as u64 <= timeout_ms => report,
        _ => {
            record.status = ProxyStatus::Inactive;
            record.latency_ms = LATENCY_UNKNOWN;
            record.score = 0;
            record.speed_kbps = 0;
            record.push_latency_sample(LATENCY_UNKNOWN);
            return false;
        }
    };

    let latency = report.latency_ms;
    record.latency_ms = latency;
    record.status = if latency > SLOW_THRESHOLD_MS {
        ProxyStatus::Slow
    } else {
        ProxyStatus::Active
    };
    record.score = score_for_latency(latency);
    record.speed_kbps = speed_for_latency(latency, jitter);
    record.push_latency_sample(latency);

    if let Some(geo) = report.geo.as_ref().filter(|g| g.is_publishable()) {
        if geo.ip.is_some() {
            record.resolved_ip = geo.ip.clone();
        }
        if geo.country_code.is_some() {
            record.country_code = geo.country_code.clone();
        }
        if geo.country_name.is_some() {
            record.country_name = geo.country_name.clone();
        }
    }

    true
}

fn draw_jitter() -> f64 {
    rand::rng().random_range(-SPEED_JITTER..=SPEED_JITTER)
}

#[derive(Default)]
struct Counters {
    tested: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self, total: usize) -> TestProgress {
        TestProgress {
            total,
            tested: self.tested.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// State shared by the workers of one run
struct RunContext {
    inventory: SharedInventory,
    prober: Arc<dyn Prober>,
    queue: Mutex<VecDeque<RecordId>>,
    cancel: Arc<AtomicBool>,
    counters: Counters,
    total: usize,
    timeout_ms: u64,
    events: Option<UnboundedSender<SchedulerEvent>>,
}

/// Drives probes over the inventory under a concurrency cap
#[derive(Clone)]
pub struct TestScheduler {
    inventory: SharedInventory,
    prober: Arc<dyn Prober>,
    settings: Arc<RwLock<TestSettings>>,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl TestScheduler {
    pub fn new(inventory: SharedInventory, prober: Arc<dyn Prober>, settings: TestSettings) -> Self {
        Self {
            inventory,
            prober,
            settings: Arc::new(RwLock::new(settings)),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inventory(&self) -> &SharedInventory {
        &self.inventory
    }

    pub async fn settings(&self) -> TestSettings {
        self.settings.read().await.clone()
    }

    /// Replace the settings; a run in progress keeps the values it started with
    pub async fn set_settings(&self, settings: TestSettings) {
        *self.settings.write().await = settings;
    }

    /// Whether a manual run is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the current manual run to stop after its in-flight probes
    pub fn stop(&self) {
        if self.is_running() {
            info!("Stop requested");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Untested and inactive records, optionally limited to a visible subset
    pub async fn candidates(&self, visible: Option<&[RecordId]>) -> Vec<RecordId> {
        let visible: Option<HashSet<&RecordId>> = visible.map(|ids| ids.iter().collect());
        self.inventory
            .read()
            .await
            .records()
            .iter()
            .filter(|r| r.status.needs_test())
            .filter(|r| visible.as_ref().map_or(true, |v| v.contains(&r.id)))
            .map(|r| r.id)
            .collect()
    }

    /// Probe the given records with a bounded worker pool
    ///
    /// Candidates are probed in submission order; completion order is
    /// whatever the network gives. Ids that do not exist are ignored.
    ///
    /// The run itself executes on a spawned task. Dropping the returned
    /// future requests a stop instead of abandoning the run, so in-flight
    /// probes still finish and unprobed records still revert to `Untested`.
    pub async fn run(
        &self,
        candidates: Vec<RecordId>,
        events: Option<UnboundedSender<SchedulerEvent>>,
    ) -> Result<RunSummary, SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let mut stop_on_drop = StopOnDrop::new(Arc::clone(&self.cancel));
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.execute(candidates, events).await });

        let joined = handle.await;
        stop_on_drop.disarm();
        joined.map_err(|e| SchedulerError::Interrupted(e.to_string()))
    }

    async fn execute(
        &self,
        candidates: Vec<RecordId>,
        events: Option<UnboundedSender<SchedulerEvent>>,
    ) -> RunSummary {
        let _running = ClearOnDrop(Arc::clone(&self.running));

        let settings = self.settings().await;
        let queue = self.mark_testing(candidates).await;
        let total = queue.len();
        let workers = settings.effective_concurrency().min(total);

        info!("Testing {} proxies with {} workers", total, workers);
        send(&events, SchedulerEvent::Started { total });

        let ctx = Arc::new(RunContext {
            inventory: Arc::clone(&self.inventory),
            prober: Arc::clone(&self.prober),
            queue: Mutex::new(queue.iter().copied().collect()),
            cancel: Arc::clone(&self.cancel),
            counters: Counters::default(),
            total,
            timeout_ms: settings.timeout_ms,
            events: events.clone(),
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(Arc::clone(&ctx)));
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!("Test worker ended abnormally: {}", e);
            }
        }

        let cancelled = self.cancel.load(Ordering::SeqCst);
        let reverted = self.revert_testing(&queue).await;
        let summary = RunSummary {
            progress: ctx.counters.snapshot(total),
            cancelled,
            reverted,
        };

        self.cancel.store(false, Ordering::SeqCst);

        info!(
            "Test run {}: {}/{} tested, {} ok, {} failed, {} reverted",
            if cancelled { "stopped" } else { "finished" },
            summary.progress.tested,
            total,
            summary.progress.succeeded,
            summary.progress.failed,
            reverted
        );
        send(&events, SchedulerEvent::Finished(summary));

        summary
    }

    /// Run over the default candidate set
    pub async fn run_pending(
        &self,
        visible: Option<&[RecordId]>,
        events: Option<UnboundedSender<SchedulerEvent>>,
    ) -> Result<RunSummary, SchedulerError> {
        let candidates = self.candidates(visible).await;
        self.run(candidates, events).await
    }

    /// One unattended pass: probe candidates one at a time, without events
    ///
    /// Returns `None` when a manual run was active at the start. A manual
    /// run starting mid-pass stops the pass before its next item, and a
    /// record it has already marked `Testing` keeps the manual result.
    pub async fn run_auto_pass(&self) -> Option<RunSummary> {
        if self.is_running() {
            debug!("Manual run active, skipping auto-test");
            return None;
        }

        let settings = self.settings().await;
        let candidates: Vec<RecordId> = self
            .inventory
            .read()
            .await
            .records()
            .iter()
            .filter(|r| r.status != ProxyStatus::Testing)
            .filter(|r| !settings.auto_test_only_inactive || r.status.needs_test())
            .map(|r| r.id)
            .collect();

        let mut summary = RunSummary {
            progress: TestProgress {
                total: candidates.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for id in candidates {
            if self.is_running() {
                debug!("Manual run started, ending auto-test pass");
                summary.cancelled = true;
                break;
            }
            let Some(target) = snapshot(&self.inventory, id).await else {
                continue;
            };
            let Some((ok, _)) = probe_and_apply(
                &self.inventory,
                self.prober.as_ref(),
                &target,
                settings.timeout_ms,
                ApplyMode::UnlessTesting,
            )
            .await
            else {
                continue;
            };
            summary.progress.tested += 1;
            if ok {
                summary.progress.succeeded += 1;
            } else {
                summary.progress.failed += 1;
            }
        }

        debug!(
            "Auto-test pass: {}/{} tested, {} ok",
            summary.progress.tested, summary.progress.total, summary.progress.succeeded
        );
        Some(summary)
    }

    /// Mark existing, distinct candidates `Testing`; returns them in order
    async fn mark_testing(&self, candidates: Vec<RecordId>) -> Vec<RecordId> {
        let mut seen = HashSet::new();
        let candidates: Vec<RecordId> = candidates.into_iter().filter(|id| seen.insert(*id)).collect();

        let mut inventory = self.inventory.write().await;
        inventory.update_many(&seen, |r| r.status = ProxyStatus::Testing);
        candidates
            .into_iter()
            .filter(|id| inventory.get(*id).is_some())
            .collect()
    }

    async fn revert_testing(&self, ids: &[RecordId]) -> usize {
        let ids: HashSet<RecordId> = ids.iter().copied().collect();
        let mut reverted = 0;
        self.inventory.write().await.update_many(&ids, |r| {
            if r.status == ProxyStatus::Testing {
                r.status = ProxyStatus::Untested;
                reverted += 1;
            }
        });
        reverted
    }
}

/// Sets the cancel flag when dropped while armed
struct StopOnDrop {
    cancel: Arc<AtomicBool>,
    armed: bool,
}

impl StopOnDrop {
    fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("Run abandoned by its caller, stopping");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Clears the running flag however the run ends
struct ClearOnDrop(Arc<AtomicBool>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a probe result is written back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    Always,
    /// Leave records a manual run has claimed alone
    UnlessTesting,
}

async fn snapshot(inventory: &SharedInventory, id: RecordId) -> Option<ProbeTarget> {
    inventory.read().await.get(id).map(ProbeTarget::from)
}

/// Probe one target and apply the result by id
///
/// Returns `None` when the record is gone, or was skipped under `mode`.
async fn probe_and_apply(
    inventory: &SharedInventory,
    prober: &dyn Prober,
    target: &ProbeTarget,
    timeout_ms: u64,
    mode: ApplyMode,
) -> Option<(bool, ProxyStatus)> {
    let outcome = prober
        .probe(target, std::time::Duration::from_millis(timeout_ms))
        .await;
    if let Err(ref e) = outcome {
        debug!("Probe of {}:{} failed: {}", target.host, target.port, e);
    }

    let jitter = draw_jitter();
    let mut result = None;
    inventory.write().await.update(target.id, |record| {
        if mode == ApplyMode::UnlessTesting && record.status == ProxyStatus::Testing {
            debug!("{} was claimed by a manual run, dropping auto-test result", record.name);
            return;
        }
        let ok = apply_outcome(record, &outcome, timeout_ms, jitter, Utc::now());
        result = Some((ok, record.status));
    });
    result
}

/// Pull ids from the shared queue until it is drained or the run is stopped
async fn worker(ctx: Arc<RunContext>) {
    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            break;
        }

        // The record is read under the queue lock so probes start in queue order
        let target = {
            let mut queue = ctx.queue.lock().await;
            let Some(id) = queue.pop_front() else {
                break;
            };
            snapshot(&ctx.inventory, id).await
        };

        // Deleted mid-run: nothing to probe or count
        let Some(target) = target else {
            continue;
        };
        let Some((ok, status)) = probe_and_apply(
            &ctx.inventory,
            ctx.prober.as_ref(),
            &target,
            ctx.timeout_ms,
            ApplyMode::Always,
        )
        .await
        else {
            continue;
        };

        ctx.counters.tested.fetch_add(1, Ordering::SeqCst);
        if ok {
            ctx.counters.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
        }

        let progress = ctx.counters.snapshot(ctx.total);
        send(&ctx.events, SchedulerEvent::Tested { id: target.id, status, progress });
    }
}

fn send(events: &Option<UnboundedSender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use crate::proxy::GeoInfo;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Prober with a fixed latency that records how probes overlap
    pub(crate) struct FixedProber {
        latency_ms: i64,
        delay: Duration,
        geo: Option<GeoInfo>,
        in_flight: std::sync::Mutex<HashSet<String>>,
        current: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) double_probes: AtomicUsize,
        pub(crate) calls: AtomicUsize,
    }

    impl FixedProber {
        pub(crate) fn new(latency_ms: i64) -> Self {
            Self {
                latency_ms,
                delay: Duration::ZERO,
                geo: None,
                in_flight: std::sync::Mutex::new(HashSet::new()),
                current: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                double_probes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_geo(mut self, geo: GeoInfo) -> Self {
            self.geo = Some(geo);
            self
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.in_flight.lock().unwrap().insert(target.host.clone()) {
                self.double_probes.fetch_add(1, Ordering::SeqCst);
            }
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.lock().unwrap().remove(&target.host);

            let report = ProbeReport::new(self.latency_ms);
            Ok(match &self.geo {
                Some(geo) => report.with_geo(geo.clone()),
                None => report,
            })
        }
    }

    /// First probe returns at once, later probes wait for the gate
    struct GatedProber {
        gate: Semaphore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for GatedProber {
        async fn probe(&self, _target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                let _permit = self.gate.acquire().await.map_err(|_| ProbeError::Timeout)?;
            }
            Ok(ProbeReport::new(100))
        }
    }

    /// Latency per host, failure for unknown hosts
    struct ScriptedProber {
        latencies: HashMap<String, i64>,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            self.latencies
                .get(&target.host)
                .map(|l| ProbeReport::new(*l))
                .ok_or_else(|| ProbeError::Connect("refused".to_string()))
        }
    }

    /// Returns 1, 2, 3... ms on successive calls
    struct CountingProber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, _target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ProbeReport::new(n as i64))
        }
    }

    /// Records the host of every target in start order
    struct OrderedProber {
        started: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Prober for OrderedProber {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            self.started.lock().unwrap().push(target.host.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ProbeReport::new(10))
        }
    }

    /// Claims its target for a manual run while the result is pending
    struct ClaimingProber {
        inventory: SharedInventory,
    }

    #[async_trait]
    impl Prober for ClaimingProber {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
            self.inventory
                .write()
                .await
                .update(target.id, |r| r.status = ProxyStatus::Testing);
            Ok(ProbeReport::new(10))
        }
    }

    pub(crate) fn inventory_with(count: usize) -> (SharedInventory, Vec<RecordId>) {
        let mut inventory = Inventory::new();
        let links: Vec<String> = (0..count)
            .map(|i| format!("trojan://pw@node{}.example.com:443#Node{}", i, i))
            .collect();
        let ids = inventory.import(&links).added;
        (inventory.into_shared(), ids)
    }

    pub(crate) async fn statuses(inventory: &SharedInventory) -> Vec<ProxyStatus> {
        inventory.read().await.records().iter().map(|r| r.status).collect()
    }

    fn settings(concurrency: usize, timeout_ms: u64) -> TestSettings {
        TestSettings::new().with_concurrency(concurrency).with_timeout_ms(timeout_ms)
    }

    #[test]
    fn test_score_formula_and_bounds() {
        assert_eq!(score_for_latency(0), 100);
        assert_eq!(score_for_latency(100), 95);
        assert_eq!(score_for_latency(1010), 50);
        assert_eq!(score_for_latency(2000), 0);
        assert_eq!(score_for_latency(60_000), 0);
        for latency in (0..30_000).step_by(7) {
            assert!(score_for_latency(latency) <= 100);
        }
    }

    #[test]
    fn test_speed_formula() {
        assert_eq!(speed_for_latency(100, 0.0), 1900);
        assert_eq!(speed_for_latency(1990, 0.0), 50);
        assert_eq!(speed_for_latency(5000, 0.0), 50);
        assert_eq!(speed_for_latency(100, 0.1), 2090);
        assert_eq!(speed_for_latency(100, -0.1), 1710);
        // Jitter beyond the amplitude is clamped
        assert_eq!(speed_for_latency(100, 5.0), 2090);
        for _ in 0..100 {
            let speed = speed_for_latency(100, draw_jitter());
            assert!((1710..=2090).contains(&speed));
        }
    }

    #[test]
    fn test_apply_outcome_success() {
        let mut record = crate::proxy::LinkCodec::to_record("vless://u@a.example:443#A");
        let now = Utc::now();
        assert!(apply_outcome(&mut record, &Ok(ProbeReport::new(1200)), 3000, 0.0, now));
        assert_eq!(record.status, ProxyStatus::Slow);
        assert_eq!(record.latency_ms, 1200);
        assert_eq!(record.score, 40);
        assert_eq!(record.speed_kbps, 800);
        assert_eq!(record.latency_history.front(), Some(&1200));
        assert_eq!(record.last_tested_at, Some(now));

        assert!(apply_outcome(&mut record, &Ok(ProbeReport::new(3000)), 3000, 0.0, now));
        assert_eq!(record.status, ProxyStatus::Slow);
    }

    #[test]
    fn test_apply_outcome_timeout_law() {
        let mut record = crate::proxy::LinkCodec::to_record("vless://u@a.example:443#A");
        for latency in [3001, 5000, 60_000] {
            assert!(!apply_outcome(&mut record, &Ok(ProbeReport::new(latency)), 3000, 0.0, Utc::now()));
            assert_eq!(record.status, ProxyStatus::Inactive);
            assert_eq!(record.latency_ms, LATENCY_UNKNOWN);
            assert_eq!(record.score, 0);
            assert_eq!(record.speed_kbps, 0);
        }
        assert_eq!(record.latency_history, VecDeque::from(vec![-1, -1, -1]));
    }

    #[test]
    fn test_apply_outcome_failure_keeps_geo() {
        let mut record = crate::proxy::LinkCodec::to_record("vless://u@a.example:443#A");
        record.country_code = Some("NL".to_string());
        assert!(!apply_outcome(&mut record, &Err(ProbeError::Timeout), 3000, 0.0, Utc::now()));
        assert_eq!(record.status, ProxyStatus::Inactive);
        assert_eq!(record.country_code.as_deref(), Some("NL"));
        assert!(record.last_tested_at.is_some());
    }

    #[test]
    fn test_apply_outcome_geo_rules() {
        let mut record = crate::proxy::LinkCodec::to_record("vless://u@a.example:443#A");
        let private = ProbeReport::new(50).with_geo(GeoInfo::new(
            "10.0.0.1".parse().unwrap(),
            Some("US".to_string()),
            None,
        ));
        apply_outcome(&mut record, &Ok(private), 3000, 0.0, Utc::now());
        assert_eq!(record.resolved_ip, None);
        assert_eq!(record.country_code, None);

        let public = ProbeReport::new(50).with_geo(GeoInfo::new(
            "9.9.9.9".parse().unwrap(),
            Some("CH".to_string()),
            Some("Switzerland".to_string()),
        ));
        apply_outcome(&mut record, &Ok(public), 3000, 0.0, Utc::now());
        assert_eq!(record.resolved_ip.as_deref(), Some("9.9.9.9"));
        assert_eq!(record.country_code.as_deref(), Some("CH"));
        assert_eq!(record.country_name.as_deref(), Some("Switzerland"));
    }

    #[test]
    fn test_percent_complete() {
        let progress = TestProgress { total: 4, tested: 1, succeeded: 1, failed: 0 };
        assert_eq!(progress.percent_complete(), 25.0);
        assert_eq!(TestProgress::default().percent_complete(), 100.0);
    }

    #[tokio::test]
    async fn test_run_all_active_with_bounded_workers() {
        let (inventory, ids) = inventory_with(5);
        let prober = Arc::new(FixedProber::new(100).with_delay(Duration::from_millis(20)));
        let scheduler = TestScheduler::new(inventory.clone(), prober.clone(), settings(2, 3000));

        let summary = scheduler.run(ids, None).await.unwrap();

        assert_eq!(summary.progress, TestProgress { total: 5, tested: 5, succeeded: 5, failed: 0 });
        assert!(!summary.cancelled);
        assert_eq!(summary.reverted, 0);
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(prober.double_probes.load(Ordering::SeqCst), 0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 5);

        let inventory = inventory.read().await;
        for record in inventory.records() {
            assert_eq!(record.status, ProxyStatus::Active);
            assert_eq!(record.score, 95);
            assert_eq!(record.latency_ms, 100);
            assert!(record.last_tested_at.is_some());
        }
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded_for_large_sets() {
        let (inventory, ids) = inventory_with(60);
        let prober = Arc::new(FixedProber::new(10).with_delay(Duration::from_millis(5)));
        let scheduler = TestScheduler::new(inventory, prober.clone(), settings(500, 3000));

        let summary = scheduler.run(ids, None).await.unwrap();
        assert_eq!(summary.progress.tested, 60);
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 20);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_clamped_to_one() {
        let (inventory, ids) = inventory_with(3);
        let prober = Arc::new(FixedProber::new(10).with_delay(Duration::from_millis(5)));
        let scheduler = TestScheduler::new(inventory, prober.clone(), settings(0, 3000));

        let summary = scheduler.run(ids, None).await.unwrap();
        assert_eq!(summary.progress.tested, 3);
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_nothing_testing() {
        let (inventory, ids) = inventory_with(10);
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        });
        let scheduler = TestScheduler::new(inventory.clone(), prober.clone(), settings(3, 3000));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(ids, Some(tx)).await })
        };

        assert_eq!(rx.recv().await, Some(SchedulerEvent::Started { total: 10 }));
        assert!(statuses(&inventory).await.iter().all(|s| *s == ProxyStatus::Testing));

        match rx.recv().await {
            Some(SchedulerEvent::Tested { progress, .. }) => assert_eq!(progress.tested, 1),
            other => panic!("unexpected event {:?}", other),
        }
        scheduler.stop();
        prober.gate.add_permits(100);

        let summary = run.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert!(summary.progress.tested <= 4);
        assert_eq!(summary.reverted, 10 - summary.progress.tested);

        let inventory = inventory.read().await;
        assert!(inventory.records().iter().all(|r| r.status != ProxyStatus::Testing));
        let untested: Vec<_> = inventory
            .records()
            .iter()
            .filter(|r| r.status == ProxyStatus::Untested)
            .collect();
        assert_eq!(untested.len(), summary.reverted);
        assert!(untested.iter().all(|r| r.last_tested_at.is_none()));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_running() {
        let (inventory, ids) = inventory_with(3);
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(1),
        });
        let scheduler = TestScheduler::new(inventory, prober.clone(), settings(1, 3000));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = {
            let scheduler = scheduler.clone();
            let ids = ids.clone();
            tokio::spawn(async move { scheduler.run(ids, Some(tx)).await })
        };
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::Started { .. })));
        assert!(scheduler.is_running());
        assert_eq!(scheduler.run(ids, None).await, Err(SchedulerError::AlreadyRunning));

        prober.gate.add_permits(10);
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.progress.tested, 3);
    }

    #[tokio::test]
    async fn test_failures_and_slow_results() {
        let mut inventory = Inventory::new();
        inventory.import([
            "trojan://p@fast.example:443#Fast",
            "trojan://p@slow.example:443#Slow",
            "trojan://p@late.example:443#Late",
            "trojan://p@dead.example:443#Dead",
        ]);
        let inventory = inventory.into_shared();
        let prober = Arc::new(ScriptedProber {
            latencies: HashMap::from([
                ("fast.example".to_string(), 80),
                ("slow.example".to_string(), 1500),
                ("late.example".to_string(), 4000),
            ]),
        });
        let scheduler = TestScheduler::new(inventory.clone(), prober, settings(4, 3000));

        let summary = scheduler.run_pending(None, None).await.unwrap();
        assert_eq!(summary.progress.succeeded, 2);
        assert_eq!(summary.progress.failed, 2);
        assert_eq!(
            statuses(&inventory).await,
            vec![ProxyStatus::Active, ProxyStatus::Slow, ProxyStatus::Inactive, ProxyStatus::Inactive]
        );

        // Only the inactive ones are picked up again
        let pending = scheduler.candidates(None).await;
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_respect_visible_subset() {
        let (inventory, ids) = inventory_with(4);
        inventory.write().await.update(ids[1], |r| r.status = ProxyStatus::Active);
        let scheduler = TestScheduler::new(inventory, Arc::new(FixedProber::new(1)), settings(2, 3000));

        assert_eq!(scheduler.candidates(None).await, vec![ids[0], ids[2], ids[3]]);
        assert_eq!(scheduler.candidates(Some(&[ids[1], ids[3]])).await, vec![ids[3]]);
    }

    #[tokio::test]
    async fn test_history_cap_after_many_runs() {
        let (inventory, ids) = inventory_with(1);
        let scheduler = TestScheduler::new(
            inventory.clone(),
            Arc::new(CountingProber { calls: AtomicUsize::new(0) }),
            settings(1, 3000),
        );
        for _ in 0..12 {
            scheduler.run(ids.clone(), None).await.unwrap();
        }
        let inventory = inventory.read().await;
        let record = inventory.get(ids[0]).unwrap();
        assert_eq!(record.latency_history.len(), 10);
        assert_eq!(record.latency_history.front(), Some(&12));
        assert_eq!(record.latency_history.back(), Some(&3));
    }

    #[tokio::test]
    async fn test_run_preserves_concurrent_manual_edits() {
        let (inventory, ids) = inventory_with(2);
        let prober = Arc::new(FixedProber::new(100).with_delay(Duration::from_millis(30)));
        let scheduler = TestScheduler::new(inventory.clone(), prober, settings(2, 3000));

        let run = {
            let scheduler = scheduler.clone();
            let ids = ids.clone();
            tokio::spawn(async move { scheduler.run(ids, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        inventory.write().await.set_manual_group(ids[0], Some("Work".to_string()));
        run.await.unwrap().unwrap();

        let inventory = inventory.read().await;
        let record = inventory.get(ids[0]).unwrap();
        assert_eq!(record.id, ids[0]);
        assert_eq!(record.manual_group.as_deref(), Some("Work"));
        assert_eq!(record.status, ProxyStatus::Active);
    }

    #[tokio::test]
    async fn test_deleted_record_is_skipped() {
        let (inventory, ids) = inventory_with(3);
        let prober = Arc::new(FixedProber::new(100).with_delay(Duration::from_millis(30)));
        let scheduler = TestScheduler::new(inventory.clone(), prober, settings(1, 3000));

        let run = {
            let scheduler = scheduler.clone();
            let ids = ids.clone();
            tokio::spawn(async move { scheduler.run(ids, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        inventory.write().await.remove(ids[2]);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.progress.tested, 2);
        assert_eq!(inventory.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_geo_enrichment_applied_on_success() {
        let (inventory, ids) = inventory_with(1);
        let geo = GeoInfo::new("1.1.1.1".parse().unwrap(), Some("AU".into()), Some("Australia".into()));
        let scheduler = TestScheduler::new(
            inventory.clone(),
            Arc::new(FixedProber::new(40).with_geo(geo)),
            settings(1, 3000),
        );
        scheduler.run(ids.clone(), None).await.unwrap();

        let inventory = inventory.read().await;
        let record = inventory.get(ids[0]).unwrap();
        assert_eq!(record.country_code.as_deref(), Some("AU"));
        assert_eq!(record.resolved_ip.as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_auto_pass_only_inactive() {
        let (inventory, ids) = inventory_with(3);
        {
            let mut inventory = inventory.write().await;
            inventory.update(ids[0], |r| r.status = ProxyStatus::Active);
            inventory.update(ids[1], |r| r.status = ProxyStatus::Inactive);
        }
        let prober = Arc::new(FixedProber::new(100));
        let scheduler = TestScheduler::new(
            inventory.clone(),
            prober.clone(),
            settings(5, 3000).with_auto_test(5, true),
        );

        let summary = scheduler.run_auto_pass().await.unwrap();
        assert_eq!(summary.progress.total, 2);
        assert_eq!(summary.progress.succeeded, 2);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
        // The active record was not touched
        assert!(inventory.read().await.get(ids[0]).unwrap().last_tested_at.is_none());
    }

    #[tokio::test]
    async fn test_auto_pass_all_records_is_sequential() {
        let (inventory, ids) = inventory_with(4);
        let prober = Arc::new(FixedProber::new(100).with_delay(Duration::from_millis(5)));
        let scheduler = TestScheduler::new(
            inventory.clone(),
            prober.clone(),
            settings(10, 3000).with_auto_test(5, false),
        );
        inventory.write().await.update(ids[0], |r| r.status = ProxyStatus::Active);

        let summary = scheduler.run_auto_pass().await.unwrap();
        assert_eq!(summary.progress.tested, 4);
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(statuses(&inventory).await.iter().all(|s| *s == ProxyStatus::Active));
    }

    #[tokio::test]
    async fn test_auto_pass_skipped_while_manual_run_active() {
        let (inventory, ids) = inventory_with(2);
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(1),
        });
        let scheduler = TestScheduler::new(inventory, prober.clone(), settings(2, 3000));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(ids, Some(tx)).await })
        };
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::Started { .. })));
        assert_eq!(scheduler.run_auto_pass().await, None);

        prober.gate.add_permits(10);
        run.await.unwrap().unwrap();
        assert!(scheduler.run_auto_pass().await.is_some());
    }

    #[tokio::test]
    async fn test_empty_run_finishes() {
        let (inventory, _) = inventory_with(0);
        let scheduler = TestScheduler::new(inventory, Arc::new(FixedProber::new(1)), settings(3, 3000));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = scheduler.run(Vec::new(), Some(tx)).await.unwrap();
        assert_eq!(summary.progress.total, 0);
        assert_eq!(rx.recv().await, Some(SchedulerEvent::Started { total: 0 }));
        assert_eq!(rx.recv().await, Some(SchedulerEvent::Finished(summary)));
    }

    #[tokio::test]
    async fn test_abandoned_run_still_cleans_up() {
        let (inventory, ids) = inventory_with(4);
        let prober = Arc::new(FixedProber::new(100).with_delay(Duration::from_millis(200)));
        let scheduler = TestScheduler::new(inventory.clone(), prober.clone(), settings(2, 3000));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), scheduler.run(ids.clone(), None)).await;
        assert!(abandoned.is_err());

        for _ in 0..100 {
            if !scheduler.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!scheduler.is_running());

        let after = statuses(&inventory).await;
        assert!(after.iter().all(|s| *s != ProxyStatus::Testing));
        assert_eq!(after.iter().filter(|s| **s == ProxyStatus::Active).count(), 2);
        assert_eq!(after.iter().filter(|s| **s == ProxyStatus::Untested).count(), 2);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        let summary = scheduler.run(ids, None).await.unwrap();
        assert!(!summary.cancelled);
        assert_eq!(summary.progress.tested, 4);
        assert!(scheduler.run_auto_pass().await.is_some());
    }

    async fn start_order(concurrency: usize, ids: Vec<RecordId>, inventory: SharedInventory) -> Vec<String> {
        let prober = Arc::new(OrderedProber {
            started: std::sync::Mutex::new(Vec::new()),
        });
        let scheduler = TestScheduler::new(inventory, prober.clone(), settings(concurrency, 3000));
        scheduler.run(ids, None).await.unwrap();
        let started = prober.started.lock().unwrap().clone();
        started
    }

    async fn hosts_of(inventory: &SharedInventory, ids: &[RecordId]) -> Vec<String> {
        let inventory = inventory.read().await;
        ids.iter()
            .filter_map(|id| inventory.get(*id))
            .map(|r| r.host.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_start_order_follows_submission_order() {
        use rand::seq::SliceRandom;

        let (inventory, mut ids) = inventory_with(12);
        ids.reverse();
        let expected = hosts_of(&inventory, &ids).await;
        assert_eq!(start_order(1, ids, inventory).await, expected);

        let (inventory, mut ids) = inventory_with(12);
        ids.shuffle(&mut rand::rng());
        let expected = hosts_of(&inventory, &ids).await;
        assert_eq!(start_order(3, ids, inventory).await, expected);
    }

    #[tokio::test]
    async fn test_auto_pass_yields_to_manual_claim() {
        let (inventory, ids) = inventory_with(1);
        let prober = Arc::new(ClaimingProber {
            inventory: inventory.clone(),
        });
        let scheduler = TestScheduler::new(inventory.clone(), prober, settings(1, 3000));

        let summary = scheduler.run_auto_pass().await.unwrap();
        assert_eq!(summary.progress.total, 1);
        assert_eq!(summary.progress.tested, 0);

        let inventory = inventory.read().await;
        let record = inventory.get(ids[0]).unwrap();
        assert_eq!(record.status, ProxyStatus::Testing);
        assert_eq!(record.last_tested_at, None);
        assert!(record.latency_history.is_empty());
    }
}
