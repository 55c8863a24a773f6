use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    state::{should_calibrate, CalibrationMarker, CalibrationPhase, CalibrationState},
    Calibrator,
};
use crate::{
    config::CalibrationSettings,
    db::{GroupStore, StoreError, LAST_CALIBRATION_KEY},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// One retraining request waiting for a worker.
pub struct CalibrationJob {
    pub id: Uuid,
    pub family: String,
    pub store: GroupStore,
}

/// The evaluator loop currently owning a family.
struct Evaluator {
    generation: u64,
    store: GroupStore,
    cancel_token: CancellationToken,
}

impl Evaluator {
    fn is_live(&self) -> bool {
        !self.store.is_closed() && !self.cancel_token.is_cancelled()
    }
}

#[derive(Default)]
struct FamilyEntry {
    state: CalibrationState,
    evaluator: Option<Evaluator>,
}

struct SchedulerInner {
    settings: CalibrationSettings,
    families: Mutex<HashMap<String, FamilyEntry>>,
    jobs: UnboundedSender<CalibrationJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    generations: AtomicU64,
}

impl SchedulerInner {
    fn families(&self) -> MutexGuard<'_, HashMap<String, FamilyEntry>> {
        match self.families.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_phase(&self, family: &str, phase: CalibrationPhase) {
        if let Some(entry) = self.families().get_mut(family) {
            entry.state.phase = phase;
        }
    }

    /// Release the family's evaluator slot if `generation` still holds it.
    fn evaluator_exited(&self, family: &str, generation: u64) {
        if let Some(entry) = self.families().get_mut(family) {
            if entry
                .evaluator
                .as_ref()
                .is_some_and(|evaluator| evaluator.generation == generation)
            {
                entry.evaluator = None;
            }
        }
    }
}

/// Per-family evaluators feeding a fixed set of calibration workers.
///
/// At most one job per family is pending or running at any time; evaluations
/// that find one in progress are no-ops.
#[derive(Clone)]
pub struct CalibrationScheduler {
    inner: Arc<SchedulerInner>,
}

impl CalibrationScheduler {
    /// Spawn `settings.workers` calibration workers. Must be called inside a
    /// tokio runtime.
    pub fn new(settings: CalibrationSettings, calibrator: Arc<dyn Calibrator>) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let worker_count = settings.workers.max(1);
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                settings,
                families: Mutex::new(HashMap::new()),
                jobs,
                workers: Mutex::new(Vec::with_capacity(worker_count)),
                shutdown: CancellationToken::new(),
                generations: AtomicU64::new(0),
            }),
        };

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..worker_count)
            .map(|index| {
                tokio::spawn(calibration_worker(
                    index,
                    Arc::clone(&scheduler.inner),
                    Arc::clone(&receiver),
                    Arc::clone(&calibrator),
                ))
            })
            .collect::<Vec<_>>();
        scheduler.workers().extend(handles);

        log_info!("calibration scheduler started with {worker_count} workers");
        scheduler
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.inner.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the periodic evaluator for the store's family. No-op while a
    /// live evaluator exists; one still bound to a closed store is replaced.
    pub fn start_family(&self, store: GroupStore) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let (cancel_token, generation) = {
            let mut families = self.inner.families();
            let entry = families.entry(store.family().to_string()).or_default();
            if let Some(previous) = &entry.evaluator {
                if previous.is_live() {
                    return;
                }
                previous.cancel_token.cancel();
            }
            let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let token = self.inner.shutdown.child_token();
            entry.evaluator = Some(Evaluator {
                generation,
                store: store.clone(),
                cancel_token: token.clone(),
            });
            (token, generation)
        };

        log_debug!(
            "starting calibration evaluator {generation} for '{}'",
            store.family()
        );
        tokio::spawn(evaluator_loop(self.clone(), store, cancel_token, generation));
    }

    /// Stop the family's evaluator and forget its state unless a job is in
    /// progress.
    pub fn stop_family(&self, family: &str) {
        let mut families = self.inner.families();
        let Some(entry) = families.get_mut(family) else {
            return;
        };
        if let Some(evaluator) = entry.evaluator.take() {
            evaluator.cancel_token.cancel();
        }
        if entry.state.is_idle() {
            families.remove(family);
        }
    }

    /// Record that ingestion persisted a labeled reading at `timestamp`.
    pub fn notify_labeled(&self, family: &str, timestamp: i64) {
        let mut families = self.inner.families();
        let entry = families.entry(family.to_string()).or_default();
        entry.state.last_insert = entry.state.last_insert.max(Some(timestamp));
    }

    /// Run one evaluation for the store's family and submit a job if due.
    /// Returns whether a job was submitted.
    pub async fn evaluate(&self, store: &GroupStore) -> Result<bool, StoreError> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(false);
        }
        if self.phase(store.family()) != CalibrationPhase::Idle {
            log_debug!("calibration for '{}' already in progress", store.family());
            return Ok(false);
        }

        let reader = store.clone();
        let (marker, labeled) = tokio::task::spawn_blocking(move || read_inputs(&reader))
            .await
            .map_err(|err| StoreError::Transaction(anyhow!("calibration check worker failed: {err}")))??;

        let job = {
            let mut families = self.inner.families();
            let entry = families.entry(store.family().to_string()).or_default();
            if !entry.state.is_idle() {
                return Ok(false);
            }

            let state = &mut entry.state;
            let latest = labeled.max(state.last_insert);
            if let CalibrationMarker::Present(at) = marker {
                state.last_calibration = Some(at);
            }

            let due = should_calibrate(
                marker,
                latest,
                state.last_checked_labeled,
                self.inner.settings.threshold(),
            );
            if latest.is_some() {
                state.last_checked_labeled = latest;
            }
            if !due {
                return Ok(false);
            }

            state.phase = CalibrationPhase::Pending;
            CalibrationJob {
                id: Uuid::new_v4(),
                family: store.family().to_string(),
                store: store.clone(),
            }
        };

        let (id, family) = (job.id, job.family.clone());
        if self.inner.jobs.send(job).is_err() {
            log_error!("calibration workers are gone, dropping job for '{family}'");
            self.inner.set_phase(&family, CalibrationPhase::Idle);
            return Ok(false);
        }

        log_info!("calibration {id} queued for '{family}'");
        Ok(true)
    }

    pub fn phase(&self, family: &str) -> CalibrationPhase {
        self.inner
            .families()
            .get(family)
            .map(|entry| entry.state.phase)
            .unwrap_or_default()
    }

    pub fn state(&self, family: &str) -> Option<CalibrationState> {
        self.inner
            .families()
            .get(family)
            .map(|entry| entry.state.clone())
    }

    pub fn completed_runs(&self, family: &str) -> u64 {
        self.state(family)
            .map(|state| state.completed_runs)
            .unwrap_or_default()
    }

    /// Stop every evaluator and worker. A calibration in progress is
    /// abandoned without writing its marker.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.workers());
        for handle in handles {
            if let Err(err) = handle.await {
                log_warn!("calibration worker failed to join: {err}");
            }
        }
        log_info!("calibration scheduler stopped");
    }
}

fn read_inputs(store: &GroupStore) -> Result<(CalibrationMarker, Option<i64>), StoreError> {
    let marker = match store.get_value::<DateTime<Utc>>(LAST_CALIBRATION_KEY) {
        Ok(at) => CalibrationMarker::Present(at),
        Err(err) if err.is_not_found() => CalibrationMarker::Missing,
        Err(err) => {
            log_warn!("calibration marker for '{}' unreadable: {err}", store.family());
            CalibrationMarker::Unreadable
        }
    };
    let labeled = store.last_labeled_timestamp()?;
    Ok((marker, labeled))
}

async fn evaluator_loop(
    scheduler: CalibrationScheduler,
    store: GroupStore,
    cancel_token: CancellationToken,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(scheduler.inner.settings.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if store.is_closed() {
                    log_debug!("store for '{}' closed, evaluator exiting", store.family());
                    break;
                }
                if let Err(err) = scheduler.evaluate(&store).await {
                    log_warn!("calibration check failed for '{}': {err}", store.family());
                }
            }
            _ = cancel_token.cancelled() => {
                log_debug!("calibration evaluator for '{}' shutting down", store.family());
                break;
            }
        }
    }

    scheduler.inner.evaluator_exited(store.family(), generation);
}

async fn calibration_worker(
    index: usize,
    inner: Arc<SchedulerInner>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<CalibrationJob>>>,
    calibrator: Arc<dyn Calibrator>,
) {
    loop {
        let next = tokio::select! {
            job = async { receiver.lock().await.recv().await } => job,
            _ = inner.shutdown.cancelled() => None,
        };
        let Some(job) = next else {
            break;
        };
        run_job(&inner, calibrator.as_ref(), job).await;
    }
    log_debug!("calibration worker {index} exiting");
}

async fn run_job(inner: &SchedulerInner, calibrator: &dyn Calibrator, job: CalibrationJob) {
    let CalibrationJob { id, family, store } = job;
    inner.set_phase(&family, CalibrationPhase::Running);
    log_info!("calibration {id} running for '{family}'");

    let outcome = tokio::select! {
        result = calibrator.calibrate(&family) => Some(result),
        _ = inner.shutdown.cancelled() => None,
    };

    match outcome {
        Some(Ok(())) => {
            let now = Utc::now();
            match store.set_value_and_wait(LAST_CALIBRATION_KEY, &now).await {
                Ok(()) => {
                    if let Some(entry) = inner.families().get_mut(&family) {
                        entry.state.last_calibration = Some(now);
                        entry.state.completed_runs += 1;
                    }
                    log_info!("calibration {id} for '{family}' finished");
                }
                Err(err) => {
                    log_error!("calibration {id} for '{family}' finished but marker write failed: {err}")
                }
            }
        }
        Some(Err(err)) => log_warn!("calibration {id} for '{family}' failed: {err}"),
        None => log_info!("calibration {id} for '{family}' abandoned at shutdown"),
    }

    inner.set_phase(&family, CalibrationPhase::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::ClassifierError, db::SensorReading};
    use async_trait::async_trait;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    /// Blocks each calibration until a permit is released.
    struct GatedCalibrator {
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedCalibrator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Calibrator for GatedCalibrator {
        async fn calibrate(&self, _family: &str) -> Result<(), ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ClassifierError::PoolClosed)?;
            permit.forget();
            Ok(())
        }
    }

    struct FailingCalibrator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Calibrator for FailingCalibrator {
        async fn calibrate(&self, _family: &str) -> Result<(), ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ClassifierError::Connection("refused".into()))
        }
    }

    fn settings() -> CalibrationSettings {
        CalibrationSettings {
            interval_secs: 3600,
            threshold_secs: 0,
            workers: 2,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn labeled(timestamp: i64) -> SensorReading {
        let mut wifi = BTreeMap::new();
        wifi.insert("aa:bb".to_string(), -50.0);
        SensorReading {
            timestamp,
            family: "home".into(),
            device: "d1".into(),
            location: "kitchen".into(),
            sensors: BTreeMap::from([("wifi".to_string(), wifi)]),
            gps: None,
        }
    }

    #[tokio::test]
    async fn bursts_of_triggers_run_one_job() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = GroupStore::open(temp_dir.path(), "home", 10)?;
        let calibrator = GatedCalibrator::new();
        let scheduler = CalibrationScheduler::new(settings(), calibrator.clone());

        let mut handles = Vec::new();
        for _ in 0..100 {
            let scheduler = scheduler.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move { scheduler.evaluate(&store).await }));
        }
        let mut submitted = 0;
        for handle in handles {
            if handle.await?? {
                submitted += 1;
            }
        }
        assert_eq!(submitted, 1);

        wait_for(|| calibrator.calls() == 1).await;
        assert_eq!(scheduler.phase("home"), CalibrationPhase::Running);
        for _ in 0..100 {
            assert!(!scheduler.evaluate(&store).await?);
        }
        assert_eq!(calibrator.calls(), 1);

        calibrator.gate.add_permits(1);
        wait_for(|| scheduler.completed_runs("home") == 1).await;
        wait_for(|| scheduler.phase("home") == CalibrationPhase::Idle).await;
        let marker: DateTime<Utc> = store.get_value(LAST_CALIBRATION_KEY)?;
        assert_eq!(scheduler.state("home").and_then(|s| s.last_calibration), Some(marker));

        // Fresh marker and no new fingerprints.
        assert!(!scheduler.evaluate(&store).await?);

        let later = Utc::now().timestamp_millis() + 60_000;
        store.insert_reading(&labeled(later))?;
        store.flush().await?;
        assert!(scheduler.evaluate(&store).await?);
        wait_for(|| calibrator.calls() == 2).await;
        calibrator.gate.add_permits(1);
        wait_for(|| scheduler.completed_runs("home") == 2).await;

        scheduler.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_calibration_keeps_marker_missing() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = GroupStore::open(temp_dir.path(), "home", 10)?;
        let calibrator = Arc::new(FailingCalibrator {
            calls: AtomicUsize::new(0),
        });
        let scheduler = CalibrationScheduler::new(settings(), calibrator.clone());

        assert!(scheduler.evaluate(&store).await?);
        wait_for(|| calibrator.calls.load(Ordering::SeqCst) == 1).await;
        wait_for(|| scheduler.phase("home") == CalibrationPhase::Idle).await;

        let missing = store.get_value::<DateTime<Utc>>(LAST_CALIBRATION_KEY);
        assert!(matches!(missing, Err(err) if err.is_not_found()));
        assert_eq!(scheduler.completed_runs("home"), 0);

        assert!(scheduler.evaluate(&store).await?);
        wait_for(|| calibrator.calls.load(Ordering::SeqCst) == 2).await;
        scheduler.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn notified_inserts_count_before_commit() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = GroupStore::open(temp_dir.path(), "home", 10)?;
        let calibrator = GatedCalibrator::new();
        let scheduler = CalibrationScheduler::new(settings(), calibrator.clone());

        store.set_value_and_wait(LAST_CALIBRATION_KEY, &Utc::now()).await?;
        assert!(!scheduler.evaluate(&store).await?);

        scheduler.notify_labeled("home", Utc::now().timestamp_millis() + 60_000);
        assert!(scheduler.evaluate(&store).await?);
        calibrator.gate.add_permits(1);
        wait_for(|| scheduler.completed_runs("home") == 1).await;
        scheduler.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reopened_store_gets_a_fresh_evaluator() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let calibrator = Arc::new(FailingCalibrator {
            calls: AtomicUsize::new(0),
        });
        let scheduler = CalibrationScheduler::new(settings(), calibrator.clone());
        let calls = || calibrator.calls.load(Ordering::SeqCst);

        let first = GroupStore::open(temp_dir.path(), "home", 10)?;
        scheduler.start_family(first.clone());
        wait_for(|| calls() == 1).await;
        wait_for(|| scheduler.phase("home") == CalibrationPhase::Idle).await;

        // The old loop is still parked on its next tick.
        first.close()?;
        let second = GroupStore::open_existing(temp_dir.path(), "home", 10)?;
        scheduler.start_family(second.clone());
        wait_for(|| calls() == 2).await;
        wait_for(|| scheduler.phase("home") == CalibrationPhase::Idle).await;

        scheduler.start_family(second.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls(), 2);

        scheduler.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn evaluator_loop_fires_on_start_and_stops() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = GroupStore::open(temp_dir.path(), "home", 10)?;
        let calibrator = GatedCalibrator::new();
        calibrator.gate.add_permits(10);
        let scheduler = CalibrationScheduler::new(settings(), calibrator.clone());

        scheduler.start_family(store.clone());
        scheduler.start_family(store.clone());
        wait_for(|| scheduler.completed_runs("home") == 1).await;
        assert_eq!(calibrator.calls(), 1);

        wait_for(|| scheduler.phase("home") == CalibrationPhase::Idle).await;
        scheduler.stop_family("home");
        assert!(scheduler.state("home").is_none());

        scheduler.shutdown().await;
        assert!(!scheduler.evaluate(&store).await?);
        Ok(())
    }
}
