use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Transaction};
use tokio::sync::oneshot;

mod error;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use error::StoreError;
pub use models::{gps_key, Gps, GpsTag, LocationPrediction, SensorMap, SensorReading};
pub use repositories::keystore::LAST_CALIBRATION_KEY;

use helpers::{dataset_path, millis_to_datetime, normalize_family};
use migrations::run_migrations;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_trace, log_warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(50);

type WriteTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum WriteCommand {
    Execute {
        query_id: String,
        label: &'static str,
        task: WriteTask,
    },
    Shutdown,
}

struct StoreInner {
    family: String,
    path: PathBuf,
    sender: SyncSender<WriteCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    pending: Arc<AtomicUsize>,
    last_write_millis: Arc<AtomicI64>,
    query_counter: AtomicU64,
}

impl StoreInner {
    /// Queue a shutdown behind every pending write and join the serializer.
    fn shutdown_writer(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);

        let handle = {
            let mut guard = match self.worker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };

        if let Some(handle) = handle {
            if self.sender.send(WriteCommand::Shutdown).is_err() {
                // Already past an earlier shutdown marker.
                log_debug!("write serializer for '{}' already stopped", self.family);
            }
            handle.join().map_err(|_| {
                StoreError::Transaction(anyhow!(
                    "write serializer for '{}' panicked",
                    self.family
                ))
            })?;
            log_info!("closed store for '{}'", self.family);
        }

        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_writer() {
            log_error!("failed to close store for '{}': {err}", self.family);
        }
    }
}

/// Durable storage for one family.
///
/// Every mutation goes through a single write-serializer thread that runs
/// each job as its own transaction, in submission order. Reads open their
/// own read-only connection so they never queue behind writes, and WAL mode
/// keeps them on committed data.
#[derive(Clone)]
pub struct GroupStore {
    inner: Arc<StoreInner>,
}

impl GroupStore {
    /// Open (creating if needed) the dataset for `family` under `data_dir`.
    ///
    /// Schema creation failure is reported as [`StoreError::Setup`]; the
    /// store is unusable in that case.
    pub fn open(data_dir: &Path, family: &str, queue_capacity: usize) -> Result<Self, StoreError> {
        let family = normalize_family(family).to_string();
        if family.is_empty() {
            return Err(StoreError::Validation("family name must not be empty".into()));
        }

        fs::create_dir_all(data_dir).map_err(|err| StoreError::Setup {
            family: family.clone(),
            source: anyhow::Error::new(err)
                .context(format!("failed to create data directory {}", data_dir.display())),
        })?;

        let path = dataset_path(data_dir, &family);
        let (command_tx, command_rx) = mpsc::sync_channel::<WriteCommand>(queue_capacity.max(1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let last_write_millis = Arc::new(AtomicI64::new(0));

        let worker = {
            let path = path.clone();
            let worker_family = family.clone();
            thread::Builder::new()
                .name(format!("roomsense-db-{}", thread_suffix(&family)))
                .spawn(move || write_serializer(path, worker_family, command_rx, ready_tx))
                .map_err(|err| StoreError::Setup {
                    family: family.clone(),
                    source: anyhow::Error::new(err)
                        .context("failed to spawn write serializer thread"),
                })?
        };

        let ready = ready_rx
            .recv()
            .context("write serializer exited before signaling readiness")
            .and_then(|init| init);
        if let Err(source) = ready {
            if worker.join().is_err() {
                log_error!("write serializer for '{family}' panicked during setup");
            }
            return Err(StoreError::Setup { family, source });
        }

        log_info!("opened store for '{}' at {}", family, path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                family,
                path,
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
                pending,
                last_write_millis,
                query_counter: AtomicU64::new(0),
            }),
        })
    }

    /// Like [`GroupStore::open`] but never creates a dataset.
    pub fn open_existing(
        data_dir: &Path,
        family: &str,
        queue_capacity: usize,
    ) -> Result<Self, StoreError> {
        if !Self::exists(data_dir, family) {
            return Err(StoreError::NotFound(format!(
                "family '{}' does not exist",
                normalize_family(family)
            )));
        }
        Self::open(data_dir, family, queue_capacity)
    }

    /// Remove the dataset files of a family that is not open.
    pub fn remove(data_dir: &Path, family: &str) -> Result<(), StoreError> {
        if !Self::exists(data_dir, family) {
            return Err(StoreError::NotFound(format!(
                "family '{}' does not exist",
                normalize_family(family)
            )));
        }
        remove_dataset_files(&dataset_path(data_dir, family))?;
        log_info!("deleted dataset for '{}'", normalize_family(family));
        Ok(())
    }

    pub fn exists(data_dir: &Path, family: &str) -> bool {
        dataset_path(data_dir, family).is_file()
    }

    pub fn family(&self) -> &str {
        &self.inner.family
    }

    pub fn path(&self) -> &Path {
        self.inner.path.as_path()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Write jobs queued but not yet executed.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// When the serializer last finished a job.
    pub fn last_write_at(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_write_millis.load(Ordering::SeqCst) {
            0 => None,
            millis => millis_to_datetime(millis).ok(),
        }
    }

    /// Drain queued writes and stop the serializer. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), StoreError> {
        self.inner.shutdown_writer()
    }

    /// Close the store and remove its dataset files.
    pub fn delete(&self) -> Result<(), StoreError> {
        self.close()?;
        remove_dataset_files(&self.inner.path)?;
        log_info!("deleted dataset for '{}'", self.inner.family);
        Ok(())
    }

    /// Fire-and-forget write. Returns once the job is queued; blocks while
    /// the queue is full. Failures are logged by the serializer and dropped.
    pub fn enqueue<F>(&self, label: &'static str, task: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        let command = self.build_command::<F, ()>(label, task, None);
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.sender.send(command).map_err(|_| {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            StoreError::Closed(self.inner.family.clone())
        })
    }

    /// Wait-for-completion write: resolves after this job and everything
    /// queued ahead of it has executed.
    pub async fn execute<F, T>(&self, label: &'static str, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = self.build_command(label, task, Some(reply_tx));
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let queued = match self.inner.sender.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                // Park on a blocking thread rather than a runtime worker.
                let sender = self.inner.sender.clone();
                tokio::task::spawn_blocking(move || sender.send(command).is_ok())
                    .await
                    .unwrap_or(false)
            }
            Err(TrySendError::Disconnected(_)) => false,
        };
        if !queued {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Closed(self.inner.family.clone()));
        }

        reply_rx
            .await
            .map_err(|_| StoreError::Closed(self.inner.family.clone()))?
    }

    /// Barrier over every write queued before this call.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.execute("flush", |_| Ok(())).await
    }

    pub(crate) fn read<F, T>(&self, label: &'static str, query: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        self.ensure_open()?;
        let query_id = self.next_query_id('r');
        let started = Instant::now();

        let conn = Connection::open_with_flags(
            &self.inner.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let result = query(&conn);
        log_trace!(
            "{label} {query_id} on '{}' finished in {:?}",
            self.inner.family,
            started.elapsed()
        );
        result
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.family.clone()));
        }
        Ok(())
    }

    fn next_query_id(&self, mode: char) -> String {
        let n = self.inner.query_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{mode}{n:06x}")
    }

    fn build_command<F, T>(
        &self,
        label: &'static str,
        task: F,
        reply: Option<oneshot::Sender<Result<T, StoreError>>>,
    ) -> WriteCommand
    where
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let query_id = self.next_query_id('w');
        let family = self.inner.family.clone();
        let job_id = query_id.clone();
        let pending = Arc::clone(&self.inner.pending);
        let last_write_millis = Arc::clone(&self.inner.last_write_millis);

        let task: WriteTask = Box::new(move |conn: &mut Connection| {
            let result = run_in_transaction(conn, task);
            if let Err(err) = &result {
                log_error!("{label} {job_id} on '{family}' failed, dropping job: {err:#}");
            }
            // Counters settle before the caller is woken.
            pending.fetch_sub(1, Ordering::SeqCst);
            last_write_millis.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            if let Some(reply) = reply {
                if reply.send(result.map_err(StoreError::Transaction)).is_err() {
                    log_warn!("{label} {job_id} caller dropped before receiving result");
                }
            }
        });

        WriteCommand::Execute {
            query_id,
            label,
            task,
        }
    }
}

fn run_in_transaction<F, T>(conn: &mut Connection, task: F) -> anyhow::Result<T>
where
    F: FnOnce(&Transaction<'_>) -> anyhow::Result<T>,
{
    let tx = conn.transaction().context("failed to begin transaction")?;
    let value = task(&tx)?;
    tx.commit().context("failed to commit transaction")?;
    Ok(value)
}

fn open_writer(path: &Path) -> anyhow::Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite dataset {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        log_error!("failed to enable WAL mode for {}: {err}", path.display());
    }

    run_migrations(&mut conn).context("failed to create dataset schema")?;
    Ok(conn)
}

fn write_serializer(
    path: PathBuf,
    family: String,
    commands: Receiver<WriteCommand>,
    ready: mpsc::Sender<anyhow::Result<()>>,
) {
    let mut conn = match open_writer(&path) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        log_error!("store opener for '{family}' went away before ready signal");
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            WriteCommand::Execute {
                query_id,
                label,
                task,
            } => run_command(&mut conn, &family, query_id, label, task),
            WriteCommand::Shutdown => break,
        }
    }

    // Jobs accepted before `closed` was observed can sit behind the shutdown
    // marker. They were acknowledged to their callers, so run them too.
    let mut late = 0usize;
    while let Ok(command) = commands.try_recv() {
        if let WriteCommand::Execute {
            query_id,
            label,
            task,
        } = command
        {
            run_command(&mut conn, &family, query_id, label, task);
            late += 1;
        }
    }
    if late > 0 {
        log_warn!("ran {late} writes queued behind shutdown for '{family}'");
    }

    log_info!("write serializer for '{family}' shutting down");
}

fn run_command(
    conn: &mut Connection,
    family: &str,
    query_id: String,
    label: &'static str,
    task: WriteTask,
) {
    let started = Instant::now();
    log_trace!("running {label} {query_id} on '{family}'");
    task(conn);
    log_trace!("finished {label} {query_id} in {:?}", started.elapsed());
}

fn remove_dataset_files(path: &Path) -> Result<(), StoreError> {
    fs::remove_file(path)?;
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        match fs::remove_file(PathBuf::from(side)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn thread_suffix(family: &str) -> String {
    family
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect()
}
