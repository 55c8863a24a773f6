use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use super::{
    connection::ClassifierConnection,
    protocol::{ClassifierRequest, ClassifierResponse, LocationAnalysis},
    ClassifierError,
};
use crate::{
    calibration::Calibrator,
    config::ClassifierSettings,
    db::{LocationPrediction, SensorReading},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_trace, log_warn};

struct PoolInner {
    settings: ClassifierSettings,
    idle: Mutex<Vec<ClassifierConnection>>,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
    reporter: CancellationToken,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<ClassifierConnection>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Counts a request as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection checked out of the pool.
///
/// Dropping it returns the connection to the idle set unless it was marked
/// unusable or the pool has shut down.
pub struct PooledConnection {
    conn: Option<ClassifierConnection>,
    pool: Arc<PoolInner>,
    usable: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(ClassifierConnection::id).unwrap_or_default()
    }

    pub async fn round_trip(&mut self, query: &str) -> Result<String, ClassifierError> {
        match self.conn.as_mut() {
            Some(conn) => conn.round_trip(query).await,
            None => Err(ClassifierError::Connection("connection already closed".into())),
        }
    }

    pub fn mark_unusable(&mut self) {
        self.usable = false;
    }

    pub fn close(mut self) {
        self.usable = false;
        self.conn.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.usable && !self.pool.closed.load(Ordering::SeqCst) {
                self.pool.idle().push(conn);
            } else {
                log_debug!("closing classifier connection #{}", conn.id());
            }
        }
    }
}

/// Bounded pool of line-protocol connections to the classification service.
#[derive(Clone)]
pub struct ClassifierPool {
    inner: Arc<PoolInner>,
}

impl ClassifierPool {
    /// Build the pool, pre-open up to `min_idle` connections and start the
    /// periodic in-flight reporter. An unreachable classifier is not fatal
    /// here; requests retry and fail individually.
    pub async fn connect(settings: ClassifierSettings) -> Self {
        let max_open = settings.max_open.max(1);
        let pool = Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_open)),
                permits: Arc::new(Semaphore::new(max_open)),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                reporter: CancellationToken::new(),
                settings,
            }),
        };

        pool.warm_up(max_open).await;
        pool.spawn_reporter();
        pool
    }

    async fn warm_up(&self, max_open: usize) {
        let wanted = self.inner.settings.min_idle.min(max_open);
        for _ in 0..wanted {
            match self.dial().await {
                Ok(conn) => self.inner.idle().push(conn),
                Err(err) => {
                    log_warn!("could not pre-open classifier connections: {err}");
                    break;
                }
            }
        }
        log_info!(
            "classifier pool ready for {} ({} idle, max {max_open})",
            self.inner.settings.address,
            self.idle_count()
        );
    }

    async fn dial(&self) -> Result<ClassifierConnection, ClassifierError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = ClassifierConnection::dial(&self.inner.settings.address, id).await?;
        log_debug!("opened classifier connection #{id}");
        Ok(conn)
    }

    fn spawn_reporter(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel_token = inner.reporter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.report_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pending = inner.in_flight.load(Ordering::SeqCst);
                        if pending > 0 {
                            log_debug!("classifier requests in flight: {pending}");
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
        });
    }

    /// Wait for a free slot, then reuse an idle connection or dial a new one.
    pub async fn acquire(&self) -> Result<PooledConnection, ClassifierError> {
        if self.is_closed() {
            return Err(ClassifierError::PoolClosed);
        }

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ClassifierError::PoolClosed)?;

        let reused = self.inner.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            usable: true,
            _permit: permit,
        })
    }

    /// Send one query line and return the response line.
    ///
    /// A failed attempt discards its connection. After failed attempt `n`
    /// the caller sleeps `n² × backoff_unit` before retrying; there is no
    /// sleep after the final attempt.
    pub async fn send(&self, query: &str) -> Result<String, ClassifierError> {
        if query.contains(|c: char| c == '\r' || c == '\n') {
            return Err(ClassifierError::Protocol(
                "query must be a single line".into(),
            ));
        }
        if self.is_closed() {
            return Err(ClassifierError::PoolClosed);
        }

        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let limit = self.inner.settings.retry_limit.max(1);
        log_trace!("IN  {query}");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_once(query).await {
                Ok(response) => {
                    log_trace!("OUT {response}");
                    return Ok(response);
                }
                Err(ClassifierError::PoolClosed) => return Err(ClassifierError::PoolClosed),
                Err(err) if attempt >= limit => {
                    log_error!("classifier request failed after {attempt} attempts: {err}");
                    return Err(ClassifierError::RetryExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    let backoff = backoff_delay(self.inner.settings.backoff_unit(), attempt);
                    log_warn!("classifier attempt {attempt} failed ({err}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn try_once(&self, query: &str) -> Result<String, ClassifierError> {
        let mut conn = self.acquire().await?;
        match conn.round_trip(query).await {
            Ok(response) => Ok(response),
            Err(err) => {
                log_warn!("removing classifier connection #{} from pool", conn.id());
                conn.mark_unusable();
                conn.close();
                Err(err)
            }
        }
    }

    pub async fn request(
        &self,
        request: &ClassifierRequest,
    ) -> Result<Option<serde_json::Value>, ClassifierError> {
        let line = self.send(&request.encode()?).await?;
        ClassifierResponse::decode(&line)?.into_data()
    }

    /// Ask the classifier to retrain its model for `family`.
    pub async fn calibrate(&self, family: &str) -> Result<(), ClassifierError> {
        self.request(&ClassifierRequest::Calibrate {
            family: family.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Ask the classifier where `reading` was taken.
    pub async fn classify(
        &self,
        family: &str,
        reading: &SensorReading,
    ) -> Result<Vec<LocationPrediction>, ClassifierError> {
        let data = self
            .request(&ClassifierRequest::Classify {
                family: family.to_string(),
                reading: reading.clone(),
            })
            .await?;

        let analysis: LocationAnalysis = match data {
            Some(value) => serde_json::from_value(value)?,
            None => LocationAnalysis::default(),
        };
        Ok(analysis.guesses)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Number of connections dialed over the pool's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close idle connections and refuse new requests. Checked-out
    /// connections are dropped when their request finishes.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.reporter.cancel();
        self.inner.permits.close();
        let drained = std::mem::take(&mut *self.inner.idle());
        log_info!("classifier pool shut down ({} idle connections closed)", drained.len());
    }
}

/// Sleep after failed attempt `attempt` (1-based): `attempt² × unit`.
fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(attempt.saturating_mul(attempt))
}

#[async_trait]
impl Calibrator for ClassifierPool {
    async fn calibrate(&self, family: &str) -> Result<(), ClassifierError> {
        ClassifierPool::calibrate(self, family).await
    }
}
