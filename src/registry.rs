use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::anyhow;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    calibration::CalibrationScheduler,
    config::StoreSettings,
    db::{
        helpers::{decode_family, normalize_family},
        GroupStore, StoreError,
    },
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Family name to open store, one canonical store per family.
///
/// Stores open lazily on first use. When a scheduler is attached, opening a
/// store starts its family's calibration evaluator and closing stops it.
pub struct Registry {
    data_dir: PathBuf,
    queue_capacity: usize,
    stores: Mutex<HashMap<String, GroupStore>>,
    scheduler: Option<CalibrationScheduler>,
    monitor: CancellationToken,
}

impl Registry {
    pub fn new(
        settings: &StoreSettings,
        scheduler: Option<CalibrationScheduler>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&settings.data_dir)?;
        Ok(Self {
            data_dir: settings.data_dir.clone(),
            queue_capacity: settings.queue_capacity,
            stores: Mutex::new(HashMap::new()),
            scheduler,
            monitor: CancellationToken::new(),
        })
    }

    fn stores(&self) -> MutexGuard<'_, HashMap<String, GroupStore>> {
        match self.stores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The open store for `family`, creating its dataset if needed.
    pub fn get(&self, family: &str) -> Result<GroupStore, StoreError> {
        self.lookup(family, true)
    }

    /// Like [`Registry::get`] but fails with `NotFound` instead of creating
    /// a dataset.
    pub fn open_existing(&self, family: &str) -> Result<GroupStore, StoreError> {
        self.lookup(family, false)
    }

    fn lookup(&self, family: &str, create: bool) -> Result<GroupStore, StoreError> {
        let family = normalize_family(family);
        if family.is_empty() {
            return Err(StoreError::Validation("family name must not be empty".into()));
        }

        let store = {
            let mut stores = self.stores();
            if let Some(store) = stores.get(family) {
                if !store.is_closed() {
                    return Ok(store.clone());
                }
            }

            let store = if create {
                GroupStore::open(&self.data_dir, family, self.queue_capacity)?
            } else {
                GroupStore::open_existing(&self.data_dir, family, self.queue_capacity)?
            };
            stores.insert(family.to_string(), store.clone());
            store
        };

        if let Some(scheduler) = &self.scheduler {
            scheduler.start_family(store.clone());
        }
        Ok(store)
    }

    pub fn is_open(&self, family: &str) -> bool {
        self.stores().contains_key(normalize_family(family))
    }

    pub fn open_count(&self) -> usize {
        self.stores().len()
    }

    /// Family names recovered from the dataset files in the data directory.
    pub fn families(&self) -> Result<Vec<String>, StoreError> {
        list_families(&self.data_dir)
    }

    /// Open every family found on disk. Returns how many opened.
    pub fn open_all(&self) -> Result<usize, StoreError> {
        let mut opened = 0;
        for family in self.families()? {
            match self.get(&family) {
                Ok(_) => opened += 1,
                Err(err) => log_error!("failed to open family '{family}': {err}"),
            }
        }
        log_info!("opened {opened} families from {}", self.data_dir.display());
        Ok(opened)
    }

    /// Close and remove a family's dataset, open or not.
    pub async fn delete(self: &Arc<Self>, family: &str) -> Result<(), StoreError> {
        let registry = Arc::clone(self);
        let family = family.to_string();
        tokio::task::spawn_blocking(move || registry.delete_blocking(&family))
            .await
            .map_err(|err| StoreError::Transaction(anyhow!("delete worker failed: {err}")))?
    }

    /// Blocking form of [`Registry::delete`]. The map stays locked until the
    /// files are gone, so a concurrent `get` either sees the old store (and
    /// loses it) or opens a fresh dataset afterwards.
    pub fn delete_blocking(&self, family: &str) -> Result<(), StoreError> {
        let family = normalize_family(family);
        let mut stores = self.stores();
        let store = stores.remove(family);
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop_family(family);
        }

        match store {
            Some(store) => store.delete(),
            None => GroupStore::remove(&self.data_dir, family),
        }
    }

    /// Drain and close every open store. Errors are logged; the number of
    /// stores closed cleanly is returned.
    pub async fn close_all(&self) -> usize {
        self.monitor.cancel();
        let stores: Vec<GroupStore> = self.stores().drain().map(|(_, store)| store).collect();

        let mut closed = 0;
        for store in stores {
            if let Some(scheduler) = &self.scheduler {
                scheduler.stop_family(store.family());
            }
            let family = store.family().to_string();
            match tokio::task::spawn_blocking(move || store.close()).await {
                Ok(Ok(())) => closed += 1,
                Ok(Err(err)) => log_error!("failed to close store for '{family}': {err}"),
                Err(err) => log_error!("close worker for '{family}' failed: {err}"),
            }
        }
        log_info!("closed {closed} stores");
        closed
    }

    /// Periodically log open stores and their queued writes until
    /// [`Registry::close_all`].
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::clone(self);
        let cancel_token = self.monitor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.report(),
                    _ = cancel_token.cancelled() => break,
                }
            }
        });
    }

    fn report(&self) {
        let stores = self.stores();
        log_debug!("{} stores open", stores.len());
        for (family, store) in stores.iter() {
            let pending = store.pending_writes();
            if pending > 0 {
                log_debug!("'{family}': {pending} writes queued");
            }
        }
    }
}

/// Decode every dataset file name in `data_dir`, sorted.
pub fn list_families(data_dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut families = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match decode_family(name) {
            Some(family) => families.push(family),
            None if name.ends_with("-wal") || name.ends_with("-shm") => {}
            None => log_warn!("ignoring unexpected file {name} in data directory"),
        }
    }
    families.sort();
    Ok(families)
}
