pub mod calibration;
pub mod classifier;
pub mod config;
pub mod db;
pub mod ingest;
pub mod registry;
pub mod utils;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};

use calibration::CalibrationScheduler;
use classifier::ClassifierPool;
use config::Settings;
use db::GroupStore;
use ingest::Ingestor;
use registry::Registry;

const ENABLE_LOGS: bool = true;

/// Every long-lived component of a running instance, wired together.
pub struct Service {
    registry: Arc<Registry>,
    scheduler: CalibrationScheduler,
    classifier: ClassifierPool,
    ingestor: Ingestor,
}

impl Service {
    /// Connect the classifier pool, start the calibration workers and open
    /// every family already on disk. Must run inside a tokio runtime.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let classifier = ClassifierPool::connect(settings.classifier.clone()).await;
        let scheduler = CalibrationScheduler::new(
            settings.calibration.clone(),
            Arc::new(classifier.clone()),
        );

        let registry = Arc::new(
            Registry::new(&settings.store, Some(scheduler.clone())).with_context(|| {
                format!(
                    "failed to prepare data directory {}",
                    settings.store.data_dir.display()
                )
            })?,
        );
        let opener = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || opener.open_all())
            .await
            .context("family open worker failed")?
            .context("failed to open existing families")?;
        registry.spawn_monitor(settings.monitor_interval());

        let ingestor = Ingestor::new(Arc::clone(&registry), Some(scheduler.clone()))
            .with_classifier(classifier.clone());

        Ok(Self {
            registry,
            scheduler,
            classifier,
            ingestor,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &CalibrationScheduler {
        &self.scheduler
    }

    pub fn classifier(&self) -> &ClassifierPool {
        &self.classifier
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    /// Stop calibrating, drain and close every store, then close the pool.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        let closed = self.registry.close_all().await;
        self.classifier.shutdown();
        log_info!("shutdown complete ({closed} stores closed)");
    }
}

/// Run until Ctrl-C or SIGTERM, then shut down cleanly.
pub async fn serve(settings: Settings) -> Result<()> {
    log_info!(
        "roomsense starting (data {}, classifier {})",
        settings.store.data_dir.display(),
        settings.classifier.address
    );

    let service = Service::start(&settings).await?;
    wait_for_signal().await;
    log_info!("shutdown signal received");
    service.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => log_warn!("cannot listen for SIGTERM: {err}"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        log_warn!("cannot listen for Ctrl-C: {err}");
    }
}

/// SQL text dump of an existing family.
pub fn dump_family(data_dir: &Path, family: &str) -> Result<String> {
    let store = GroupStore::open_existing(data_dir, family, 1)?;
    let dump = store.dump();
    store.close()?;
    Ok(dump?)
}

pub fn list_families(data_dir: &Path) -> Result<Vec<String>> {
    Ok(registry::list_families(data_dir)?)
}
