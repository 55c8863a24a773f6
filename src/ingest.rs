use std::sync::Arc;

use anyhow::anyhow;
use thiserror::Error;

use crate::{
    calibration::CalibrationScheduler,
    classifier::{ClassifierError, ClassifierPool},
    db::{GroupStore, LocationPrediction, SensorReading, StoreError},
    registry::Registry,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Entry point for scans arriving from transport adapters.
#[derive(Clone)]
pub struct Ingestor {
    registry: Arc<Registry>,
    scheduler: Option<CalibrationScheduler>,
    classifier: Option<ClassifierPool>,
}

impl Ingestor {
    pub fn new(registry: Arc<Registry>, scheduler: Option<CalibrationScheduler>) -> Self {
        Self {
            registry,
            scheduler,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: ClassifierPool) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    async fn with_store<F, T>(&self, family: &str, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&GroupStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let family = family.to_string();
        // Opening a store and a full write queue both block.
        tokio::task::spawn_blocking(move || {
            let store = registry.get(&family)?;
            task(&store)
        })
        .await
        .map_err(|err| StoreError::Transaction(anyhow!("ingest worker failed: {err}")))?
    }

    /// Validate and queue a reading. Labeled readings are reported to the
    /// calibration scheduler once queued.
    pub async fn save_reading(&self, reading: SensorReading) -> Result<(), IngestError> {
        reading.validate()?;
        let labeled = reading.is_labeled();
        let timestamp = reading.timestamp;
        let family = reading.family.clone();

        let family = self
            .with_store(&family, move |store| {
                store.insert_reading(&reading)?;
                Ok(store.family().to_string())
            })
            .await?;

        if labeled {
            if let Some(scheduler) = &self.scheduler {
                scheduler.notify_labeled(&family, timestamp);
            }
        }
        Ok(())
    }

    pub async fn save_predictions(
        &self,
        family: &str,
        timestamp: i64,
        predictions: Vec<LocationPrediction>,
    ) -> Result<(), IngestError> {
        self.with_store(family, move |store| {
            store.insert_predictions(timestamp, &predictions)
        })
        .await?;
        Ok(())
    }

    /// Ask the classifier where an unlabeled reading was taken and store the
    /// guesses as predictions for its timestamp.
    pub async fn classify(
        &self,
        reading: &SensorReading,
    ) -> Result<Vec<LocationPrediction>, IngestError> {
        reading.validate()?;
        let classifier = self.classifier.as_ref().ok_or(ClassifierError::PoolClosed)?;

        let guesses = classifier.classify(&reading.family, reading).await?;
        if guesses.is_empty() {
            log_warn!(
                "classifier returned no guesses for '{}' at {}",
                reading.family,
                reading.timestamp
            );
            return Ok(guesses);
        }

        log_debug!(
            "storing {} guesses for '{}' at {}",
            guesses.len(),
            reading.family,
            reading.timestamp
        );
        self.save_predictions(&reading.family, reading.timestamp, guesses.clone())
            .await?;
        Ok(guesses)
    }
}
