//! Decides when a family's classifier model should be retrained.

use async_trait::async_trait;

use crate::classifier::ClassifierError;

mod scheduler;
mod state;

pub use scheduler::{CalibrationJob, CalibrationScheduler};
pub use state::{should_calibrate, CalibrationMarker, CalibrationPhase, CalibrationState};

/// Something that can retrain the model for a family.
#[async_trait]
pub trait Calibrator: Send + Sync {
    async fn calibrate(&self, family: &str) -> Result<(), ClassifierError>;
}
