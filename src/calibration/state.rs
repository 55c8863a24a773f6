use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CalibrationPhase {
    Idle,
    /// Job submitted, waiting for a free worker.
    Pending,
    Running,
}

impl Default for CalibrationPhase {
    fn default() -> Self {
        CalibrationPhase::Idle
    }
}

/// What the keystore says about the last calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMarker {
    Missing,
    Unreadable,
    Present(DateTime<Utc>),
}

/// In-memory bookkeeping for one family. Only the marker is persisted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationState {
    pub phase: CalibrationPhase,
    /// Newest labeled timestamp reported by ingestion (epoch millis).
    pub last_insert: Option<i64>,
    pub last_calibration: Option<DateTime<Utc>>,
    /// Newest labeled timestamp seen by the previous evaluation.
    pub last_checked_labeled: Option<i64>,
    pub completed_runs: u64,
}

impl CalibrationState {
    pub fn is_idle(&self) -> bool {
        self.phase == CalibrationPhase::Idle
    }
}

/// Decide whether a family needs retraining.
///
/// Always true when the marker is missing or unreadable. Otherwise the newest
/// labeled reading must have advanced since the previous check and be more
/// than `threshold` newer than the last calibration.
pub fn should_calibrate(
    marker: CalibrationMarker,
    latest_labeled: Option<i64>,
    previous_check: Option<i64>,
    threshold: Duration,
) -> bool {
    let last_calibration = match marker {
        CalibrationMarker::Missing | CalibrationMarker::Unreadable => return true,
        CalibrationMarker::Present(at) => at,
    };
    let Some(latest) = latest_labeled else {
        return false;
    };

    let advanced = previous_check.map_or(true, |previous| latest > previous);
    let threshold_millis = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
    advanced && latest.saturating_sub(last_calibration.timestamp_millis()) > threshold_millis
}
