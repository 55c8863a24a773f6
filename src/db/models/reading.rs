//! Sensor scan data model.
//!
//! A reading is one scan from one device at one instant. It is stored as one
//! `sensors` row per sensor kind and regrouped on the way out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::StoreError;

/// Sensor kind (e.g. `wifi`, `bluetooth`) -> source address -> signal value.
pub type SensorMap = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Gps {
    /// Both horizontal coordinates must be non-zero to count as a fix.
    pub fn is_set(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub family: String,
    pub device: String,
    /// Empty means unlabeled.
    #[serde(default)]
    pub location: String,
    pub sensors: SensorMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<Gps>,
}

impl SensorReading {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.timestamp == 0 {
            return Err(StoreError::Validation("timestamp must be non-zero".into()));
        }
        if self.device.trim().is_empty() {
            return Err(StoreError::Validation("device id must not be empty".into()));
        }
        if self.sensors.is_empty() {
            return Err(StoreError::Validation(
                "reading must carry at least one sensor entry".into(),
            ));
        }
        Ok(())
    }

    pub fn is_labeled(&self) -> bool {
        !self.location.trim().is_empty()
    }

    pub fn gps_fix(&self) -> Option<Gps> {
        self.gps.filter(Gps::is_set)
    }
}
