use serde::{Deserialize, Serialize};

use super::reading::Gps;

/// GPS position learned for one sensor source.
///
/// `key` is `<sensor kind>-<source address>`; last write wins per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsTag {
    pub key: String,
    pub location: String,
    pub gps: Gps,
}

pub fn gps_key(sensor_kind: &str, address: &str) -> String {
    format!("{sensor_kind}-{address}")
}
