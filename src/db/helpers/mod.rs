use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};

pub const DATASET_SUFFIX: &str = ".sqlite3.db";

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// `?, ?, ?` for an `IN (...)` clause with `count` bound parameters.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp {millis} is out of range"))
}

/// Family names are trimmed before they are used anywhere.
pub fn normalize_family(family: &str) -> &str {
    family.trim()
}

/// Filesystem-safe, reversible file name for a family's dataset.
pub fn encode_family(family: &str) -> String {
    format!(
        "{}{DATASET_SUFFIX}",
        hex::encode(normalize_family(family).as_bytes())
    )
}

/// Inverse of [`encode_family`]. `None` for files that are not datasets.
pub fn decode_family(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(DATASET_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn dataset_path(data_dir: &Path, family: &str) -> PathBuf {
    data_dir.join(encode_family(family))
}

/// Round to two decimals (half away from zero) and clamp into `[0, 1]`.
pub fn round_probability(probability: f64) -> f64 {
    if !probability.is_finite() {
        return 0.0;
    }
    ((probability * 100.0).round() / 100.0).clamp(0.0, 1.0)
}
