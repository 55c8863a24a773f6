use anyhow::Context;
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::{GroupStore, StoreError};

/// Keystore entry holding the time of the last successful calibration.
pub const LAST_CALIBRATION_KEY: &str = "LastCalibrationTime";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO keystore (key, value) VALUES (?1, ?2)";

impl GroupStore {
    /// Queue a JSON-encoded value under `key`. Last write wins.
    pub fn set_value<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let key = key.to_string();
        self.enqueue("set_value", move |tx| {
            tx.execute(UPSERT_SQL, params![key, encoded])
                .with_context(|| format!("failed to store key '{key}'"))?;
            Ok(())
        })
    }

    /// Same as [`GroupStore::set_value`] but resolves once committed.
    pub async fn set_value_and_wait<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let key = key.to_string();
        self.execute("set_value", move |tx| {
            tx.execute(UPSERT_SQL, params![key, encoded])
                .with_context(|| format!("failed to store key '{key}'"))?;
            Ok(())
        })
        .await
    }

    pub fn get_value<V: DeserializeOwned>(&self, key: &str) -> Result<V, StoreError> {
        let raw: Option<String> = self.read("get_value", |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM keystore WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(value.flatten())
        })?;

        let raw = raw.ok_or_else(|| StoreError::NotFound(format!("key '{key}'")))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
