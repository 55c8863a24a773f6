use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value};

use crate::db::{
    helpers::{placeholders, round_probability},
    models::LocationPrediction,
    GroupStore, StoreError,
};

impl GroupStore {
    /// Replace the prediction batch stored for `timestamp`.
    ///
    /// Probabilities are rounded to two decimals before they are queued. An
    /// empty batch is rejected and nothing is queued.
    pub fn insert_predictions(
        &self,
        timestamp: i64,
        predictions: &[LocationPrediction],
    ) -> Result<(), StoreError> {
        if predictions.is_empty() {
            return Err(StoreError::Validation("no predictions to add".into()));
        }
        if predictions.iter().any(|p| p.location.trim().is_empty()) {
            return Err(StoreError::Validation(
                "prediction location must not be empty".into(),
            ));
        }

        let batch: Vec<(String, f64)> = predictions
            .iter()
            .map(|p| (p.location.trim().to_string(), round_probability(p.probability)))
            .collect();

        self.enqueue("insert_predictions", move |tx| {
            let now = Utc::now().to_rfc3339();
            {
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO location_predictions
                         (timestamp, locationid, probability, create_at, update_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT (timestamp, locationid)
                     DO UPDATE SET probability = excluded.probability,
                                   update_at = excluded.update_at",
                )?;
                for (location, probability) in &batch {
                    upsert
                        .execute(params![timestamp, location, probability, now])
                        .with_context(|| {
                            format!("failed to store prediction {location} at {timestamp}")
                        })?;
                }
            }

            let mut stale_params: Vec<Value> = vec![Value::Integer(timestamp)];
            stale_params.extend(batch.iter().map(|(location, _)| Value::Text(location.clone())));
            tx.execute(
                &format!(
                    "DELETE FROM location_predictions
                     WHERE timestamp = ? AND locationid NOT IN ({})",
                    placeholders(batch.len())
                ),
                params_from_iter(stale_params),
            )
            .context("failed to drop superseded predictions")?;
            Ok(())
        })
    }

    /// Predictions stored for `timestamp`, most likely first.
    pub fn predictions_at(&self, timestamp: i64) -> Result<Vec<LocationPrediction>, StoreError> {
        self.read("predictions_at", |conn| {
            let mut stmt = conn.prepare(
                "SELECT locationid, probability
                 FROM location_predictions
                 WHERE timestamp = ?1
                 ORDER BY probability DESC, locationid ASC",
            )?;
            let predictions = stmt
                .query_map(params![timestamp], |row| {
                    Ok(LocationPrediction {
                        location: row.get(0)?,
                        probability: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(predictions)
        })
    }

    /// Every location that has ever been predicted.
    pub fn list_locations(&self) -> Result<Vec<String>, StoreError> {
        self.read("list_locations", |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT locationid FROM location_predictions ORDER BY locationid",
            )?;
            let locations = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(locations)
        })
    }
}
