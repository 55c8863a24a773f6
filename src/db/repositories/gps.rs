use anyhow::Context;
use rusqlite::params;

use crate::db::{
    models::{gps_key, Gps, GpsTag, SensorReading},
    GroupStore, StoreError,
};

impl GroupStore {
    /// Queue a GPS tag upsert for every source seen in `reading`.
    pub(crate) fn set_gps(&self, reading: &SensorReading, gps: Gps) -> Result<(), StoreError> {
        let location = reading.location.trim().to_string();
        let keys: Vec<String> = reading
            .sensors
            .iter()
            .flat_map(|(kind, sources)| sources.keys().map(move |address| gps_key(kind, address)))
            .collect();

        self.enqueue("set_gps", move |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO gps (mac, loc, lat, lon, alt) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for key in &keys {
                stmt.execute(params![key, location, gps.latitude, gps.longitude, gps.altitude])
                    .with_context(|| format!("failed to store gps tag {key}"))?;
            }
            Ok(())
        })
    }

    pub fn gps_tags(&self) -> Result<Vec<GpsTag>, StoreError> {
        self.read("gps_tags", |conn| {
            let mut stmt = conn.prepare("SELECT mac, loc, lat, lon, alt FROM gps ORDER BY mac")?;
            let tags = stmt
                .query_map([], |row| {
                    Ok(GpsTag {
                        key: row.get(0)?,
                        location: row.get(1)?,
                        gps: Gps {
                            latitude: row.get::<_, Option<f64>>(2)?.unwrap_or_default(),
                            longitude: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                            altitude: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                        },
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tags)
        })
    }
}
