use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params};

use crate::db::{
    helpers::{millis_to_datetime, placeholders, to_i64, to_u64},
    models::SensorReading,
    GroupStore, StoreError,
};

const INSERT_SENSOR_SQL: &str = "INSERT OR REPLACE INTO sensors
    (timestamp, deviceid, locationid, sensor_type, sensor, create_at, update_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Rows must come back ordered so that one reading's rows are adjacent.
fn query_readings<P: Params>(
    conn: &Connection,
    family: &str,
    sql: &str,
    params: P,
) -> Result<Vec<SensorReading>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;

    let mut readings: Vec<SensorReading> = Vec::new();
    while let Some(row) = rows.next()? {
        let timestamp: i64 = row.get(0)?;
        let device: String = row.get(1)?;
        let location: String = row.get(2)?;
        let kind: String = row.get(3)?;
        let sensor: String = row.get(4)?;
        let values: BTreeMap<String, f64> = serde_json::from_str(&sensor)?;

        match readings.last_mut() {
            Some(last) if last.timestamp == timestamp && last.device == device => {
                last.sensors.insert(kind, values);
            }
            _ => {
                let mut sensors = BTreeMap::new();
                sensors.insert(kind, values);
                readings.push(SensorReading {
                    timestamp,
                    family: family.to_string(),
                    device,
                    location,
                    sensors,
                    gps: None,
                });
            }
        }
    }

    Ok(readings)
}

fn query_counts<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut counts = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        counts.insert(name, to_u64(count, "count")?);
    }
    Ok(counts)
}

fn query_first_seen<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<BTreeMap<String, DateTime<Utc>>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut first_seen = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let device: String = row.get(0)?;
        let millis: i64 = row.get(1)?;
        first_seen.insert(device, millis_to_datetime(millis)?);
    }
    Ok(first_seen)
}

fn max_timestamp(conn: &Connection, sql: &str) -> Result<Option<i64>, StoreError> {
    let value = conn
        .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
        .optional()?;
    Ok(value.flatten())
}

impl GroupStore {
    /// Validate and queue a reading, one row per sensor kind. A GPS fix on the
    /// reading queues a GPS tag upsert as well.
    pub fn insert_reading(&self, reading: &SensorReading) -> Result<(), StoreError> {
        reading.validate()?;

        let timestamp = reading.timestamp;
        let device = reading.device.trim().to_string();
        let location = reading.location.trim().to_string();
        let rows = reading
            .sensors
            .iter()
            .map(|(kind, values)| Ok((kind.clone(), serde_json::to_string(values)?)))
            .collect::<Result<Vec<(String, String)>, StoreError>>()?;

        self.enqueue("insert_reading", move |tx| {
            let now = Utc::now().to_rfc3339();
            let mut stmt = tx.prepare_cached(INSERT_SENSOR_SQL)?;
            for (kind, sensor) in &rows {
                stmt.execute(params![timestamp, device, location, kind, sensor, now, now])
                    .with_context(|| format!("failed to insert {kind} reading for {device}"))?;
            }
            Ok(())
        })?;

        if let Some(gps) = reading.gps_fix() {
            self.set_gps(reading, gps)?;
        }
        Ok(())
    }

    /// Queue removal of every reading carrying `location`.
    pub fn delete_location(&self, location: &str) -> Result<(), StoreError> {
        let location = location.trim().to_string();
        self.enqueue("delete_location", move |tx| {
            tx.execute("DELETE FROM sensors WHERE locationid = ?1", params![location])
                .with_context(|| format!("failed to delete readings for '{location}'"))?;
            Ok(())
        })
    }

    pub fn latest_reading(&self, device: &str) -> Result<SensorReading, StoreError> {
        let device = device.trim();
        let readings = self.read("latest_reading", |conn| {
            query_readings(
                conn,
                self.family(),
                "SELECT timestamp, deviceid, locationid, sensor_type, sensor
                 FROM sensors
                 WHERE deviceid = ?1
                   AND timestamp = (SELECT MAX(timestamp) FROM sensors WHERE deviceid = ?1)
                 ORDER BY sensor_type",
                params![device],
            )
        })?;

        readings
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("no readings for device '{device}'")))
    }

    pub fn readings_at(&self, timestamp: i64) -> Result<Vec<SensorReading>, StoreError> {
        self.read("readings_at", |conn| {
            query_readings(
                conn,
                self.family(),
                "SELECT timestamp, deviceid, locationid, sensor_type, sensor
                 FROM sensors
                 WHERE timestamp = ?1
                 ORDER BY deviceid, sensor_type",
                params![timestamp],
            )
        })
    }

    /// Most recent reading per device among rows newer than
    /// `latest_timestamp - window_millis`.
    pub fn readings_within_window(&self, window_millis: u64) -> Result<Vec<SensorReading>, StoreError> {
        let window = to_i64(window_millis)?;
        self.read("readings_within_window", |conn| {
            let Some(latest) = max_timestamp(conn, "SELECT MAX(timestamp) FROM sensors")? else {
                return Ok(Vec::new());
            };
            let minimum = latest.saturating_sub(window);

            query_readings(
                conn,
                self.family(),
                "SELECT s.timestamp, s.deviceid, s.locationid, s.sensor_type, s.sensor
                 FROM sensors s
                 JOIN (
                     SELECT deviceid, MAX(timestamp) AS ts
                     FROM sensors
                     WHERE timestamp > ?1
                     GROUP BY deviceid
                 ) newest ON s.deviceid = newest.deviceid AND s.timestamp = newest.ts
                 ORDER BY s.timestamp DESC, s.deviceid, s.sensor_type",
                params![minimum],
            )
        })
    }

    pub fn last_reading_timestamp(&self) -> Result<Option<i64>, StoreError> {
        self.read("last_reading_timestamp", |conn| {
            max_timestamp(conn, "SELECT MAX(timestamp) FROM sensors")
        })
    }

    pub fn last_labeled_timestamp(&self) -> Result<Option<i64>, StoreError> {
        self.read("last_labeled_timestamp", |conn| {
            max_timestamp(conn, "SELECT MAX(timestamp) FROM sensors WHERE locationid != ''")
        })
    }

    /// Number of labeled readings (fingerprints), each counted once however
    /// many sensor kinds it carries.
    pub fn labeled_reading_count(&self) -> Result<u64, StoreError> {
        self.read("labeled_reading_count", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM (
                     SELECT DISTINCT timestamp, deviceid FROM sensors WHERE locationid != ''
                 )",
                [],
                |row| row.get(0),
            )?;
            Ok(to_u64(count, "labeled count")?)
        })
    }

    pub fn labeled_readings(&self) -> Result<Vec<SensorReading>, StoreError> {
        self.read("labeled_readings", |conn| {
            query_readings(
                conn,
                self.family(),
                "SELECT timestamp, deviceid, locationid, sensor_type, sensor
                 FROM sensors
                 WHERE locationid != ''
                 ORDER BY timestamp, deviceid, sensor_type",
                [],
            )
        })
    }

    pub fn unlabeled_readings(&self) -> Result<Vec<SensorReading>, StoreError> {
        self.read("unlabeled_readings", |conn| {
            query_readings(
                conn,
                self.family(),
                "SELECT timestamp, deviceid, locationid, sensor_type, sensor
                 FROM sensors
                 WHERE locationid = ''
                 ORDER BY timestamp, deviceid, sensor_type",
                [],
            )
        })
    }

    /// Readings per device.
    pub fn device_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.read("device_counts", |conn| {
            query_counts(
                conn,
                "SELECT deviceid, COUNT(DISTINCT timestamp) FROM sensors GROUP BY deviceid",
                [],
            )
        })
    }

    pub fn device_counts_for(&self, devices: &[String]) -> Result<BTreeMap<String, u64>, StoreError> {
        if devices.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT deviceid, COUNT(DISTINCT timestamp) FROM sensors
             WHERE deviceid IN ({})
             GROUP BY deviceid",
            placeholders(devices.len())
        );
        self.read("device_counts_for", |conn| {
            query_counts(conn, &sql, params_from_iter(devices.iter()))
        })
    }

    /// Labeled readings per location.
    pub fn location_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.read("location_counts", |conn| {
            query_counts(
                conn,
                "SELECT locationid, COUNT(*) FROM (
                     SELECT DISTINCT timestamp, deviceid, locationid
                     FROM sensors
                     WHERE locationid != ''
                 )
                 GROUP BY locationid",
                [],
            )
        })
    }

    /// Device ids, busiest first.
    pub fn list_devices(&self) -> Result<Vec<String>, StoreError> {
        self.read("list_devices", |conn| {
            let mut stmt = conn.prepare(
                "SELECT deviceid FROM sensors
                 GROUP BY deviceid
                 ORDER BY COUNT(DISTINCT timestamp) DESC, deviceid ASC",
            )?;
            let devices = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(devices)
        })
    }

    pub fn device_count(&self) -> Result<u64, StoreError> {
        self.read("device_count", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT deviceid) FROM sensors WHERE deviceid != ''",
                [],
                |row| row.get(0),
            )?;
            Ok(to_u64(count, "device count")?)
        })
    }

    pub fn first_seen_per_device(&self) -> Result<BTreeMap<String, DateTime<Utc>>, StoreError> {
        self.read("first_seen_per_device", |conn| {
            query_first_seen(
                conn,
                "SELECT deviceid, MIN(timestamp) FROM sensors GROUP BY deviceid",
                [],
            )
        })
    }

    pub fn first_seen_for(
        &self,
        devices: &[String],
    ) -> Result<BTreeMap<String, DateTime<Utc>>, StoreError> {
        if devices.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT deviceid, MIN(timestamp) FROM sensors
             WHERE deviceid IN ({})
             GROUP BY deviceid",
            placeholders(devices.len())
        );
        self.read("first_seen_for", |conn| {
            query_first_seen(conn, &sql, params_from_iter(devices.iter()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Gps, SensorMap};
    use tempfile::TempDir;

    fn reading(timestamp: i64, device: &str, location: &str, kinds: &[(&str, &str, f64)]) -> SensorReading {
        let mut sensors = SensorMap::new();
        for (kind, address, value) in kinds {
            sensors
                .entry(kind.to_string())
                .or_default()
                .insert(address.to_string(), *value);
        }
        SensorReading {
            timestamp,
            family: "site".into(),
            device: device.into(),
            location: location.into(),
            sensors,
            gps: None,
        }
    }

    fn open(temp_dir: &TempDir) -> anyhow::Result<GroupStore> {
        Ok(GroupStore::open(temp_dir.path(), "site", 100)?)
    }

    #[tokio::test]
    async fn latest_reading_regroups_sensor_kinds() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;

        store.insert_reading(&reading(1000, "d1", "roomA", &[("wifi", "aa:bb", -50.0)]))?;
        store.insert_reading(&reading(
            2000,
            "d1",
            "",
            &[("wifi", "aa:bb", -60.0), ("bluetooth", "cc:dd", -70.0)],
        ))?;
        store.flush().await?;

        let latest = store.latest_reading("d1")?;
        assert_eq!(latest.timestamp, 2000);
        assert_eq!(latest.family, "site");
        assert_eq!(latest.sensors.len(), 2);
        assert_eq!(latest.sensors["bluetooth"]["cc:dd"], -70.0);
        assert!(!latest.is_labeled());

        assert!(store.latest_reading("nobody").unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn same_key_supersedes_instead_of_merging() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;

        store.insert_reading(&reading(5, "d1", "", &[("wifi", "aa", -40.0), ("wifi", "bb", -41.0)]))?;
        store.insert_reading(&reading(5, "d1", "hall", &[("wifi", "cc", -42.0)]))?;
        store.flush().await?;

        let readings = store.readings_at(5)?;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].location, "hall");
        assert_eq!(readings[0].sensors["wifi"].len(), 1);
        assert!(readings[0].sensors["wifi"].contains_key("cc"));
        Ok(())
    }

    #[tokio::test]
    async fn labeled_count_grows_by_one_per_fingerprint() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;
        assert_eq!(store.labeled_reading_count()?, 0);

        store.insert_reading(&reading(
            10,
            "d1",
            "kitchen",
            &[("wifi", "aa", -40.0), ("bluetooth", "bb", -80.0)],
        ))?;
        store.flush().await?;
        assert_eq!(store.labeled_reading_count()?, 1);

        store.insert_reading(&reading(11, "d1", "", &[("wifi", "aa", -40.0)]))?;
        store.insert_reading(&reading(12, "d2", "kitchen", &[("wifi", "aa", -45.0)]))?;
        store.flush().await?;
        assert_eq!(store.labeled_reading_count()?, 2);
        assert_eq!(store.last_labeled_timestamp()?, Some(12));
        assert_eq!(store.last_reading_timestamp()?, Some(12));

        assert_eq!(store.labeled_readings()?.len(), 2);
        assert_eq!(store.unlabeled_readings()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn window_returns_newest_reading_per_device() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;
        assert!(store.readings_within_window(1_000)?.is_empty());

        store.insert_reading(&reading(1_000, "old", "", &[("wifi", "aa", -1.0)]))?;
        store.insert_reading(&reading(9_500, "d1", "", &[("wifi", "aa", -2.0)]))?;
        store.insert_reading(&reading(9_800, "d1", "", &[("wifi", "aa", -3.0)]))?;
        store.insert_reading(&reading(10_000, "d2", "", &[("wifi", "aa", -4.0)]))?;
        store.flush().await?;

        let window = store.readings_within_window(1_000)?;
        let summary: Vec<(&str, i64)> = window
            .iter()
            .map(|r| (r.device.as_str(), r.timestamp))
            .collect();
        assert_eq!(summary, vec![("d2", 10_000), ("d1", 9_800)]);
        Ok(())
    }

    #[tokio::test]
    async fn device_and_location_statistics() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;

        store.insert_reading(&reading(1, "d1", "a", &[("wifi", "x", -1.0), ("bluetooth", "y", -1.0)]))?;
        store.insert_reading(&reading(2, "d1", "a", &[("wifi", "x", -1.0)]))?;
        store.insert_reading(&reading(3, "d1", "", &[("wifi", "x", -1.0)]))?;
        store.insert_reading(&reading(4, "d2", "b", &[("wifi", "x", -1.0)]))?;
        store.flush().await?;

        let counts = store.device_counts()?;
        assert_eq!(counts["d1"], 3);
        assert_eq!(counts["d2"], 1);
        assert_eq!(store.list_devices()?, vec!["d1".to_string(), "d2".to_string()]);
        assert_eq!(store.device_count()?, 2);

        let locations = store.location_counts()?;
        assert_eq!(locations.get("a"), Some(&2));
        assert_eq!(locations.get("b"), Some(&1));
        assert!(!locations.contains_key(""));

        let only_d2 = store.device_counts_for(&["d2".to_string(), "ghost".to_string()])?;
        assert_eq!(only_d2.len(), 1);
        assert!(store.device_counts_for(&[])?.is_empty());

        let first_seen = store.first_seen_per_device()?;
        assert_eq!(first_seen["d1"].timestamp_millis(), 1);
        assert_eq!(first_seen["d2"].timestamp_millis(), 4);
        assert_eq!(store.first_seen_for(&["d2".to_string()])?.len(), 1);
        assert!(store.first_seen_for(&[])?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_location_removes_its_fingerprints() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;
        store.insert_reading(&reading(1, "d1", "a", &[("wifi", "x", -1.0)]))?;
        store.insert_reading(&reading(2, "d1", "b", &[("wifi", "x", -1.0)]))?;
        store.delete_location("a")?;
        store.flush().await?;

        let counts = store.location_counts()?;
        assert!(!counts.contains_key("a"));
        assert_eq!(counts["b"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_reading_is_rejected_before_queueing() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = open(&temp_dir)?;
        let mut bad = reading(0, "d1", "", &[("wifi", "x", -1.0)]);
        bad.gps = Some(Gps {
            latitude: 1.0,
            longitude: 1.0,
            altitude: 0.0,
        });

        assert!(matches!(store.insert_reading(&bad), Err(StoreError::Validation(_))));
        assert_eq!(store.pending_writes(), 0);
        assert!(store.gps_tags()?.is_empty());
        Ok(())
    }
}
