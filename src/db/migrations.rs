use anyhow::{bail, Context, Result};
use rusqlite::Connection;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// One schema step. A dataset at `version - 1` becomes `version` once `sql`
/// runs.
struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version, contiguous from 1.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tables",
        sql: include_str!("schemas/schema_v1.sql"),
    },
    Migration {
        version: 2,
        name: "reading and prediction indexes",
        sql: include_str!("schemas/schema_v2.sql"),
    },
];

fn latest_version() -> i32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")
}

/// Bring a family dataset up to the newest schema.
///
/// Each step commits together with its `user_version` bump, so an
/// interrupted upgrade resumes from the last completed step. Datasets
/// written by a newer build are refused.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let latest = latest_version();
    let found = schema_version(conn)?;
    if found > latest {
        bail!("dataset schema version {found} is newer than supported version {latest}");
    }

    for migration in MIGRATIONS.iter().filter(|migration| migration.version > found) {
        let tx = conn
            .transaction()
            .with_context(|| format!("failed to start migration {}", migration.version))?;
        tx.execute_batch(migration.sql).with_context(|| {
            format!("migration {} ({}) failed", migration.version, migration.name)
        })?;
        tx.pragma_update(None, "user_version", migration.version)
            .context("failed to update user_version pragma")?;
        tx.commit()
            .with_context(|| format!("failed to commit migration {}", migration.version))?;
        log_info!("applied schema migration {} ({})", migration.version, migration.name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(conn: &Connection, kind: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([kind], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    #[test]
    fn versions_are_contiguous() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, index as i32 + 1, "{}", migration.name);
        }
    }

    #[test]
    fn installs_schema_once() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        run_migrations(&mut conn)?;

        assert_eq!(
            names(&conn, "table")?,
            vec!["gps", "keystore", "location_predictions", "sensors"]
        );
        assert_eq!(schema_version(&conn)?, latest_version());
        Ok(())
    }

    #[test]
    fn upgrades_a_first_version_dataset() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(MIGRATIONS[0].sql)?;
        conn.pragma_update(None, "user_version", 1)?;
        conn.execute(
            "INSERT INTO keystore (key, value) VALUES ('kept', '\"yes\"')",
            [],
        )?;
        assert!(names(&conn, "index")?.is_empty());

        run_migrations(&mut conn)?;

        assert_eq!(schema_version(&conn)?, 2);
        assert_eq!(
            names(&conn, "index")?,
            vec![
                "idx_predictions_location",
                "idx_sensors_device_time",
                "idx_sensors_location",
            ]
        );
        let kept: String =
            conn.query_row("SELECT value FROM keystore WHERE key = 'kept'", [], |row| row.get(0))?;
        assert_eq!(kept, "\"yes\"");
        Ok(())
    }

    #[test]
    fn refuses_newer_dataset() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "user_version", latest_version() + 1)?;
        let err = run_migrations(&mut conn).unwrap_err();
        assert!(err.to_string().contains("newer"));
        Ok(())
    }
}
