use std::fmt::Write as _;

use rusqlite::{types::ValueRef, Connection};

use crate::db::{GroupStore, StoreError};

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format!("{f:?}"),
        ValueRef::Text(bytes) => {
            format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''"))
        }
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
    }
}

fn dump_table(conn: &Connection, table: &str, out: &mut String) -> Result<(), StoreError> {
    let quoted = quote_identifier(table);
    let mut stmt = conn.prepare(&format!("SELECT * FROM {quoted}"))?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for index in 0..columns {
            values.push(render_value(row.get_ref(index)?));
        }
        let _ = writeln!(out, "INSERT INTO {quoted} VALUES({});", values.join(","));
    }
    Ok(())
}

impl GroupStore {
    /// Plain SQL text dump: schema followed by one INSERT per row.
    pub fn dump(&self) -> Result<String, StoreError> {
        self.read("dump", |conn| {
            let mut out = String::from("PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\n");

            let mut stmt = conn.prepare(
                "SELECT type, name, sql FROM sqlite_master
                 WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
                 ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
            )?;
            let objects = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (kind, name, sql) in &objects {
                let _ = writeln!(out, "{sql};");
                if kind == "table" {
                    dump_table(conn, name, &mut out)?;
                }
            }

            out.push_str("COMMIT;\n");
            Ok(out)
        })
    }
}
