use std::path::Path;

use anyhow::{anyhow, Context, Result};
use featmgr_core::{Hive, HiveError, HiveValue, KeyPath};
use rusqlite::{params, Connection, OptionalExtension};

use crate::schema::{current_schema_version, open_connection};

/// Hive persisted in two tables: `hive_keys` (one row per key, the root is
/// the empty path) and `hive_values`.
#[derive(Debug)]
pub struct SqliteHive {
    conn: Connection,
}

impl SqliteHive {
    /// Open (or create) a hive database and migrate it.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// # Errors
    /// Returns an error when the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM hive_keys WHERE path = ?1)",
                params![path],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to look up key {path}"))?;
        Ok(exists == 1)
    }

    fn require(&self, path: &KeyPath) -> Result<String, HiveError> {
        let rendered = path.to_string();
        if self.exists(&rendered).map_err(backend)? {
            Ok(rendered)
        } else {
            Err(HiveError::KeyNotFound(rendered))
        }
    }

    fn create(&mut self, path: &KeyPath) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut current = KeyPath::root();
        for segment in path.segments() {
            let child = current.join(segment);
            tx.execute(
                "INSERT OR IGNORE INTO hive_keys(path, parent, name) VALUES (?1, ?2, ?3)",
                params![child.to_string(), current.to_string(), segment],
            )
            .with_context(|| format!("failed to create key {child}"))?;
            current = child;
        }
        tx.commit().context("failed to commit key creation")?;
        Ok(())
    }

    fn delete(&mut self, path: &KeyPath) -> Result<bool> {
        let rendered = path.to_string();
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let removed = if path.is_root() {
            let values = tx.execute("DELETE FROM hive_values", []).context("failed to clear values")?;
            let keys = tx
                .execute("DELETE FROM hive_keys WHERE path <> ''", [])
                .context("failed to clear keys")?;
            values + keys > 0
        } else {
            let prefix = format!("{rendered}\\");
            tx.execute(
                "DELETE FROM hive_values
                 WHERE key_path = ?1 OR substr(key_path, 1, length(?2)) = ?2",
                params![rendered, prefix],
            )
            .with_context(|| format!("failed to delete values beneath {rendered}"))?;
            let keys = tx
                .execute(
                    "DELETE FROM hive_keys WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
                    params![rendered, prefix],
                )
                .with_context(|| format!("failed to delete key tree {rendered}"))?;
            keys > 0
        };
        tx.commit().context("failed to commit key deletion")?;
        Ok(removed)
    }

    fn names(&self, sql: &str, path: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare name listing")?;
        let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn read_value(&self, path: &str, name: &str) -> Result<Option<HiveValue>> {
        let row = self
            .conn
            .query_row(
                "SELECT kind, data FROM hive_values WHERE key_path = ?1 AND name = ?2",
                params![path, name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read value {name} under {path}"))?;
        row.map(|(kind, data)| decode_value(&kind, data)).transpose()
    }

    fn write_value(&self, path: &str, name: &str, value: &HiveValue) -> Result<()> {
        let (kind, data) = encode_value(value);
        self.conn
            .execute(
                "INSERT INTO hive_values(key_path, name, kind, data) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key_path, name) DO UPDATE SET kind = excluded.kind, data = excluded.data",
                params![path, name, kind, data],
            )
            .with_context(|| format!("failed to write value {name} under {path}"))?;
        Ok(())
    }
}

impl Hive for SqliteHive {
    fn create_key(&mut self, path: &KeyPath) -> Result<(), HiveError> {
        self.create(path).map_err(backend)
    }

    fn key_exists(&self, path: &KeyPath) -> Result<bool, HiveError> {
        self.exists(&path.to_string()).map_err(backend)
    }

    fn delete_tree(&mut self, path: &KeyPath) -> Result<bool, HiveError> {
        self.delete(path).map_err(backend)
    }

    fn subkey_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError> {
        let rendered = self.require(path)?;
        self.names("SELECT name FROM hive_keys WHERE parent = ?1 ORDER BY name", &rendered)
            .map_err(backend)
    }

    fn value_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError> {
        let rendered = self.require(path)?;
        self.names("SELECT name FROM hive_values WHERE key_path = ?1 ORDER BY name", &rendered)
            .map_err(backend)
    }

    fn value(&self, path: &KeyPath, name: &str) -> Result<Option<HiveValue>, HiveError> {
        let rendered = self.require(path)?;
        self.read_value(&rendered, name).map_err(backend)
    }

    fn set_value(
        &mut self,
        path: &KeyPath,
        name: &str,
        value: HiveValue,
    ) -> Result<(), HiveError> {
        let rendered = self.require(path)?;
        self.write_value(&rendered, name, &value).map_err(backend)
    }

    fn delete_value(&mut self, path: &KeyPath, name: &str) -> Result<bool, HiveError> {
        let rendered = path.to_string();
        let removed = self
            .conn
            .execute(
                "DELETE FROM hive_values WHERE key_path = ?1 AND name = ?2",
                params![rendered, name],
            )
            .with_context(|| format!("failed to delete value {name} under {rendered}"))
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

pub(crate) fn backend(err: anyhow::Error) -> HiveError {
    HiveError::backend(format!("{err:#}"))
}

fn encode_value(value: &HiveValue) -> (&'static str, Vec<u8>) {
    match value {
        HiveValue::Dword(value) => ("dword", value.to_le_bytes().to_vec()),
        HiveValue::Qword(value) => ("qword", value.to_le_bytes().to_vec()),
        HiveValue::Binary(bytes) => ("binary", bytes.clone()),
        HiveValue::String(text) => ("string", text.as_bytes().to_vec()),
    }
}

fn decode_value(kind: &str, data: Vec<u8>) -> Result<HiveValue> {
    match kind {
        "dword" => {
            let raw = <[u8; 4]>::try_from(data.as_slice())
                .map_err(|_| anyhow!("dword value holds {} bytes", data.len()))?;
            Ok(HiveValue::Dword(u32::from_le_bytes(raw)))
        }
        "qword" => {
            let raw = <[u8; 8]>::try_from(data.as_slice())
                .map_err(|_| anyhow!("qword value holds {} bytes", data.len()))?;
            Ok(HiveValue::Qword(u64::from_le_bytes(raw)))
        }
        "binary" => Ok(HiveValue::Binary(data)),
        "string" => String::from_utf8(data)
            .map(HiveValue::String)
            .context("string value is not valid UTF-8"),
        other => Err(anyhow!("unknown value kind {other}")),
    }
}
