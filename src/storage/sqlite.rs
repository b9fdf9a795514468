//! The embedded single-file backend, over SQLite.
//!
//! A single embedded instance assumes no concurrent external writer, so
//! this dialect has no monitor queries and deletions are physical row
//! deletes rather than tombstones.

use crate::config::StorageOptions;
use crate::storage::sql::{check_table_name, SqlDialect, StorageRow};
use crate::storage::SerializedVariable;
use crate::{Error, Result};
use rusqlite::{params, Connection};

/// SQLite dialect for [`SqlStorage`](crate::storage::SqlStorage).
pub struct SqliteDialect {
    conn: Option<Connection>,
    table: String,
    batching: bool,
}

impl SqliteDialect {
    /// Creates an unconnected dialect.
    pub fn new() -> Self {
        Self { conn: None, table: String::new(), batching: false }
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or_else(|| Error::invalid_state("sqlite backend not connected"))
    }
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDialect for SqliteDialect {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&mut self, options: &StorageOptions) -> Result<()> {
        options.validate_file()?;
        check_table_name(&options.table)?;
        let file = options.file.clone().expect("validated above");
        let conn = Connection::open(&file)?;
        self.conn = Some(conn);
        self.table = options.table.clone();
        self.batching = options.commit_interval.is_some();
        Ok(())
    }

    fn create_table(&mut self) -> Result<()> {
        self.conn()?.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name VARCHAR(380) NOT NULL PRIMARY KEY,
                type VARCHAR(50),
                value BLOB
            )",
            self.table
        ))?;
        Ok(())
    }

    fn prepare_statements(&mut self) -> Result<()> {
        // Statements are prepared through the connection's statement cache;
        // rebuilding them means discarding that cache.
        self.conn()?.flush_prepared_statement_cache();
        Ok(())
    }

    fn write(&mut self, record: &SerializedVariable) -> Result<()> {
        let conn = self.conn()?;
        if record.is_delete() {
            let mut stmt =
                conn.prepare_cached(&format!("DELETE FROM {} WHERE name = ?1", self.table))?;
            stmt.execute(params![record.name])?;
        } else {
            let mut stmt = conn.prepare_cached(&format!(
                "REPLACE INTO {} (name, type, value) VALUES (?1, ?2, ?3)",
                self.table
            ))?;
            stmt.execute(params![
                record.name,
                record.type_id,
                record.data.as_ref().map(|d| d.as_ref())
            ])?;
        }
        Ok(())
    }

    fn load_all(&mut self, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!("SELECT name, type, value, rowid FROM {}", self.table))?;
        let mut rows = stmt.query([])?;
        let mut max = 0u64;
        while let Some(r) = rows.next()? {
            let rowid: i64 = r.get(3)?;
            let rowid = rowid.max(0) as u64;
            max = max.max(rowid);
            row(StorageRow {
                name: r.get(0)?,
                type_id: r.get(1)?,
                data: r.get(2)?,
                rowid,
            });
        }
        Ok(max)
    }

    fn begin_batch(&mut self) -> Result<()> {
        self.conn()?.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn()?.execute_batch("COMMIT; BEGIN")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            if self.batching {
                // Close the transaction left open by the last commit.
                if let Err(e) = conn.execute_batch("COMMIT") {
                    log::debug!("closing commit failed (nothing pending): {}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSection;
    use crate::serialize::TypeRegistry;
    use crate::storage::{SqlStorage, VariablesStorage};
    use crate::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file_section(dir: &TempDir) -> ConfigSection {
        ConfigSection::new().with("file", dir.path().join("vars.db").display().to_string())
    }

    fn open(section: &ConfigSection) -> SqlStorage<SqliteDialect> {
        SqlStorage::new(
            "sqlite-test",
            SqliteDialect::new(),
            section,
            Arc::new(TypeRegistry::with_defaults()),
        )
        .unwrap()
    }

    fn load_all(storage: &mut SqlStorage<SqliteDialect>) -> Vec<(String, Option<Value>)> {
        let mut seen = Vec::new();
        storage.load(&mut |name, value| seen.push((name.to_string(), value))).unwrap();
        seen
    }

    #[test]
    fn test_missing_file_option_fails_registration() {
        let result = SqlStorage::new(
            "bad",
            SqliteDialect::new(),
            &ConfigSection::new(),
            Arc::new(TypeRegistry::with_defaults()),
        );
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_bad_table_name_rejected() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir).with("table", "vars; DROP TABLE users");
        let result = SqlStorage::new(
            "bad",
            SqliteDialect::new(),
            &section,
            Arc::new(TypeRegistry::with_defaults()),
        );
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir);

        // First session: write and close
        {
            let mut storage = open(&section);
            storage.start(Arc::new(|_, _| {})).unwrap();
            let queue = storage.queue();
            queue.push("kills::alice", Some(&Value::from(3i64)));
            queue.push("motd", Some(&Value::from("welcome")));
            storage.close().unwrap();
        }

        // Second session: everything comes back
        {
            let mut storage = open(&section);
            let seen = load_all(&mut storage);
            assert_eq!(seen.len(), 2);
            assert!(seen
                .contains(&("kills::alice".to_string(), Some(Value::from(3i64)))));
            assert!(seen.contains(&("motd".to_string(), Some(Value::from("welcome")))));
            storage.close().unwrap();
        }
    }

    #[test]
    fn test_replace_semantics() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir);
        {
            let mut storage = open(&section);
            storage.start(Arc::new(|_, _| {})).unwrap();
            let queue = storage.queue();
            for i in 0..10 {
                queue.push("counter", Some(&Value::from(i as i64)));
            }
            storage.close().unwrap();
        }
        {
            let mut storage = open(&section);
            let seen = load_all(&mut storage);
            assert_eq!(seen, vec![("counter".to_string(), Some(Value::from(9i64)))]);
            storage.close().unwrap();
        }
    }

    #[test]
    fn test_delete_removes_row() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir);
        {
            let mut storage = open(&section);
            storage.start(Arc::new(|_, _| {})).unwrap();
            let queue = storage.queue();
            queue.push("gone", Some(&Value::from(1i64)));
            queue.push("kept", Some(&Value::from(2i64)));
            queue.push("gone", None);
            storage.close().unwrap();
        }
        {
            let mut storage = open(&section);
            let seen = load_all(&mut storage);
            assert_eq!(seen, vec![("kept".to_string(), Some(Value::from(2i64)))]);
            storage.close().unwrap();
        }
    }

    #[test]
    fn test_batched_commit_mode_persists() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir).with("commit changes", "50 ms");
        {
            let mut storage = open(&section);
            storage.start(Arc::new(|_, _| {})).unwrap();
            storage.queue().push("batched", Some(&Value::from(true)));
            storage.close().unwrap();
        }
        {
            let mut storage = open(&section);
            let seen = load_all(&mut storage);
            assert_eq!(seen, vec![("batched".to_string(), Some(Value::from(true)))]);
            storage.close().unwrap();
        }
    }

    #[test]
    fn test_custom_table_name() {
        let dir = TempDir::new().unwrap();
        let section = file_section(&dir).with("table", "custom_vars");
        {
            let mut storage = open(&section);
            storage.start(Arc::new(|_, _| {})).unwrap();
            storage.queue().push("x", Some(&Value::from(1i64)));
            storage.close().unwrap();
        }
        {
            let mut storage = open(&section);
            assert_eq!(load_all(&mut storage).len(), 1);
            storage.close().unwrap();
        }
    }
}
