//! The networked backend, over MySQL.
//!
//! Multiple processes may share one database, so this dialect carries the
//! full monitor surface: an auto-increment `rowid` cursor column, a
//! changes-since select, and tombstone rows for deletions (cleaned up by
//! the monitor once every poller has had a chance to observe them).
//! Connections come from the client library's pool; statements are
//! prepared through the connection's statement cache, so rebuilding them
//! means fetching a fresh connection on the assumption the old one died.

use crate::config::StorageOptions;
use crate::storage::sql::{check_table_name, SqlDialect, StorageRow};
use crate::storage::SerializedVariable;
use crate::{Error, Result};
use mysql::prelude::Queryable;
use mysql::{OptsBuilder, Pool, PooledConn};

struct Statements {
    write: String,
    delete: String,
    monitor: String,
    cleanup: String,
}

/// MySQL dialect for [`SqlStorage`](crate::storage::SqlStorage).
pub struct MySqlDialect {
    pool: Option<Pool>,
    conn: Option<PooledConn>,
    statements: Option<Statements>,
    table: String,
    batching: bool,
    /// Deletions are kept as tombstone rows only when another process may
    /// be polling for them.
    monitored: bool,
}

impl MySqlDialect {
    /// Creates an unconnected dialect.
    pub fn new() -> Self {
        Self {
            pool: None,
            conn: None,
            statements: None,
            table: String::new(),
            batching: false,
            monitored: false,
        }
    }

    fn conn(&mut self) -> Result<&mut PooledConn> {
        self.conn.as_mut().ok_or_else(|| Error::invalid_state("mysql backend not connected"))
    }

    fn statements(&self) -> Result<&Statements> {
        self.statements
            .as_ref()
            .ok_or_else(|| Error::invalid_state("mysql statements not prepared"))
    }
}

impl Default for MySqlDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDialect for MySqlDialect {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    fn connect(&mut self, options: &StorageOptions) -> Result<()> {
        options.validate_network()?;
        check_table_name(&options.table)?;
        let opts = OptsBuilder::new()
            .ip_or_hostname(options.host.clone())
            .tcp_port(options.port)
            .user(options.user.clone())
            .pass(options.password.clone())
            .db_name(options.database.clone());
        let pool = Pool::new(opts)?;
        self.conn = Some(pool.get_conn()?);
        self.pool = Some(pool);
        self.table = options.table.clone();
        self.batching = options.commit_interval.is_some();
        self.monitored = options.monitor_interval.is_some();
        Ok(())
    }

    fn create_table(&mut self) -> Result<()> {
        let table = self.table.clone();
        self.conn()?.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                rowid BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(380) NOT NULL UNIQUE,
                type VARCHAR(50),
                value BLOB
            )",
            table
        ))?;
        Ok(())
    }

    fn prepare_statements(&mut self) -> Result<()> {
        // A fresh connection; after an error the old one may be dead. Its
        // statement cache prepares each statement on first use.
        if let Some(pool) = &self.pool {
            self.conn = Some(pool.get_conn()?);
        }
        let table = &self.table;
        self.statements = Some(Statements {
            write: format!("REPLACE INTO {} (name, type, value) VALUES (?, ?, ?)", table),
            delete: format!("DELETE FROM {} WHERE name = ?", table),
            monitor: format!(
                "SELECT name, type, value, rowid FROM {} WHERE rowid > ? ORDER BY rowid",
                table
            ),
            cleanup: format!("DELETE FROM {} WHERE type IS NULL AND rowid < ?", table),
        });
        if self.batching {
            self.begin_batch()?;
        }
        Ok(())
    }

    fn write(&mut self, record: &SerializedVariable) -> Result<()> {
        if record.is_delete() && !self.monitored {
            let sql = self.statements()?.delete.clone();
            self.conn()?.exec_drop(sql, (record.name.as_str(),))?;
        } else {
            // A REPLACE assigns a fresh rowid even on overwrite, which is
            // what moves the monitor cursor in other processes. A deletion
            // on a monitored backend becomes a NULL-typed tombstone row.
            let sql = self.statements()?.write.clone();
            self.conn()?.exec_drop(
                sql,
                (
                    record.name.as_str(),
                    record.type_id.as_deref(),
                    record.data.as_ref().map(|d| d.to_vec()),
                ),
            )?;
        }
        Ok(())
    }

    fn load_all(&mut self, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
        let table = self.table.clone();
        let rows: Vec<(String, Option<String>, Option<Vec<u8>>, u64)> = self
            .conn()?
            .query(format!("SELECT name, type, value, rowid FROM {}", table))?;
        let mut max = 0u64;
        for (name, type_id, data, rowid) in rows {
            max = max.max(rowid);
            row(StorageRow { name, type_id, data, rowid });
        }
        Ok(max)
    }

    fn monitors(&self) -> bool {
        true
    }

    fn changes_since(&mut self, cursor: u64, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
        let sql = self.statements()?.monitor.clone();
        let rows: Vec<(String, Option<String>, Option<Vec<u8>>, u64)> =
            self.conn()?.exec(sql, (cursor,))?;
        let mut max = cursor;
        for (name, type_id, data, rowid) in rows {
            max = max.max(rowid);
            row(StorageRow { name, type_id, data, rowid });
        }
        Ok(max)
    }

    fn cleanup_tombstones(&mut self, cursor: u64) -> Result<()> {
        let sql = self.statements()?.cleanup.clone();
        self.conn()?.exec_drop(sql, (cursor,))?;
        Ok(())
    }

    fn begin_batch(&mut self) -> Result<()> {
        self.conn()?.query_drop("SET autocommit = 0")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn()?.query_drop("COMMIT")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.batching {
            if let Ok(conn) = self.conn() {
                if let Err(e) = conn.query_drop("COMMIT") {
                    log::debug!("closing commit failed: {}", e);
                }
            }
        }
        self.statements = None;
        self.conn = None;
        self.pool = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSection;

    #[test]
    fn test_missing_connection_options_fail() {
        let section = ConfigSection::new().with("host", "db.example.com");
        let options = StorageOptions::from_section(&section).unwrap();
        let mut dialect = MySqlDialect::new();
        // user and database are missing: fails before any network activity
        assert!(matches!(dialect.connect(&options), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_table_name_rejected() {
        let section = ConfigSection::new()
            .with("host", "db.example.com")
            .with("user", "vars")
            .with("database", "game")
            .with("table", "vars`; --");
        let options = StorageOptions::from_section(&section).unwrap();
        let mut dialect = MySqlDialect::new();
        assert!(matches!(dialect.connect(&options), Err(Error::Config(_))));
    }

    #[test]
    fn test_supports_monitoring() {
        assert!(MySqlDialect::new().monitors());
    }

    #[test]
    fn test_unconnected_operations_fail_cleanly() {
        let mut dialect = MySqlDialect::new();
        assert!(dialect.create_table().is_err());
        assert!(dialect.write(&SerializedVariable::deletion("x")).is_err());
        assert!(dialect.close().is_ok());
    }
}
