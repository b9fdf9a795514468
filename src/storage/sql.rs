//! The relational backend base.
//!
//! [`SqlStorage`] owns everything the SQL backends share: the write queue
//! and its writer thread, the initial full load, the monitor thread that
//! polls for rows written by other processes, the commit thread for
//! batched-commit mode, and the rebuild-statements-on-error discipline.
//! The [`SqlDialect`] trait is the seam: concrete backends only provide
//! their DDL, their statements, and their connection handling.
//!
//! Threads shut down cooperatively: a shared closed flag is checked at
//! each loop iteration (never abrupt interruption), so in-flight queries
//! finish cleanly, and `close` joins every thread.

use crate::config::{ConfigSection, StorageOptions};
use crate::serialize::TypeRegistry;
use crate::storage::{
    sleep_unless_closed, ChangeQueue, ReplaySink, SerializedVariable, VariablesStorage,
    WriteWorker,
};
use crate::value::Value;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Extra delay added on top of two monitor intervals before tombstoned
/// rows are cleaned up, so a slow straggler write is not raced.
const CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// Minimum time between "polling cannot keep up" warnings.
const WARN_COOLDOWN: Duration = Duration::from_secs(60);

/// One row read back from a backend.
#[derive(Debug, Clone)]
pub struct StorageRow {
    /// Flattened variable name.
    pub name: String,

    /// Serializer identifier; `None` marks a deletion.
    pub type_id: Option<String>,

    /// Serialized payload.
    pub data: Option<Vec<u8>>,

    /// Monotonically increasing row cursor. Backends without monitoring
    /// report 0.
    pub rowid: u64,
}

/// The dialect seam implemented by each concrete backend.
///
/// Implementations hold the connection (or pool) and the prepared
/// statements. After any SQL error the base rebuilds statements via
/// [`prepare_statements`](Self::prepare_statements), assuming the
/// connection rotated underneath them.
pub trait SqlDialect: Send + 'static {
    /// Short backend name for log messages.
    fn backend(&self) -> &'static str;

    /// Validates the options and opens the connection (or pool).
    fn connect(&mut self, options: &StorageOptions) -> Result<()>;

    /// Issues the dialect's `CREATE TABLE IF NOT EXISTS`.
    fn create_table(&mut self) -> Result<()>;

    /// (Re)builds the prepared statements.
    fn prepare_statements(&mut self) -> Result<()>;

    /// Writes one record: the delete statement for a logical delete, the
    /// upsert otherwise. Monitored backends keep deletions as tombstone
    /// rows so other processes can observe them.
    fn write(&mut self, record: &SerializedVariable) -> Result<()>;

    /// Streams every row, returning the highest cursor seen (0 if the
    /// backend has no cursor column).
    fn load_all(&mut self, row: &mut dyn FnMut(StorageRow)) -> Result<u64>;

    /// Whether this backend supports cross-process change monitoring.
    /// Embedded single-instance backends answer `false` — they assume no
    /// concurrent external writer.
    fn monitors(&self) -> bool {
        false
    }

    /// Streams rows whose cursor exceeds `cursor`, returning the new
    /// highest cursor (at least `cursor`).
    fn changes_since(&mut self, cursor: u64, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
        let _ = (cursor, row);
        Err(Error::invalid_state("this backend does not monitor changes"))
    }

    /// Removes fully-deleted rows older than `cursor`.
    fn cleanup_tombstones(&mut self, cursor: u64) -> Result<()> {
        let _ = cursor;
        Err(Error::invalid_state("this backend does not monitor changes"))
    }

    /// Switches the connection from autocommit into batched-commit mode.
    fn begin_batch(&mut self) -> Result<()>;

    /// Commits the pending transaction (batched-commit mode only).
    fn commit(&mut self) -> Result<()>;

    /// Closes the connection.
    fn close(&mut self) -> Result<()>;
}

/// A storage over one [`SqlDialect`].
pub struct SqlStorage<D: SqlDialect> {
    name: Arc<str>,
    options: StorageOptions,
    registry: Arc<TypeRegistry>,
    dialect: Arc<Mutex<D>>,
    closed: Arc<AtomicBool>,
    cursor: Arc<AtomicU64>,
    tx: Sender<SerializedVariable>,
    rx: Option<Receiver<SerializedVariable>>,
    writer: Option<WriteWorker>,
    monitor: Option<JoinHandle<()>>,
    committer: Option<JoinHandle<()>>,
}

impl<D: SqlDialect> SqlStorage<D> {
    /// Connects the dialect and prepares it for use. A configuration or
    /// connection error fails construction — the storage is then simply
    /// not registered.
    pub fn new(
        name: impl Into<String>,
        mut dialect: D,
        section: &ConfigSection,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let options = StorageOptions::from_section(section)?;
        dialect.connect(&options)?;
        dialect.create_table()?;
        dialect.prepare_statements()?;
        if options.commit_interval.is_some() {
            dialect.begin_batch()?;
        }
        log::info!("[{}] connected ({} backend)", name, dialect.backend());

        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(Self {
            name,
            options,
            registry,
            dialect: Arc::new(Mutex::new(dialect)),
            closed: Arc::new(AtomicBool::new(false)),
            cursor: Arc::new(AtomicU64::new(0)),
            tx,
            rx: Some(rx),
            writer: None,
            monitor: None,
            committer: None,
        })
    }

    /// The cursor after which the monitor looks for new rows.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    fn spawn_monitor(&self, interval: Duration, replay: ReplaySink) -> JoinHandle<()> {
        let name = Arc::clone(&self.name);
        let dialect = Arc::clone(&self.dialect);
        let registry = Arc::clone(&self.registry);
        let closed = Arc::clone(&self.closed);
        let cursor = Arc::clone(&self.cursor);
        std::thread::Builder::new()
            .name(format!("varstore-monitor-{}", name))
            .spawn(move || {
                monitor_loop(name, dialect, registry, closed, cursor, interval, replay)
            })
            .expect("spawning monitor thread")
    }

    fn spawn_committer(&self, delay: Duration) -> JoinHandle<()> {
        let name = Arc::clone(&self.name);
        let dialect = Arc::clone(&self.dialect);
        let closed = Arc::clone(&self.closed);
        std::thread::Builder::new()
            .name(format!("varstore-commit-{}", name))
            .spawn(move || loop {
                if !sleep_unless_closed(&closed, delay) {
                    break;
                }
                if let Err(e) = dialect.lock().commit() {
                    // The pool reconnects on next use; nothing to do here.
                    log::error!("[{}] periodic commit failed: {}", name, e);
                }
            })
            .expect("spawning commit thread")
    }
}

impl<D: SqlDialect> VariablesStorage for SqlStorage<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, sink: &mut dyn FnMut(&str, Option<Value>)) -> Result<usize> {
        let mut count = 0usize;
        let registry = Arc::clone(&self.registry);
        let name = Arc::clone(&self.name);
        let max = self.dialect.lock().load_all(&mut |row| {
            if let Some(value) = decode_row(&registry, &name, &row) {
                sink(&row.name, value);
                count += 1;
            }
        })?;
        self.cursor.store(max, Ordering::SeqCst);
        log::info!("[{}] loaded {} variables", self.name, count);
        Ok(count)
    }

    fn queue(&self) -> ChangeQueue {
        ChangeQueue::new(Arc::clone(&self.name), Arc::clone(&self.registry), self.tx.clone())
    }

    fn start(&mut self, replay: ReplaySink) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::invalid_state("storage already started"))?;

        let name = Arc::clone(&self.name);
        let dialect = Arc::clone(&self.dialect);
        self.writer = Some(WriteWorker::spawn(
            name.to_string(),
            rx,
            Arc::clone(&self.closed),
            move |record| {
                let mut guard = dialect.lock();
                if let Err(e) = guard.write(record) {
                    log::error!("[{}] failed to save variable '{}': {}", name, record.name, e);
                    if let Err(e) = guard.prepare_statements() {
                        log::error!("[{}] failed to rebuild prepared statements: {}", name, e);
                    }
                }
            },
        ));

        let monitors = self.dialect.lock().monitors();
        if let (true, Some(interval)) = (monitors, self.options.monitor_interval) {
            self.monitor = Some(self.spawn_monitor(interval, replay));
        }
        if let Some(delay) = self.options.commit_interval {
            self.committer = Some(self.spawn_committer(delay));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(writer) = &mut self.writer {
            writer.join();
        }
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                log::error!("[{}] monitor thread panicked", self.name);
            }
        }
        if let Some(handle) = self.committer.take() {
            if handle.join().is_err() {
                log::error!("[{}] commit thread panicked", self.name);
            }
        }
        let mut dialect = self.dialect.lock();
        if self.options.commit_interval.is_some() {
            if let Err(e) = dialect.commit() {
                log::error!("[{}] final commit failed: {}", self.name, e);
            }
        }
        dialect.close()?;
        log::info!("[{}] closed", self.name);
        Ok(())
    }
}

/// Table names are spliced into SQL text (identifiers cannot be bound),
/// so anything beyond plain identifier characters is rejected outright.
pub(crate) fn check_table_name(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && table.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(Error::config(format!("invalid table name '{}'", table)))
    }
}

/// Decodes one row through the registry. `Some(None)` is a deletion
/// marker; `None` means the row was skipped (unknown type or corrupt
/// payload) — skipped only from the in-memory view, never removed from
/// the database.
fn decode_row(registry: &TypeRegistry, storage: &str, row: &StorageRow) -> Option<Option<Value>> {
    let type_id = match &row.type_id {
        None => return Some(None),
        Some(type_id) => type_id,
    };
    let data = match &row.data {
        None => {
            log::error!("[{}] variable '{}' has type '{}' but no payload; skipping", storage, row.name, type_id);
            return None;
        }
        Some(data) => data,
    };
    match registry.deserialize(type_id, data) {
        Ok(value) => Some(Some(value)),
        Err(e) => {
            log::error!("[{}] cannot load variable '{}': {}", storage, row.name, e);
            None
        }
    }
}

fn monitor_loop<D: SqlDialect>(
    name: Arc<str>,
    dialect: Arc<Mutex<D>>,
    registry: Arc<TypeRegistry>,
    closed: Arc<AtomicBool>,
    cursor: Arc<AtomicU64>,
    interval: Duration,
    replay: ReplaySink,
) {
    let mut cleanups: Vec<(Instant, u64)> = Vec::new();
    let mut last_warn: Option<Instant> = None;
    loop {
        if !sleep_unless_closed(&closed, interval) {
            break;
        }
        let started = Instant::now();
        let seen = cursor.load(Ordering::SeqCst);
        let mut rows = Vec::new();
        let polled = dialect.lock().changes_since(seen, &mut |row| rows.push(row));
        match polled {
            Ok(new_cursor) => {
                for row in &rows {
                    if let Some(value) = decode_row(&registry, &name, row) {
                        replay(&row.name, value);
                    }
                }
                if new_cursor > seen {
                    cursor.store(new_cursor, Ordering::SeqCst);
                    // Tombstones older than this cursor may be dropped once
                    // every poller has had a chance to observe them.
                    cleanups.push((started + interval * 2 + CLEANUP_GRACE, new_cursor));
                }
            }
            Err(e) => {
                let mut guard = dialect.lock();
                log::error!("[{}] change poll failed: {}", name, e);
                if let Err(e) = guard.prepare_statements() {
                    log::error!("[{}] failed to rebuild prepared statements: {}", name, e);
                }
            }
        }

        let now = Instant::now();
        while cleanups.first().is_some_and(|(due, _)| *due <= now) {
            let (_, old_cursor) = cleanups.remove(0);
            if let Err(e) = dialect.lock().cleanup_tombstones(old_cursor) {
                log::error!("[{}] tombstone cleanup failed: {}", name, e);
            }
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            let due = last_warn.is_none_or(|t| t.elapsed() >= WARN_COOLDOWN);
            if due {
                log::warn!(
                    "[{}] processing changes took {}ms, longer than the {}ms monitor interval; the database cannot keep up",
                    name,
                    elapsed.as_millis(),
                    interval.as_millis()
                );
                last_warn = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Shared in-memory "database server" driving the base machinery in
    /// tests. Two dialects sharing one server emulate two processes
    /// sharing one database.
    #[derive(Default)]
    pub(crate) struct MemServer {
        pub rows: BTreeMap<String, (Option<String>, Option<Vec<u8>>, u64)>,
        pub next_rowid: u64,
        pub commits: usize,
        pub prepare_calls: usize,
    }

    pub(crate) type SharedServer = Arc<Mutex<MemServer>>;

    pub(crate) struct MemoryDialect {
        pub server: SharedServer,
        pub monitoring: bool,
        pub fail_writes: Arc<AtomicUsize>,
    }

    impl MemoryDialect {
        pub(crate) fn new(server: SharedServer, monitoring: bool) -> Self {
            Self { server, monitoring, fail_writes: Arc::new(AtomicUsize::new(0)) }
        }
    }

    impl SqlDialect for MemoryDialect {
        fn backend(&self) -> &'static str {
            "memory"
        }

        fn connect(&mut self, _options: &StorageOptions) -> Result<()> {
            Ok(())
        }

        fn create_table(&mut self) -> Result<()> {
            Ok(())
        }

        fn prepare_statements(&mut self) -> Result<()> {
            self.server.lock().prepare_calls += 1;
            Ok(())
        }

        fn write(&mut self, record: &SerializedVariable) -> Result<()> {
            if self
                .fail_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::database("injected write failure"));
            }
            let mut server = self.server.lock();
            server.next_rowid += 1;
            let rowid = server.next_rowid;
            if record.is_delete() && !self.monitoring {
                server.rows.remove(&record.name);
            } else {
                server.rows.insert(
                    record.name.clone(),
                    (
                        record.type_id.clone(),
                        record.data.as_ref().map(|d| d.to_vec()),
                        rowid,
                    ),
                );
            }
            Ok(())
        }

        fn load_all(&mut self, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
            let server = self.server.lock();
            let mut max = 0;
            for (name, (type_id, data, rowid)) in &server.rows {
                max = max.max(*rowid);
                row(StorageRow {
                    name: name.clone(),
                    type_id: type_id.clone(),
                    data: data.clone(),
                    rowid: *rowid,
                });
            }
            Ok(max)
        }

        fn monitors(&self) -> bool {
            self.monitoring
        }

        fn changes_since(&mut self, cursor: u64, row: &mut dyn FnMut(StorageRow)) -> Result<u64> {
            let server = self.server.lock();
            let mut max = cursor;
            for (name, (type_id, data, rowid)) in &server.rows {
                if *rowid > cursor {
                    max = max.max(*rowid);
                    row(StorageRow {
                        name: name.clone(),
                        type_id: type_id.clone(),
                        data: data.clone(),
                        rowid: *rowid,
                    });
                }
            }
            Ok(max)
        }

        fn cleanup_tombstones(&mut self, cursor: u64) -> Result<()> {
            let mut server = self.server.lock();
            server.rows.retain(|_, (type_id, _, rowid)| {
                type_id.is_some() || *rowid >= cursor
            });
            Ok(())
        }

        fn begin_batch(&mut self) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.server.lock().commits += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn noop_replay() -> ReplaySink {
        Arc::new(|_, _| {})
    }

    fn new_storage(
        server: &SharedServer,
        monitoring: bool,
        section: &ConfigSection,
    ) -> SqlStorage<MemoryDialect> {
        SqlStorage::new(
            "test",
            MemoryDialect::new(Arc::clone(server), monitoring),
            section,
            Arc::new(TypeRegistry::with_defaults()),
        )
        .unwrap()
    }

    #[test]
    fn test_queued_writes_reach_backend_on_close() {
        let server: SharedServer = Arc::default();
        let mut storage = new_storage(&server, false, &ConfigSection::new());
        storage.start(noop_replay()).unwrap();

        let queue = storage.queue();
        for i in 0..20 {
            queue.push(&format!("v::{}", i), Some(&Value::from(i as i64)));
        }
        storage.close().unwrap();

        let server = server.lock();
        assert_eq!(server.rows.len(), 20);
        assert_eq!(server.rows.get("v::7").unwrap().0.as_deref(), Some("long"));
    }

    #[test]
    fn test_unmonitored_delete_is_physical() {
        let server: SharedServer = Arc::default();
        let mut storage = new_storage(&server, false, &ConfigSection::new());
        storage.start(noop_replay()).unwrap();

        let queue = storage.queue();
        queue.push("x", Some(&Value::from(1i64)));
        queue.push("x", None);
        storage.close().unwrap();

        assert!(server.lock().rows.is_empty());
    }

    #[test]
    fn test_load_skips_undecodable_rows() {
        let server: SharedServer = Arc::default();
        {
            let registry = TypeRegistry::with_defaults();
            let (type_id, data) = registry.serialize(&Value::from(5i64)).unwrap();
            let mut guard = server.lock();
            guard.rows.insert(
                "good".into(),
                (Some(type_id.to_string()), Some(data.to_vec()), 1),
            );
            guard.rows.insert("unknown".into(), (Some("vector3".into()), Some(vec![1]), 2));
            guard.rows.insert("corrupt".into(), (Some("string".into()), Some(vec![]), 3));
            guard.rows.insert("tombstone".into(), (None, None, 4));
            guard.next_rowid = 4;
        }

        let mut storage = new_storage(&server, true, &ConfigSection::new());
        let mut seen = Vec::new();
        let count = storage
            .load(&mut |name, value| seen.push((name.to_string(), value)))
            .unwrap();

        // The good row and the deletion marker arrive; the broken rows are
        // skipped from the in-memory view only.
        assert_eq!(count, 2);
        assert!(seen.contains(&("good".to_string(), Some(Value::from(5i64)))));
        assert!(seen.contains(&("tombstone".to_string(), None)));
        // The monitor resumes after everything the load observed.
        assert_eq!(storage.cursor(), 4);
        assert_eq!(server.lock().rows.len(), 4);
        storage.close().unwrap();
    }

    #[test]
    fn test_monitor_replays_writes_from_other_process() {
        let server: SharedServer = Arc::default();
        let section = ConfigSection::new().with("monitor interval", "50 ms");

        let mut writer_storage = new_storage(&server, true, &section);
        writer_storage.start(noop_replay()).unwrap();

        let mut reader_storage = new_storage(&server, true, &section);
        reader_storage.load(&mut |_, _| {}).unwrap();
        let seen: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reader_storage
            .start(Arc::new(move |name, value| {
                sink.lock().push((name.to_string(), value));
            }))
            .unwrap();

        // "Process A" writes; "process B" must observe it within a couple
        // of monitor intervals.
        writer_storage.queue().push("shared", Some(&Value::from(9i64)));
        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().contains(&("shared".to_string(), Some(Value::from(9i64))))
        }));

        // A deletes; B observes the tombstone, and the tombstone row is
        // still in the database because the cleanup grace has not passed.
        writer_storage.queue().push("shared", None);
        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().contains(&("shared".to_string(), None))
        }));
        {
            let guard = server.lock();
            let row = guard.rows.get("shared").expect("tombstone row still present");
            assert!(row.0.is_none());
        }

        writer_storage.close().unwrap();
        reader_storage.close().unwrap();
    }

    #[test]
    fn test_write_failure_rebuilds_statements() {
        let server: SharedServer = Arc::default();
        let dialect = MemoryDialect::new(Arc::clone(&server), false);
        dialect.fail_writes.store(1, Ordering::SeqCst);
        let mut storage = SqlStorage::new(
            "test",
            dialect,
            &ConfigSection::new(),
            Arc::new(TypeRegistry::with_defaults()),
        )
        .unwrap();
        let prepares_before = server.lock().prepare_calls;
        storage.start(noop_replay()).unwrap();

        let queue = storage.queue();
        queue.push("lost", Some(&Value::from(1i64)));
        queue.push("kept", Some(&Value::from(2i64)));
        storage.close().unwrap();

        let server = server.lock();
        // The failed write is not retried inline, but the statements were
        // rebuilt and the next write went through.
        assert!(server.prepare_calls > prepares_before);
        assert!(!server.rows.contains_key("lost"));
        assert!(server.rows.contains_key("kept"));
    }

    #[test]
    fn test_commit_thread_commits_periodically() {
        let server: SharedServer = Arc::default();
        let section = ConfigSection::new().with("commit changes", "50 ms");
        let mut storage = new_storage(&server, false, &section);
        storage.start(noop_replay()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || server.lock().commits >= 3));
        storage.close().unwrap();
    }

    #[test]
    fn test_monitor_interval_without_support_is_ignored() {
        let server: SharedServer = Arc::default();
        let section = ConfigSection::new().with("monitor interval", "50 ms");
        // monitoring = false: the dialect has no monitor queries, so no
        // monitor thread starts even though an interval is configured.
        let mut storage = new_storage(&server, false, &section);
        storage.start(noop_replay()).unwrap();
        assert!(storage.monitor.is_none());
        storage.close().unwrap();
    }

    #[test]
    fn test_double_start_fails() {
        let server: SharedServer = Arc::default();
        let mut storage = new_storage(&server, false, &ConfigSection::new());
        storage.start(noop_replay()).unwrap();
        assert!(storage.start(noop_replay()).is_err());
        storage.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let server: SharedServer = Arc::default();
        let mut storage = new_storage(&server, false, &ConfigSection::new());
        storage.start(noop_replay()).unwrap();
        storage.close().unwrap();
        storage.close().unwrap();
    }
}
