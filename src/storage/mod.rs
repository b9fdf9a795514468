//! Persistence: the storage contract and the shared write machinery.
//!
//! A storage accepts a configuration section, connects, performs one full
//! synchronous load into the in-memory scopes, queues every subsequent
//! durable write, and shuts down cleanly. Writes travel as
//! [`SerializedVariable`] records through an unbounded channel drained by
//! one background writer thread per storage; shutdown is cooperative via a
//! closed flag, and close joins the thread after the queue drains.

pub(crate) mod sql;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "mysql-backend")]
mod mysql;

pub use sql::{SqlDialect, SqlStorage, StorageRow};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDialect;

#[cfg(feature = "mysql-backend")]
pub use self::mysql::MySqlDialect;

use crate::serialize::TypeRegistry;
use crate::value::Value;
use crate::Result;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Maximum variable name length persisted without a truncation warning.
pub const MAX_NAME_LENGTH: usize = 380;

/// Maximum serializer identifier length persisted without a warning.
pub const MAX_TYPE_ID_LENGTH: usize = 50;

/// Maximum serialized payload size persisted without a warning.
pub const MAX_VALUE_SIZE: usize = 10_000;

/// One persisted variable record. A `None` type and payload is a logical
/// delete.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedVariable {
    /// Flattened variable name (`a::b::c`).
    pub name: String,

    /// Identifier of the serializer that produced the payload.
    pub type_id: Option<String>,

    /// Serialized payload. Cheaply cloneable so one record can fan out.
    pub data: Option<Bytes>,
}

impl SerializedVariable {
    /// A record representing deletion of the named variable.
    pub fn deletion(name: impl Into<String>) -> Self {
        Self { name: name.into(), type_id: None, data: None }
    }

    /// Whether this record is a logical delete.
    pub fn is_delete(&self) -> bool {
        self.type_id.is_none()
    }
}

/// Callback through which storage hands loaded or replayed records back to
/// the engine. `None` means the record was a deletion.
pub type ReplaySink = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// The persistence contract.
///
/// Lifecycle: construct (connect; configuration errors fail construction
/// and the storage is never registered), [`load`](Self::load) once,
/// [`start`](Self::start) the background machinery, then feed writes
/// through the handle from [`queue`](Self::queue) until
/// [`close`](Self::close).
pub trait VariablesStorage: Send + Sync {
    /// The configured name of this storage (used in log messages).
    fn name(&self) -> &str;

    /// Streams every persisted record through `sink`, synchronously.
    /// Records that fail to deserialize are skipped and logged, never
    /// fatal. Returns the number of records loaded.
    fn load(&mut self, sink: &mut dyn FnMut(&str, Option<Value>)) -> Result<usize>;

    /// A cloneable handle through which durable mutations are queued.
    fn queue(&self) -> ChangeQueue;

    /// Spawns the writer thread and, where supported and configured, the
    /// monitor and commit threads. `replay` receives changes written by
    /// other processes.
    fn start(&mut self, replay: ReplaySink) -> Result<()>;

    /// Drains the write queue, stops and joins all background threads,
    /// and closes the connection.
    fn close(&mut self) -> Result<()>;
}

/// Cloneable handle queueing durable mutations to one storage.
///
/// Serialization happens on the caller's thread (so the value need not be
/// `Send`); the SQL round-trip happens on the storage's writer thread.
/// Values exceeding the size ceilings are still written — the ceilings are
/// soft limits that warn, not reject.
#[derive(Clone)]
pub struct ChangeQueue {
    storage_name: Arc<str>,
    registry: Arc<TypeRegistry>,
    tx: Sender<SerializedVariable>,
}

impl ChangeQueue {
    pub(crate) fn new(
        storage_name: Arc<str>,
        registry: Arc<TypeRegistry>,
        tx: Sender<SerializedVariable>,
    ) -> Self {
        Self { storage_name, registry, tx }
    }

    /// Queues a write (`Some`) or deletion (`None`) of the named variable.
    pub fn push(&self, name: &str, value: Option<&Value>) {
        let record = match value {
            None => SerializedVariable::deletion(name),
            Some(value) => match self.registry.serialize(value) {
                Ok((type_id, data)) => SerializedVariable {
                    name: name.to_string(),
                    type_id: Some(type_id.to_string()),
                    data: Some(data),
                },
                Err(e) => {
                    log::error!(
                        "[{}] cannot serialize variable '{}': {}",
                        self.storage_name,
                        name,
                        e
                    );
                    return;
                }
            },
        };
        self.warn_ceilings(&record);
        // The receiver only disappears once the storage is closed; late
        // writes are dropped.
        if self.tx.send(record).is_err() {
            log::warn!("[{}] dropping write to closed storage", self.storage_name);
        }
    }

    fn warn_ceilings(&self, record: &SerializedVariable) {
        if record.name.len() > MAX_NAME_LENGTH {
            log::warn!(
                "[{}] variable name '{}' is {} characters long (limit {}); it may be truncated by the database",
                self.storage_name,
                record.name,
                record.name.len(),
                MAX_NAME_LENGTH
            );
        }
        if let Some(type_id) = &record.type_id {
            if type_id.len() > MAX_TYPE_ID_LENGTH {
                log::warn!(
                    "[{}] type id '{}' exceeds {} characters; it may be truncated by the database",
                    self.storage_name,
                    type_id,
                    MAX_TYPE_ID_LENGTH
                );
            }
        }
        if let Some(data) = &record.data {
            if data.len() > MAX_VALUE_SIZE {
                log::warn!(
                    "[{}] value of '{}' is {} bytes (limit {}); it may be truncated by the database",
                    self.storage_name,
                    record.name,
                    data.len(),
                    MAX_VALUE_SIZE
                );
            }
        }
    }
}

/// How long blocking loops wait between checks of their closed flag.
pub(crate) const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// The background writer thread: drains queued records into a write
/// function until the storage closes, then finishes whatever is left in
/// the queue before exiting.
pub(crate) struct WriteWorker {
    handle: Option<JoinHandle<()>>,
}

impl WriteWorker {
    pub(crate) fn spawn(
        storage_name: String,
        rx: Receiver<SerializedVariable>,
        closed: Arc<AtomicBool>,
        mut write: impl FnMut(&SerializedVariable) + Send + 'static,
    ) -> Self {
        let handle = std::thread::Builder::new()
            .name(format!("varstore-write-{}", storage_name))
            .spawn(move || loop {
                match rx.recv_timeout(SHUTDOWN_POLL) {
                    Ok(record) => write(&record),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if closed.load(Ordering::SeqCst) && rx.is_empty() {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawning writer thread");
        Self { handle: Some(handle) }
    }

    /// Joins the thread. The closed flag must already be set.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("storage writer thread panicked");
            }
        }
    }
}

/// Sleeps for `total`, waking early if `closed` is set. Returns `true` if
/// the sleep completed, `false` if it was cut short by shutdown.
pub(crate) fn sleep_unless_closed(closed: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if closed.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(SHUTDOWN_POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !closed.load(Ordering::SeqCst)
}
