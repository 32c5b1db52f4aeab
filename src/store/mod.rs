// src/store/mod.rs
mod helpers;
mod migrations;
pub mod sqlite;

use thiserror::Error;

use crate::types::{OpenSession, Sample, SessionEvent, StoredSample};

pub use sqlite::SqliteGateway;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage connection already released")]
    Closed,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schema migration failed: {0}")]
    Migration(String),
    #[error("invalid stored value: {0}")]
    InvalidData(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store for devices, samples and session boundary events.
///
/// Implementations must be usable from the ingestion thread and the session
/// owner at the same time.
pub trait PersistenceGateway: Send + Sync {
    /// Inserts or refreshes the descriptor keyed by `name`; returns its stable id.
    fn upsert_device(&self, name: &str, port: &str, battery_percent: u8)
        -> Result<i64, PersistenceError>;

    fn insert_sample(&self, device_id: i64, sample: &Sample) -> Result<(), PersistenceError>;

    fn insert_session_event(&self, event: &SessionEvent) -> Result<(), PersistenceError>;

    /// Most recent session-start of `device_id` with no later session-stop.
    fn find_open_session_start(
        &self,
        device_id: i64,
    ) -> Result<Option<OpenSession>, PersistenceError>;

    /// Samples recorded between the latest replay-start marker of `device_id` and the
    /// first replay-end after it, oldest first. `None` when no such pair exists.
    fn fetch_replay_window(
        &self,
        device_id: i64,
    ) -> Result<Option<Vec<StoredSample>>, PersistenceError>;

    /// Releases the underlying connection. Later calls are no-ops.
    fn close(&self) -> Result<(), PersistenceError>;

    fn is_closed(&self) -> bool;
}
