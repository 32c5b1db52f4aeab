use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::drivers::DriverError;
use crate::store::PersistenceError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to sensor on {port}: {source}")]
    DeviceConnection { port: String, source: DriverError },
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] PersistenceError),
    #[error("no recorded samples between replay markers for device {device_id}")]
    ReplayWindowEmpty { device_id: i64 },
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("device {device_id} already has an open session started at {started_at}")]
    SessionAlreadyOpen {
        device_id: i64,
        started_at: DateTime<Utc>,
    },
    #[error("session is stopped")]
    Stopped,
    #[error("exporting unsaved samples: {0}")]
    Export(#[source] std::io::Error),
}
