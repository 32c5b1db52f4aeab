// src/lib.rs
pub mod config;
pub mod drivers;
pub mod error;
pub mod ingest;
pub mod monitor;
pub mod recorder;
pub mod session;
pub mod store;
pub mod types;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::DeviceSession;
