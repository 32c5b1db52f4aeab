// src/drivers/mod.rs
pub mod buffer;
pub mod calibration;
pub mod error;
pub mod replay;
pub mod shimmer;
pub mod source;

pub use buffer::{BufferedSample, SampleBuffer};
pub use error::{CalibrationDomainError, DriverError};
pub use replay::ReplaySource;
pub use shimmer::ShimmerDriver;
pub use source::{SensorDriver, StreamCallback};
