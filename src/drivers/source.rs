use std::sync::Arc;

use crate::drivers::DriverError;
use crate::types::RawPacket;

/// Receiver of packets, called on the driver's own thread.
pub type StreamCallback = Arc<dyn Fn(RawPacket) + Send + Sync>;

/// Capability set shared by the serial Shimmer driver and the replay source.
///
/// A session drives either one through this trait only.
pub trait SensorDriver: Send {
    fn initialize(&mut self) -> Result<(), DriverError>;

    /// Battery charge in percent.
    fn get_battery_state(&mut self) -> Result<u8, DriverError>;

    fn get_device_name(&mut self) -> Result<String, DriverError>;

    /// Callbacks must be registered before `start_streaming`.
    fn add_stream_callback(&mut self, callback: StreamCallback);

    fn start_streaming(&mut self) -> Result<(), DriverError>;

    fn stop_streaming(&mut self) -> Result<(), DriverError>;

    /// Stops streaming if needed and releases the underlying resource.
    fn shutdown(&mut self) -> Result<(), DriverError>;

    fn is_initialized(&self) -> bool;
}
