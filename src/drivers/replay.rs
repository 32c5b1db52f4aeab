use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::{DriverError, SensorDriver, StreamCallback};
use crate::error::SessionError;
use crate::store::PersistenceGateway;
use crate::types::{RawPacket, StoredSample};

pub const SIMULATED_DEVICE_NAME: &str = "Simulated Shimmer";

/// Device id whose replay markers delimit the recording to play back.
pub const REPLAY_DEVICE_ID: i64 = 3;

pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_millis(250);

/// Plays a recorded window back through the stream callbacks, one sample per tick.
///
/// Stands in for the hardware driver when no sensor is reachable. The window is
/// played once; a stream that is stopped and started again resumes where it
/// left off and never repeats a sample.
pub struct ReplaySource {
    name: String,
    window: Arc<Vec<RawPacket>>,
    interval: Duration,
    callbacks: Vec<StreamCallback>,
    cursor: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    initialized: bool,
}

impl ReplaySource {
    /// Loads the most recent window marked for `device_id`.
    pub fn load(
        store: &dyn PersistenceGateway,
        device_id: i64,
        interval: Duration,
    ) -> Result<Self, SessionError> {
        let window = store
            .fetch_replay_window(device_id)?
            .filter(|samples| !samples.is_empty())
            .ok_or(SessionError::ReplayWindowEmpty { device_id })?;
        info!(
            "loaded {} recorded samples for replay (device {device_id})",
            window.len()
        );
        let packets = window.iter().map(StoredSample::to_packet).collect();
        Ok(Self::from_packets(packets, interval))
    }

    pub fn from_packets(packets: Vec<RawPacket>, interval: Duration) -> Self {
        Self {
            name: SIMULATED_DEVICE_NAME.to_string(),
            window: Arc::new(packets),
            interval,
            callbacks: Vec::new(),
            cursor: Arc::new(AtomicUsize::new(0)),
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
            initialized: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of samples handed to the callbacks so far.
    pub fn emitted(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.emitted() >= self.window.len()
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("replay worker panicked");
            }
        }
    }
}

impl SensorDriver for ReplaySource {
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = true;
        Ok(())
    }

    fn get_battery_state(&mut self) -> Result<u8, DriverError> {
        Ok(0)
    }

    fn get_device_name(&mut self) -> Result<String, DriverError> {
        Ok(self.name.clone())
    }

    fn add_stream_callback(&mut self, callback: StreamCallback) {
        self.callbacks.push(callback);
    }

    fn start_streaming(&mut self) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if let Some(handle) = &self.worker {
            if !self.cancel.load(Ordering::SeqCst) && !handle.is_finished() {
                return Ok(());
            }
        }
        // A cancelled worker exits within one interval.
        self.join_worker();
        self.cancel.store(false, Ordering::SeqCst);
        let window = Arc::clone(&self.window);
        let cursor = Arc::clone(&self.cursor);
        let cancel = Arc::clone(&self.cancel);
        let callbacks = self.callbacks.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("gsr-replay".into())
            .spawn(move || replay_loop(&window, &cursor, &callbacks, &cancel, interval))?;
        self.worker = Some(handle);
        info!(
            "replay streaming from sample {} of {}",
            self.emitted(),
            self.window.len()
        );
        Ok(())
    }

    /// Only raises the cancel flag; the worker notices it at its next tick.
    fn stop_streaming(&mut self) -> Result<(), DriverError> {
        self.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), DriverError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.join_worker();
        self.initialized = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.join_worker();
    }
}

fn replay_loop(
    window: &[RawPacket],
    cursor: &AtomicUsize,
    callbacks: &[StreamCallback],
    cancel: &AtomicBool,
    interval: Duration,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("replay cancelled at sample {}", cursor.load(Ordering::SeqCst));
            break;
        }
        let index = cursor.load(Ordering::SeqCst);
        let Some(packet) = window.get(index) else {
            info!("replay window exhausted after {index} samples");
            break;
        };
        for callback in callbacks {
            callback(*packet);
        }
        cursor.store(index + 1, Ordering::SeqCst);
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Instant;

    use crate::store::SqliteGateway;

    fn packets(n: u32) -> Vec<RawPacket> {
        (0..n)
            .map(|i| RawPacket {
                device_time: i,
                raw_gsr: 0x4000 | (1000 + i as u16),
                raw_ppg: 1500 + i as i32,
            })
            .collect()
    }

    fn recording_source(
        n: u32,
        interval: Duration,
    ) -> (ReplaySource, Arc<Mutex<Vec<(Instant, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut source = ReplaySource::from_packets(packets(n), interval);
        let sink = Arc::clone(&seen);
        source.add_stream_callback(Arc::new(move |packet: RawPacket| {
            sink.lock()
                .unwrap()
                .push((Instant::now(), packet.device_time));
        }));
        source.initialize().unwrap();
        (source, seen)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn emits_every_sample_once_at_interval() {
        let interval = Duration::from_millis(20);
        let (mut source, seen) = recording_source(5, interval);
        source.start_streaming().unwrap();
        wait_until(Duration::from_secs(3), || source.is_exhausted());
        source.shutdown().unwrap();
        let seen = seen.lock().unwrap();
        let order: Vec<u32> = seen.iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in seen.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= interval);
        }
    }

    #[test]
    fn stop_truncates_and_never_adds() {
        let (mut source, seen) = recording_source(100, Duration::from_millis(20));
        source.start_streaming().unwrap();
        thread::sleep(Duration::from_millis(90));
        source.stop_streaming().unwrap();
        source.shutdown().unwrap();
        let after_join = seen.lock().unwrap().len();
        assert!(after_join > 0);
        assert!(after_join < 100);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(seen.lock().unwrap().len(), after_join);
    }

    #[test]
    fn restart_resumes_without_repeats() {
        let (mut source, seen) = recording_source(6, Duration::from_millis(15));
        source.start_streaming().unwrap();
        wait_until(Duration::from_secs(2), || source.emitted() >= 2);
        source.stop_streaming().unwrap();
        source.start_streaming().unwrap();
        wait_until(Duration::from_secs(3), || source.is_exhausted());
        source.shutdown().unwrap();
        let order: Vec<u32> = seen.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn start_requires_initialize() {
        let mut source = ReplaySource::from_packets(packets(2), Duration::from_millis(5));
        assert!(matches!(
            source.start_streaming(),
            Err(DriverError::NotInitialized)
        ));
        assert_eq!(source.get_device_name().unwrap(), SIMULATED_DEVICE_NAME);
        assert_eq!(source.get_battery_state().unwrap(), 0);
    }

    #[test]
    fn load_without_markers_is_empty_window() {
        let store = SqliteGateway::open_in_memory().unwrap();
        let err = ReplaySource::load(&store, REPLAY_DEVICE_ID, DEFAULT_REPLAY_INTERVAL)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::ReplayWindowEmpty {
                device_id: REPLAY_DEVICE_ID
            }
        ));
    }
}
