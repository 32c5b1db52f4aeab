use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::drivers::replay::ReplaySource;
use crate::drivers::shimmer::ShimmerDriver;
use crate::drivers::{BufferedSample, DriverError, SampleBuffer, SensorDriver};
use crate::error::SessionError;
use crate::ingest::{lock_buffer, Ingestor, SharedBuffer};
use crate::recorder::SampleRecorder;
use crate::store::PersistenceGateway;
use crate::types::{
    ConnectionMode, DeviceDescriptor, EventKind, OpenSession, Sample, SessionEvent, SessionState,
};

/// One connected sensor, real or replayed, from connect to cleanup.
///
/// The session owns the driver and the persistence gateway. Dropping it runs
/// [`DeviceSession::safe_shutdown`], so an early return or a panic still writes
/// the stop marker, flushes the buffer and releases the store. Samples the
/// store refused are exported as CSV to the configured directory.
pub struct DeviceSession {
    driver: Option<Box<dyn SensorDriver>>,
    store: Arc<dyn PersistenceGateway>,
    store_released: bool,
    device: DeviceDescriptor,
    mode: ConnectionMode,
    state: SessionState,
    buffer: SharedBuffer,
    ingestor: Arc<Ingestor>,
    label: String,
    export_dir: PathBuf,
}

fn keep_first(slot: &mut Option<SessionError>, result: Result<(), SessionError>) {
    if let Err(err) = result {
        warn!("shutdown step failed: {err}");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

impl DeviceSession {
    /// Connects to the Shimmer on `port`, falling back to replay if allowed and the port is busy.
    pub fn connect(
        port: &str,
        allow_simulated_fallback: bool,
        store: Arc<dyn PersistenceGateway>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let baud_rate = config.baud_rate;
        Self::connect_with(port, allow_simulated_fallback, store, config, |port| {
            let driver = ShimmerDriver::open_with_baud(port, baud_rate)?;
            Ok(Box::new(driver) as Box<dyn SensorDriver>)
        })
    }

    /// Like [`DeviceSession::connect`] with a caller-supplied hardware opener.
    pub fn connect_with<F>(
        port: &str,
        allow_simulated_fallback: bool,
        store: Arc<dyn PersistenceGateway>,
        config: &SessionConfig,
        open_hardware: F,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce(&str) -> Result<Box<dyn SensorDriver>, DriverError>,
    {
        let result = Self::establish(
            port,
            allow_simulated_fallback,
            Arc::clone(&store),
            config,
            open_hardware,
        );
        if result.is_err() {
            if let Err(err) = store.close() {
                warn!("releasing store after failed connect: {err}");
            }
        }
        result
    }

    fn establish<F>(
        port: &str,
        allow_simulated_fallback: bool,
        store: Arc<dyn PersistenceGateway>,
        config: &SessionConfig,
        open_hardware: F,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce(&str) -> Result<Box<dyn SensorDriver>, DriverError>,
    {
        let connection_error = |source: DriverError| SessionError::DeviceConnection {
            port: port.to_string(),
            source,
        };

        let (mut driver, mode) = match open_hardware(port) {
            Ok(driver) => (driver, ConnectionMode::Hardware),
            Err(err) if allow_simulated_fallback && err.is_port_unavailable() => {
                warn!("{err}; falling back to recorded replay");
                let replay = ReplaySource::load(
                    &*store,
                    config.replay_device_id,
                    config.replay_interval(),
                )?
                .with_name(config.simulated_device_name.as_str());
                (
                    Box::new(replay) as Box<dyn SensorDriver>,
                    ConnectionMode::Simulation,
                )
            }
            Err(err) => return Err(connection_error(err)),
        };

        driver.initialize().map_err(connection_error)?;
        let battery_percent = driver.get_battery_state().map_err(connection_error)?;
        let name = driver.get_device_name().map_err(connection_error)?;
        let id = store.upsert_device(&name, port, battery_percent)?;
        let device = DeviceDescriptor {
            id,
            name,
            port: port.to_string(),
            battery_percent,
        };

        let buffer: SharedBuffer = Arc::new(Mutex::new(SampleBuffer::new()));
        let live_store = config.live_upload.then(|| Arc::clone(&store));
        let ingestor = Arc::new(Ingestor::new(
            id,
            Arc::clone(&buffer),
            config.warmup(),
            live_store,
        ));
        driver.add_stream_callback(ingestor.callback());

        info!(
            "connected to {} ({:?}) on {}, battery {}%, device id {}",
            device.name, mode, device.port, device.battery_percent, device.id
        );
        Ok(Self {
            driver: Some(driver),
            store,
            store_released: false,
            device,
            mode,
            state: SessionState::Connecting,
            buffer,
            ingestor,
            label: String::new(),
            export_dir: config.export_dir.clone(),
        })
    }

    /// Starts the stream and records a session-start. A no-op while already streaming.
    pub fn start_streaming(&mut self, subject_id: i64, label: &str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Stopped => return Err(SessionError::Stopped),
            SessionState::Connecting => {}
        }

        if let Some(open) = self.store.find_open_session_start(self.device.id)? {
            return Err(SessionError::SessionAlreadyOpen {
                device_id: self.device.id,
                started_at: open.started_at,
            });
        }

        let driver = self.driver.as_mut().ok_or(SessionError::Stopped)?;
        driver.start_streaming()?;
        let event = SessionEvent::new(
            self.device.id,
            Some(subject_id),
            EventKind::SessionStart,
            label,
        );
        if let Err(err) = self.store.insert_session_event(&event) {
            if let Err(stop_err) = driver.stop_streaming() {
                warn!("stopping driver after failed start: {stop_err}");
            }
            return Err(err.into());
        }

        self.state = SessionState::Streaming;
        self.label = label.to_string();
        info!(
            "device {}: streaming for subject {subject_id} ('{label}')",
            self.device.id
        );
        Ok(())
    }

    /// Closes a session-start left without its stop by a run that crashed.
    ///
    /// Only the caller knows that no other process still owns the open start,
    /// so this never happens on its own. Returns the session it closed, if any.
    /// While streaming the open start is this session's own and is left alone.
    pub fn close_stale_session(&self) -> Result<Option<OpenSession>, SessionError> {
        match self.state {
            SessionState::Connecting => {}
            SessionState::Streaming => return Ok(None),
            SessionState::Stopped => return Err(SessionError::Stopped),
        }
        let Some(open) = self.store.find_open_session_start(self.device.id)? else {
            return Ok(None);
        };
        warn!(
            "device {}: closing session '{}' left open since {}",
            self.device.id, open.label, open.started_at
        );
        self.store.insert_session_event(&SessionEvent::new(
            self.device.id,
            open.subject_id,
            EventKind::SessionStop,
            open.label.clone(),
        ))?;
        Ok(Some(open))
    }

    /// Copy of everything buffered so far, oldest first.
    pub fn get_live_data(&self) -> Vec<Sample> {
        lock_buffer(&self.buffer).snapshot()
    }

    pub fn clear_buffer(&self) {
        lock_buffer(&self.buffer).clear();
    }

    pub fn trim_buffer(&self, keep_last: usize) {
        lock_buffer(&self.buffer).trim_to_last(keep_last);
    }

    /// Stops the stream, optionally writes the stop marker and flushes the buffer.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned. Samples that could not be flushed stay in the buffer. Calls
    /// after the first are no-ops. A session that never started streaming
    /// writes no stop marker.
    pub fn stop_streaming(
        &mut self,
        emit_stop_event: bool,
        flush_to_storage: bool,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        let was_streaming = self.state == SessionState::Streaming;
        let mut first_error = None;

        if let Some(driver) = self.driver.as_mut() {
            keep_first(&mut first_error, driver.stop_streaming().map_err(Into::into));
        }
        self.ingestor.close();

        if emit_stop_event && was_streaming {
            keep_first(&mut first_error, self.write_stop_event());
        }
        if flush_to_storage {
            keep_first(&mut first_error, self.flush_buffer());
        }
        if let Some(mut driver) = self.driver.take() {
            keep_first(&mut first_error, driver.shutdown().map_err(Into::into));
        }

        self.state = SessionState::Stopped;
        info!("device {}: session stopped", self.device.id);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_stop_event(&self) -> Result<(), SessionError> {
        match self.store.find_open_session_start(self.device.id)? {
            Some(open) => {
                self.store.insert_session_event(&SessionEvent::new(
                    self.device.id,
                    open.subject_id,
                    EventKind::SessionStop,
                    open.label,
                ))?;
                Ok(())
            }
            None => {
                debug!("device {}: no open session to close", self.device.id);
                Ok(())
            }
        }
    }

    fn flush_buffer(&self) -> Result<(), SessionError> {
        let entries = lock_buffer(&self.buffer).take_all();
        let mut written = 0usize;
        for (index, entry) in entries.iter().enumerate() {
            if entry.persisted {
                continue;
            }
            if let Err(err) = self.store.insert_sample(self.device.id, &entry.sample) {
                let remaining: Vec<BufferedSample> = entries[index..]
                    .iter()
                    .filter(|e| !e.persisted)
                    .cloned()
                    .collect();
                error!(
                    "device {}: flush failed after {written} samples, {} kept in buffer",
                    self.device.id,
                    remaining.len()
                );
                lock_buffer(&self.buffer).restore(remaining);
                return Err(err.into());
            }
            written += 1;
        }
        info!(
            "device {}: flushed {written} samples ({} already uploaded)",
            self.device.id,
            entries.len() - written
        );
        Ok(())
    }

    /// Writes samples the store never received to a CSV in the export directory.
    fn export_unsaved(&self) -> Result<(), SessionError> {
        let entries = lock_buffer(&self.buffer).take_all();
        let unsaved: Vec<Sample> = entries
            .iter()
            .filter(|e| !e.persisted)
            .map(|e| e.sample.clone())
            .collect();
        if unsaved.is_empty() {
            lock_buffer(&self.buffer).restore(entries);
            return Ok(());
        }

        let mut recorder = SampleRecorder::new();
        let written = recorder
            .start_in(&self.export_dir, &self.label)
            .and_then(|path| {
                recorder.write_samples(&unsaved)?;
                recorder.stop()?;
                Ok(path)
            });
        match written {
            Ok(path) => {
                warn!(
                    "device {}: {} unsaved samples exported to {}",
                    self.device.id,
                    unsaved.len(),
                    path.display()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "device {}: {} unsaved samples could not be exported: {err}",
                    self.device.id,
                    unsaved.len()
                );
                lock_buffer(&self.buffer).restore(entries);
                Err(SessionError::Export(err))
            }
        }
    }

    /// Stops with stop marker and flush unless already stopped, exports what the
    /// store did not take, then releases the store once.
    pub fn safe_shutdown(&mut self) -> Result<(), SessionError> {
        let mut first_error = None;
        if self.state != SessionState::Stopped {
            keep_first(&mut first_error, self.stop_streaming(true, true));
        }
        keep_first(&mut first_error, self.export_unsaved());
        if !self.store_released {
            self.store_released = true;
            keep_first(
                &mut first_error,
                self.store.close().map_err(SessionError::from),
            );
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(err) = self.safe_shutdown() {
            error!("device {}: cleanup on drop failed: {err}", self.device.id);
        }
    }
}
