//! Packet ingestion: the callback a driver invokes for every packet it decodes.
//!
//! Runs on the driver's thread. Calibrates, stamps and appends to the shared
//! buffer; optionally writes each sample straight to the store. Nothing in here
//! may panic or block for long, since it holds up the serial reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};

use crate::drivers::calibration;
use crate::drivers::{SampleBuffer, StreamCallback};
use crate::store::PersistenceGateway;
use crate::types::{RawPacket, Sample};

pub type SharedBuffer = Arc<Mutex<SampleBuffer>>;

/// Locks the live buffer, recovering it if a previous holder panicked.
pub fn lock_buffer(buffer: &Mutex<SampleBuffer>) -> MutexGuard<'_, SampleBuffer> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Ingestor {
    device_id: i64,
    buffer: SharedBuffer,
    live_store: Option<Arc<dyn PersistenceGateway>>,
    warmup_until: Instant,
    closed: AtomicBool,
    domain_errors: AtomicU64,
    dropped_warmup: AtomicU64,
}

impl Ingestor {
    /// `live_store` is set only in live-upload mode.
    pub fn new(
        device_id: i64,
        buffer: SharedBuffer,
        warmup: Duration,
        live_store: Option<Arc<dyn PersistenceGateway>>,
    ) -> Self {
        Self {
            device_id,
            buffer,
            live_store,
            warmup_until: Instant::now() + warmup,
            closed: AtomicBool::new(false),
            domain_errors: AtomicU64::new(0),
            dropped_warmup: AtomicU64::new(0),
        }
    }

    pub fn callback(self: &Arc<Self>) -> StreamCallback {
        let ingestor = Arc::clone(self);
        Arc::new(move |packet: RawPacket| ingestor.handle(packet))
    }

    pub fn handle(&self, packet: RawPacket) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("packet {} arrived after stop, dropped", packet.device_time);
            return;
        }
        if Instant::now() < self.warmup_until {
            self.dropped_warmup.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let conductance = match calibration::conductance(packet.raw_gsr) {
            Ok(value) => Some(value),
            Err(err) => {
                if self.domain_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("device {}: {err}", self.device_id);
                } else {
                    debug!("device {}: {err}", self.device_id);
                }
                None
            }
        };

        // Stamp, upload and append under one lock so the stored and buffered
        // timestamps are the same value.
        let mut buffer = lock_buffer(&self.buffer);
        // stop may have flushed while this packet was being calibrated
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let sample = Sample {
            capture_time: buffer.next_capture_time(Utc::now()),
            device_time: packet.device_time,
            raw_gsr: packet.raw_gsr,
            raw_ppg: packet.raw_ppg,
            conductance,
        };

        let persisted = match &self.live_store {
            Some(store) => match store.insert_sample(self.device_id, &sample) {
                Ok(()) => true,
                Err(err) => {
                    warn!("device {}: live upload failed, kept for flush: {err}", self.device_id);
                    false
                }
            },
            None => false,
        };

        if persisted {
            buffer.push_persisted(sample);
        } else {
            buffer.push(sample);
        }
    }

    /// Drops every packet from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn domain_errors(&self) -> u64 {
        self.domain_errors.load(Ordering::Relaxed)
    }

    pub fn dropped_during_warmup(&self) -> u64 {
        self.dropped_warmup.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    use crate::store::SqliteGateway;

    fn packet(device_time: u32, raw_gsr: u16) -> RawPacket {
        RawPacket {
            device_time,
            raw_gsr,
            raw_ppg: 1900,
        }
    }

    fn buffer() -> SharedBuffer {
        Arc::new(Mutex::new(SampleBuffer::new()))
    }

    #[test]
    fn warmup_drops_packets() {
        let shared = buffer();
        let ingestor = Ingestor::new(1, Arc::clone(&shared), Duration::from_secs(4), None);
        for i in 0..10 {
            ingestor.handle(packet(i, 0x4800));
        }
        assert!(lock_buffer(&shared).is_empty());
        assert_eq!(ingestor.dropped_during_warmup(), 10);
    }

    #[test]
    fn calibrates_and_appends() {
        let shared = buffer();
        let ingestor = Ingestor::new(1, Arc::clone(&shared), Duration::ZERO, None);
        ingestor.handle(packet(1, 0xC000));
        ingestor.handle(packet(2, 0x0000));
        let snap = lock_buffer(&shared).snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap[0].conductance.is_some());
        // out-of-domain readings are kept with raw values only
        assert_eq!(snap[1].conductance, None);
        assert_eq!(snap[1].raw_gsr, 0x0000);
        assert_eq!(ingestor.domain_errors(), 1);
    }

    #[test]
    fn closed_ingestor_drops_packets() {
        let shared = buffer();
        let ingestor = Ingestor::new(1, Arc::clone(&shared), Duration::ZERO, None);
        ingestor.close();
        ingestor.handle(packet(1, 0x4800));
        assert!(lock_buffer(&shared).is_empty());
    }

    #[test]
    fn live_upload_marks_persisted_entries() {
        let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let device = store.upsert_device("dev", "COM1", 50).unwrap();
        let shared = buffer();
        let gateway: Arc<dyn PersistenceGateway> = store.clone();
        let ingestor = Arc::new(Ingestor::new(
            device,
            Arc::clone(&shared),
            Duration::ZERO,
            Some(gateway),
        ));
        let callback = ingestor.callback();
        callback(packet(1, 0x4800));
        callback(packet(2, 0x4801));

        let entries = lock_buffer(&shared).take_all();
        assert!(entries.iter().all(|e| e.persisted));
        assert_eq!(store.samples_for_device(device).unwrap().len(), 2);
    }

    #[test]
    fn uploaded_timestamp_matches_buffered_one() {
        let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let device = store.upsert_device("dev", "COM1", 50).unwrap();
        let shared = buffer();
        // a predecessor stamped ahead of the wall clock forces a clamp
        // stored timestamps carry microseconds
        let ahead = (Utc::now() + chrono::Duration::seconds(30)).trunc_subsecs(6);
        lock_buffer(&shared).push_persisted(Sample {
            capture_time: ahead,
            device_time: 0,
            raw_gsr: 0x4800,
            raw_ppg: 1900,
            conductance: None,
        });
        let gateway: Arc<dyn PersistenceGateway> = store.clone();
        let ingestor = Ingestor::new(device, Arc::clone(&shared), Duration::ZERO, Some(gateway));
        ingestor.handle(packet(1, 0x4800));

        let buffered = lock_buffer(&shared).snapshot();
        let stored = store.samples_for_device(device).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(buffered[1].capture_time, ahead);
        assert_eq!(stored[0].capture_time, buffered[1].capture_time);
    }

    #[test]
    fn failed_live_upload_keeps_sample_unpersisted() {
        let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let shared = buffer();
        let gateway: Arc<dyn PersistenceGateway> = store.clone();
        // unknown device id violates the foreign key
        let ingestor = Ingestor::new(999, Arc::clone(&shared), Duration::ZERO, Some(gateway));
        ingestor.handle(packet(1, 0x4800));
        let entries = lock_buffer(&shared).take_all();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].persisted);
    }
}
