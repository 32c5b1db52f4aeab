use chrono::{DateTime, Utc};

use crate::types::Sample;

/// A buffered sample plus whether it already reached the store.
#[derive(Clone, Debug)]
pub struct BufferedSample {
    pub sample: Sample,
    pub persisted: bool,
}

/// Append-only, time-ordered store of the samples of one session.
///
/// `capture_time` never decreases: a sample stamped earlier than its
/// predecessor (wall clock stepped back) takes the predecessor's timestamp.
#[derive(Default)]
pub struct SampleBuffer {
    entries: Vec<BufferedSample>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.push_entry(sample, false);
    }

    /// Appends a sample that has already been written to storage.
    pub fn push_persisted(&mut self, sample: Sample) {
        self.push_entry(sample, true);
    }

    fn push_entry(&mut self, mut sample: Sample, persisted: bool) {
        if let Some(last) = self.entries.last() {
            if sample.capture_time < last.sample.capture_time {
                sample.capture_time = last.sample.capture_time;
            }
        }
        self.entries.push(BufferedSample { sample, persisted });
    }

    /// `now`, or the newest buffered timestamp if the clock went backwards.
    pub fn next_capture_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.entries.last() {
            Some(last) if last.sample.capture_time > now => last.sample.capture_time,
            _ => now,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every buffered sample, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.entries.iter().map(|e| e.sample.clone()).collect()
    }

    /// Keeps only the newest `keep` samples.
    pub fn trim_to_last(&mut self, keep: usize) {
        if self.entries.len() > keep {
            let excess = self.entries.len() - keep;
            self.entries.drain(..excess);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Empties the buffer and hands every entry to the caller.
    pub fn take_all(&mut self) -> Vec<BufferedSample> {
        std::mem::take(&mut self.entries)
    }

    /// Puts entries back in front of anything buffered since they were taken.
    pub fn restore(&mut self, mut entries: Vec<BufferedSample>) {
        entries.append(&mut self.entries);
        self.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};

    fn sample(device_time: u32, offset_ms: i64) -> Sample {
        Sample {
            capture_time: Utc::now() + Duration::milliseconds(offset_ms),
            device_time,
            raw_gsr: 0x4800,
            raw_ppg: 2000,
            conductance: Some(1.0),
        }
    }

    #[test]
    fn snapshot_keeps_order() {
        let mut buffer = SampleBuffer::new();
        for i in 0..5 {
            buffer.push(sample(i, i as i64));
        }
        let snap = buffer.snapshot();
        assert_eq!(snap.len(), 5);
        let times: Vec<u32> = snap.iter().map(|s| s.device_time).collect();
        assert_eq!(times, vec![0, 1, 2, 3, 4]);
        // later pushes don't affect an earlier snapshot
        buffer.push(sample(5, 5));
        assert_eq!(snap.len(), 5);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn capture_time_never_goes_backwards() {
        let mut buffer = SampleBuffer::new();
        buffer.push(sample(0, 1_000));
        buffer.push(sample(1, 0));
        let snap = buffer.snapshot();
        assert_eq!(snap[1].capture_time, snap[0].capture_time);
        assert_eq!(buffer.next_capture_time(Utc::now()), snap[0].capture_time);
    }

    #[test]
    fn trim_keeps_newest() {
        let mut buffer = SampleBuffer::new();
        for i in 0..10 {
            buffer.push(sample(i, i as i64));
        }
        buffer.trim_to_last(3);
        let times: Vec<u32> = buffer.snapshot().iter().map(|s| s.device_time).collect();
        assert_eq!(times, vec![7, 8, 9]);
        buffer.trim_to_last(10);
        assert_eq!(buffer.len(), 3);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn restore_puts_entries_first() {
        let mut buffer = SampleBuffer::new();
        buffer.push(sample(0, 0));
        buffer.push_persisted(sample(1, 1));
        let taken = buffer.take_all();
        assert!(buffer.is_empty());
        assert!(!taken[0].persisted);
        assert!(taken[1].persisted);
        buffer.push(sample(2, 2));
        buffer.restore(taken);
        let times: Vec<u32> = buffer.snapshot().iter().map(|s| s.device_time).collect();
        assert_eq!(times, vec![0, 1, 2]);
    }
}
