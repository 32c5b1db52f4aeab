use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::info;

use crate::types::Sample;

const HEADER: &str = "capture_time,device_time,gsr_raw,ppg_raw,conductance_us";

/// CSV sink for samples that have to leave the process without the database.
pub struct SampleRecorder {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    written: usize,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self {
            writer: None,
            path: None,
            written: 0,
        }
    }

    /// Opens `gsr_samples_<label>_<unix seconds>.csv` in `dir` and writes the header.
    pub fn start_in(&mut self, dir: &Path, label: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let label = if label.is_empty() { "unlabeled" } else { label };
        let filename = format!("gsr_samples_{}_{}.csv", label, Utc::now().timestamp());
        let path = dir.join(filename);
        let mut w = BufWriter::new(File::create(&path)?);
        writeln!(w, "{HEADER}")?;
        info!("Recording started: {}", path.display());
        self.writer = Some(w);
        self.path = Some(path.clone());
        self.written = 0;
        Ok(path)
    }

    pub fn write_samples(&mut self, samples: &[Sample]) -> std::io::Result<()> {
        let Some(w) = &mut self.writer else {
            return Ok(());
        };
        for sample in samples {
            write!(
                w,
                "{},{},{},{}",
                sample.capture_time.to_rfc3339(),
                sample.device_time,
                sample.raw_gsr,
                sample.raw_ppg
            )?;
            match sample.conductance {
                Some(value) => writeln!(w, ",{value:.6}")?,
                None => writeln!(w, ",")?,
            }
        }
        self.written += samples.len();
        Ok(())
    }

    pub fn stop(&mut self) -> std::io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            if let Some(path) = &self.path {
                info!("Recording saved: {} ({} samples)", path.display(), self.written);
            }
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }
}

impl Default for SampleRecorder {
    fn default() -> Self {
        Self::new()
    }
}
