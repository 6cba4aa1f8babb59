//! JSONL sample recorder with file rotation

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::sample::{DecodedSample, Measurement};

const FILE_PREFIX: &str = "samples_";
const FILE_SUFFIX: &str = ".jsonl";

/// Records buffered before an explicit flush
const FLUSH_EVERY: usize = 500;

/// One JSONL line
#[derive(Debug, Serialize)]
struct SampleRecord<'a> {
    /// RFC 3339, microseconds
    timestamp: String,
    counter: u8,
    #[serde(flatten)]
    measurement: &'a Measurement,
}

/// Writes valid samples as JSON lines into rotating files
///
/// Files are named `samples_<timestamp>_<sequence>.jsonl`, so they sort
/// oldest first.
#[derive(Debug)]
pub struct SampleRecorder {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    records_in_file: usize,
    total_records: u64,
    sequence: u32,
}

impl SampleRecorder {
    /// Create the recorder, creating `dir` if needed
    ///
    /// # Arguments
    ///
    /// * `dir` - Output directory
    /// * `max_records_per_file` - Records before rotating to a new file
    /// * `max_files_to_keep` - Older files beyond this count are deleted
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created
    pub fn new<P: AsRef<Path>>(dir: P, max_records_per_file: usize, max_files_to_keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            writer: None,
            current_path: None,
            records_in_file: 0,
            total_records: 0,
            sequence: 0,
        })
    }

    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        Self::new(&config.log_dir, config.max_records_per_file, config.max_files_to_keep)
    }

    /// Append a sample
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Written
    /// * `Ok(false)` - Skipped (failed its checksum)
    ///
    /// # Errors
    ///
    /// `Io` or `Telemetry` if the line cannot be serialized or written
    pub fn record(&mut self, sample: &DecodedSample) -> Result<bool> {
        let Some(measurement) = &sample.measurement else {
            return Ok(false);
        };

        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let line = serde_json::to_string(&SampleRecord {
            timestamp: sample
                .received_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            counter: sample.counter,
            measurement,
        })?;

        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
            self.total_records += 1;

            if self.records_in_file % FLUSH_EVERY == 0 {
                writer.flush()?;
            }
        }
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// File currently being written
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    fn rotate(&mut self) -> Result<()> {
        self.flush()?;

        self.sequence += 1;
        let name = format!(
            "{}{}_{:04}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            self.sequence,
            FILE_SUFFIX
        );
        let path = self.dir.join(name);

        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.records_in_file = 0;
        info!("Recording samples to {}", path.display());
        self.current_path = Some(path);

        self.prune()
    }

    /// Delete the oldest files beyond `max_files_to_keep`
    fn prune(&self) -> Result<()> {
        let mut files = recorded_files(&self.dir)?;
        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        let excess = files.len() - self.max_files_to_keep;
        for path in files.drain(..excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed old sample file {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

impl Drop for SampleRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush sample file: {}", e);
        }
    }
}

/// Sample files in `dir`, oldest first
pub fn recorded_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::state::CalibrationState;
    use crate::packet::decoder::RawSample;
    use tempfile::TempDir;

    fn sample(counter: u8, valid: bool) -> DecodedSample {
        let raw = RawSample {
            differential: [1000; 6],
            sum: [2048; 6],
            report_id: 0x01,
            imu: [256, 0, -256, 0, 0],
            temperature: Some(400),
        };
        DecodedSample {
            raw: vec![0; 53],
            checksum_ok: valid,
            counter,
            received_at: Utc::now(),
            measurement: valid.then(|| Measurement::from_raw(raw, &CalibrationState::default())),
        }
    }

    #[test]
    fn test_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut recorder = SampleRecorder::new(dir.path(), 100, 5).unwrap();

        assert!(recorder.record(&sample(1, true)).unwrap());
        assert!(recorder.record(&sample(2, true)).unwrap());
        recorder.flush().unwrap();

        let contents = fs::read_to_string(recorder.current_path().unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["counter"], 2);
        assert_eq!(value["report_id"], 1);
        assert_eq!(value["temperature_celsius"], 25.0);
        assert_eq!(value["wrench"].as_array().unwrap().len(), 6);
        assert_eq!(value["imu"]["kind"], "vector");
    }

    #[test]
    fn test_invalid_samples_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut recorder = SampleRecorder::new(dir.path(), 100, 5).unwrap();

        assert!(!recorder.record(&sample(1, false)).unwrap());
        assert_eq!(recorder.total_records(), 0);
        assert!(recorder.current_path().is_none());
        assert!(recorded_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_rotation_and_retention() {
        let dir = TempDir::new().unwrap();
        let mut recorder = SampleRecorder::new(dir.path(), 3, 2).unwrap();

        for i in 0..10 {
            recorder.record(&sample(i, true)).unwrap();
        }
        recorder.flush().unwrap();

        // 10 records at 3 per file = 4 files, of which the newest 2 remain
        let files = recorded_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].as_path(), recorder.current_path().unwrap());

        let last = fs::read_to_string(&files[1]).unwrap();
        assert_eq!(last.lines().count(), 1);
        let previous = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(previous.lines().count(), 3);
        assert_eq!(recorder.total_records(), 10);
    }

    #[test]
    fn test_other_files_are_left_alone() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let mut recorder = SampleRecorder::new(dir.path(), 1, 1).unwrap();
        for i in 0..3 {
            recorder.record(&sample(i, true)).unwrap();
        }

        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(recorded_files(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let config = TelemetryConfig {
            enabled: true,
            log_dir: nested.to_string_lossy().into_owned(),
            max_records_per_file: 10,
            max_files_to_keep: 3,
            format: "jsonl".to_string(),
        };

        SampleRecorder::from_config(&config).unwrap();
        assert!(nested.is_dir());
    }
}
