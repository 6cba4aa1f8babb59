//! # Telemetry Module
//!
//! Raw numeric dumps of the sample stream.
//!
//! This module handles:
//! - Formatting valid samples as JSONL (JSON Lines)
//! - Writing to rotating files (max N records per file)
//! - Retaining only the last M files

pub mod recorder;

pub use recorder::SampleRecorder;
