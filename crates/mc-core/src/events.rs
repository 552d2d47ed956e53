//! Auxiliary JSONL event stream.
//!
//! Mirrors logical events into a line-delimited JSON file for out-of-band
//! analysis. The DB event store remains authoritative; this stream is a
//! portable, jq-friendly complement.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// One emitted record.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub event_type: String,
    pub mission_id: String,
    pub round_id: String,
    pub unit_id: String,
    pub worker_id: String,
    pub details: Value,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.into(),
            mission_id: String::new(),
            round_id: String::new(),
            unit_id: String::new(),
            worker_id: String::new(),
            details: Value::Object(Default::default()),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
        }
    }

    pub fn mission(mut self, id: &str) -> Self {
        self.mission_id = id.to_owned();
        self
    }

    pub fn round(mut self, id: &str) -> Self {
        self.round_id = id.to_owned();
        self
    }

    pub fn unit(mut self, id: &str) -> Self {
        self.unit_id = id.to_owned();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn tokens(mut self, input: i64, output: i64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Append-only JSONL writer for mission events.
///
/// `emit` is a silent no-op until `open` succeeds, so callers never branch
/// on whether the stream is configured.
#[derive(Debug)]
pub struct EventStream {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn open(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
        Ok(())
    }

    pub fn close(&self) {
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Append one record, flushed immediately.
    pub fn emit(&self, record: &EventRecord) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ref mut file) = *guard else {
            return;
        };
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                    warn!(error = %e, "failed to append event record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize event record"),
        }
    }
}
