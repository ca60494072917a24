//! JSONL artifact writers.
//!
//! Rows are handed to a background thread over a channel and written one per
//! line. Dropping every sender and calling [`SinkWorker::join`] flushes the
//! file and surfaces any write error.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;

pub const FRICTION_RECORDS_FILE: &str = "friction_records.jsonl";
pub const FIRMWARE_PROFILES_FILE: &str = "firmware_profiles.jsonl";
pub const TRAJECTORIES_FILE: &str = "trajectories.jsonl";
pub const TESTS_FILE: &str = "tests.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("sink channel closed")]
    Closed,
    #[error("sink worker failed: {0}")]
    Join(String),
}

pub struct JsonlSink<T> {
    sender: mpsc::Sender<T>,
}

impl<T> Clone for JsonlSink<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

pub struct SinkWorker {
    handle: Option<std::thread::JoinHandle<Result<usize, SinkError>>>,
}

impl SinkWorker {
    /// Wait for the writer to drain. Returns the number of rows written.
    pub fn join(mut self) -> Result<usize, SinkError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(SinkError::Join("sink worker panicked".to_string())),
            },
            None => Ok(0),
        }
    }
}

impl<T: Serialize + Send + 'static> JsonlSink<T> {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, SinkWorker), SinkError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<T>();
        let handle = std::thread::spawn(move || write_loop(file, receiver));
        Ok((
            Self { sender },
            SinkWorker {
                handle: Some(handle),
            },
        ))
    }

    pub fn record(&self, row: T) -> Result<(), SinkError> {
        self.sender.send(row).map_err(|_| SinkError::Closed)
    }
}

fn write_loop<T: Serialize>(file: std::fs::File, receiver: mpsc::Receiver<T>) -> Result<usize, SinkError> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for row in receiver {
        let line = serde_json::to_string(&row).map_err(|e| SinkError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Write a whole table at once.
pub fn write_all<T, I>(path: impl AsRef<Path>, rows: I) -> Result<usize, SinkError>
where
    T: Serialize + Send + 'static,
    I: IntoIterator<Item = T>,
{
    let (sink, worker) = JsonlSink::new(path)?;
    for row in rows {
        // A closed channel means the writer failed; join reports why.
        if sink.record(row).is_err() {
            break;
        }
    }
    drop(sink);
    worker.join()
}

/// Read a JSONL table, skipping blank lines.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, SinkError> {
    let raw = std::fs::read_to_string(path)?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| SinkError::Serde(e.to_string())))
        .collect()
}
