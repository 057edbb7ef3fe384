use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

use crate::trace::Trace;

/// Thread-safe, append-only buffer of traces.
///
/// Workers append regardless of invocation outcome; the supervisor's
/// flusher drains it to the sink periodically.
#[derive(Debug, Default)]
pub struct Collector {
    traces: Mutex<Vec<Trace>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, trace: Trace) {
        self.traces.lock().unwrap().push(trace);
    }

    /// Take all buffered traces, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Trace> {
        std::mem::take(&mut *self.traces.lock().unwrap())
    }

    /// Put traces back after a failed flush so they are not lost.
    pub fn restore(&self, traces: Vec<Trace>) {
        self.traces.lock().unwrap().extend(traces);
    }

    pub fn len(&self) -> usize {
        self.traces.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// CSV writer over a create-append output file, one row per trace.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Open for appending. The header row is only written when the file is
    /// empty, so re-runs append rows rather than repeating headers.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let write_headers = file.metadata()?.len() == 0;
        Ok(Self {
            writer: csv::WriterBuilder::new()
                .has_headers(write_headers)
                .from_writer(file),
        })
    }

    pub fn write_all(&mut self, traces: &[Trace]) -> Result<()> {
        for trace in traces {
            self.writer.serialize(trace)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
