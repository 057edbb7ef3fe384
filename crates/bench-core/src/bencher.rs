use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collector::{Collector, CsvSink};
use crate::config::{render_output_path, BenchmarkConfig};
use crate::runner;
use crate::workload::{HookFn, PayloadFn, Workload};

/// Cadence of the background collector-to-sink flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Workload supervisor: owns the collector and the output sink, runs the
/// phases strictly in order, and keeps a background flusher alive across
/// phase boundaries.
pub struct Bencher {
    work: Workload,
    strict: bool,
    collector: Arc<Collector>,
    sink: Option<CsvSink>,
}

impl Bencher {
    pub fn new(work: Workload, sink: CsvSink) -> Self {
        Self {
            work,
            strict: false,
            collector: Arc::new(Collector::new()),
            sink: Some(sink),
        }
    }

    /// Build a bencher from a YAML descriptor, rendering the output
    /// filename and opening it in create-append mode.
    pub fn from_config(config: BenchmarkConfig) -> Result<Self> {
        if config.output.is_empty() {
            bail!("config does not contain an output file");
        }
        let work = Workload::from_config(&config.workload)?;
        let path = render_output_path(&config.output, &work.name, Local::now().date_naive());
        let sink = CsvSink::open(&path)
            .with_context(|| format!("could not open result file {path}"))?;
        Ok(Self::new(work, sink))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Self::from_config(BenchmarkConfig::from_reader(reader)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(BenchmarkConfig::from_file(path)?)
    }

    /// Abort the workload on the first per-invocation or setup error.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn workload(&self) -> &Workload {
        &self.work
    }

    pub fn collector(&self) -> Arc<Collector> {
        self.collector.clone()
    }

    pub fn with_pre_run(mut self, hook: HookFn) -> Self {
        self.work.pre_run = Some(hook);
        self
    }

    pub fn with_post_run(mut self, hook: HookFn) -> Self {
        self.work.post_run = Some(hook);
        self
    }

    pub fn with_phase_pre_run(mut self, phase_index: usize, hook: HookFn) -> Self {
        if let Some(phase) = self.work.phases.get_mut(phase_index) {
            phase.pre_run = Some(hook);
        }
        self
    }

    pub fn with_phase_post_run(mut self, phase_index: usize, hook: HookFn) -> Self {
        if let Some(phase) = self.work.phases.get_mut(phase_index) {
            phase.post_run = Some(hook);
        }
        self
    }

    /// Install the payload function on every phase.
    pub fn with_payload_fn(mut self, payload_fn: PayloadFn) -> Self {
        for phase in &mut self.work.phases {
            phase.payload_fn = Some(payload_fn.clone());
        }
        self
    }

    /// Run all phases. Strict mode stops at the first failing phase but
    /// still runs the workload post-run hook and the final flush.
    pub async fn run(&mut self) -> Result<()> {
        let sink = self.sink.take().context("benchmark already ran")?;
        let flusher_stop = CancellationToken::new();
        let flusher = tokio::spawn(flush_loop(
            self.collector.clone(),
            sink,
            flusher_stop.clone(),
        ));

        if let Some(hook) = &self.work.pre_run {
            if let Err(err) = hook() {
                error!("failed to perform pre run: {err:#}");
            }
        }

        let cancel = CancellationToken::new();
        let mut failure = None;
        for (index, phase) in self.work.phases.iter().enumerate() {
            info!("running phase {index} ({})", phase.name);
            if let Err(err) = runner::run_phase(phase, self, &cancel).await {
                error!("error in phase {index}: {err:#}");
                if self.strict {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(hook) = &self.work.post_run {
            if let Err(err) = hook() {
                error!("failed to perform post run: {err:#}");
            }
        }

        flusher_stop.cancel();
        let mut sink = flusher.await.context("flusher task failed")?;
        let remaining = self.collector.drain();
        if let Err(err) = sink.write_all(&remaining) {
            error!("failed to write results to disk: {err:#}");
            for trace in &remaining {
                error!("unwritten trace: {trace:?}");
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Drain the collector into the sink every [`FLUSH_INTERVAL`] until
/// stopped, then hand the sink back for the final flush.
async fn flush_loop(collector: Arc<Collector>, mut sink: CsvSink, stop: CancellationToken) -> CsvSink {
    let mut ticker = interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let traces = collector.drain();
                if traces.is_empty() {
                    continue;
                }
                if let Err(err) = sink.write_all(&traces) {
                    error!("failed to write results: {err:#}");
                    collector.restore(traces);
                }
            }
            _ = stop.cancelled() => break,
        }
    }
    sink
}
