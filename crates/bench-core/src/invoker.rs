use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;

use crate::bencher::Bencher;
use crate::collector::Collector;
use crate::rate::{HatchRate, RateClosed};
use crate::trace::{synthesize_id, Trace};
use crate::workload::Phase;

/// Error from one admission/invocation cycle.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The rate closed or the phase was cancelled; the worker exits quietly.
    #[error(transparent)]
    Closed(#[from] RateClosed),
    /// The invocation itself failed terminally (after any retries).
    #[error("invocation failed: {0}")]
    Invocation(#[source] anyhow::Error),
}

/// Per-phase endpoint client performing one invocation per `exec` call.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Bind per-phase parameters and capture the collector handle.
    async fn setup(&self, phase: &Phase, bencher: &Bencher) -> anyhow::Result<()>;

    /// One admission-gated invocation: `rate.take()`, perform the request,
    /// report the outcome to the rate, submit the trace.
    async fn exec(&self, rate: &dyn HatchRate) -> Result<(), ExecError>;
}

/// Invoker that fabricates traces locally with a fixed delay.
///
/// Useful for dry-running a workload without a backend and as the
/// deterministic endpoint in tests: with `failing_every(n)` every n-th
/// attempt reports a 500.
pub struct MockInvoker {
    delay: Duration,
    fail_every: Option<u64>,
    attempts: AtomicU64,
    collector: Mutex<Option<Arc<Collector>>>,
}

impl MockInvoker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_every: None,
            attempts: AtomicU64::new(0),
            collector: Mutex::new(None),
        }
    }

    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn setup(&self, _phase: &Phase, bencher: &Bencher) -> anyhow::Result<()> {
        *self.collector.lock().unwrap() = Some(bencher.collector());
        Ok(())
    }

    async fn exec(&self, rate: &dyn HatchRate) -> Result<(), ExecError> {
        let collector = self
            .collector
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ExecError::Invocation(anyhow::anyhow!("invoker not set up")))?;

        rate.take().await?;

        let request_start = Utc::now();
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_every
            .map(|n| attempt % n == n - 1)
            .unwrap_or(false);
        let status = if failed { 500 } else { 200 };
        let request_end = Utc::now();
        let latency = (request_end - request_start)
            .num_milliseconds()
            .max(0) as u64;

        if failed {
            rate.on_failed();
        } else {
            rate.on_success();
        }

        let mut trace = Trace::client_side(
            synthesize_id(),
            status,
            request_start,
            request_end,
            latency,
            latency,
        );
        trace.platform = Some("mock".to_string());
        collector.add(trace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_failure_cadence() {
        let mock = MockInvoker::new(Duration::ZERO).failing_every(3);
        let outcomes: Vec<bool> = (0..6)
            .map(|attempt| mock.fail_every.map(|n| attempt % n == n - 1).unwrap())
            .collect();
        assert_eq!(outcomes, vec![false, false, true, false, false, true]);
    }
}
