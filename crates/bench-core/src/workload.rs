use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::WorkloadConfig;
use crate::invoker::Invoker;
use crate::rate::HatchRate;
use crate::registry::{invokers, rates};

/// Side-effect hook run once before or after a workload or phase.
pub type HookFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Produces the request payload for a phase, evaluated once during invoker
/// setup.
pub type PayloadFn = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Named sequence of phases, immutable after construction.
pub struct Workload {
    pub name: String,
    /// URL or platform identifier (e.g. function name).
    pub target: String,
    pub pre_run: Option<HookFn>,
    pub post_run: Option<HookFn>,
    pub phases: Vec<Phase>,
}

/// One segment of a workload with uniform concurrency and pacing.
pub struct Phase {
    pub name: String,
    /// Number of workers driving invocations.
    pub threads: usize,
    pub hatch_rate: Arc<dyn HatchRate>,
    /// Wall-clock upper bound; without one the phase runs until the rate
    /// signals completion.
    pub timeout: Option<Duration>,
    pub target: String,
    pub payload_fn: Option<PayloadFn>,
    pub pre_run: Option<HookFn>,
    pub post_run: Option<HookFn>,
    pub invoker: Arc<dyn Invoker>,
}

impl Workload {
    /// Build the runnable workload from its descriptor, constructing the
    /// invoker and each phase's rate through the registries.
    pub fn from_config(config: &WorkloadConfig) -> Result<Self> {
        let invoker = invokers().build(&config.invoker)?;

        let mut phases = Vec::with_capacity(config.phases.len());
        for phase in &config.phases {
            if phase.threads == 0 {
                bail!("phase {} needs at least one thread", phase.name);
            }
            phases.push(Phase {
                name: phase.name.clone(),
                threads: phase.threads,
                hatch_rate: rates().build(&phase.hatch_rate)?,
                timeout: phase.timeout()?,
                target: config.target.clone(),
                payload_fn: None,
                pre_run: None,
                post_run: None,
                invoker: invoker.clone(),
            });
        }

        Ok(Self {
            name: config.name.clone(),
            target: config.target.clone(),
            pre_run: None,
            post_run: None,
            phases,
        })
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "workload {} -> {}", self.name, self.target)?;
        for phase in &self.phases {
            write!(f, "  phase {}: {} threads", phase.name, phase.threads)?;
            match phase.timeout {
                Some(timeout) => writeln!(f, ", timeout {timeout:?}")?,
                None => writeln!(f, ", no timeout")?,
            }
        }
        Ok(())
    }
}
