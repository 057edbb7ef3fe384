//! Phase execution engine for FaaS benchmark workloads.
//!
//! A [`Workload`] is a sequence of [`Phase`]s; each phase drives a number
//! of workers through a pluggable [`HatchRate`] against one [`Invoker`],
//! collecting one [`Trace`] per invocation into a [`Collector`] that a
//! background flusher persists as CSV.

pub mod bencher;
pub mod bucket;
pub mod collector;
pub mod config;
pub mod http;
pub mod invoker;
pub mod openwhisk;
pub mod rate;
pub mod registry;
mod runner;
pub mod trace;
pub mod workload;

pub use bencher::{Bencher, FLUSH_INTERVAL};
pub use bucket::TokenBucket;
pub use collector::{Collector, CsvSink};
pub use config::{
    render_output_path, BenchmarkConfig, HatchRateConfig, InvokerConfig, PhaseConfig,
    WorkloadConfig,
};
pub use http::HttpInvoker;
pub use invoker::{ExecError, Invoker, MockInvoker};
pub use openwhisk::WhiskInvoker;
pub use rate::{
    Completion, ConstantRate, FixedRpsRate, HatchRate, NoopRate, RateClosed, SlopingRate,
};
pub use registry::{invokers, rates, InvokerRegistry, RateRegistry};
pub use trace::{Trace, TraceEnvelope};
pub use workload::{HookFn, PayloadFn, Phase, Workload};
