use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::debug;

use crate::bencher::Bencher;
use crate::collector::Collector;
use crate::config::{duration_option, flag_option, require_options, str_option, InvokerConfig};
use crate::invoker::{ExecError, Invoker};
use crate::rate::HatchRate;
use crate::trace::{synthesize_id, Trace, TraceEnvelope};
use crate::workload::Phase;

/// Upper bound on idle connections kept per host.
pub const MAX_IDLE_CONN: usize = 500;

const BENCH_USER_AGENT: &str = "doom/0.0.2";
const BENCH_HEADER: &str = "X-Benchmark";
const BENCH_TAG: &str = "doom";

/// HTTP(S) endpoint client.
///
/// Benchmarking posture: TLS verification is disabled and the connection
/// pool is sized to the phase's worker count (capped at [`MAX_IDLE_CONN`]).
#[derive(Debug)]
pub struct HttpInvoker {
    timeout: Duration,
    body: Option<Vec<u8>>,
    compression: bool,
    keep_alive: bool,
    redirects: bool,
    h2: bool,
    state: Mutex<Option<HttpState>>,
}

#[derive(Clone, Debug)]
struct HttpState {
    client: reqwest::Client,
    target: String,
    headers: HeaderMap,
    body: Vec<u8>,
    collector: Arc<Collector>,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            body: None,
            compression: true,
            keep_alive: true,
            redirects: true,
            h2: false,
            state: Mutex::new(None),
        }
    }

    pub fn from_config(config: &InvokerConfig) -> anyhow::Result<Self> {
        require_options(&config.kind, &config.options, &["timeout"])?;
        Ok(Self {
            timeout: duration_option(&config.options, "timeout")?,
            body: str_option(&config.options, "body").map(String::into_bytes),
            compression: flag_option(&config.options, "compression", true),
            keep_alive: flag_option(&config.options, "keep_alive", true),
            redirects: flag_option(&config.options, "redirects", true),
            h2: flag_option(&config.options, "h2", false),
            state: Mutex::new(None),
        })
    }

    fn state(&self) -> Option<HttpState> {
        self.state.lock().unwrap().clone()
    }

    /// One request against the template; always yields a trace, status 0 on
    /// transport errors.
    async fn attempt(&self, state: &HttpState) -> Trace {
        let id = synthesize_id();
        let request_start = Utc::now();
        let started = std::time::Instant::now();

        let response = state
            .client
            .get(state.target.as_str())
            .headers(state.headers.clone())
            .header("X-Request-ID", id.as_str())
            .body(state.body.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let first_byte = started.elapsed();
                let status = response.status().as_u16();
                let body = response.bytes().await.unwrap_or_default();
                let total = started.elapsed();
                debug!(
                    %id,
                    status,
                    first_byte_ms = first_byte.as_millis() as u64,
                    "request done"
                );

                let mut trace = Trace::client_side(
                    id.clone(),
                    status,
                    request_start,
                    Utc::now(),
                    first_byte.as_millis() as u64,
                    total.as_millis() as u64,
                );
                match serde_json::from_slice::<TraceEnvelope>(&body) {
                    Ok(envelope) => trace.absorb(envelope),
                    Err(err) => debug!(%id, "response body is not a trace envelope: {err}"),
                }
                trace
            }
            Err(err) => {
                debug!(%id, "request failed: {err}");
                Trace::client_side(
                    id,
                    0,
                    request_start,
                    Utc::now(),
                    0,
                    started.elapsed().as_millis() as u64,
                )
            }
        }
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn setup(&self, phase: &Phase, bencher: &Bencher) -> anyhow::Result<()> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .pool_max_idle_per_host(if self.keep_alive {
                phase.threads.min(MAX_IDLE_CONN)
            } else {
                0
            })
            .gzip(self.compression);
        if !self.redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        if self.h2 {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder.build().context("failed to build http client")?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(BENCH_HEADER, HeaderValue::from_static(BENCH_TAG));
        headers.insert(USER_AGENT, HeaderValue::from_static(BENCH_USER_AGENT));

        let body = match &phase.payload_fn {
            Some(payload_fn) => payload_fn(),
            None => self.body.clone().unwrap_or_default(),
        };

        *self.state.lock().unwrap() = Some(HttpState {
            client,
            target: phase.target.clone(),
            headers,
            body,
            collector: bencher.collector(),
        });
        Ok(())
    }

    async fn exec(&self, rate: &dyn HatchRate) -> Result<(), ExecError> {
        let state = self
            .state()
            .ok_or_else(|| ExecError::Invocation(anyhow::anyhow!("invoker not set up")))?;

        rate.take().await?;

        let trace = self.attempt(&state).await;
        match trace.status {
            200..=299 => rate.on_success(),
            0 => rate.on_failed(),
            status if status >= 400 => rate.on_failed(),
            _ => {}
        }
        state.collector.add(trace);
        Ok(())
    }
}
