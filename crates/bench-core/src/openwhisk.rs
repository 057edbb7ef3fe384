use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bencher::Bencher;
use crate::bucket::TokenBucket;
use crate::collector::Collector;
use crate::config::{require_options, str_option, u64_option, InvokerConfig};
use crate::invoker::{ExecError, Invoker};
use crate::rate::HatchRate;
use crate::trace::{synthesize_id, Trace, TraceEnvelope};
use crate::workload::Phase;

/// Invocation attempts per `exec` before giving up.
pub const MAX_RETRIES: usize = 4;
/// Activation polls per accepted (202) invocation.
pub const MAX_PULL_RETRIES: usize = 4;

const POLL_BACKOFF_BASE: Duration = Duration::from_secs(4);
const POLL_BACKOFF_RATIO: u32 = 4;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenWhisk action invoker over the platform's REST API.
///
/// Synchronous invocations come back as HTTP 200 with the result inline;
/// asynchronous ones return 202 with an `activationId` that is then polled
/// under a per-minute rate cap.
#[derive(Debug)]
pub struct WhiskInvoker {
    function: Option<String>,
    requests_per_minute: u64,
    host: String,
    token: String,
    state: Mutex<Option<WhiskState>>,
}

#[derive(Clone, Debug)]
struct WhiskState {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    function: String,
    auth_user: String,
    auth_pass: Option<String>,
    payload: Option<serde_json::Value>,
    collector: Arc<Collector>,
    poll_bucket: Arc<TokenBucket>,
}

impl WhiskInvoker {
    pub fn from_config(config: &InvokerConfig) -> anyhow::Result<Self> {
        require_options(&config.kind, &config.options, &["host", "token"])?;

        let mut requests_per_minute = 60;
        if config.options.contains_key("rps") {
            requests_per_minute = u64_option(&config.options, "rps")?;
            if requests_per_minute == 0 {
                bail!("rps must be positive");
            }
            if requests_per_minute > 200 {
                warn!("setting rps over 200 can result in openwhisk failures in some instances");
            }
        }

        Ok(Self {
            function: str_option(&config.options, "function"),
            requests_per_minute,
            host: str_option(&config.options, "host").unwrap_or_default(),
            token: str_option(&config.options, "token").unwrap_or_default(),
            state: Mutex::new(None),
        })
    }

    fn state(&self) -> Option<WhiskState> {
        self.state.lock().unwrap().clone()
    }

    async fn try_invoke(
        &self,
        state: &WhiskState,
        rate: &dyn HatchRate,
    ) -> Result<Trace, ExecError> {
        let request_start = Utc::now();
        let started = std::time::Instant::now();
        let invoke_url = format!(
            "{}/api/v1/namespaces/{}/actions/{}?blocking=true",
            state.base_url, state.namespace, state.function
        );

        for attempt in 1..=MAX_RETRIES {
            rate.take().await?;

            let mut request = state
                .client
                .post(&invoke_url)
                .basic_auth(&state.auth_user, state.auth_pass.as_deref());
            if let Some(payload) = &state.payload {
                request = request.json(payload);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!("failed [{attempt}/{MAX_RETRIES}]: {err}");
                    rate.on_failed();
                    continue;
                }
            };

            let status = response.status().as_u16();
            debug!("invoked {} - {status}", state.function);
            match status {
                200 => {
                    rate.on_success();
                    let first_byte = started.elapsed();
                    let body = response.bytes().await.unwrap_or_default();
                    let mut trace = Trace::client_side(
                        synthesize_id(),
                        200,
                        request_start,
                        Utc::now(),
                        first_byte.as_millis() as u64,
                        started.elapsed().as_millis() as u64,
                    );
                    absorb_blocking_body(&mut trace, &body);
                    return Ok(trace);
                }
                202 => {
                    rate.on_queued();
                    let body: serde_json::Value =
                        response.json().await.unwrap_or_default();
                    let Some(activation_id) =
                        body.get("activationId").and_then(serde_json::Value::as_str)
                    else {
                        debug!("202 without an activationId");
                        rate.on_failed();
                        continue;
                    };
                    match self.poll_activation(state, activation_id).await {
                        Ok(mut trace) => {
                            trace.request_start = request_start;
                            trace.request_end = Utc::now();
                            trace.response_ms = started.elapsed().as_millis() as u64;
                            return Ok(trace);
                        }
                        Err(err) => {
                            debug!("failed [{attempt}/{MAX_RETRIES}]: {err:#}");
                            rate.on_failed();
                        }
                    }
                }
                status => {
                    debug!(
                        "failed [{attempt}/{MAX_RETRIES}] to invoke {} - {status}",
                        state.function
                    );
                    rate.on_failed();
                }
            }
        }

        Err(ExecError::Invocation(anyhow!(
            "failed request after {MAX_RETRIES} tries"
        )))
    }

    async fn poll_activation(
        &self,
        state: &WhiskState,
        activation_id: &str,
    ) -> anyhow::Result<Trace> {
        let url = format!(
            "{}/api/v1/namespaces/{}/activations/{}",
            state.base_url, state.namespace, activation_id
        );
        let mut backoff = POLL_BACKOFF_BASE;

        debug!("polling activation {activation_id}");
        for _ in 0..MAX_PULL_RETRIES {
            state.poll_bucket.acquire().await;

            match state
                .client
                .get(&url)
                .basic_auth(&state.auth_user, state.auth_pass.as_deref())
                .send()
                .await
            {
                Ok(response) if response.status().as_u16() == 200 => {
                    let activation: Activation = response
                        .json()
                        .await
                        .with_context(|| format!("failed to fetch activation {activation_id}"))?;
                    debug!("polled {activation_id} successfully");

                    let now = Utc::now();
                    let mut trace =
                        Trace::client_side(synthesize_id(), activation.status_code, now, now, 0, 0);
                    if let Ok(envelope) =
                        serde_json::from_value::<TraceEnvelope>(activation.response.result.clone())
                    {
                        trace.absorb(envelope);
                    }
                    if !activation.activation_id.is_empty() {
                        trace.id = activation.activation_id;
                    }
                    trace.status = activation.status_code;
                    trace.execution_ms = Some(activation.duration);
                    if !activation.version.is_empty() {
                        trace.code_version = Some(activation.version);
                    }
                    return Ok(trace);
                }
                Ok(response) => {
                    debug!("activation not ready - {}", response.status());
                }
                Err(err) => {
                    debug!("failed to poll: {err}");
                }
            }

            // results not here yet, exponential backoff between polls
            sleep(backoff).await;
            backoff *= POLL_BACKOFF_RATIO;
        }

        bail!("could not fetch activation {activation_id} after {MAX_PULL_RETRIES} tries")
    }
}

#[async_trait]
impl Invoker for WhiskInvoker {
    async fn setup(&self, phase: &Phase, bencher: &Bencher) -> anyhow::Result<()> {
        let (host, token, namespace) = resolve_credentials(&self.host, &self.token);
        if token.is_empty() {
            warn!("did not find a token for the openwhisk client");
        }
        let (auth_user, auth_pass) = match token.split_once(':') {
            Some((user, pass)) => (user.to_string(), Some(pass.to_string())),
            None => (token, None),
        };

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(CLIENT_TIMEOUT)
            .build()
            .context("failed to build openwhisk client")?;

        let function = self
            .function
            .clone()
            .unwrap_or_else(|| phase.target.clone());

        let payload = match &phase.payload_fn {
            Some(payload_fn) => Some(
                serde_json::from_slice(&payload_fn())
                    .context("failed to create invocation payload")?,
            ),
            None => None,
        };

        *self.state.lock().unwrap() = Some(WhiskState {
            client,
            base_url: url_base(&host),
            namespace,
            function,
            auth_user,
            auth_pass,
            payload,
            collector: bencher.collector(),
            poll_bucket: Arc::new(TokenBucket::new(
                self.requests_per_minute,
                Duration::from_secs(60),
                (self.requests_per_minute / 60).max(1),
            )),
        });
        Ok(())
    }

    async fn exec(&self, rate: &dyn HatchRate) -> Result<(), ExecError> {
        let state = self
            .state()
            .ok_or_else(|| ExecError::Invocation(anyhow!("invoker not set up")))?;
        let trace = self.try_invoke(&state, rate).await?;
        state.collector.add(trace);
        Ok(())
    }
}

/// Blocking invocations return the full activation record; bare function
/// results are accepted as a fallback.
fn absorb_blocking_body(trace: &mut Trace, body: &[u8]) {
    if let Ok(activation) = serde_json::from_slice::<Activation>(body) {
        if !activation.activation_id.is_empty() {
            if let Ok(envelope) =
                serde_json::from_value::<TraceEnvelope>(activation.response.result)
            {
                trace.absorb(envelope);
            }
            trace.id = activation.activation_id;
            trace.execution_ms = Some(activation.duration);
            if !activation.version.is_empty() {
                trace.code_version = Some(activation.version);
            }
            return;
        }
    }
    if let Ok(envelope) = serde_json::from_slice::<TraceEnvelope>(body) {
        trace.absorb(envelope);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Activation {
    activation_id: String,
    version: String,
    status_code: u16,
    /// Execution duration in milliseconds.
    duration: u64,
    response: ActivationResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActivationResponse {
    result: serde_json::Value,
}

fn wskprops_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".wskprops"),
        None => PathBuf::from("~").join(".wskprops"),
    }
}

/// Explicit config wins; otherwise `~/.wskprops`, otherwise the
/// `__OW_*` environment.
fn resolve_credentials(host: &str, token: &str) -> (String, String, String) {
    if !token.is_empty() {
        return (host.to_string(), token.to_string(), "_".to_string());
    }

    let props = match std::fs::read_to_string(wskprops_path()) {
        Ok(contents) => parse_props(&contents),
        Err(_) => std::env::vars().collect(),
    };
    let (props_host, props_token, namespace) = credentials_from(&props);

    (
        props_host.unwrap_or_else(|| host.to_string()),
        props_token.unwrap_or_default(),
        namespace.unwrap_or_else(|| "_".to_string()),
    )
}

/// `key=value`, one per line.
fn parse_props(contents: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in contents.lines() {
        match line.split_once('=') {
            Some((key, value)) => {
                props.insert(key.trim().to_string(), value.trim().to_string());
            }
            None if !line.trim().is_empty() => {
                debug!("could not read prop line {line}");
            }
            None => {}
        }
    }
    props
}

fn credentials_from(
    props: &HashMap<String, String>,
) -> (Option<String>, Option<String>, Option<String>) {
    let pick = |primary: &str, fallback: &str| {
        props
            .get(primary)
            .or_else(|| props.get(fallback))
            .cloned()
    };
    (
        pick("APIHOST", "__OW_API_HOST"),
        pick("AUTH", "__OW_API_KEY"),
        pick("NAMESPACE", "__OW_NAMESPACE"),
    )
}

fn url_base(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}
