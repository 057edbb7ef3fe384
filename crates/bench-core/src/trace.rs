use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome record for one invocation attempt.
///
/// The client-measured fields (`id`, `status`, request instants and
/// latencies) are always present. Everything else is metadata the target
/// function echoed back in its response envelope and is merged in via
/// [`Trace::absorb`] when the body parses as one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub status: u16,
    pub request_start: DateTime<Utc>,
    pub request_end: DateTime<Utc>,
    /// Request to first response byte, in milliseconds.
    pub first_byte_ms: u64,
    /// Request to end of response body, in milliseconds.
    pub response_ms: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub host_id: Option<String>,
    pub boot_time: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub code_version: Option<String>,
    pub config_version: Option<String>,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub memory: Option<u64>,
    /// Server-side execution latency, in milliseconds.
    pub execution_ms: Option<u64>,
}

impl Trace {
    /// A trace carrying only client-side measurements.
    pub fn client_side(
        id: String,
        status: u16,
        request_start: DateTime<Utc>,
        request_end: DateTime<Utc>,
        first_byte_ms: u64,
        response_ms: u64,
    ) -> Self {
        Self {
            id,
            status,
            request_start,
            request_end,
            first_byte_ms,
            response_ms,
            timestamp: None,
            container_id: None,
            host_id: None,
            boot_time: None,
            cost: None,
            start_time: None,
            end_time: None,
            code_version: None,
            config_version: None,
            platform: None,
            runtime: None,
            memory: None,
            execution_ms: None,
        }
    }

    /// Fold a parsed response envelope into this trace. Server-reported
    /// fields win; the synthesized id stands when the server sent none.
    pub fn absorb(&mut self, envelope: TraceEnvelope) {
        if !envelope.id.is_empty() {
            self.id = envelope.id;
        }
        self.timestamp = envelope.timestamp.or(self.timestamp);
        self.container_id = envelope.container_id.or(self.container_id.take());
        self.host_id = envelope.host_id.or(self.host_id.take());
        self.boot_time = envelope.boot_time.or(self.boot_time);
        self.cost = envelope.cost.or(self.cost);
        self.start_time = envelope.start_time.or(self.start_time);
        self.end_time = envelope.end_time.or(self.end_time);
        self.code_version = envelope.code_version.or(self.code_version.take());
        self.config_version = envelope.config_version.or(self.config_version.take());
        self.platform = envelope.platform.or(self.platform.take());
        self.runtime = envelope.runtime.or(self.runtime.take());
        self.memory = envelope.memory.or(self.memory);
        self.execution_ms = envelope.execution_ms.or(self.execution_ms);
    }
}

/// Generate a request/trace id when the server does not provide one.
pub fn synthesize_id() -> String {
    Uuid::new_v4().to_string()
}

/// Partial trace as reported by the target function in its response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceEnvelope {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub host_id: Option<String>,
    pub boot_time: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub code_version: Option<String>,
    pub config_version: Option<String>,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub memory: Option<u64>,
    pub execution_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_trace() -> Trace {
        Trace::client_side(
            "local-id".to_string(),
            200,
            Utc::now(),
            Utc::now(),
            12,
            34,
        )
    }

    #[test]
    fn absorb_keeps_synthesized_id_when_server_sends_none() {
        let mut trace = base_trace();
        trace.absorb(TraceEnvelope::default());
        assert_eq!(trace.id, "local-id");
    }

    #[test]
    fn absorb_prefers_server_fields() {
        let mut trace = base_trace();
        let envelope: TraceEnvelope = serde_json::from_str(
            r#"{"id":"remote-id","platform":"TEST","memory":128,"execution_ms":55}"#,
        )
        .unwrap();
        trace.absorb(envelope);

        assert_eq!(trace.id, "remote-id");
        assert_eq!(trace.platform.as_deref(), Some("TEST"));
        assert_eq!(trace.memory, Some(128));
        assert_eq!(trace.execution_ms, Some(55));
        // client-side measurements are untouched
        assert_eq!(trace.first_byte_ms, 12);
        assert_eq!(trace.response_ms, 34);
    }

    #[test]
    fn envelope_parses_from_partial_json() {
        let envelope: TraceEnvelope =
            serde_json::from_str(r#"{"container_id":"c1"}"#).unwrap();
        assert_eq!(envelope.container_id.as_deref(), Some("c1"));
        assert!(envelope.id.is_empty());
    }
}
