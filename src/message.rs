//! Wire message schema for the session ↔ worker protocol.
//!
//! Every message is an [`Envelope`] pairing a small [`Header`] (id,
//! timestamp) with a discriminated-union [`Body`]. See
//! [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! for the protocol this one is descended from — ours replaces the five
//! ZeroMQ sockets with a single length-prefixed stream (see
//! [`crate::transport`]) and collapses the message set down to what an
//! interactive, durable Python execution core actually needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carried by every message: correlation id and wall-clock send time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Globally unique id of this message. For requests, this is also the
    /// correlation key reused by all derived messages (execution id, input
    /// id). For replies, this is a fresh id of the reply itself.
    pub id: String,

    /// Wall-clock send time, seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Header {
    /// Build a header with a fresh random id and the current time.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_unix(),
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A complete wire message: header plus a typed, tagged body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub header: Header,

    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Wrap a body with a freshly generated header.
    pub fn new(body: Body) -> Self {
        Self {
            header: Header::new(),
            body,
        }
    }

    /// The correlation key used to route this message to an in-flight
    /// request: the `execution_id` for execution-scoped messages, the
    /// `input_id` for an `InputResponse`, or this message's own `id` for
    /// standalone requests (`Execute`, `Input`).
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            Body::Execute { .. } => Some(self.header.id.as_str()),
            Body::Result { execution_id, .. } => Some(execution_id.as_str()),
            Body::Error { execution_id, .. } => Some(execution_id.as_str()),
            Body::Output { execution_id, .. } => Some(execution_id.as_str()),
            Body::Input { execution_id, .. } => Some(execution_id.as_str()),
            Body::InputResponse { input_id, .. } => Some(input_id.as_str()),
            Body::Cancel { execution_id, .. } => Some(execution_id.as_str()),
            Body::Heartbeat => None,
            Body::Ready { .. } => None,
            Body::Unknown => None,
        }
    }

    /// Type tag, used for logging unknown-message drops per the
    /// message-layer compatibility rule.
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
}

/// The stream an [`Body::Output`] frame was captured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// `Error.kind` as defined in the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source failed to parse or compile under both the flagged and
    /// AST-fallback compile paths.
    Compilation,
    /// User code raised an exception.
    Execution,
    /// Execution was cancelled via caller request or timeout.
    Cancelled,
    /// A configured wall-clock timeout fired.
    Timeout,
    /// The worker process terminated unexpectedly.
    WorkerCrash,
    /// A malformed frame, unknown required field, or state-machine
    /// violation.
    Protocol,
}

/// Type-specific fields for each message kind, internally tagged by `type`.
///
/// Unknown types deserialize to [`Body::Unknown`] per the message-layer
/// compatibility rule (log and drop, never error).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Execute a block of code.
    Execute {
        code: String,
        capture_source: bool,
    },

    /// Terminal success outcome of an execution.
    Result {
        execution_id: String,
        value: serde_json::Value,
        repr: Option<String>,
        duration_ms: f64,
    },

    /// Terminal failure outcome of an execution.
    Error {
        execution_id: String,
        kind: ErrorKind,
        message: String,
        traceback: Option<String>,
        #[serde(default)]
        notes: Vec<String>,
    },

    /// A chunk of captured stdout/stderr for an in-flight execution.
    Output {
        execution_id: String,
        stream: Stream,
        data: String,
        seq: u64,
    },

    /// The worker requests standard input on behalf of user code.
    Input {
        execution_id: String,
        prompt: String,
    },

    /// The client's answer to an [`Body::Input`] request.
    InputResponse { input_id: String, data: String },

    /// Sent by the Session to request cooperative cancellation of the named
    /// in-flight execution (caller-supplied timeout expiry, or the caller's
    /// `execute()` iterator being dropped before a terminal message arrived).
    Cancel {
        execution_id: String,
        reason: Option<String>,
    },

    /// Zero-payload liveness ping, emitted periodically by the worker.
    Heartbeat,

    /// Sent once by the worker immediately after startup.
    Ready { worker_version: Option<String> },

    /// Any message type this build doesn't recognize. Additive protocol
    /// changes land here instead of breaking older peers.
    #[serde(other)]
    Unknown,
}

impl Body {
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Execute { .. } => "execute",
            Body::Result { .. } => "result",
            Body::Error { .. } => "error",
            Body::Output { .. } => "output",
            Body::Input { .. } => "input",
            Body::InputResponse { .. } => "input_response",
            Body::Cancel { .. } => "cancel",
            Body::Heartbeat => "heartbeat",
            Body::Ready { .. } => "ready",
            Body::Unknown => "unknown",
        }
    }
}

/// Extra per-request metadata a timeout rejection carries, per §4.G.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutContext {
    pub capability: String,
    pub execution_id: Option<String>,
    pub request_id: String,
    pub timeout_seconds: f64,
}

/// A JSON-compatible projection of a namespace, used by
/// [`crate::engine::namespace::Namespace::serialize_for_persistence`].
/// Sets are not natively JSON, so they round-trip through a tagged shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedNamespace(pub BTreeMap<String, serde_json::Value>);

/// Binary codec for [`Envelope`] over the frame transport.
///
/// Uses MessagePack via `rmp-serde` with named-struct encoding so internally
/// tagged enums (and unknown-variant fallback) round-trip correctly; JSON is
/// available as a debug fallback per §4.B.
pub mod codec {
    use super::Envelope;

    /// Serialize an envelope to its binary wire representation.
    pub fn encode(msg: &Envelope) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(msg)
    }

    /// Parse a binary wire payload into an envelope.
    pub fn decode(payload: &[u8]) -> Result<Envelope, rmp_serde::decode::Error> {
        rmp_serde::from_slice(payload)
    }

    /// Debug-only JSON encoding, per the message layer's documented fallback.
    pub fn encode_json(msg: &Envelope) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(msg)
    }

    /// Debug-only JSON decoding.
    pub fn decode_json(payload: &[u8]) -> serde_json::Result<Envelope> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_round_trips_through_msgpack() {
        let msg = Envelope::new(Body::Execute {
            code: "1 + 1".into(),
            capture_source: true,
        });
        let bytes = codec::encode(&msg).unwrap();
        let back = codec::decode(&bytes).unwrap();
        assert_eq!(back.header.id, msg.header.id);
        assert_eq!(back.correlation_id(), Some(msg.header.id.as_str()));
        match back.body {
            Body::Execute {
                code,
                capture_source,
            } => {
                assert_eq!(code, "1 + 1");
                assert!(capture_source);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_drops_to_unknown_variant() {
        let mut value = serde_json::json!({
            "id": "abc",
            "timestamp": 0.0,
            "type": "debug_event",
        });
        let value = value.take();
        let bytes = serde_json::to_vec(&value).unwrap();
        let env: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(env.body, Body::Unknown));
        assert_eq!(env.type_name(), "unknown");
    }

    #[test]
    fn correlation_id_routes_by_message_kind() {
        let result = Envelope::new(Body::Result {
            execution_id: "exec-1".into(),
            value: serde_json::Value::Null,
            repr: None,
            duration_ms: 1.2,
        });
        assert_eq!(result.correlation_id(), Some("exec-1"));

        let input_response = Envelope::new(Body::InputResponse {
            input_id: "in-1".into(),
            data: "ada".into(),
        });
        assert_eq!(input_response.correlation_id(), Some("in-1"));

        let heartbeat = Envelope::new(Body::Heartbeat);
        assert_eq!(heartbeat.correlation_id(), None);
    }
}
