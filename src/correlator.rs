//! Request/Response Correlator (spec §4.G).
//!
//! Ties outgoing requests to durable promises resolved when a matching
//! response frame arrives, the same shape as the teacher's
//! `reply_tx_map: Arc<DashMap<String, oneshot::Sender<KernelMessage>>>` plus
//! its `PendingRequest` drop-guard (`backend/wire_protocol.rs`): a pending
//! entry is removed from the map either when it resolves/rejects or when
//! its handle is dropped, so a caller that stops polling never leaks a slot.
//!
//! [`crate::session::Session`] owns one of these and feeds it every inbound
//! envelope from its reader loop. It registers an `exec:{execution_id}`
//! promise only when a caller's `execute()` supplies a timeout, using the
//! promise's own timeout rejection to decide when to send the worker a
//! `Cancel` message and surface a synthetic `cancelled` terminal error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::message::{Body, Envelope, ErrorKind};

/// The outcome a promise is resolved or rejected with.
#[derive(Debug, Clone)]
pub enum Outcome {
    Resolved(Value),
    Rejected(Rejection),
}

/// Structured rejection payload (spec §4.G / §7).
#[derive(Debug, Clone)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
    pub notes: Vec<String>,
}

impl Rejection {
    fn timeout(capability: &str, execution_id: Option<&str>, request_id: &str, seconds: f64) -> Self {
        Rejection {
            kind: ErrorKind::Timeout,
            message: format!(
                "{capability} request {request_id} timed out after {seconds}s\
                 {exec}",
                exec = execution_id
                    .map(|id| format!(" (execution_id={id})"))
                    .unwrap_or_default()
            ),
            notes: vec![],
        }
    }

    fn cancelled(reason: &str) -> Self {
        Rejection {
            kind: ErrorKind::Cancelled,
            message: reason.to_string(),
            notes: vec![],
        }
    }

    fn worker_crash() -> Self {
        Rejection {
            kind: ErrorKind::WorkerCrash,
            message: "worker process terminated unexpectedly".to_string(),
            notes: vec![],
        }
    }
}

struct Pending {
    tx: Option<oneshot::Sender<Outcome>>,
}

/// A caller-held handle for one outstanding promise. Dropping it before the
/// promise settles removes its map entry, mirroring the teacher's
/// `PendingRequest` drop guard.
pub struct Handle {
    id: String,
    registry: Arc<DashMap<String, Pending>>,
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl Handle {
    /// Await the outcome, or a timeout rejection carrying request context.
    pub async fn wait(mut self, capability: &str, execution_id: Option<&str>, deadline: Option<Duration>) -> Outcome {
        let rx = self.rx.take().expect("wait() called once");
        let result = match deadline {
            Some(d) => timeout(d, rx).await,
            None => Ok(rx.await),
        };

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_canceled)) => Outcome::Rejected(Rejection::cancelled("promise dropped before settling")),
            Err(_elapsed) => {
                let seconds = deadline.map(|d| d.as_secs_f64()).unwrap_or_default();
                let rejection = Rejection::timeout(capability, execution_id, &self.id, seconds);
                self.registry.remove(&self.id);
                Outcome::Rejected(rejection)
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Durable promise registry and message-interceptor bridge.
///
/// The correlator never reads the transport directly (spec §4.G); it is
/// driven entirely by [`Correlator::on_message`], which the
/// [`crate::session::Session`] calls for every inbound envelope via its
/// interceptor mechanism.
pub struct Correlator {
    pending: Arc<DashMap<String, Pending>>,
    open: std::sync::atomic::AtomicBool,
    pending_high_water_mark: AtomicU64,
    timeouts_total: AtomicU64,
    cancelled_total: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            open: std::sync::atomic::AtomicBool::new(true),
            pending_high_water_mark: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
        }
    }

    /// Idempotent; a no-op if already open.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Idempotent; rejects every still-pending promise with `cancelled`.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, mut slot)) = self.pending.remove(&key) {
                if let Some(tx) = slot.tx.take() {
                    self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send(Outcome::Rejected(Rejection::cancelled(
                        "correlator closed with request still pending",
                    )));
                }
            }
        }
    }

    fn promise_id_for_execute(execution_id: &str) -> String {
        format!("exec:{execution_id}")
    }

    fn promise_id_for_input(execution_id: &str, input_message_id: &str) -> String {
        format!("{execution_id}:input:{input_message_id}")
    }

    /// Register a promise for an `execute` flow, keyed on the execution id.
    pub fn register_execute(&self, execution_id: &str) -> Handle {
        self.register(Self::promise_id_for_execute(execution_id))
    }

    /// Register a promise for an `input` flow, keyed on execution id and
    /// the Input message's own id.
    pub fn register_input(&self, execution_id: &str, input_message_id: &str) -> Handle {
        self.register(Self::promise_id_for_input(execution_id, input_message_id))
    }

    fn register(&self, id: String) -> Handle {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), Pending { tx: Some(tx) });
        let current = self.pending.len() as u64;
        self.pending_high_water_mark
            .fetch_max(current, Ordering::Relaxed);
        Handle {
            id,
            registry: self.pending.clone(),
            rx: Some(rx),
        }
    }

    /// Feed an inbound envelope to the correlator. Called by the Session's
    /// interceptor chain for every message, regardless of whether it
    /// matches a pending promise.
    pub fn on_message(&self, envelope: &Envelope) {
        match &envelope.body {
            Body::Result {
                execution_id,
                value,
                ..
            } => {
                self.settle(
                    &Self::promise_id_for_execute(execution_id),
                    Outcome::Resolved(value.clone()),
                );
            }
            Body::Error {
                execution_id,
                kind,
                message,
                notes,
                ..
            } => {
                self.settle(
                    &Self::promise_id_for_execute(execution_id),
                    Outcome::Rejected(Rejection {
                        kind: *kind,
                        message: message.clone(),
                        notes: notes.clone(),
                    }),
                );
            }
            Body::InputResponse { input_id, data } => {
                // input_id is the Input message's own id; the promise key
                // additionally requires the execution_id, which callers
                // supplied at registration time via `register_input`. We
                // recover it by scanning for the suffix, since InputResponse
                // only carries the input message id on the wire.
                let suffix = format!(":input:{input_id}");
                if let Some(key) = self
                    .pending
                    .iter()
                    .map(|e| e.key().clone())
                    .find(|k| k.ends_with(&suffix))
                {
                    self.settle(&key, Outcome::Resolved(Value::String(data.clone())));
                }
            }
            _ => {}
        }
    }

    fn settle(&self, id: &str, outcome: Outcome) {
        if let Some((_, mut slot)) = self.pending.remove(id) {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(outcome);
            }
        } else {
            debug!(promise_id = id, "settle for unknown or already-settled promise");
        }
    }

    /// Reject the promise for `execution_id`, if present, with a
    /// `worker_crash` outcome. Used when the transport itself fails.
    pub fn fail_all_with_worker_crash(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.settle(&key, Outcome::Rejected(Rejection::worker_crash()));
        }
    }

    pub fn pending_current(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_high_water_mark(&self) -> u64 {
        self.pending_high_water_mark.load(Ordering::Relaxed)
    }

    pub fn timeouts_total(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    pub fn cancelled_total(&self) -> u64 {
        self.cancelled_total.load(Ordering::Relaxed)
    }

    /// Called by [`Handle::wait`] via the session when a timeout elapses,
    /// so the correlator's counters stay accurate even though the handle
    /// itself removed the map entry.
    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn result_resolves_the_matching_execute_promise() {
        let correlator = Correlator::new();
        let handle = correlator.register_execute("exec-1");

        let result_msg = Envelope::new(Body::Result {
            execution_id: "exec-1".into(),
            value: serde_json::json!(10),
            repr: Some("10".into()),
            duration_ms: 1.0,
        });
        correlator.on_message(&result_msg);

        let outcome = handle.wait("execute", Some("exec-1"), None).await;
        match outcome {
            Outcome::Resolved(v) => assert_eq!(v, serde_json::json!(10)),
            other => panic!("expected resolved, got {other:?}"),
        }
        assert_eq!(correlator.pending_current(), 0);
    }

    #[tokio::test]
    async fn error_rejects_distinct_from_resolve() {
        let correlator = Correlator::new();
        let handle = correlator.register_execute("exec-2");

        let err_msg = Envelope::new(Body::Error {
            execution_id: "exec-2".into(),
            kind: ErrorKind::Execution,
            message: "boom".into(),
            traceback: None,
            notes: vec![],
        });
        correlator.on_message(&err_msg);

        match handle.wait("execute", Some("exec-2"), None).await {
            Outcome::Rejected(rej) => {
                assert_eq!(rej.kind, ErrorKind::Execution);
                assert_eq!(rej.message, "boom");
            }
            other => panic!("expected rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_rejects_without_a_response() {
        let correlator = Correlator::new();
        let handle = correlator.register_execute("exec-3");

        let outcome = handle
            .wait("execute", Some("exec-3"), Some(Duration::from_millis(10)))
            .await;
        match outcome {
            Outcome::Rejected(rej) => assert_eq!(rej.kind, ErrorKind::Timeout),
            other => panic!("expected timeout rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_rejects_all_pending_with_cancelled() {
        let correlator = Correlator::new();
        let handle = correlator.register_execute("exec-4");
        correlator.close();

        match handle.wait("execute", Some("exec-4"), None).await {
            Outcome::Rejected(rej) => assert_eq!(rej.kind, ErrorKind::Cancelled),
            other => panic!("expected cancelled rejection, got {other:?}"),
        }
        assert_eq!(correlator.cancelled_total(), 1);
    }

    #[tokio::test]
    async fn input_response_resolves_by_suffix_match() {
        let correlator = Correlator::new();
        let handle = correlator.register_input("exec-5", "input-msg-1");

        let resp = Envelope::new(Body::InputResponse {
            input_id: "input-msg-1".into(),
            data: "ADA".into(),
        });
        correlator.on_message(&resp);

        match handle.wait("input", Some("exec-5"), None).await {
            Outcome::Resolved(v) => assert_eq!(v, serde_json::json!("ADA")),
            other => panic!("expected resolved, got {other:?}"),
        }
    }
}
