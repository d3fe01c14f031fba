//! Worker Process (spec §4.E).
//!
//! Owns the single event loop inside the worker: a transport reader pump, a
//! request dispatcher, and the [`crate::engine::Engine`] plus
//! [`crate::engine::namespace::Namespace`] it drives. Runs as the binary
//! entry point in `src/bin/capsule-worker.rs`; stdin/stdout are the wire
//! channel, so all diagnostic logging here goes to stderr only (installed
//! by the binary, not this module).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pyo3::prelude::*;
use tokio::io::{Stdin, Stdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::io_capture::{IoEvent, IoHandle};
use crate::engine::Engine;
use crate::message::{Body, Envelope, Stream};
use crate::transport::{self, FrameReader, FrameWriter};

/// Pending `input()` calls the worker is waiting on a matching
/// `InputResponse` for, keyed by the Input message's own id.
type InputWaiters = Arc<DashMap<String, oneshot::Sender<String>>>;

/// Drives the worker's event loop until stdin closes or a fatal protocol
/// error occurs.
pub struct Worker {
    engine: Engine,
    reader: FrameReader<Stdin>,
    writer: FrameWriter<Stdout>,
    input_waiters: InputWaiters,
    output_seq: Arc<AtomicU64>,
    config: Config,
    io: IoHandle,
}

impl Worker {
    pub fn new(py: Python<'_>, config: Config, stdin: Stdin, stdout: Stdout) -> PyResult<Self> {
        let writer = FrameWriter::new(stdout, config.max_frame_bytes);
        let input_waiters: InputWaiters = Arc::new(DashMap::new());
        let output_seq = Arc::new(AtomicU64::new(0));

        // The captured-output/`input()` capabilities the engine injects into
        // user code run on whichever thread is executing Python (the worker's
        // own tokio thread for sync/async code, the dedicated blocking-sync
        // thread for blocking code); this background task is the single place
        // that turns those callbacks into frames on the real transport.
        let (io_tx, mut io_rx) = mpsc::unbounded_channel::<IoEvent>();
        {
            let writer = writer.clone();
            let input_waiters = input_waiters.clone();
            let output_seq = output_seq.clone();
            tokio::spawn(async move {
                while let Some(event) = io_rx.recv().await {
                    match event {
                        IoEvent::Output { execution_id, stream, data } => {
                            if let Err(err) =
                                emit_output_to(&writer, &execution_id, stream, data, &output_seq).await
                            {
                                warn!(error = %err, "failed to emit captured output");
                                break;
                            }
                        }
                        IoEvent::Input { execution_id, prompt, reply } => {
                            let response =
                                request_input_via(&writer, &input_waiters, &execution_id, &prompt)
                                    .await
                                    .unwrap_or_else(|err| {
                                        warn!(error = %err, "failed to request input");
                                        String::new()
                                    });
                            let _ = reply.send(response);
                        }
                        IoEvent::Flush { done } => {
                            let _ = done.send(());
                        }
                    }
                }
            });
        }

        let io = IoHandle::new(io_tx);
        let engine = Engine::new(
            py,
            Duration::from_secs_f64(config.execute_timeout_s),
            config.blocking_modules.clone(),
            config.blocking_methods_by_module.clone(),
            io.clone(),
        )?;

        Ok(Self {
            engine,
            reader: FrameReader::new(stdin, config.max_frame_bytes),
            writer,
            input_waiters,
            output_seq,
            config,
            io,
        })
    }

    /// Main loop: send `Ready`, then concurrently pump heartbeats and
    /// service inbound frames until the transport closes.
    pub async fn run(mut self) -> Result<(), transport::Error> {
        self.send_ready().await?;

        let heartbeat_interval = Duration::from_secs_f64(self.config.heartbeat_interval_s);
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = transport::receive_envelope(&mut self.reader) => {
                    match envelope? {
                        Some(envelope) => {
                            if let Err(err) = self.dispatch(envelope).await {
                                warn!(error = %err, "failed to dispatch inbound message");
                            }
                        }
                        None => continue, // unknown type, already logged and dropped
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = transport::send_envelope(&self.writer, &Envelope::new(Body::Heartbeat)).await {
                        error!(error = %err, "failed to emit heartbeat");
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn send_ready(&self) -> Result<(), transport::Error> {
        let ready = Envelope::new(Body::Ready {
            worker_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        });
        transport::send_envelope(&self.writer, &ready).await
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), transport::Error> {
        match envelope.body {
            Body::Execute { code, .. } => {
                self.handle_execute(envelope.header.id, code).await?;
            }
            Body::InputResponse { input_id, data } => {
                if let Some((_, tx)) = self.input_waiters.remove(&input_id) {
                    let _ = tx.send(data);
                } else {
                    warn!(input_id, "input_response for unknown or already-settled input");
                }
            }
            Body::Cancel { execution_id, reason } => {
                let cancelled = self.engine.cancel_current(reason.as_deref());
                if !cancelled {
                    warn!(execution_id, "cancel request for an execution that is not current");
                }
            }
            other => {
                warn!(kind = other.type_name(), "ignoring message not expected inbound to worker");
            }
        }
        Ok(())
    }

    async fn handle_execute(&self, execution_id: String, code: String) -> Result<(), transport::Error> {
        info!(execution_id, "starting execution");
        let started = std::time::Instant::now();

        let outcome = self.engine.execute(&execution_id, &code).await;

        // Drain every Output frame queued by this execution before emitting
        // the terminal Result/Error, so captured stdout/stderr always
        // arrives first (spec §4.E, testable property 3).
        self.io.flush().await;

        match outcome {
            Ok(outcome) => {
                let value_json =
                    Python::with_gil(|py| pyo3_value_to_json(py, outcome.value.bind(py)));
                let result = Envelope::new(Body::Result {
                    execution_id: execution_id.clone(),
                    value: value_json.unwrap_or(serde_json::Value::Null),
                    repr: outcome.repr,
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                });
                transport::send_envelope(&self.writer, &result).await?;
            }
            Err(err) => {
                let kind = err.wire_kind();
                let error_msg = Envelope::new(Body::Error {
                    execution_id: execution_id.clone(),
                    kind,
                    message: err.to_string(),
                    traceback: None,
                    notes: execution_notes(&execution_id, &code),
                });
                transport::send_envelope(&self.writer, &error_msg).await?;
            }
        }

        Ok(())
    }

    /// The `input(prompt="")` capability injected into the namespace (spec
    /// §4.E). Sends an Input frame, registers a waiter keyed on a fresh
    /// message id, and suspends until the matching InputResponse resolves
    /// the waiter.
    pub async fn request_input(&self, execution_id: &str, prompt: &str) -> Result<String, transport::Error> {
        request_input_via(&self.writer, &self.input_waiters, execution_id, prompt).await
    }

    /// Emit one chunk of captured output. The caller is responsible for
    /// calling this for every write performed during an execution and for
    /// ensuring all such calls complete (flush) before the terminal
    /// Result/Error is sent, preserving the output-before-result ordering
    /// invariant (spec §4.E, testable property 3).
    pub async fn emit_output(
        &self,
        execution_id: &str,
        stream: Stream,
        data: String,
    ) -> Result<(), transport::Error> {
        emit_output_to(&self.writer, execution_id, stream, data, &self.output_seq).await
    }
}

async fn emit_output_to(
    writer: &FrameWriter<Stdout>,
    execution_id: &str,
    stream: Stream,
    data: String,
    output_seq: &AtomicU64,
) -> Result<(), transport::Error> {
    let seq = output_seq.fetch_add(1, Ordering::SeqCst);
    let output = Envelope::new(Body::Output {
        execution_id: execution_id.to_string(),
        stream,
        data,
        seq,
    });
    transport::send_envelope(writer, &output).await
}

async fn request_input_via(
    writer: &FrameWriter<Stdout>,
    input_waiters: &InputWaiters,
    execution_id: &str,
    prompt: &str,
) -> Result<String, transport::Error> {
    let input_msg = Envelope::new(Body::Input {
        execution_id: execution_id.to_string(),
        prompt: prompt.to_string(),
    });
    let input_id = input_msg.header.id.clone();

    let (tx, rx) = oneshot::channel();
    input_waiters.insert(input_id.clone(), tx);

    transport::send_envelope(writer, &input_msg).await?;

    rx.await.map_err(|_| {
        transport::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "input waiter dropped before a response arrived",
        ))
    })
}

fn execution_notes(execution_id: &str, source: &str) -> Vec<String> {
    let excerpt: String = source.chars().take(80).collect();
    vec![format!("execution_id={execution_id}"), format!("source_excerpt={excerpt:?}")]
}

/// Project a Python value to JSON for the wire `Result.value` field. This
/// reuses the namespace manager's projection rules (callables/modules drop
/// to `Null`) since the wire contract only asks for an "opaque" value and a
/// JSON-compatible best effort is what callers outside this process can
/// actually consume.
fn pyo3_value_to_json(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<serde_json::Value> {
    if value.is_none() {
        return Ok(serde_json::Value::Null);
    }
    if let Ok(b) = value.extract::<bool>() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(serde_json::Value::from(i));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    if let Ok(s) = value.extract::<String>() {
        return Ok(serde_json::Value::String(s));
    }
    let _ = py;
    // Anything else (objects, containers of non-trivial values) is
    // represented by its repr rather than dropped outright, since the wire
    // contract's `value` field is documented as opaque and `repr` already
    // carries a human-readable form alongside it.
    Ok(serde_json::Value::String(
        value.repr()?.to_string_lossy().to_string(),
    ))
}

