//! Session Runtime (spec §4.F).
//!
//! Owns exactly one worker subprocess and exactly one reader task for its
//! transport — the single-reader invariant is absolute: no other component
//! may call `receive()` on the worker transport. Grounded in the teacher's
//! `LocalKernel::start()` (`backend/local.rs`), which spawns a subprocess
//! via `tokio::process::Command` and hands back a connected client; this
//! Session generalizes that shape to the length-prefixed stdio transport
//! and adds the request/iterator routing `backend/commands.rs`'s
//! `run_cell()` does for Jupyter's iopub stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::correlator::{self, Correlator};
use crate::message::{Body, Envelope, ErrorKind, Stream};
use crate::transport::{self, FrameReader, FrameWriter};

/// Top-level session failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("worker did not send Ready within {0:.1}s")]
    StartupTimeout(f64),

    #[error("failed to spawn worker process: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("worker transport failed: {0}")]
    Transport(#[from] transport::Error),

    #[error("session is not running")]
    NotRunning,
}

impl Error {
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            Error::StartupTimeout(_) => ErrorKind::Timeout,
            Error::WorkerSpawn(_) | Error::Transport(_) => ErrorKind::WorkerCrash,
            Error::NotRunning => ErrorKind::Protocol,
        }
    }
}

/// A message delivered to a caller's `execute()` iterator.
#[derive(Debug, Clone)]
pub enum ExecuteEvent {
    Output { stream: Stream, data: String, seq: u64 },
    Input { input_id: String, prompt: String },
    Result { value: serde_json::Value, repr: Option<String>, duration_ms: f64 },
    Error { kind: ErrorKind, message: String, traceback: Option<String>, notes: Vec<String> },
}

type Interceptor = Box<dyn Fn(&Envelope) + Send + Sync>;

struct RunningWorker {
    child: Child,
    writer: FrameWriter<tokio::process::ChildStdin>,
    reader_task: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

/// Per-execution routing slot: the reader loop forwards messages with a
/// matching `execution_id` here until the terminal message arrives.
struct ExecutionSlot {
    tx: mpsc::UnboundedSender<ExecuteEvent>,
}

/// The command used to launch a worker process. Fully explicit and
/// caller-provided — this crate does not guess an interpreter or binary
/// path, matching the "no default-guessing of paths" stance taken for
/// configuration in general (spec §1 Non-goals: CLI/config loading is an
/// external collaborator).
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Owns one worker subprocess and its transport. See module docs for the
/// single-reader invariant this type is responsible for upholding.
pub struct Session {
    config: Config,
    worker_command: WorkerCommand,
    running: Mutex<Option<RunningWorker>>,
    executions: Arc<DashMap<String, ExecutionSlot>>,
    interceptors: Arc<Mutex<Vec<Interceptor>>>,
    next_interceptor_id: AtomicU64,
    correlator: Arc<Correlator>,
}

impl Session {
    pub fn new(config: Config, worker_command: WorkerCommand) -> Self {
        Self {
            config,
            worker_command,
            running: Mutex::new(None),
            executions: Arc::new(DashMap::new()),
            interceptors: Arc::new(Mutex::new(Vec::new())),
            next_interceptor_id: AtomicU64::new(0),
            correlator: Arc::new(Correlator::new()),
        }
    }

    /// Spawn the worker, wait for its initial `Ready` message.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let mut command = Command::new(&self.worker_command.program);
        command
            .args(&self.worker_command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (name, value) in self.config.to_env_pairs() {
            command.env(name, value);
        }
        let mut child = command.spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let writer = FrameWriter::new(stdin, self.config.max_frame_bytes);
        let mut reader = FrameReader::new(stdout, self.config.max_frame_bytes);
        let closed = reader.closed_flag();

        self.correlator.open();
        let executions = self.executions.clone();
        let interceptors = self.interceptors.clone();
        let correlator = self.correlator.clone();
        let reader_writer = writer.clone();

        // Wait for Ready before handing control to the long-lived reader
        // pump, so `start()` can fail fast on a broken worker.
        let ready = timeout(
            Duration::from_secs_f64(self.config.startup_timeout_s),
            transport::receive_envelope(&mut reader),
        )
        .await
        .map_err(|_| Error::StartupTimeout(self.config.startup_timeout_s))?
        .map_err(Error::Transport)?;

        match ready {
            Some(Envelope { body: Body::Ready { .. }, .. }) => {
                info!("worker ready");
            }
            Some(other) => {
                warn!(kind = other.type_name(), "expected Ready, got a different message first");
            }
            None => {
                warn!("first frame from worker was undecodable");
            }
        }

        let reader_task = tokio::spawn(Self::reader_loop(
            reader,
            reader_writer,
            executions,
            interceptors,
            correlator,
        ));

        *self.running.lock().await = Some(RunningWorker {
            child,
            writer,
            reader_task,
            closed,
        });

        Ok(())
    }

    /// The sole reader of the worker transport (single-reader invariant,
    /// spec §4.F / testable property 5). Routes inbound frames by
    /// `execution_id`/`input_id` to the matching `execute()` iterator, and
    /// always hands every message to registered interceptors afterward.
    async fn reader_loop(
        mut reader: FrameReader<tokio::process::ChildStdout>,
        writer: FrameWriter<tokio::process::ChildStdin>,
        executions: Arc<DashMap<String, ExecutionSlot>>,
        interceptors: Arc<Mutex<Vec<Interceptor>>>,
        correlator: Arc<Correlator>,
    ) {
        loop {
            let envelope = match transport::receive_envelope(&mut reader).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, "worker transport closed");
                    Self::broadcast_worker_crash(&executions);
                    correlator.fail_all_with_worker_crash();
                    return;
                }
            };

            // Drives the correlator's durable promises (spec §4.G); it never
            // reads the transport itself, only this already-decoded envelope.
            correlator.on_message(&envelope);

            if let Some(id) = envelope.correlation_id() {
                if let Some(slot) = executions.get(id) {
                    if let Some(event) = to_execute_event(&envelope) {
                        if slot.tx.send(event).is_err() {
                            // The caller's execute() iterator was dropped
                            // before a terminal message arrived; cancel the
                            // worker-side execution instead of leaking a
                            // slot nobody is draining (spec §4.F).
                            drop(slot);
                            executions.remove(id);
                            let cancel = Envelope::new(Body::Cancel {
                                execution_id: id.to_string(),
                                reason: Some("execute() caller dropped the stream".to_string()),
                            });
                            let _ = transport::send_envelope(&writer, &cancel).await;
                        }
                    }
                }
            }

            let guard = interceptors.lock().await;
            for interceptor in guard.iter() {
                interceptor(&envelope);
            }
        }
    }

    fn broadcast_worker_crash(executions: &DashMap<String, ExecutionSlot>) {
        for entry in executions.iter() {
            let _ = entry.value().tx.send(ExecuteEvent::Error {
                kind: ErrorKind::WorkerCrash,
                message: "worker process terminated unexpectedly".to_string(),
                traceback: None,
                notes: vec![],
            });
        }
    }

    /// Write the Execute frame, then yield Output messages for this
    /// execution in arrival order, finally yielding the terminal Result or
    /// Error. If `timeout` is set and no terminal message arrives in time,
    /// the Session sends the worker a Cancel signal and yields a single
    /// `cancelled` Error in its place (spec §4.F/§4.G). If the returned
    /// receiver is dropped before a terminal message arrives, the reader
    /// loop detects the closed channel and cancels the worker-side
    /// execution on the caller's behalf, so no stream leaks into the next
    /// execution.
    #[instrument(skip(self, source))]
    pub async fn execute(
        &self,
        source: String,
        capture_source: bool,
        timeout: Option<Duration>,
    ) -> Result<(String, mpsc::UnboundedReceiver<ExecuteEvent>), Error> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or(Error::NotRunning)?;

        let envelope = Envelope::new(Body::Execute {
            code: source,
            capture_source,
        });
        let execution_id = envelope.header.id.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        self.executions
            .insert(execution_id.clone(), ExecutionSlot { tx });

        transport::send_envelope(&running.writer, &envelope).await?;

        if let Some(duration) = timeout {
            let handle = self.correlator.register_execute(&execution_id);
            let writer = running.writer.clone();
            let executions = self.executions.clone();
            let watched_id = execution_id.clone();
            tokio::spawn(async move {
                let outcome = handle.wait("execute", Some(&watched_id), Some(duration)).await;
                if let correlator::Outcome::Rejected(rejection) = outcome {
                    if rejection.kind == ErrorKind::Timeout {
                        let cancel = Envelope::new(Body::Cancel {
                            execution_id: watched_id.clone(),
                            reason: Some("execute timeout expired".to_string()),
                        });
                        let _ = transport::send_envelope(&writer, &cancel).await;
                        if let Some((_, slot)) = executions.remove(&watched_id) {
                            let _ = slot.tx.send(ExecuteEvent::Error {
                                kind: ErrorKind::Cancelled,
                                message: rejection.message,
                                traceback: None,
                                notes: rejection.notes,
                            });
                        }
                    }
                }
            });
        }

        Ok((execution_id, rx))
    }

    /// `input_response(input_id, data)` — forwards the user's response as
    /// an InputResponse frame.
    pub async fn input_response(&self, input_id: String, data: String) -> Result<(), Error> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or(Error::NotRunning)?;
        let envelope = Envelope::new(Body::InputResponse { input_id, data });
        transport::send_envelope(&running.writer, &envelope).await?;
        Ok(())
    }

    /// Registers a callback invoked for every inbound message after
    /// dispatch and after the correlator has had a chance to settle its own
    /// promises. Returns an id for `remove_message_interceptor`.
    pub async fn add_message_interceptor<F>(&self, f: F) -> u64
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut guard = self.interceptors.lock().await;
        guard.push(Box::new(f));
        self.next_interceptor_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop the execution slot for `execution_id`, so a later stray frame
    /// (already in flight from the worker) does not leak into a future
    /// caller awaiting the same id.
    pub fn forget_execution(&self, execution_id: &str) {
        self.executions.remove(execution_id);
    }

    /// Idempotent: sends a termination sentinel, drains, reaps.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut guard = self.running.lock().await;
        if let Some(mut running) = guard.take() {
            drop(running.writer);
            running.reader_task.abort();
            let _ = running.child.kill().await;
            let _ = running.child.wait().await;
        }
        // The correlator must not leak promises past session shutdown
        // (spec §4.D lifecycle note); close() idempotently rejects whatever
        // is still pending with `cancelled`.
        self.correlator.close();
        Ok(())
    }

    /// Shutdown then start, preserving the session's worker command but
    /// discarding the namespace — a recovery primitive, not a resume.
    pub async fn restart(&self) -> Result<(), Error> {
        self.shutdown().await?;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }
}

fn to_execute_event(envelope: &Envelope) -> Option<ExecuteEvent> {
    match &envelope.body {
        Body::Output { stream, data, seq, .. } => Some(ExecuteEvent::Output {
            stream: *stream,
            data: data.clone(),
            seq: *seq,
        }),
        Body::Input { prompt, .. } => Some(ExecuteEvent::Input {
            input_id: envelope.header.id.clone(),
            prompt: prompt.clone(),
        }),
        Body::Result { value, repr, duration_ms, .. } => Some(ExecuteEvent::Result {
            value: value.clone(),
            repr: repr.clone(),
            duration_ms: *duration_ms,
        }),
        Body::Error { kind, message, traceback, notes, .. } => Some(ExecuteEvent::Error {
            kind: *kind,
            message: message.clone(),
            traceback: traceback.clone(),
            notes: notes.clone(),
        }),
        _ => None,
    }
}

