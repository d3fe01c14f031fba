//! Capability injection (spec §4.E): stdout/stderr capture and the
//! `input()` builtin. Both route through an [`IoHandle`] back to the
//! Worker's transport rather than touching it directly, the way
//! `log_writer.rs`'s `SlotLogWriter` routes captured writes back to its
//! owning process through a channel instead of writing to the real stream.
//! Installed once at engine startup; since executions are serialized on one
//! namespace (spec §4.D "single-threaded w.r.t. user code"), a single
//! `current` cell tagging writes with the in-flight execution id is enough
//! — no per-execution reinstall is needed.

use std::ffi::CString;
use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyModule, PyTuple};
use tokio::sync::{mpsc, oneshot};

use crate::message::Stream;

/// Emitted by injected capability callbacks, consumed by the Worker.
pub enum IoEvent {
    Output {
        execution_id: String,
        stream: Stream,
        data: String,
    },
    Input {
        execution_id: String,
        prompt: String,
        reply: oneshot::Sender<String>,
    },
    /// A barrier marker: once the consumer task processes this (after every
    /// `Output` queued ahead of it on the same channel), it signals `done`.
    /// Lets a caller await "everything captured so far has been flushed to
    /// the transport" before emitting a terminal Result/Error frame (spec
    /// §4.E, testable property 3).
    Flush { done: oneshot::Sender<()> },
}

/// Cheap-to-clone handle the engine and its injected capabilities use to
/// reach the worker's transport without holding a reference to it.
#[derive(Clone)]
pub struct IoHandle {
    tx: mpsc::UnboundedSender<IoEvent>,
}

impl IoHandle {
    pub fn new(tx: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, execution_id: &str, stream: Stream, data: String) {
        let _ = self.tx.send(IoEvent::Output {
            execution_id: execution_id.to_string(),
            stream,
            data,
        });
    }

    /// Blocks the calling OS thread until a matching `InputResponse`
    /// arrives. Only the dedicated blocking-sync thread may call this
    /// (spec §4.E); calling it from a tokio worker thread would stall the
    /// runtime, since it is not an async fn.
    fn request_input(&self, execution_id: &str, prompt: String) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(IoEvent::Input {
                execution_id: execution_id.to_string(),
                prompt,
                reply: reply_tx,
            })
            .is_err()
        {
            return String::new();
        }
        reply_rx.blocking_recv().unwrap_or_default()
    }

    /// Waits until every `Output` event sent before this call has been
    /// consumed by the worker's transport-writing task, since the channel
    /// preserves FIFO order and the consumer replies only once it reaches
    /// this marker in turn.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(IoEvent::Flush { done: done_tx }).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

/// A minimal Python file-like object whose `write()` forwards to a Rust
/// closure. Defined as embedded source rather than a `#[pyclass]`, the same
/// technique `engine::compile_with_ast_fallback` already uses to synthesize
/// Python source at runtime.
const STREAM_CLASS_SRC: &str = r#"
class _CapsuleStream:
    def __init__(self, write_cb, original):
        self._write_cb = write_cb
        self._original = original
        self.closed = False

    def write(self, data):
        if self.closed or not data:
            return 0
        self._write_cb(data)
        return len(data)

    def flush(self):
        pass

    def isatty(self):
        return False

    def writable(self):
        return True

    def readable(self):
        return False

    def fileno(self):
        return self._original.fileno()
"#;

/// Redirect `sys.stdout`/`sys.stderr` to forward writes as Output frames
/// tagged with whichever execution id `current` holds at write time, and
/// inject the `input(prompt="")` capability into the live namespace.
pub fn install(
    py: Python<'_>,
    namespace_live: &Bound<'_, PyDict>,
    current: Arc<Mutex<Option<String>>>,
    io: IoHandle,
) -> PyResult<()> {
    let module = PyModule::from_code(
        py,
        CString::new(STREAM_CLASS_SRC)
            .expect("stream class source has no interior NUL")
            .as_c_str(),
        CString::new("<capsule_stream>").unwrap().as_c_str(),
        CString::new("capsule_stream").unwrap().as_c_str(),
    )?;
    let stream_class = module.getattr("_CapsuleStream")?;
    let sys = py.import("sys")?;

    install_one_stream(py, &sys, &stream_class, Stream::Stdout, "stdout", current.clone(), io.clone())?;
    install_one_stream(py, &sys, &stream_class, Stream::Stderr, "stderr", current.clone(), io.clone())?;

    namespace_live.set_item("input", make_input_builtin(py, current, io)?)?;
    Ok(())
}

fn install_one_stream(
    py: Python<'_>,
    sys: &Bound<'_, PyModule>,
    stream_class: &Bound<'_, PyAny>,
    stream: Stream,
    attr: &str,
    current: Arc<Mutex<Option<String>>>,
    io: IoHandle,
) -> PyResult<()> {
    let original = sys.getattr(attr)?;
    let write_cb = PyCFunction::new_closure(
        py,
        None,
        None,
        move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<()> {
            let data: String = args.get_item(0)?.extract()?;
            if let Some(execution_id) = current.lock().clone() {
                io.emit(&execution_id, stream, data);
            }
            Ok(())
        },
    )?;
    let instance = stream_class.call1((write_cb, original))?;
    sys.setattr(attr, instance)?;
    Ok(())
}

fn make_input_builtin<'py>(
    py: Python<'py>,
    current: Arc<Mutex<Option<String>>>,
    io: IoHandle,
) -> PyResult<Bound<'py, PyAny>> {
    let func = PyCFunction::new_closure(
        py,
        None,
        None,
        move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<String> {
            let prompt: String = args
                .get_item(0)
                .ok()
                .and_then(|v| v.extract::<String>().ok())
                .unwrap_or_default();
            let execution_id = current.lock().clone().ok_or_else(|| {
                pyo3::exceptions::PyRuntimeError::new_err(
                    "input() called outside of an active execution",
                )
            })?;
            Ok(io.request_input(&execution_id, prompt))
        },
    )?;
    Ok(func.into_any())
}
