//! The single auxiliary worker thread used for blocking-sync code (spec §5).
//!
//! Exactly one thread exists, dedicated to running blocking-sync source so
//! the worker's event loop is never blocked. Jobs are submitted over an
//! `mpsc` queue and run one at a time — a pool would violate the
//! "single-slot" requirement, so this is a bespoke thread plus channel
//! rather than `tokio::task::spawn_blocking`'s shared ambient pool.

use std::ffi::CString;
use std::sync::Arc;
use std::thread::JoinHandle;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::engine::namespace::Namespace;

struct Job {
    source: String,
    filename: String,
    namespace: Arc<Namespace>,
    reply: oneshot::Sender<PyResult<Py<PyAny>>>,
}

enum Command {
    Run(Job),
    Shutdown,
}

/// Handle to the dedicated blocking-sync worker thread.
pub struct BlockingSlot {
    tx: mpsc::UnboundedSender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl BlockingSlot {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let handle = std::thread::Builder::new()
            .name("capsule-blocking-sync".into())
            .spawn(move || {
                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        Command::Run(job) => {
                            let Job {
                                source,
                                filename,
                                namespace,
                                reply,
                            } = job;
                            let result = Python::with_gil(|py| {
                                run_one(py, &namespace, &source, &filename)
                            });
                            if reply.send(result).is_err() {
                                debug!("blocking-sync caller dropped before result delivered");
                            }
                        }
                        Command::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn blocking-sync worker thread");

        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Run `source` against a copy of the namespace on the dedicated
    /// thread, then merge its diff back via `merge_thread_results` with
    /// `source="thread"`, `strategy="smart"`.
    pub async fn run_against_namespace(
        &self,
        namespace: Arc<Namespace>,
        source: String,
        filename: String,
    ) -> PyResult<Py<PyAny>> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Run(Job {
                source,
                filename,
                namespace,
                reply,
            }))
            .map_err(|_| pyo3::exceptions::PyRuntimeError::new_err("blocking-sync thread gone"))?;

        reply_rx.await.map_err(|_| {
            pyo3::exceptions::PyRuntimeError::new_err("blocking-sync reply channel closed")
        })?
    }
}

fn run_one(py: Python<'_>, namespace: &Namespace, source: &str, filename: &str) -> PyResult<Py<PyAny>> {
    let pre = namespace.snapshot(py)?;
    let thread_globals = PyDict::new(py);
    for (k, v) in pre.iter() {
        thread_globals.set_item(k, v)?;
    }

    let code = CString::new(source).map_err(|err| {
        pyo3::exceptions::PySyntaxError::new_err(format!("source contains a NUL byte: {err}"))
    })?;
    let _ = filename; // reserved for future linecache registration on this path

    // Blocking-sync code is always compiled/run in exec mode (statement
    // blocks return None; see spec §9 design note on the wrapper path
    // policy), so there is no expression value to extract here.
    py.run(code.as_c_str(), Some(&thread_globals), None)?;

    namespace.merge_thread_results(py, &thread_globals, &pre)?;
    Ok(py.None())
}

impl Drop for BlockingSlot {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("blocking-sync worker thread panicked during shutdown");
            }
        }
    }
}
