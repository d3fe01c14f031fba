//! Execution Engine (spec §4.D).
//!
//! Compiles and runs one user program per `execute()` call against the
//! session [`Namespace`], auto-detecting whether it needs top-level-await
//! handling, blocking-I/O offload, or straight synchronous execution.
//! Embeds CPython the way `cpython_executor.rs` does: `Python::with_gil`
//! blocks, `py.eval`/`py.run` over `CString` source, coroutine detection via
//! `inspect.iscoroutine`, and `pyo3_async_runtimes` to drive the resulting
//! coroutine on the worker's event loop.

pub mod blocking;
pub mod io_capture;
pub mod namespace;

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyWeakrefMethods, PyWeakrefReference};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use self::blocking::BlockingSlot;
use self::io_capture::IoHandle;
use self::namespace::{Namespace, Source, Strategy};
use crate::message::ErrorKind;

/// Engine-level failure, mapped to a wire `error` message by the worker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compilation failed: {0}")]
    Compilation(String),

    #[error("{0}")]
    Execution(String),

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("execution timed out after {0:.1}s")]
    Timeout(f64),
}

impl Error {
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            Error::Compilation(_) => ErrorKind::Compilation,
            Error::Execution(_) => ErrorKind::Execution,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Classification of a source snippet (spec §4.D "Mode analysis").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TopLevelAwait,
    AsyncDef,
    BlockingSync,
    SimpleSync,
    Unknown,
}

/// Successful outcome of one `execute()` call.
pub struct Outcome {
    pub value: Py<PyAny>,
    pub repr: Option<String>,
}

/// What `run_async` has compiled, ready to be driven to completion (spec
/// §4.D "Compile-first policy").
enum PreparedAsync {
    /// The flagged-compile path: `target` is the code object's eval result
    /// (a coroutine if a top-level `await` is present, otherwise already the
    /// final value), and `locals` is the isolated dict it ran against.
    Flagged { target: Py<PyAny>, locals: Py<PyDict> },
    /// The AST-fallback path: `coroutine` is the synthesized
    /// `__async_exec__()` call, whose eventual return value is its own
    /// `locals()` dict rather than a user expression value.
    AstFallback { coroutine: Py<PyAny> },
}

/// Counters exposed for the cancellation-scoping testable property (spec §8
/// property 8) and general observability.
#[derive(Debug, Default)]
pub struct Counters {
    pub cancels_requested: AtomicU64,
    pub cancels_effective: AtomicU64,
    pub cancels_noop: AtomicU64,
    pub cancelled_errors: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Tracks the single top-level task currently in flight, so
/// `cancel_current` can cancel it and cleanup can close it if it never
/// completed (spec §4.D "Coroutine lifecycle and cancellation").
struct CurrentTask {
    execution_id: String,
    cancel_token: tokio_util::sync::CancellationToken,
}

/// The Execution Engine. One instance lives for the life of the worker
/// process and is driven from its single event loop.
pub struct Engine {
    namespace: Arc<Namespace>,
    blocking_slot: BlockingSlot,
    current: Mutex<Option<CurrentTask>>,
    io_current: Arc<Mutex<Option<String>>>,
    counters: Counters,
    execute_timeout: Duration,
    extra_blocking_modules: Vec<String>,
    extra_blocking_methods: BTreeMap<String, Vec<String>>,
    /// Weak references to in-flight top-level coroutines, keyed by execution
    /// id (spec §4.D "Pending coroutine set"). Closed best-effort whenever
    /// an execution ends without having driven its coroutine to completion,
    /// so the set's size is zero in steady state (spec §8 property 7).
    pending_coroutines: Mutex<BTreeMap<String, Py<PyWeakrefReference>>>,
}

impl Engine {
    pub fn new(
        py: Python<'_>,
        execute_timeout: Duration,
        extra_blocking_modules: Vec<String>,
        extra_blocking_methods: BTreeMap<String, Vec<String>>,
        io: IoHandle,
    ) -> PyResult<Self> {
        let namespace = Namespace::new(py)?;
        let io_current = Arc::new(Mutex::new(None));
        io_capture::install(py, &namespace.live(py), io_current.clone(), io)?;

        Ok(Self {
            namespace: Arc::new(namespace),
            blocking_slot: BlockingSlot::spawn(),
            current: Mutex::new(None),
            io_current,
            counters: Counters::default(),
            execute_timeout,
            extra_blocking_modules,
            extra_blocking_methods,
            pending_coroutines: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn namespace(&self) -> Arc<Namespace> {
        self.namespace.clone()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Size of the pending-coroutine set (spec §8 property 7 "No coroutine
    /// leak"). Zero whenever no execution is in flight.
    pub fn pending_coroutine_count(&self) -> usize {
        self.pending_coroutines.lock().len()
    }

    fn register_pending_coroutine(&self, execution_id: &str, target: &Bound<'_, PyAny>) -> PyResult<()> {
        let weak = PyWeakrefReference::new(target)?;
        self.pending_coroutines.lock().insert(execution_id.to_string(), weak.unbind());
        Ok(())
    }

    /// Best-effort cleanup of the execution's tracked coroutine if it is
    /// still alive (spec §4.D "Cleanup"). A no-op once the coroutine has
    /// already run to completion and been collected.
    fn close_pending_coroutine(&self, execution_id: &str) {
        let weak = self.pending_coroutines.lock().remove(execution_id);
        if let Some(weak) = weak {
            Python::with_gil(|py| {
                if let Some(coroutine) = weak.bind(py).upgrade() {
                    close_leaked_coroutine(py, &coroutine);
                }
            });
        }
    }

    /// Classify `source` per spec §4.D. Tolerates the `SyntaxError` that
    /// top-level await produces without the enabling compile flag.
    pub fn analyze(&self, py: Python<'_>, source: &str) -> PyResult<Mode> {
        let ast = py.import("ast")?;
        let code = CString::new(source).map_err(|_| {
            pyo3::exceptions::PySyntaxError::new_err("source contains a NUL byte")
        })?;

        let parsed = ast.call_method1("parse", (code.to_str().unwrap_or_default(),));
        let tree = match parsed {
            Ok(tree) => tree,
            Err(err) => {
                if is_top_level_await_syntax_error(py, &err, source) {
                    return Ok(Mode::TopLevelAwait);
                }
                return Ok(Mode::Unknown);
            }
        };

        let walk = ast.call_method1("walk", (&tree,))?;
        let mut has_top_level_await = false;
        let mut has_async_def = false;
        let mut has_blocking_call = false;

        for node in walk.try_iter()? {
            let node = node?;
            let type_name = node.get_type().name()?.to_string();
            match type_name.as_str() {
                "Await" => has_top_level_await = true,
                "AsyncFunctionDef" => has_async_def = true,
                "Call" => {
                    if self.looks_blocking(py, &node)? {
                        has_blocking_call = true;
                    }
                }
                "Import" | "ImportFrom" => {
                    if self.imports_blocking_module(py, &node)? {
                        has_blocking_call = true;
                    }
                }
                _ => {}
            }
        }

        if has_top_level_await {
            Ok(Mode::TopLevelAwait)
        } else if has_async_def {
            Ok(Mode::AsyncDef)
        } else if has_blocking_call {
            Ok(Mode::BlockingSync)
        } else {
            Ok(Mode::SimpleSync)
        }
    }

    fn looks_blocking(&self, py: Python<'_>, call_node: &Bound<'_, PyAny>) -> PyResult<bool> {
        let func = call_node.getattr("func")?;
        let name = if func.hasattr("id")? {
            func.getattr("id")?.extract::<String>().ok()
        } else if func.hasattr("attr")? {
            func.getattr("attr")?.extract::<String>().ok()
        } else {
            None
        };
        let _ = py;
        Ok(name
            .map(|n| {
                namespace_builtin_blocking_calls().contains(&n.as_str())
                    || self.extra_blocking_methods.values().any(|v| v.contains(&n))
            })
            .unwrap_or(false))
    }

    fn imports_blocking_module(&self, _py: Python<'_>, import_node: &Bound<'_, PyAny>) -> PyResult<bool> {
        let module_names: Vec<String> = if import_node.hasattr("module")? {
            import_node
                .getattr("module")?
                .extract::<Option<String>>()?
                .into_iter()
                .collect()
        } else {
            let names = import_node.getattr("names")?;
            let mut out = Vec::new();
            for alias in names.try_iter()? {
                if let Ok(name) = alias?.getattr("name").and_then(|n| n.extract::<String>()) {
                    out.push(name);
                }
            }
            out
        };

        Ok(module_names.iter().any(|m| {
            namespace_builtin_blocking_modules().contains(&m.as_str())
                || self.extra_blocking_modules.iter().any(|x| x == m)
        }))
    }

    /// Run one user program against the session namespace (spec §4.D
    /// `execute()`).
    #[instrument(skip(self, source), fields(execution_id = %execution_id))]
    pub async fn execute(&self, execution_id: &str, source: &str) -> Result<Outcome, Error> {
        let mode = Python::with_gil(|py| self.analyze(py, source))
            .map_err(|err| Error::Compilation(err.to_string()))?;

        debug!(?mode, "analyzed execution mode");

        let cancel_token = tokio_util::sync::CancellationToken::new();
        {
            let mut current = self.current.lock();
            *current = Some(CurrentTask {
                execution_id: execution_id.to_string(),
                cancel_token: cancel_token.clone(),
            });
            *self.io_current.lock() = Some(execution_id.to_string());
        }

        let result = self.run_mode(mode, execution_id, source, cancel_token.clone()).await;

        // finally: always clear the current-task slot and run best-effort
        // cleanup, mirroring the engine's try/finally state machine.
        {
            let mut current = self.current.lock();
            *current = None;
            *self.io_current.lock() = None;
        }

        match &result {
            Ok(outcome) => {
                Python::with_gil(|py| {
                    self.namespace.bump_result_history(py, outcome.value.bind(py))
                })
                .map_err(|err| Error::Execution(err.to_string()))?;
            }
            Err(Error::Cancelled(_)) => {
                self.counters.cancelled_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    async fn run_mode(
        &self,
        mode: Mode,
        execution_id: &str,
        source: &str,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> Result<Outcome, Error> {
        match mode {
            Mode::TopLevelAwait | Mode::AsyncDef => {
                self.run_async(execution_id, source, cancel_token).await
            }
            Mode::BlockingSync => self.run_blocking(source).await,
            Mode::SimpleSync => self.run_sync(source).await,
            Mode::Unknown => Err(Error::Compilation(format!(
                "could not parse source for execution {execution_id}"
            ))),
        }
    }

    /// Compile-first policy plus AST fallback (spec §4.D). Both paths run
    /// user code against an isolated locals mapping and merge the result
    /// back through `Namespace::update` once it has run to completion, so
    /// protected-key writes from user code are gated the same way the
    /// blocking-sync path already gates them (spec §4.D "Namespace binding
    /// semantics").
    async fn run_async(
        &self,
        execution_id: &str,
        source: &str,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> Result<Outcome, Error> {
        let namespace = self.namespace.clone();
        let execution_id_owned = execution_id.to_string();
        let source_owned = source.to_string();

        let prepared = Python::with_gil(|py| -> PyResult<PreparedAsync> {
            match compile_flagged(py, &source_owned, &execution_id_owned) {
                Ok(code) => {
                    let locals = PyDict::new(py);
                    let target = eval_against_namespace(py, &namespace, code.bind(py), &locals)?;
                    self.register_pending_coroutine(&execution_id_owned, &target)?;
                    Ok(PreparedAsync::Flagged {
                        target: target.unbind(),
                        locals: locals.unbind(),
                    })
                }
                Err(flagged_err) => {
                    if is_top_level_await_syntax_error_msg(&flagged_err.to_string()) {
                        Err(flagged_err)
                    } else {
                        let coroutine =
                            compile_with_ast_fallback(py, &namespace, &source_owned, &execution_id_owned)?;
                        self.register_pending_coroutine(&execution_id_owned, coroutine.bind(py))?;
                        Ok(PreparedAsync::AstFallback { coroutine })
                    }
                }
            }
        })
        .map_err(|err| Error::Compilation(err.to_string()))?;

        let (to_drive, locals) = match prepared {
            PreparedAsync::Flagged { target, locals } => (target, Some(locals)),
            PreparedAsync::AstFallback { coroutine } => (coroutine, None),
        };

        let awaited = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                self.counters.cancels_effective.fetch_add(1, Ordering::Relaxed);
                self.close_pending_coroutine(execution_id);
                return Err(Error::Cancelled(format!(
                    "execution {execution_id} cancelled by request"
                )));
            }
            result = tokio::time::timeout(self.execute_timeout, drive_coroutine(to_drive)) => result,
        };

        self.close_pending_coroutine(execution_id);

        match awaited {
            Ok(Ok(value)) => Python::with_gil(|py| -> Result<Outcome, Error> {
                if let Some(locals) = &locals {
                    namespace
                        .update(py, locals.bind(py), Source::Async, Strategy::Overwrite)
                        .map_err(|err| Error::Execution(err.to_string()))?;
                    let repr = value.bind(py).repr().ok().map(|r| r.to_string());
                    Ok(Outcome { value, repr })
                } else {
                    // AST-fallback path: the awaited value is the
                    // synthesized wrapper's `locals()`, not a user
                    // expression result (spec §4.D wrapper-path policy:
                    // statement blocks return `None`).
                    let bound = value.bind(py);
                    if let Ok(dict) = bound.downcast::<PyDict>() {
                        namespace
                            .update(py, dict, Source::Async, Strategy::Overwrite)
                            .map_err(|err| Error::Execution(err.to_string()))?;
                    } else if !bound.is_none() {
                        warn!("AST-fallback wrapper returned a non-dict value; skipping local merge");
                    }
                    Ok(Outcome { value: py.None(), repr: None })
                }
            }),
            Ok(Err(err)) => Err(Error::Execution(err.to_string())),
            Err(_elapsed) => Err(Error::Timeout(self.execute_timeout.as_secs_f64())),
        }
    }

    async fn run_blocking(&self, source: &str) -> Result<Outcome, Error> {
        if source.is_empty() {
            warn!("blocking-sync path invoked with empty source");
        }
        let filename = "<blocking_sync>".to_string();
        let value = self
            .blocking_slot
            .run_against_namespace(self.namespace.clone(), source.to_string(), filename)
            .await
            .map_err(|err| Error::Execution(err.to_string()))?;
        Ok(Outcome { value, repr: None })
    }

    /// Executes against an isolated locals dict and merges the result back
    /// through `Namespace::update` (spec §4.D "Namespace binding
    /// semantics"), the same isolate-then-merge shape `blocking.rs::run_one`
    /// already uses for the blocking-sync path.
    async fn run_sync(&self, source: &str) -> Result<Outcome, Error> {
        let namespace = self.namespace.clone();
        let source_owned = source.to_string();
        Python::with_gil(|py| {
            let live = namespace.live(py);
            let locals = PyDict::new(py);
            let code = CString::new(source_owned.clone())
                .map_err(|_| pyo3::exceptions::PySyntaxError::new_err("NUL byte in source"))?;

            // Prefer eval for a single expression so simple-sync statements
            // can still surface a value on the flagged-compile-free path;
            // fall back to exec (value is then None) for statement blocks.
            let eval_attempt = py.eval(code.as_c_str(), Some(&live), Some(&locals));
            let outcome = match eval_attempt {
                Ok(value) => Outcome {
                    repr: value.repr().ok().map(|r| r.to_string()),
                    value: value.unbind(),
                },
                Err(_) => {
                    py.run(code.as_c_str(), Some(&live), Some(&locals))?;
                    Outcome {
                        value: py.None(),
                        repr: None,
                    }
                }
            };
            namespace.update(py, &locals, Source::Sync, Strategy::Overwrite)?;
            Ok(outcome)
        })
        .map_err(|err: PyErr| Error::Execution(err.to_string()))
    }

    /// `cancel_current(reason?) -> bool`. Cancels only the executor's own
    /// top-level task; user-spawned background tasks are untouched.
    pub fn cancel_current(&self, reason: Option<&str>) -> bool {
        self.counters.cancels_requested.fetch_add(1, Ordering::Relaxed);
        let current = self.current.lock();
        match current.as_ref() {
            Some(task) => {
                info!(execution_id = %task.execution_id, reason, "cancelling current execution");
                task.cancel_token.cancel();
                true
            }
            None => {
                self.counters.cancels_noop.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

fn namespace_builtin_blocking_calls() -> &'static [&'static str] {
    crate::config::Config::builtin_blocking_calls()
}

fn namespace_builtin_blocking_modules() -> &'static [&'static str] {
    crate::config::Config::builtin_blocking_modules()
}

/// The CPython flag enabling `await` outside a function body at module
/// scope, read at startup from `ast` rather than hardcoded, per the
/// expansion's note that supported-version flag values should not be
/// pinned as Rust constants.
fn top_level_await_flag(py: Python<'_>) -> PyResult<i32> {
    let ast = py.import("ast")?;
    ast.getattr("PyCF_ALLOW_TOP_LEVEL_AWAIT")?.extract()
}

fn compile_flagged(py: Python<'_>, source: &str, execution_id: &str) -> PyResult<Py<PyAny>> {
    let builtins = py.import("builtins")?;
    let compile_fn = builtins.getattr("compile")?;
    let flag = top_level_await_flag(py)?;
    let code_obj = compile_fn.call1((source, format!("<execution:{execution_id}>"), "exec", flag))?;
    Ok(code_obj.unbind())
}

fn compile_with_ast_fallback(
    py: Python<'_>,
    namespace: &Namespace,
    source: &str,
    execution_id: &str,
) -> PyResult<Py<PyAny>> {
    let ast = py.import("ast")?;
    let tree = ast.call_method1("parse", (source,))?;
    let body = tree.getattr("body")?;

    let wrapper_src = format!(
        "async def __async_exec__():\n    return locals()\n"
    );
    let wrapper_tree = ast.call_method1("parse", (wrapper_src,))?;
    let wrapper_fn = wrapper_tree.getattr("body")?.get_item(0)?;
    let wrapper_body = wrapper_fn.getattr("body")?;

    // Splice the user's statement list in before the synthesized `return
    // locals()`, with no reordering, no injected `global`s, and no def ->
    // async def rewriting (spec §4.D AST fallback policy).
    let return_stmt = wrapper_body.get_item(0)?;
    wrapper_body.call_method0("clear")?;
    for stmt in body.try_iter()? {
        wrapper_body.call_method1("append", (stmt?,))?;
    }
    wrapper_body.call_method1("append", (return_stmt,))?;

    ast.call_method1("fix_missing_locations", (&wrapper_tree,))?;

    let filename = format!("<async_fallback:{execution_id}>");
    let builtins = py.import("builtins")?;
    let compile_fn = builtins.getattr("compile")?;
    let code_obj = compile_fn.call1((&wrapper_tree, filename, "exec"))?;

    // Defined against a read-only snapshot rather than the live mapping:
    // `__async_exec__` only needs read access to existing names to resolve
    // globals at call time, and must never itself land in the live
    // namespace. Its own locally bound names (returned by `locals()`) are
    // what the caller merges back through `Namespace::update`.
    let def_globals = namespace.snapshot(py)?;
    let exec_fn = builtins.getattr("exec")?;
    exec_fn.call1((code_obj, &def_globals))?;

    let async_exec_fn = def_globals.get_item("__async_exec__")?.ok_or_else(|| {
        pyo3::exceptions::PyRuntimeError::new_err("AST fallback failed to bind __async_exec__")
    })?;
    let coroutine = async_exec_fn.call0()?;
    Ok(coroutine.unbind())
}

/// Evaluate a flagged-compiled code object against an isolated `locals`
/// dict layered over the live namespace as globals, so name stores land in
/// `locals` instead of the live mapping directly (spec §4.D "Namespace
/// binding semantics"). The caller merges `locals` back once the result —
/// possibly a coroutine, when the source contains a top-level `await` —
/// has run to completion.
fn eval_against_namespace<'py>(
    py: Python<'py>,
    namespace: &Namespace,
    code: &Bound<'py, PyAny>,
    locals: &Bound<'py, PyDict>,
) -> PyResult<Bound<'py, PyAny>> {
    let live = namespace.live(py);
    let builtins = py.import("builtins")?;
    let eval_fn = builtins.getattr("eval")?;
    eval_fn.call1((code, &live, locals))
}

/// Await a coroutine object, bridging onto the asyncio event loop via
/// `pyo3_async_runtimes`, or pass through a non-coroutine value untouched.
async fn drive_coroutine(value: Py<PyAny>) -> PyResult<Py<PyAny>> {
    let is_coroutine = Python::with_gil(|py| {
        let inspect = py.import("inspect")?;
        inspect
            .call_method1("iscoroutine", (value.bind(py),))?
            .extract::<bool>()
    })?;

    if !is_coroutine {
        return Ok(value);
    }

    let future = Python::with_gil(|py| {
        pyo3_async_runtimes::tokio::into_future(value.bind(py).clone())
    })?;
    let result = future.await?;
    Ok(result)
}

fn is_top_level_await_syntax_error(py: Python<'_>, err: &PyErr, source: &str) -> bool {
    let _ = (py, source);
    is_top_level_await_syntax_error_msg(&err.to_string())
}

fn is_top_level_await_syntax_error_msg(msg: &str) -> bool {
    msg.contains("'await' outside") || msg.contains("await") && msg.contains("async")
}

/// Best-effort cleanup of any tracked coroutine that did not complete,
/// letting leak-detection tests assert steady-state zero (spec §4.D
/// "Cleanup").
pub fn close_leaked_coroutine(py: Python<'_>, coroutine: &Bound<'_, PyAny>) {
    if let Err(err) = coroutine.call_method0("close") {
        warn!(error = %err, "failed to close leaked coroutine");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_py<F: FnOnce(Python<'_>)>(f: F) {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(f);
    }

    fn test_io_handle() -> IoHandle {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        IoHandle::new(tx)
    }

    #[test]
    fn analyze_classifies_simple_sync() {
        with_py(|py| {
            let engine = Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap();
            let mode = engine.analyze(py, "x = 1 + 1").unwrap();
            assert_eq!(mode, Mode::SimpleSync);
        });
    }

    #[test]
    fn analyze_classifies_async_def() {
        with_py(|py| {
            let engine = Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap();
            let mode = engine.analyze(py, "async def f():\n    pass\n").unwrap();
            assert_eq!(mode, Mode::AsyncDef);
        });
    }

    #[test]
    fn analyze_classifies_blocking_sync_via_known_module() {
        with_py(|py| {
            let engine = Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap();
            let mode = engine
                .analyze(py, "import time\ntime.sleep(0.1)\n")
                .unwrap();
            assert_eq!(mode, Mode::BlockingSync);
        });
    }

    #[tokio::test]
    async fn cancel_current_is_a_noop_when_nothing_is_running() {
        pyo3::prepare_freethreaded_python();
        let engine = Python::with_gil(|py| {
            Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap()
        });
        assert!(!engine.cancel_current(Some("nothing to cancel")));
        assert_eq!(engine.counters().cancels_noop.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sync_path_routes_protected_key_writes_through_the_gate() {
        pyo3::prepare_freethreaded_python();
        let engine = Python::with_gil(|py| {
            Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap()
        });

        engine
            .execute("exec-1", "__builtins__ = None\nx = 1")
            .await
            .unwrap();

        Python::with_gil(|py| {
            let live = engine.namespace().live(py);
            assert!(live.get_item("__builtins__").unwrap().unwrap().is_instance_of::<pyo3::types::PyModule>());
            let x: i64 = live.get_item("x").unwrap().unwrap().extract().unwrap();
            assert_eq!(x, 1);
        });
        assert_eq!(engine.namespace().protected_write_conflicts(), 1);
    }

    #[tokio::test]
    async fn async_path_routes_protected_key_writes_through_the_gate() {
        pyo3::prepare_freethreaded_python();
        let engine = Python::with_gil(|py| {
            Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap()
        });

        engine
            .execute("exec-1", "async def f():\n    pass\n__builtins__ = None\ny = 2")
            .await
            .unwrap();

        Python::with_gil(|py| {
            let live = engine.namespace().live(py);
            assert!(live.get_item("__builtins__").unwrap().unwrap().is_instance_of::<pyo3::types::PyModule>());
            let y: i64 = live.get_item("y").unwrap().unwrap().extract().unwrap();
            assert_eq!(y, 2);
        });
        assert_eq!(engine.namespace().protected_write_conflicts(), 1);
    }

    #[tokio::test]
    async fn pending_coroutine_set_is_empty_in_steady_state() {
        pyo3::prepare_freethreaded_python();
        let engine = Python::with_gil(|py| {
            Engine::new(py, Duration::from_secs(1), vec![], BTreeMap::new(), test_io_handle()).unwrap()
        });

        engine
            .execute("exec-1", "import asyncio\nawait asyncio.sleep(0)")
            .await
            .unwrap();

        assert_eq!(engine.pending_coroutine_count(), 0);
    }
}
