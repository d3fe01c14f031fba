//! Namespace Manager (spec §4.C).
//!
//! A thread-safe, merge-only mapping that persists user bindings across
//! executions while protecting engine-owned slots. Backed by a `Py<PyDict>`
//! held across the GIL, the way `cpython_executor.rs` holds long-lived
//! `Py<PyAny>` instances and only ever touches them inside
//! `Python::with_gil` — the GIL itself is the reentrant lock the spec asks
//! for, so `Namespace`'s methods all require a `Python<'_>` token and the
//! type system makes "hold the lock across I/O" unrepresentable: there is
//! no way to keep a `Python<'_>` across an `.await` point since it borrows
//! the (thread-local) GIL guard.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PySet};
use serde_json::Value;
use tracing::{debug, warn};

use crate::message::PersistedNamespace;

/// `update()`'s write strategy (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Overwrite,
    Preserve,
    /// Skips writes that would replace a non-sentinel value with `None` or
    /// an empty container, and skips no-op writes.
    Smart,
}

/// Who is attempting the write; gates access to the protected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Engine,
    Async,
    Sync,
    Thread,
}

impl Source {
    fn may_write_protected(self) -> bool {
        matches!(self, Source::Engine)
    }
}

/// Context a `view_for` caller is operating under (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewContext {
    Thread,
    Async,
    Sync,
}

fn protected_keys() -> &'static BTreeSet<&'static str> {
    use std::sync::OnceLock;
    static KEYS: OnceLock<BTreeSet<&'static str>> = OnceLock::new();
    KEYS.get_or_init(|| {
        [
            "_", "__", "___", "_i", "_ii", "_iii", "Out", "In", "_exit_code", "_exception",
            "__name__", "__builtins__", "__doc__",
        ]
        .into_iter()
        .collect()
    })
}

/// The live, session-scoped namespace. Its object identity never changes
/// for the life of the session (spec invariant — property 1).
pub struct Namespace {
    dict: Py<PyDict>,
    conflict_counter: AtomicU64,
}

impl Namespace {
    /// Build a fresh namespace with the required built-ins pre-populated.
    pub fn new(py: Python<'_>) -> PyResult<Self> {
        let dict = PyDict::new(py);
        dict.set_item("__name__", "__main__")?;
        dict.set_item("__doc__", py.None())?;
        let builtins = py.import("builtins")?;
        dict.set_item("__builtins__", builtins)?;
        Ok(Self {
            dict: dict.unbind(),
            conflict_counter: AtomicU64::new(0),
        })
    }

    /// Number of user-context writes to protected keys silently discarded
    /// so far (spec §4.C, §7).
    pub fn protected_write_conflicts(&self) -> u64 {
        self.conflict_counter.load(Ordering::Relaxed)
    }

    /// `snapshot()` — a shallow copy of bindings, safe for readers.
    pub fn snapshot<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let live = self.dict.bind(py);
        let copy = PyDict::new(py);
        for (k, v) in live.iter() {
            copy.set_item(k, v)?;
        }
        Ok(copy)
    }

    /// `view_for(context)`. All three contexts get an isolated copy — the
    /// caller runs code against it and merges any changes back through
    /// `update`/`merge_thread_results`, never writing the live mapping
    /// directly.
    pub fn view_for<'py>(&self, py: Python<'py>, context: ViewContext) -> PyResult<Bound<'py, PyDict>> {
        let _ = context;
        self.snapshot(py)
    }

    /// The live mapping itself, for callers (the engine) that execute code
    /// directly against it.
    pub fn live<'py>(&self, py: Python<'py>) -> Bound<'py, PyDict> {
        self.dict.bind(py).clone()
    }

    fn is_sentinel_or_empty(value: &Bound<'_, PyAny>) -> PyResult<bool> {
        if value.is_none() {
            return Ok(true);
        }
        if let Ok(len) = value.len() {
            return Ok(len == 0);
        }
        Ok(false)
    }

    /// `update(changes, source, strategy)` — merges `changes` into the live
    /// mapping in place. Never replaces the dict object itself.
    pub fn update(
        &self,
        py: Python<'_>,
        changes: &Bound<'_, PyDict>,
        source: Source,
        strategy: Strategy,
    ) -> PyResult<()> {
        let live = self.dict.bind(py);
        let protected = protected_keys();

        for (key, new_value) in changes.iter() {
            let key_str: String = key.extract()?;

            if protected.contains(key_str.as_str()) && !source.may_write_protected() {
                self.conflict_counter.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key_str, "discarded user-context write to protected key");
                continue;
            }

            if strategy == Strategy::Preserve && live.contains(&key)? {
                continue;
            }

            if strategy == Strategy::Smart {
                if let Some(existing) = live.get_item(&key)? {
                    let existing_is_sentinel = Self::is_sentinel_or_empty(&existing)?;
                    let new_is_empty = Self::is_sentinel_or_empty(&new_value)?;
                    if new_is_empty && !existing_is_sentinel {
                        continue;
                    }
                    if existing.eq(&new_value)? {
                        continue;
                    }
                }
            }

            live.set_item(&key, &new_value)?;
        }

        Ok(())
    }

    /// `merge_thread_results(post, pre)` — diffs a thread-execution
    /// namespace against its pre-image and applies the diff with
    /// `source="thread"`, `strategy="smart"`.
    pub fn merge_thread_results(
        &self,
        py: Python<'_>,
        post: &Bound<'_, PyDict>,
        pre: &Bound<'_, PyDict>,
    ) -> PyResult<()> {
        let diff = PyDict::new(py);
        for (key, value) in post.iter() {
            let before = pre.get_item(&key)?;
            let changed = match &before {
                Some(prev) => !prev.eq(&value)?,
                None => true,
            };
            if changed {
                diff.set_item(&key, &value)?;
            }
        }
        self.update(py, &diff, Source::Thread, Strategy::Smart)
    }

    /// `bump_result_history(value)` — engine-only; shifts `___ <- __ <- _ <-
    /// value`. Ignores `None`.
    pub fn bump_result_history(&self, py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<()> {
        if value.is_none() {
            return Ok(());
        }
        let live = self.dict.bind(py);
        let prev_ii = live.get_item("__")?;
        let prev_i = live.get_item("_")?;

        if let Some(prev_ii) = prev_ii {
            live.set_item("___", prev_ii)?;
        }
        if let Some(prev_i) = prev_i {
            live.set_item("__", prev_i)?;
        }
        live.set_item("_", value)?;
        Ok(())
    }

    /// `serialize_for_persistence()` — a JSON-compatible projection.
    /// Callables, modules, objects without a stable textual form, and
    /// `__builtins__` are skipped; sets become `{"__type__": "set",
    /// "values": [...]}`.
    pub fn serialize_for_persistence(&self, py: Python<'_>) -> PyResult<PersistedNamespace> {
        let live = self.dict.bind(py);
        let mut out = std::collections::BTreeMap::new();

        for (key, value) in live.iter() {
            let key_str: String = key.extract()?;
            if key_str == "__builtins__" {
                continue;
            }
            match python_to_json(py, &value) {
                Ok(Some(json)) => {
                    out.insert(key_str, json);
                }
                Ok(None) => {
                    debug!(key = %key_str, "skipped non-serializable namespace value");
                }
                Err(err) => {
                    warn!(key = %key_str, error = %err, "failed to project namespace value");
                }
            }
        }

        Ok(PersistedNamespace(out))
    }

    /// `deserialize(persisted)` — inverse of [`Namespace::serialize_for_persistence`].
    /// Builds a fresh namespace seeded with the usual engine-owned slots,
    /// then merges the persisted bindings in as `Source::Engine` so the
    /// restored values land even where they alias a protected key (the
    /// snapshot was produced by a prior session's own engine, not a user).
    pub fn deserialize(py: Python<'_>, persisted: &PersistedNamespace) -> PyResult<Self> {
        let namespace = Self::new(py)?;
        let changes = PyDict::new(py);
        for (key, value) in &persisted.0 {
            changes.set_item(key, json_to_python(py, value)?)?;
        }
        namespace.update(py, &changes, Source::Engine, Strategy::Overwrite)?;
        Ok(namespace)
    }
}

/// Project a single Python value into a JSON-compatible [`Value`], or
/// `Ok(None)` if it has no stable textual form (callables, modules).
fn python_to_json(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Option<Value>> {
    if value.is_none() {
        return Ok(Some(Value::Null));
    }
    if let Ok(b) = value.extract::<bool>() {
        return Ok(Some(Value::Bool(b)));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(Some(Value::from(i)));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(serde_json::Number::from_f64(f).map(Value::Number));
    }
    if let Ok(s) = value.extract::<String>() {
        return Ok(Some(Value::String(s)));
    }
    if let Ok(list) = value.downcast::<PyList>() {
        let mut items = Vec::with_capacity(list.len());
        for item in list.iter() {
            match python_to_json(py, &item)? {
                Some(v) => items.push(v),
                None => return Ok(None),
            }
        }
        return Ok(Some(Value::Array(items)));
    }
    if let Ok(set) = value.downcast::<PySet>() {
        let mut values = Vec::with_capacity(set.len());
        for item in set.iter() {
            match python_to_json(py, &item)? {
                Some(v) => values.push(v),
                None => return Ok(None),
            }
        }
        let mut obj = serde_json::Map::new();
        obj.insert("__type__".into(), Value::String("set".into()));
        obj.insert("values".into(), Value::Array(values));
        return Ok(Some(Value::Object(obj)));
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in dict.iter() {
            let key_str: String = match k.extract() {
                Ok(s) => s,
                Err(_) => return Ok(None),
            };
            match python_to_json(py, &v)? {
                Some(json) => {
                    obj.insert(key_str, json);
                }
                None => return Ok(None),
            }
        }
        return Ok(Some(Value::Object(obj)));
    }

    let inspect = py.import("inspect")?;
    let is_callable = value.is_callable();
    let is_module = inspect
        .call_method1("ismodule", (value,))?
        .extract::<bool>()
        .unwrap_or(false);
    if is_callable || is_module {
        return Ok(None);
    }

    Ok(None)
}

/// Project a JSON value back into a Python object, the inverse of
/// [`python_to_json`]. The `{"__type__": "set", "values": [...]}` encoding
/// round-trips to a `set`; any other object round-trips to a `dict`.
fn json_to_python(py: Python<'_>, value: &Value) -> PyResult<Py<PyAny>> {
    match value {
        Value::Null => Ok(py.None()),
        Value::Bool(b) => Ok((*b).into_pyobject(py)?.into_any().unbind()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.into_pyobject(py)?.into_any().unbind())
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                Ok(f.into_pyobject(py)?.into_any().unbind())
            }
        }
        Value::String(s) => Ok(s.as_str().into_pyobject(py)?.into_any().unbind()),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_python(py, item)?)?;
            }
            Ok(list.into_any().unbind())
        }
        Value::Object(obj) => {
            if let Some(Value::String(marker)) = obj.get("__type__") {
                if marker == "set" {
                    let set = PySet::empty(py)?;
                    if let Some(Value::Array(values)) = obj.get("values") {
                        for item in values {
                            set.add(json_to_python(py, item)?)?;
                        }
                    }
                    return Ok(set.into_any().unbind());
                }
            }
            let dict = PyDict::new(py);
            for (k, v) in obj {
                dict.set_item(k.as_str(), json_to_python(py, v)?)?;
            }
            Ok(dict.into_any().unbind())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_py<F: FnOnce(Python<'_>)>(f: F) {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(f);
    }

    #[test]
    fn protected_key_write_from_user_context_is_discarded() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            let changes = PyDict::new(py);
            changes.set_item("_exit_code", 1).unwrap();
            ns.update(py, &changes, Source::Async, Strategy::Overwrite)
                .unwrap();

            assert!(ns.live(py).get_item("_exit_code").unwrap().is_none());
            assert_eq!(ns.protected_write_conflicts(), 1);
        });
    }

    #[test]
    fn engine_source_may_write_protected_keys() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            let changes = PyDict::new(py);
            changes.set_item("_exit_code", 0).unwrap();
            ns.update(py, &changes, Source::Engine, Strategy::Overwrite)
                .unwrap();
            let value: i64 = ns
                .live(py)
                .get_item("_exit_code")
                .unwrap()
                .unwrap()
                .extract()
                .unwrap();
            assert_eq!(value, 0);
        });
    }

    #[test]
    fn result_history_shifts_on_each_bump() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            ns.bump_result_history(py, &5i64.into_pyobject(py).unwrap().into_any())
                .unwrap();
            ns.bump_result_history(py, &10i64.into_pyobject(py).unwrap().into_any())
                .unwrap();
            ns.bump_result_history(py, &15i64.into_pyobject(py).unwrap().into_any())
                .unwrap();

            let live = ns.live(py);
            let get = |k: &str| -> i64 { live.get_item(k).unwrap().unwrap().extract().unwrap() };
            assert_eq!(get("_"), 15);
            assert_eq!(get("__"), 10);
            assert_eq!(get("___"), 5);
        });
    }

    #[test]
    fn bump_ignores_none_result() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            ns.bump_result_history(py, &5i64.into_pyobject(py).unwrap().into_any())
                .unwrap();
            ns.bump_result_history(py, &py.None().into_bound(py))
                .unwrap();
            let value: i64 = ns.live(py).get_item("_").unwrap().unwrap().extract().unwrap();
            assert_eq!(value, 5);
        });
    }

    #[test]
    fn namespace_identity_is_stable_across_updates() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            let before_ptr = ns.dict.bind(py).as_ptr();
            let changes = PyDict::new(py);
            changes.set_item("x", 1).unwrap();
            ns.update(py, &changes, Source::Async, Strategy::Overwrite)
                .unwrap();
            let after_ptr = ns.dict.bind(py).as_ptr();
            assert_eq!(before_ptr, after_ptr);
        });
    }

    #[test]
    fn serialize_for_persistence_skips_builtins_and_projects_sets() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            let changes = PyDict::new(py);
            let set = PySet::new(py, [1i64, 2, 3]).unwrap();
            changes.set_item("numbers", set).unwrap();
            ns.update(py, &changes, Source::Async, Strategy::Overwrite)
                .unwrap();

            let persisted = ns.serialize_for_persistence(py).unwrap();
            assert!(!persisted.0.contains_key("__builtins__"));
            let numbers = persisted.0.get("numbers").unwrap();
            assert_eq!(numbers["__type__"], "set");
        });
    }

    #[test]
    fn deserialize_round_trips_serialize_for_persistence() {
        with_py(|py| {
            let ns = Namespace::new(py).unwrap();
            let changes = PyDict::new(py);
            changes.set_item("x", 42i64).unwrap();
            changes.set_item("name", "ada").unwrap();
            changes.set_item("items", PyList::new(py, [1i64, 2, 3]).unwrap()).unwrap();
            let set = PySet::new(py, [1i64, 2, 3]).unwrap();
            changes.set_item("numbers", set).unwrap();
            ns.update(py, &changes, Source::Async, Strategy::Overwrite)
                .unwrap();

            let persisted = ns.serialize_for_persistence(py).unwrap();
            let restored = Namespace::deserialize(py, &persisted).unwrap();
            let reserialized = restored.serialize_for_persistence(py).unwrap();
            assert_eq!(persisted.0, reserialized.0);
        });
    }
}
