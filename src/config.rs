//! Runtime configuration surface (spec §6).
//!
//! Loading configuration from a file or environment is explicitly out of
//! scope for the core (see the Non-goals in §1); this module only defines
//! the shape external loaders populate and a small merge helper for
//! layering an override on top of defaults, the same zero-framework
//! approach the teacher uses for its own settings (`environment.rs`'s
//! plain structs deserialized straight from a JSON file, no config crate).

use std::collections::BTreeMap;

use serde::Deserialize;

/// Recognized configuration options (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Rejects inbound frames larger than this. Default 10 MiB.
    #[serde(default = "Config::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Per-execution wall clock, in seconds. Default 30.
    #[serde(default = "Config::default_execute_timeout_s")]
    pub execute_timeout_s: f64,

    /// LRU bound for the compiled code-object cache. Default 100.
    #[serde(default = "Config::default_ast_cache_max")]
    pub ast_cache_max: usize,

    /// Extra module names treated as blocking roots, beyond the built-in
    /// list (`requests`, `urllib`, `socket`, `subprocess`, `sqlite3`).
    #[serde(default)]
    pub blocking_modules: Vec<String>,

    /// Extra method names treated as blocking when called on imported
    /// blocking roots, keyed by module name.
    #[serde(default)]
    pub blocking_methods_by_module: BTreeMap<String, Vec<String>>,

    /// Whether to emit a warning when the blocking-sync path is selected.
    #[serde(default)]
    pub warn_on_blocking: bool,

    /// Worker heartbeat cadence, in seconds.
    #[serde(default = "Config::default_heartbeat_interval_s")]
    pub heartbeat_interval_s: f64,

    /// `Session::start()` bound, in seconds.
    #[serde(default = "Config::default_startup_timeout_s")]
    pub startup_timeout_s: f64,
}

impl Config {
    fn default_max_frame_bytes() -> usize {
        10 * 1024 * 1024
    }

    fn default_execute_timeout_s() -> f64 {
        30.0
    }

    fn default_ast_cache_max() -> usize {
        100
    }

    fn default_heartbeat_interval_s() -> f64 {
        5.0
    }

    fn default_startup_timeout_s() -> f64 {
        10.0
    }

    /// Layer `override_config` on top of `self`, field by field, treating a
    /// field equal to its own default as "unset" in the override. This is
    /// the same one-struct, no-crate merge strategy the teacher applies to
    /// its own settings layering.
    pub fn merge(self, over: Config) -> Config {
        let base = Config::default();
        Config {
            max_frame_bytes: if over.max_frame_bytes != base.max_frame_bytes {
                over.max_frame_bytes
            } else {
                self.max_frame_bytes
            },
            execute_timeout_s: if over.execute_timeout_s != base.execute_timeout_s {
                over.execute_timeout_s
            } else {
                self.execute_timeout_s
            },
            ast_cache_max: if over.ast_cache_max != base.ast_cache_max {
                over.ast_cache_max
            } else {
                self.ast_cache_max
            },
            blocking_modules: if !over.blocking_modules.is_empty() {
                over.blocking_modules
            } else {
                self.blocking_modules
            },
            blocking_methods_by_module: if !over.blocking_methods_by_module.is_empty() {
                over.blocking_methods_by_module
            } else {
                self.blocking_methods_by_module
            },
            warn_on_blocking: over.warn_on_blocking || self.warn_on_blocking,
            heartbeat_interval_s: if over.heartbeat_interval_s != base.heartbeat_interval_s {
                over.heartbeat_interval_s
            } else {
                self.heartbeat_interval_s
            },
            startup_timeout_s: if over.startup_timeout_s != base.startup_timeout_s {
                over.startup_timeout_s
            } else {
                self.startup_timeout_s
            },
        }
    }

    /// The built-in blocking-root module names (spec §4.D), independent of
    /// any configured extensions.
    pub fn builtin_blocking_modules() -> &'static [&'static str] {
        &["requests", "urllib", "socket", "subprocess", "sqlite3"]
    }

    /// The built-in blocking call names recognized outside an async context
    /// (spec §4.D).
    pub fn builtin_blocking_calls() -> &'static [&'static str] {
        &["input", "open", "sleep", "wait", "read", "write", "recv", "send"]
    }

    /// Environment variable names the Session sets on the worker's child
    /// process to hand down its effective configuration, since the worker
    /// binary otherwise parses zero CLI flags (spec §4.E expansion).
    pub const ENV_MAX_FRAME_BYTES: &'static str = "CAPSULE_MAX_FRAME_BYTES";
    pub const ENV_EXECUTE_TIMEOUT_S: &'static str = "CAPSULE_EXECUTE_TIMEOUT_S";
    pub const ENV_HEARTBEAT_INTERVAL_S: &'static str = "CAPSULE_HEARTBEAT_INTERVAL_S";

    /// Pairs of `(name, value)` to set as environment variables on the
    /// spawned worker process so its `Config::from_env()` reconstructs this
    /// configuration.
    pub fn to_env_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (Self::ENV_MAX_FRAME_BYTES, self.max_frame_bytes.to_string()),
            (Self::ENV_EXECUTE_TIMEOUT_S, self.execute_timeout_s.to_string()),
            (
                Self::ENV_HEARTBEAT_INTERVAL_S,
                self.heartbeat_interval_s.to_string(),
            ),
        ]
    }

    /// Reconstruct configuration from environment variables set by
    /// [`Config::to_env_pairs`], falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(v) = std::env::var(Self::ENV_MAX_FRAME_BYTES) {
            if let Ok(parsed) = v.parse() {
                config.max_frame_bytes = parsed;
            }
        }
        if let Ok(v) = std::env::var(Self::ENV_EXECUTE_TIMEOUT_S) {
            if let Ok(parsed) = v.parse() {
                config.execute_timeout_s = parsed;
            }
        }
        if let Ok(v) = std::env::var(Self::ENV_HEARTBEAT_INTERVAL_S) {
            if let Ok(parsed) = v.parse() {
                config.heartbeat_interval_s = parsed;
            }
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_bytes: Config::default_max_frame_bytes(),
            execute_timeout_s: Config::default_execute_timeout_s(),
            ast_cache_max: Config::default_ast_cache_max(),
            blocking_modules: Vec::new(),
            blocking_methods_by_module: BTreeMap::new(),
            warn_on_blocking: false,
            heartbeat_interval_s: Config::default_heartbeat_interval_s(),
            startup_timeout_s: Config::default_startup_timeout_s(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_frame_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.execute_timeout_s, 30.0);
        assert_eq!(cfg.ast_cache_max, 100);
    }

    #[test]
    fn merge_prefers_non_default_override_fields() {
        let base = Config::default();
        let over = Config {
            execute_timeout_s: 5.0,
            ..Config::default()
        };
        let merged = base.merge(over);
        assert_eq!(merged.execute_timeout_s, 5.0);
        assert_eq!(merged.max_frame_bytes, Config::default_max_frame_bytes());
    }
}
