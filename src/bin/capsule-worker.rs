//! Worker entry point (spec §4.E / §6 "Worker invocation").
//!
//! Thin wiring over library code, following the teacher's own `main.rs`
//! shape: install logging, then hand off to `capsule_core`. Stdin/stdout
//! are the wire transport inherited from the spawning Session, so logging
//! here is directed at stderr only — never print to stdout.

use capsule_core::config::Config;
use capsule_core::worker::Worker;
use pyo3::prelude::*;
use tracing::error;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let result = runtime.block_on(async move {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();

        let worker = Python::with_gil(|py| Worker::new(py, config, stdin, stdout))
            .map_err(|err| format!("failed to initialize worker: {err}"))?;

        worker.run().await.map_err(|err| err.to_string())
    });

    if let Err(err) = result {
        error!(error = %err, "worker terminated with an error");
        std::process::exit(1);
    }
}
