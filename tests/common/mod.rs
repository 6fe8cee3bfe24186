#![allow(dead_code)]

use promise_graph::{ManualTaskRunner, TaskRunnerRef};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a subscriber filtered by `RUST_LOG`. Safe to call from every test.
pub fn setup_log() {
    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish()
        .try_init();
}

/// A manual runner plus the handle continuations take.
pub fn manual_runner() -> (Arc<ManualTaskRunner>, TaskRunnerRef) {
    let runner = ManualTaskRunner::new();
    let handle: TaskRunnerRef = runner.clone();
    (runner, handle)
}
