//! Observability infrastructure for drover.
//!
//! Structured logging with consistent spans across all drover components.
//! Binaries call [`init_logging`] once at startup; library code attaches
//! the span constructors below so log lines carry job and execution context.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `drover_exec=debug`)
///
/// # Example
///
/// ```rust
/// use drover_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for reconciliation passes.
///
/// # Example
///
/// ```rust
/// use drover_core::observability::reconcile_span;
///
/// let span = reconcile_span("tick", "job-execution-monitor");
/// let _guard = span.enter();
/// // ... run the pass
/// ```
#[must_use]
pub fn reconcile_span(operation: &str, loop_name: &str) -> Span {
    tracing::info_span!("reconcile", op = operation, name = loop_name)
}

/// Creates a span for operations scoped to a single data job.
#[must_use]
pub fn job_span(operation: &str, job_name: &str) -> Span {
    tracing::info_span!("data_job", op = operation, job = job_name)
}

/// Creates a span for operations scoped to a single execution.
#[must_use]
pub fn execution_span(operation: &str, job_name: &str, execution_id: &str) -> Span {
    tracing::info_span!(
        "execution",
        op = operation,
        job = job_name,
        execution = execution_id,
    )
}
