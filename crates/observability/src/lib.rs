//! Tracing and logging setup shared by the platform binaries.

use serde::Deserialize;

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line (production default).
    #[default]
    Json,
    /// Human-readable, for local development.
    Pretty,
}

/// Initialize process-wide observability with JSON logs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize process-wide observability with an explicit log format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}
