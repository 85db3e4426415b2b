//! Observability for the beacon core: a metrics recorder the session manager
//! and broker report into, plus tracing initialization with an optional
//! SQLite sink for warn+ logs.

mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive. Overridden by the RUST_LOG env var.
    pub log_filter: String,
    /// Emit JSON-formatted log lines instead of human-readable ones.
    pub json_output: bool,
    /// Persist warn+ logs to SQLite at this path.
    pub log_db_path: Option<PathBuf>,
    /// Persist periodic metric snapshots to SQLite at this path.
    pub metrics_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            json_output: false,
            log_db_path: None,
            metrics_db_path: None,
        }
    }
}

/// Handles to the telemetry backends. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// The recorder to hand to `SessionManager` / `MessageBroker`.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// The log sink, when one was configured.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize tracing and metrics. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let fmt_layer = if config.json_output {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (sqlite_layer, log_sink) = match &config.log_db_path {
        Some(path) => match SqliteLogSink::new(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("beacon-telemetry: failed to open log database: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    // try_init so tests can call this more than once without panicking.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init();

    let metrics = match &config.metrics_db_path {
        Some(path) => match MetricsRecorder::with_snapshots(path) {
            Ok(recorder) => Arc::new(recorder),
            Err(e) => {
                eprintln!("beacon-telemetry: failed to open metrics database: {e}");
                Arc::new(MetricsRecorder::new())
            }
        },
        None => Arc::new(MetricsRecorder::new()),
    };

    TelemetryGuard {
        log_sink,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_defaults() {
        let guard = init_telemetry(TelemetryConfig::default());
        assert!(guard.logs().is_none());
        guard.metrics().counter_inc("init.test", &[], 1);
        assert_eq!(guard.metrics().counter_get("init.test", &[]), 1);
    }

    #[test]
    fn init_is_reentrant() {
        let _a = init_telemetry(TelemetryConfig::default());
        let _b = init_telemetry(TelemetryConfig::default());
    }
}
