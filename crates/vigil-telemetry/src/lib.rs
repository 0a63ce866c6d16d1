mod diagnostics;

pub use diagnostics::{DiagnosticLayer, DiagnosticQuery, DiagnosticRecord, DiagnosticSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "vigil_client" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Whether to persist warn+ diagnostics to SQLite.
    pub diagnostics_to_sqlite: bool,
    /// Path to the diagnostics database.
    pub diagnostics_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            diagnostics_to_sqlite: false,
            diagnostics_db_path: dirs_fallback().join("diagnostics.db"),
        }
    }
}

impl TelemetryConfig {
    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the diagnostic sink reachable for queries after init.
pub struct TelemetryGuard {
    diagnostics: Option<Arc<DiagnosticSink>>,
}

impl TelemetryGuard {
    /// Access the sink for querying persisted diagnostics.
    pub fn diagnostics(&self) -> Option<&DiagnosticSink> {
        self.diagnostics.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// Logs go to stderr so stdout stays free for the chat transcript.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let (diagnostic_layer, sink) = if config.diagnostics_to_sqlite {
        match DiagnosticSink::open(&config.diagnostics_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(DiagnosticLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("vigil-telemetry: failed to open diagnostics DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(diagnostic_layer)
        .init();

    TelemetryGuard { diagnostics: sink }
}

/// Fallback home dir for default paths.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".vigil")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
        assert!(!config.diagnostics_to_sqlite);
        assert!(config.diagnostics_db_path.ends_with(".vigil/diagnostics.db"));
    }

    #[test]
    fn filter_directive_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("vigil_client".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "warn,vigil_client=debug");
    }
}
