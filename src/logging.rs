//! Logging infrastructure - structured tracing across the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Per-target filtering (`invoke`, `trampoline`, `toggle`)
//! - Zero-cost when disabled
//! - Optional file output through a non-blocking appender

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state; holds the appender guard for the process lifetime
static LOGGER_INITIALIZED: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console only when unset
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("BRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // BRIDGE_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("BRIDGE_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("BRIDGE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("BRIDGE_LOG_SPANS").is_ok();

        config
    }

    /// Minimal logging
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Verbose logging
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("introspect_bridge.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Parse a level name, falling back to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "introspect_bridge={level},invoke={level},trampoline={level},toggle={level}",
                level = config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().map(Path::new) {
            Some(path) => {
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
                let file = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "introspect_bridge.log".to_string());
                let appender = tracing_appender::rolling::never(
                    dir.unwrap_or_else(|| Path::new(".")),
                    file,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
            }
            None => (fmt::writer::BoxMakeWriter::new(io::stderr), None),
        };

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        // Another subscriber may already be installed by the embedder
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log a native invocation
#[inline]
pub fn log_invoke(function: &str, script_args: usize, native_args: usize) {
    debug!(
        target: "invoke",
        event = "invoke",
        function,
        script_args,
        native_args,
        "Invoking native callable"
    );
}

/// Log a native error returned through the error channel
pub fn log_native_error(function: &str, code: i32, message: &str) {
    debug!(
        target: "invoke",
        event = "native_error",
        function,
        code,
        message,
        "Native callable reported an error"
    );
}

/// Log extra script arguments being ignored
pub fn log_excess_arguments(function: &str, expected: usize, got: usize) {
    warn!(
        target: "invoke",
        event = "excess_arguments",
        "Too many arguments to {}: expected {}, got {}",
        function,
        expected,
        got
    );
}

/// Log trampoline construction
#[inline]
pub fn log_trampoline_created(callback: &str, scope: &str, code: *const core::ffi::c_void) {
    trace!(
        target: "trampoline",
        event = "trampoline_created",
        callback,
        scope,
        code = ?code,
        "Trampoline created"
    );
}

/// Log trampoline release (refcount hit zero)
#[inline]
pub fn log_trampoline_released(callback: &str) {
    trace!(
        target: "trampoline",
        event = "trampoline_released",
        callback,
        "Trampoline released"
    );
}

/// Log refusal to enter the engine during a sweep
pub fn log_reentry_refused(callback: &str) {
    error!(
        target: "trampoline",
        event = "reentry_refused",
        callback,
        "Attempting to call back into the script engine during the sweeping phase of GC. \
         This is most likely caused by not destroying a native object that has a callback \
         connected before the wrapper was collected. The callback was not invoked."
    );
}

/// Log a script exception that could not propagate to a caller
pub fn log_exception(context: &str, message: &str) {
    error!(
        event = "exception",
        context,
        message,
        "Unhandled script exception"
    );
}

/// Log a toggle notification
#[inline]
pub fn log_toggle(object: *const core::ffi::c_void, direction: &str, on_owner: bool) {
    trace!(
        target: "toggle",
        event = "toggle",
        object = ?object,
        direction,
        on_owner,
        "Toggle notification"
    );
}

/// Log a deferred toggle task
pub fn log_toggle_queued(object: *const core::ffi::c_void, direction: &str) {
    debug!(
        target: "toggle",
        event = "toggle_queued",
        object = ?object,
        direction,
        "Toggle deferred to owner thread"
    );
}

/// Log bridge shutdown
pub fn log_shutdown(drained: usize, released: usize) {
    info!(
        event = "shutdown",
        drained_tasks = drained,
        released_wrappers = released,
        "Bridge shutting down"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.start.elapsed().as_micros() as u64,
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_path.is_none());

        assert_eq!(LogConfig::performance().level, Level::ERROR);
        assert_eq!(LogConfig::debug().level, Level::TRACE);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init_with_config(LogConfig::performance());
        init_with_config(LogConfig::performance());
        assert!(is_initialized());
    }
}
