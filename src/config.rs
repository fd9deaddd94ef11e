//! Bridge configuration, loadable from TOML

use crate::error::Result;
use crate::logging::{parse_level, LogConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub invoke: InvokeConfig,

    #[serde(default)]
    pub trampoline: TrampolineConfig,

    #[serde(default)]
    pub toggle: ToggleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeConfig {
    /// Warn when a call receives more script arguments than it uses
    #[serde(default = "default_true")]
    pub warn_excess_arguments: bool,

    /// Reject callables needing more native slots than this
    #[serde(default = "default_max_arity")]
    pub max_native_arity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrampolineConfig {
    /// Keep texts of exceptions reported from callbacks for the embedder
    #[serde(default = "default_true")]
    pub report_exceptions: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToggleConfig {
    /// Tasks executed per `run_pending` call; 0 means no limit
    #[serde(default)]
    pub task_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub spans: bool,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            warn_excess_arguments: true,
            max_native_arity: default_max_arity(),
        }
    }
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            report_exceptions: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_max_arity() -> usize { 64 }
fn default_level() -> String { "info".to_string() }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults with logging taken from the environment
    pub fn from_env() -> Self {
        let log = LogConfig::from_env();
        let mut config = Self::default();
        config.logging = LoggingConfig {
            level: log.level.as_str().to_lowercase(),
            json: log.json_format,
            file: log.log_path,
            spans: log.show_spans,
        };
        config
    }

    /// Logging section as a subscriber configuration
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: parse_level(&self.logging.level),
            log_path: self.logging.file.clone(),
            json_format: self.logging.json,
            show_spans: self.logging.spans,
        }
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.invoke.warn_excess_arguments);
        assert_eq!(config.invoke.max_native_arity, 64);
        assert!(config.trampoline.report_exceptions);
        assert_eq!(config.toggle.task_batch, 0);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [invoke]
            warn_excess_arguments = false

            [logging]
            level = "debug"
            json = true
        "#;

        let config = BridgeConfig::parse(toml).unwrap();
        assert!(!config.invoke.warn_excess_arguments);
        assert_eq!(config.invoke.max_native_arity, 64);
        assert_eq!(config.log_config().level, tracing::Level::DEBUG);
        assert!(config.log_config().json_format);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[toggle]\ntask_batch = 8").unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.toggle.task_batch, 8);
    }

    #[test]
    fn test_generate_default_round_trips() {
        let text = BridgeConfig::generate_default();
        let config = BridgeConfig::parse(&text).unwrap();
        assert_eq!(config.invoke.max_native_arity, 64);
    }
}
