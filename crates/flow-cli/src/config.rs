//! Configuration for the `flow` binary
//!
//! Loads configuration from:
//! 1. flow.yaml - execution and logging settings
//! 2. .env file - secrets referenced by `env("NAME")` arguments
//!
//! The .env file is loaded before environment overrides are applied, so it
//! may set any of them. Environment variables always override flow.yaml
//! values, and command-line flags override both.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// DuckDB database for `flow run`; ":memory:" for a throwaway database
    pub database: String,

    /// Run test blocks on the rayon pool
    pub parallel_tests: bool,

    /// Dotenv file loaded before secrets are resolved
    pub env_file: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            database: ":memory:".to_string(),
            parallel_tests: true,
            env_file: ".env".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from YAML file, then the env file, then apply
    /// environment variable overrides
    ///
    /// A missing config or env file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        let env_file = std::env::var("FLOW_ENV_FILE").unwrap_or_else(|_| config.execution.env_file.clone());
        dotenvy::from_path(&env_file).ok();
        config.apply_env();
        Ok(config)
    }

    fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    fn apply_env(&mut self) {
        if let Ok(database) = std::env::var("FLOW_DATABASE") {
            self.execution.database = database;
        }
        if let Ok(parallel) = std::env::var("FLOW_PARALLEL_TESTS") {
            if let Ok(parallel) = parallel.parse() {
                self.execution.parallel_tests = parallel;
            }
        }
        if let Ok(env_file) = std::env::var("FLOW_ENV_FILE") {
            self.execution.env_file = env_file;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
    }
}
