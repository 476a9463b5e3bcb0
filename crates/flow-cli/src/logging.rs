//! Structured logging for the `flow` binary
//!
//! Human-readable console output by default, JSON for log shippers, and
//! daily-rotated files through `tracing-appender`.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format (structured logging)
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to pretty
    pub fn from_name(name: &str) -> Self {
        match name {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    /// Unknown names fall back to stdout
    pub fn from_name(name: &str) -> Self {
        match name {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }
}

fn file_appender(directory: &str) -> RollingFileAppender {
    std::fs::create_dir_all(directory).ok();
    RollingFileAppender::new(Rotation::DAILY, directory, "flow.log")
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    }
}

/// Initialize the global subscriber from (already env-overridden) config
///
/// Console logs go to stderr so `flow compile` output stays pipeable.
///
/// ```bash
/// RUST_LOG=flow_compiler=debug LOG_FORMAT=pretty flow run shop.flow
/// RUST_LOG=info LOG_FORMAT=json LOG_OUTPUT=file LOG_DIR=/var/log/flow flow test shop.flow
/// ```
pub fn init(config: &LoggingConfig) {
    let format = LogFormat::from_name(&config.format);
    let output = LogOutput::from_name(&config.output);

    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("warn"));

    match output {
        LogOutput::Stdout => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer(format))
                .init();
        }
        LogOutput::File => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(file_appender(&config.directory))
                        .with_ansi(false),
                )
                .init();
        }
        LogOutput::Both => {
            let file_layer = fmt::layer()
                .with_writer(file_appender(&config.directory))
                .with_ansi(false)
                .boxed();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer(format))
                .with(file_layer)
                .init();
        }
    }

    tracing::debug!(format = ?format, output = ?output, level = %config.level, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_name() {
        assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name("fancy"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_output_from_name() {
        assert_eq!(LogOutput::from_name("file"), LogOutput::File);
        assert_eq!(LogOutput::from_name("both"), LogOutput::Both);
        assert_eq!(LogOutput::from_name("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::from_name(""), LogOutput::Stdout);
    }
}
