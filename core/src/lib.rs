use log::{LevelFilter, SetLoggerError};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{runtime::ConfigErrors, Appender, Config, Root},
    encode::{pattern::PatternEncoder, Encode},
    filter::threshold::ThresholdFilter,
};
use std::{backtrace, env};

pub mod constants;
pub mod database;
pub mod latency;
pub mod measurement;
pub mod stats;

pub use database::canonical_database_name;
pub use latency::Latency;
pub use measurement::{Operation, RawMeasurement};
pub use stats::{compute_stats, StatSummary};

#[derive(Debug)]
struct BacktracePatternEncoder {
    pattern_encoder: PatternEncoder,
    is_backtrace_enabled: bool,
}

impl BacktracePatternEncoder {
    fn new(pattern: &str) -> Self {
        BacktracePatternEncoder {
            pattern_encoder: PatternEncoder::new(pattern),
            is_backtrace_enabled: env::var("RUST_BACKTRACE").is_ok()
                || env::var("RUST_LIB_BACKTRACE").is_ok(),
        }
    }
}

impl Encode for BacktracePatternEncoder {
    fn encode(
        &self,
        w: &mut dyn log4rs::encode::Write,
        record: &log::Record<'_>,
    ) -> anyhow::Result<()> {
        if record.level() == log::Level::Error && self.is_backtrace_enabled {
            let args = format_args!(
                "{}\nBacktrace:\n{}",
                record.args(),
                backtrace::Backtrace::capture()
            );
            let new_record = log::Record::builder()
                .args(args)
                .level(record.level())
                .target(record.target())
                .module_path(record.module_path())
                .file(record.file())
                .line(record.line())
                .build();
            self.pattern_encoder.encode(w, &new_record)?;
        } else {
            self.pattern_encoder.encode(w, record)?;
        }
        Ok(())
    }
}

/// Errors raised while wiring up the process-wide logger.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("failed to open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid logger configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("logger already initialized: {0}")]
    SetLogger(#[from] SetLoggerError),
}

/// Installs the `log4rs` backend used by every binary in the workspace.
///
/// Records at `log_level` and above go to stderr. When `file_path` is set the
/// same records are also appended to that file.
///
/// # Arguments
/// * `log_level` - Threshold for both appenders.
/// * `file_path` - Optional log file; `None` keeps output on stderr only.
///
/// # Returns
/// * `Ok(())` once the global logger is installed.
/// * `Err(LoggerError)` if the file cannot be opened or a logger is already set.
pub fn initialize_logger(
    log_level: LevelFilter,
    file_path: Option<&str>,
) -> Result<(), LoggerError> {
    const LOGGING_PATTERN: &str = "{d} {l} {f}:{L} - {m}\n";

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(BacktracePatternEncoder::new(LOGGING_PATTERN)))
        .build();

    let mut config_builder = Config::builder();
    let mut root_builder = Root::builder();

    if let Some(path) = file_path {
        let logfile = FileAppender::builder()
            // Pattern: https://docs.rs/log4rs/*/log4rs/encode/pattern/index.html
            .encoder(Box::new(BacktracePatternEncoder::new(LOGGING_PATTERN)))
            .build(path)
            .map_err(|source| LoggerError::File {
                path: path.to_string(),
                source,
            })?;

        config_builder =
            config_builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root_builder = root_builder.appender("logfile");
    }

    let config = config_builder
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(log_level)))
                .build("stderr", Box::new(stderr)),
        )
        .build(root_builder.appender("stderr").build(log_level))?;

    let _handle = log4rs::init_config(config)?;

    Ok(())
}

/// Parses a case-insensitive level name as used by the `*_LOG_LEVEL` variables.
pub fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_log_level;
    use log::LevelFilter;

    #[test]
    fn parse_log_level_accepts_known_names() {
        assert_eq!(parse_log_level("INFO"), Some(LevelFilter::Info));
        assert_eq!(parse_log_level(" warning "), Some(LevelFilter::Warn));
        assert_eq!(parse_log_level("trace"), Some(LevelFilter::Trace));
        assert_eq!(parse_log_level("off"), Some(LevelFilter::Off));
    }

    #[test]
    fn parse_log_level_rejects_unknown_names() {
        assert_eq!(parse_log_level("verbose"), None);
        assert_eq!(parse_log_level(""), None);
    }
}
