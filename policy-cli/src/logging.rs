use crate::Args;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to include thread names in logs
    pub include_thread_names: bool,

    /// Whether to include file and line number information
    pub include_file_info: bool,

    /// Whether to enable colored output on the terminal
    pub enable_colors: bool,

    /// Log file path (optional, if None logs only to stderr)
    pub log_file: Option<PathBuf>,

    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();
        module_levels.insert("reqwest".to_string(), "warn".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("rustls".to_string(), "warn".to_string());

        Self {
            level: "warn".to_string(),
            include_thread_names: false,
            include_file_info: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

impl LoggingConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            level: args.log_level.clone(),
            log_file: args.log_file.clone(),
            ..Default::default()
        }
    }
}

/// Build the level filter; `RUST_LOG` wins over the configured level
pub fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    if !levels::is_valid_level(&config.level) {
        return Err(anyhow!("Invalid log level: {}", config.level));
    }

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("Invalid log directive: {}", directive))?,
        );
    }
    Ok(filter)
}

/// Initialize logging based on the provided configuration
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let mut guard = None;
    let file_layer = match &config.log_file {
        Some(path) => {
            let (writer, file_guard) = tracing_appender::non_blocking(create_file_appender(path)?);
            guard = Some(file_guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        }
        None => None,
    };

    // Reports go to stdout, so terminal logs use stderr
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(config.include_thread_names)
                .with_file(config.include_file_info)
                .with_line_number(config.include_file_info)
                .with_ansi(config.enable_colors),
        )
        .with(file_layer)
        .try_init();

    match result {
        Ok(_) => tracing::debug!("Logging initialized with level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

/// Create a daily-rolling file appender
fn create_file_appender(log_file: &Path) -> anyhow::Result<tracing_appender::rolling::RollingFileAppender> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let directory = match log_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let filename = log_file
        .file_name()
        .ok_or_else(|| anyhow!("Invalid log file name: {}", log_file.display()))?;

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    Ok(RollingFileAppender::new(Rotation::DAILY, directory, filename))
}

/// Log level utilities
pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }

    pub fn valid_levels() -> Vec<&'static str> {
        vec!["trace", "debug", "info", "warn", "error"]
    }
}
