//! Configuration module for the scaling server.
//!
//! The four positional arguments are mandatory. Everything else can come
//! from flags or an optional TOML file; flags take precedence over the file.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "scaling-server")]
#[command(author = "scaling-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Replies with a SHA-1 digest for every 8000-byte payload", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: u16,

    /// Number of worker threads in the pool
    pub workers: usize,

    /// Number of messages that triggers a batch flush
    pub batch_size: usize,

    /// Seconds since the last flush that triggers a batch flush
    pub batch_time: u64,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Bound the task queue; producers block when it is full
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Seconds between statistics reports
    #[arg(short = 's', long)]
    pub stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Task queue capacity (unbounded when absent)
    pub queue_capacity: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            queue_capacity: None,
        }
    }
}

/// Statistics reporting configuration
#[derive(Debug, Deserialize)]
pub struct StatsConfig {
    /// Reporting interval in seconds
    #[serde(default = "default_stats_interval")]
    pub interval: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: default_stats_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_stats_interval() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub batch_size: usize,
    pub batch_time: Duration,
    pub queue_capacity: Option<usize>,
    pub stats_interval: Duration,
    pub backlog: i32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Parse an explicit argument list; the first item is the program name.
    pub fn try_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = CliArgs::try_parse_from(args).map_err(|e| ConfigError::Usage(e.to_string()))?;
        Self::resolve(cli)
    }

    /// Merge CLI args with the TOML file (CLI takes precedence) and validate.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            workers: cli.workers,
            batch_size: cli.batch_size,
            batch_time: Duration::from_secs(cli.batch_time),
            queue_capacity: cli.queue_capacity.or(toml_config.server.queue_capacity),
            stats_interval: Duration::from_secs(
                cli.stats_interval.unwrap_or(toml_config.stats.interval),
            ),
            backlog: toml_config.server.backlog,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave the server unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch-size must be at least 1"));
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::Invalid("stats interval must be at least 1 second"));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid("queue capacity must be at least 1"));
        }
        Ok(())
    }

    /// Address string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Usage(String),
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_args() {
        let config = Config::try_from_args(["scaling-server", "5000", "10", "25", "3"]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.workers, 10);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_time, Duration::from_secs(3));
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.stats_interval, Duration::from_secs(20));
        assert_eq!(config.listen_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_missing_args_is_usage_error() {
        let err = Config::try_from_args(["scaling-server", "5000", "10", "25"]).unwrap_err();
        assert!(matches!(err, ConfigError::Usage(_)));
    }

    #[test]
    fn test_non_integer_is_usage_error() {
        let err = Config::try_from_args(["scaling-server", "5000", "ten", "25", "3"]).unwrap_err();
        assert!(matches!(err, ConfigError::Usage(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::try_from_args(["scaling-server", "5000", "0", "25", "3"]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_from_args([
            "scaling-server",
            "5000",
            "4",
            "10",
            "1",
            "--host",
            "127.0.0.1",
            "-q",
            "128",
            "-s",
            "5",
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:5000");
        assert_eq!(config.queue_capacity, Some(128));
        assert_eq!(config.stats_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_default_toml_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.stats.interval, 20);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            backlog = 256
            queue_capacity = 4096

            [stats]
            interval = 10

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.backlog, 256);
        assert_eq!(config.server.queue_capacity, Some(4096));
        assert_eq!(config.stats.interval, 10);
        assert_eq!(config.logging.level, "debug");
    }
}
