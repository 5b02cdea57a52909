//! Configuration module for the crystal server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "crystal")]
#[command(version)]
#[command(about = "A single-threaded chat request server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to the intents JSON file
    #[arg(long)]
    pub intents: Option<PathBuf>,

    /// Rebuild the intent model instead of loading the saved one
    #[arg(long)]
    pub retrain: bool,

    /// Name of the intent model
    #[arg(long)]
    pub model: Option<String>,

    /// Responder worker threads (0 = answer inline on the event loop)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Listen backlog
    pub backlog: i32,
    /// Maximum number of open connections
    pub max_connections: usize,
    /// Bytes read per receive, and so the largest request
    pub read_buffer_size: usize,
    /// Per-connection cap on queued output
    pub max_outbound_bytes: usize,
    /// Idle timeout in seconds (0 = disabled)
    pub idle_timeout_secs: u64,
    /// How long shutdown waits for in-flight requests
    pub shutdown_grace_secs: u64,
    /// Readiness events handled per poll
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            backlog: 1024,
            max_connections: 1024,
            read_buffer_size: 1024,
            max_outbound_bytes: 1024 * 1024, // 1 MB
            idle_timeout_secs: 0,
            shutdown_grace_secs: 5,
            events_capacity: 1024,
        }
    }
}

/// Responder-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Worker threads (0 = inline)
    pub workers: usize,
    /// Intents JSON file
    pub intents: PathBuf,
    /// Directory holding saved models
    pub model_dir: PathBuf,
    /// Model name
    pub model: String,
    /// Always rebuild the model
    pub retrain: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            intents: PathBuf::from("./data/intents.json"),
            model_dir: PathBuf::from("."),
            model: "Crystal".to_string(),
            retrain: false,
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

const DEFAULT_PORT: u16 = 9001;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub max_outbound_bytes: usize,
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub events_capacity: usize,
    pub responder_workers: usize,
    pub intents: PathBuf,
    pub model_dir: PathBuf,
    pub model: String,
    pub retrain: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already parsed CLI arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            responder,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            read_buffer_size: server.read_buffer_size,
            max_outbound_bytes: server.max_outbound_bytes,
            idle_timeout_secs: cli.idle_timeout.unwrap_or(server.idle_timeout_secs),
            shutdown_grace_secs: server.shutdown_grace_secs,
            events_capacity: server.events_capacity,
            responder_workers: cli.workers.unwrap_or(responder.workers),
            intents: cli.intents.unwrap_or(responder.intents),
            model_dir: responder.model_dir,
            model: cli.model.unwrap_or(responder.model),
            retrain: cli.retrain || responder.retrain,
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backlog", self.backlog.max(0) as usize),
            ("max_connections", self.max_connections),
            ("read_buffer_size", self.read_buffer_size),
            ("max_outbound_bytes", self.max_outbound_bytes),
            ("events_capacity", self.events_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }
        if self.model.is_empty() {
            return Err(ConfigError::Invalid("model", "must not be empty"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(key, reason) => {
                write!(f, "Invalid configuration value '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9001);
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.responder_workers, 0);
        assert_eq!(config.idle_timeout_secs, 0);
        assert_eq!(config.intents, PathBuf::from("./data/intents.json"));
        assert_eq!(config.model, "Crystal");
        assert!(!config.retrain);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9100
            max_outbound_bytes = 4096
            idle_timeout_secs = 30

            [responder]
            workers = 4
            model = "Opal"
            retrain = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.max_outbound_bytes, 4096);
        assert_eq!(config.server.idle_timeout_secs, 30);
        // Unset keys keep their defaults.
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.responder.workers, 4);
        assert_eq!(config.responder.model, "Opal");
        assert!(config.responder.retrain);
        assert_eq!(config.responder.model_dir, PathBuf::from("."));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\nhost = \"0.0.0.0\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "crystal",
            "--config",
            file.path().to_str().unwrap(),
            "--port",
            "9200",
            "--retrain",
            "--model",
            "Opal",
        ]);
        let config = Config::from_args(cli).unwrap();

        assert_eq!(config.port, 9200);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.retrain);
        assert_eq!(config.model, "Opal");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_config_errors() {
        let cli = CliArgs::parse_from(["crystal", "--config", "/nonexistent/crystal.toml"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a port\"").unwrap();
        let cli = CliArgs::parse_from(["crystal", "-c", file.path().to_str().unwrap()]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::TomlParse(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nread_buffer_size = 0").unwrap();
        let cli = CliArgs::parse_from(["crystal", "-c", file.path().to_str().unwrap()]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::Invalid("read_buffer_size", _))
        ));
    }
}
