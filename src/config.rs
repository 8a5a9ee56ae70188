//! Configuration module for the tcp-engine echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::endpoint::EndPoint;
use crate::runtime::Keepalive;
use crate::server::ServerOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tcp-engine")]
#[command(author = "tcp-engine authors")]
#[command(version = "0.1.0")]
#[command(about = "Multi-threaded asynchronous TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Endpoint to listen on (e.g., 127.0.0.1:7000); repeat for several
    #[arg(short = 'l', long = "listen")]
    pub listen: Vec<EndPoint>,

    /// Number of reactor worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Number of auxiliary threads delivering disconnect events
    #[arg(long)]
    pub aux_workers: Option<usize>,

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
    pub socket: SocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Endpoints to bind
    #[serde(default = "default_listen")]
    pub listen: Vec<EndPoint>,
    /// Number of reactor worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Number of auxiliary threads
    #[serde(default = "default_aux_workers")]
    pub aux_workers: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Read buffer size per session in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default)]
    pub nodelay: bool,
    /// Session-count poll interval during shutdown
    #[serde(default = "default_shutdown_poll_interval_ms")]
    pub shutdown_poll_interval_ms: u64,
    /// Seconds to wait for sessions before force-closing them (0 = forever)
    #[serde(default)]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: default_threads(),
            aux_workers: default_aux_workers(),
            backlog: default_backlog(),
            read_buffer_size: default_read_buffer_size(),
            nodelay: false,
            shutdown_poll_interval_ms: default_shutdown_poll_interval_ms(),
            shutdown_grace_secs: 0,
        }
    }
}

/// Listening socket options
#[derive(Debug, Deserialize, Default)]
pub struct SocketConfig {
    /// Keep-alive idle time in seconds (unset = keep-alive off)
    pub keepalive_idle_secs: Option<u64>,
    /// Keep-alive probe interval in seconds
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Keep-alive probe count
    #[serde(default = "default_keepalive_retries")]
    pub keepalive_retries: u32,
    /// Receive/send timeout in seconds
    pub timeout_secs: Option<u64>,
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

fn default_listen() -> Vec<EndPoint> {
    vec![EndPoint::new("127.0.0.1", 7000)]
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_aux_workers() -> usize {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_read_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_shutdown_poll_interval_ms() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    10
}

fn default_keepalive_retries() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<EndPoint>,
    pub threads: usize,
    pub aux_workers: usize,
    pub backlog: i32,
    pub read_buffer_size: usize,
    pub nodelay: bool,
    pub shutdown_poll_interval: Duration,
    pub shutdown_grace: Option<Duration>,
    pub keepalive: Option<Keepalive>,
    pub timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        let socket = toml_config.socket;

        Config {
            listen: if cli.listen.is_empty() {
                server.listen
            } else {
                cli.listen
            },
            threads: cli.threads.unwrap_or(server.threads).max(1),
            aux_workers: cli.aux_workers.unwrap_or(server.aux_workers).max(1),
            backlog: server.backlog,
            read_buffer_size: server.read_buffer_size,
            nodelay: server.nodelay,
            shutdown_poll_interval: Duration::from_millis(server.shutdown_poll_interval_ms.max(1)),
            shutdown_grace: match server.shutdown_grace_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            keepalive: socket.keepalive_idle_secs.map(|idle| Keepalive {
                idle: Duration::from_secs(idle),
                interval: Duration::from_secs(socket.keepalive_interval_secs),
                retries: socket.keepalive_retries,
            }),
            timeout: socket.timeout_secs.map(Duration::from_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            read_buffer_size: self.read_buffer_size,
            listen_backlog: self.backlog,
            aux_workers: self.aux_workers,
            nodelay: self.nodelay,
            shutdown_poll_interval: self.shutdown_poll_interval,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
