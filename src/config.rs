//! Configuration module for imagedesk-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::port::DEFAULT_SCAN_WIDTH;

/// Port used when none is given, or when the given one is not a number.
pub const DEFAULT_PORT: u16 = 8080;

/// Directory served when no root is configured, looked up next to the executable.
pub const DEFAULT_ROOT_DIR: &str = "imagedesk";

/// Command-line arguments for the asset server
#[derive(Parser, Debug)]
#[command(name = "imagedesk-server")]
#[command(author = "imagedesk-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Serve the Image Desk web app on localhost", long_about = None)]
pub struct CliArgs {
    /// Starting port; the first free port at or above it is used
    #[arg(value_name = "PORT", allow_negative_numbers = true)]
    pub port: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory to serve (defaults to `imagedesk` next to the executable)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Address to scan and bind (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Number of consecutive ports to try
    #[arg(long)]
    pub scan_width: Option<u16>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Starting port for the scan
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_scan_width")]
    pub scan_width: u16,
    pub root: Option<PathBuf>,
    /// Extensions served with the script content type
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scan_width: default_scan_width(),
            root: None,
            script_extensions: default_script_extensions(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1".to_string()
}

fn default_port() -> i64 {
    DEFAULT_PORT as i64
}

fn default_scan_width() -> u16 {
    DEFAULT_SCAN_WIDTH
}

fn default_script_extensions() -> Vec<String> {
    vec!["js".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    /// First port of the scan range
    pub port: u16,
    pub scan_width: u16,
    /// Absolute path of the asset root (existence is checked at bind time)
    pub root: PathBuf,
    pub script_extensions: Vec<String>,
    pub log_level: String,
    /// Non-fatal problems found while loading, reported once logging is up
    pub notices: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::merge(cli, toml_config, &cwd, default_root())
    }

    /// Merge CLI args over TOML values.
    ///
    /// Relative roots resolve against `cwd`; `fallback_root` is used when
    /// neither source names one.
    pub fn merge(
        cli: CliArgs,
        toml_config: TomlConfig,
        cwd: &Path,
        fallback_root: PathBuf,
    ) -> Result<Self, ConfigError> {
        let mut notices = Vec::new();

        let file_port = validate_port(toml_config.server.port)?;
        let port = match cli.port {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(n) => validate_port(n)?,
                Err(_) => {
                    notices.push(format!(
                        "Invalid port number '{}'. Using default port {}.",
                        raw, file_port
                    ));
                    file_port
                }
            },
            None => file_port,
        };

        let scan_width = cli.scan_width.unwrap_or(toml_config.server.scan_width);
        if scan_width == 0 {
            return Err(ConfigError::InvalidScanWidth);
        }

        let host_str = cli.host.unwrap_or(toml_config.server.host);
        let host = parse_host(&host_str)?;

        let root = match cli.root.or(toml_config.server.root) {
            Some(root) if root.is_relative() => cwd.join(root),
            Some(root) => root,
            None => fallback_root,
        };

        let script_extensions = toml_config
            .server
            .script_extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            scan_width,
            root,
            script_extensions,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            notices,
        })
    }
}

/// The asset directory next to the running executable.
fn default_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_ROOT_DIR)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_DIR))
}

fn validate_port(port: i64) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

fn parse_host(host: &str) -> Result<IpAddr, ConfigError> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse()
        .map_err(|_| ConfigError::InvalidHost(host.to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(i64),
    InvalidScanWidth,
    InvalidHost(String),
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
            ConfigError::InvalidPort(port) => {
                write!(f, "Invalid starting port {}: must be between 1 and 65535", port)
            }
            ConfigError::InvalidScanWidth => write!(f, "Port scan width must be at least 1"),
            ConfigError::InvalidHost(host) => write!(f, "Invalid host address '{}'", host),
        }
    }
}

impl std::error::Error for ConfigError {}
