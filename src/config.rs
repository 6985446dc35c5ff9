//! Configuration management for the llama playground.
//!
//! Configuration is layered from multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/llama-playground/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `LLAMA_PLAYGROUND__`)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! Nested keys use a double underscore separator, for example:
//! - `LLAMA_PLAYGROUND__BACKEND__MANAGED=false`
//! - `LLAMA_PLAYGROUND__BACKEND__PORT=8080`
//! - `LLAMA_PLAYGROUND__BACKEND__MODEL_PATH=/models/7B/ggml-model-q4_0.bin`
//! - `LLAMA_PLAYGROUND__LOGGING__DEBUG=true`

use clap::Args;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Binary used when `bin_path` is `auto`.
pub const DEFAULT_BIN_PATH: &str = "./bin/main";

const SYSTEM_CONFIG: &str = "/etc/llama-playground/config.toml";
const ENV_PREFIX: &str = "LLAMA_PLAYGROUND";

/// Configuration options shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Launch and supervise the backend process (false: connect to an existing one)
    #[arg(long)]
    pub managed: Option<bool>,

    /// Path to the llama.cpp tcp_server binary, or "auto"
    #[arg(long, value_name = "PATH")]
    pub bin_path: Option<String>,

    /// Path to the model file passed to the backend
    #[arg(long, value_name = "PATH")]
    pub model_path: Option<String>,

    /// Backend host
    #[arg(long)]
    pub host: Option<String>,

    /// Backend port, or "auto"
    #[arg(long)]
    pub port: Option<PortSetting>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log filter directive (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    pub log_filter: Option<String>,
}

/// Backend port: fixed, or resolved through the port allocator at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSetting {
    Auto,
    Fixed(u16),
}

impl FromStr for PortSetting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PortSetting::Auto);
        }
        match s.parse::<u16>() {
            Ok(0) => Err("port must be positive".to_string()),
            Ok(port) => Ok(PortSetting::Fixed(port)),
            Err(_) => Err(format!("expected a port number or \"auto\", got '{}'", s)),
        }
    }
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSetting::Auto => write!(f, "auto"),
            PortSetting::Fixed(port) => write!(f, "{}", port),
        }
    }
}

impl<'de> Deserialize<'de> for PortSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u16::try_from(n)
                .ok()
                .filter(|p| *p != 0)
                .map(PortSetting::Fixed)
                .ok_or_else(|| de::Error::custom(format!("port {} out of range", n))),
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

impl Serialize for PortSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PortSetting::Auto => serializer.serialize_str("auto"),
            PortSetting::Fixed(port) => serializer.serialize_u16(*port),
        }
    }
}

/// Playground configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub backend: BackendSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Backend process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Launch the backend binary ourselves
    pub managed: bool,
    /// Path to the backend binary, or "auto"
    pub bin_path: String,
    /// Model file handed to the backend
    pub model_path: String,
    /// Host the backend listens on
    pub host: String,
    /// Listening port
    pub port: PortSetting,
    /// Range searched when `port` is auto
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),
    /// Readiness checks before giving up
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// Delay between readiness checks
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub filter: Option<String>,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = Self::defaults_builder()
            .add_source(config::File::with_name(SYSTEM_CONFIG).required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_args(args);
        Ok(settings)
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self> {
        Ok(Self::defaults_builder().build()?.try_deserialize()?)
    }

    fn defaults_builder() -> config::ConfigBuilder<config::builder::DefaultState> {
        config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ))
    }

    fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(managed) = args.managed {
            self.backend.managed = managed;
        }
        if let Some(bin_path) = &args.bin_path {
            self.backend.bin_path = bin_path.clone();
        }
        if let Some(model_path) = &args.model_path {
            self.backend.model_path = model_path.clone();
        }
        if let Some(host) = &args.host {
            self.backend.host = host.clone();
        }
        if let Some(port) = args.port {
            self.backend.port = port;
        }
        if args.debug {
            self.logging.debug = true;
        }
        if let Some(filter) = &args.log_filter {
            self.logging.filter = Some(filter.clone());
        }
    }

    /// Reject combinations the backend layer cannot act on.
    pub fn validate(&self) -> Result<()> {
        let backend = &self.backend;
        if !backend.managed && backend.port == PortSetting::Auto {
            return Err(Error::config(
                "backend.port must be set to a port number when backend.managed is false",
            ));
        }
        if backend.managed && backend.model_path.trim().is_empty() {
            return Err(Error::config("backend.model_path is required when backend.managed is true"));
        }
        if backend.host.trim().is_empty() {
            return Err(Error::config("backend.host must not be empty"));
        }
        let (min, max) = backend.port_range;
        if min == 0 || min > max {
            return Err(Error::config(format!("invalid backend.port_range [{}, {}]", min, max)));
        }
        if backend.probe_attempts == 0 {
            return Err(Error::config("backend.probe_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl BackendSettings {
    /// Binary path with `auto` resolved to the conventional location.
    pub fn resolved_bin_path(&self) -> PathBuf {
        if self.bin_path == "auto" {
            PathBuf::from(DEFAULT_BIN_PATH)
        } else {
            PathBuf::from(&self.bin_path)
        }
    }

    pub fn probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.probe_interval_ms)
    }
}

fn default_port_range() -> (u16, u16) {
    crate::port::DEFAULT_PORT_RANGE
}

fn default_probe_attempts() -> u32 {
    50
}

fn default_probe_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let settings = Settings::defaults().unwrap();
        assert!(settings.backend.managed);
        assert_eq!(settings.backend.port, PortSetting::Auto);
        assert_eq!(settings.backend.host, "localhost");
        assert_eq!(settings.backend.probe_attempts, 50);
        assert_eq!(settings.backend.probe_interval_ms, 1000);
        assert_eq!(settings.backend.port_range, (1000, 65535));
        assert_eq!(settings.backend.resolved_bin_path(), PathBuf::from(DEFAULT_BIN_PATH));
        assert!(!settings.logging.debug);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_user_file_and_args_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[backend]\nmanaged = false\nport = 8080\nhost = \"10.0.0.2\"\n[logging]\ndebug = true"
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            host: Some("127.0.0.1".into()),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert!(!settings.backend.managed);
        assert_eq!(settings.backend.port, PortSetting::Fixed(8080));
        assert_eq!(settings.backend.host, "127.0.0.1");
        assert!(settings.logging.debug);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unmanaged_auto_port_is_rejected() {
        let mut settings = Settings::defaults().unwrap();
        settings.backend.managed = false;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        settings.backend.port = PortSetting::Fixed(9000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_managed_requires_model_path() {
        let mut settings = Settings::defaults().unwrap();
        settings.backend.model_path = "  ".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_port_setting_parse() {
        assert_eq!("auto".parse::<PortSetting>().unwrap(), PortSetting::Auto);
        assert_eq!("8080".parse::<PortSetting>().unwrap(), PortSetting::Fixed(8080));
        assert!("0".parse::<PortSetting>().is_err());
        assert!("70000".parse::<PortSetting>().is_err());
        assert!("http".parse::<PortSetting>().is_err());
        assert_eq!(PortSetting::Fixed(42).to_string(), "42");
    }
}
