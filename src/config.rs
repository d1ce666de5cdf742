//! Configuration management for the embedstream gateway.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/embedstream/config.toml`)
//! 3. User-specified configuration file (TOML or YAML)
//! 4. Environment variables (prefixed with `EMBEDSTREAM__`, `__` separated)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! A few unprefixed variables are honoured for compatibility with existing
//! deployments:
//! - `ADDR` - listen address in `ip:port` form
//! - `LOG_OUTPUT` - enables rolling file logging
//! - `LOG_DIR` - directory for log files (defaults to `.`)

use crate::catalog::{ModelCatalog, ModelSpec};
use crate::constants::{defaults, env as env_vars};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line overrides shared by the subcommands
#[derive(Debug, Default, Clone, clap::Args)]
pub struct Args {
    /// Configuration file path (TOML or YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen address in host:port format
    #[arg(short = 'a', long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Inference backend base URL
    #[arg(long, value_name = "URL", alias = "tensorflow-api-addr")]
    pub backend_url: Option<String>,

    /// Maximum in-flight requests per stream session
    #[arg(long, value_name = "N")]
    pub max_in_flight: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listener and lifecycle settings
    pub server: ServerConfig,
    /// Per-session stream settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Dispatcher defaults
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Inference backend
    pub backend: BackendConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Metrics reporting
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Served models
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

/// Listener and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Time sessions get to drain in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Outbound responses buffered per session
    #[serde(default = "default_response_buffer")]
    pub response_buffer: usize,
}

/// Per-session stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Concurrency ceiling per session
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Defaults applied to models that do not set their own bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_capacity")]
    pub default_queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub default_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_queue_capacity: default_queue_capacity(),
            default_workers: default_workers(),
        }
    }
}

/// Supported inference backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// TensorFlow Serving REST API
    TfServing,
}

/// Inference backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

impl BackendConfig {
    /// Per-request timeout for backend calls
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when no filter is given
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Full `EnvFilter` directive, e.g. `embedstream_core=debug,tonic=info`
    #[serde(default)]
    pub filter: Option<String>,
    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// JSON formatted file output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            dir: None,
            json: false,
        }
    }
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the periodic metrics reporter
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            interval_secs: default_metrics_interval(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/embedstream/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix(env_vars::CONFIG_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;

        // Legacy environment variables
        if let Ok(addr) = env::var(env_vars::ADDR) {
            if let Some((host, port)) = split_host_port(&addr) {
                config.server.host = host;
                config.server.port = port;
            }
        }
        if config.logging.dir.is_none() && env::var(env_vars::LOG_OUTPUT).is_ok() {
            let dir = env::var(env_vars::LOG_DIR).unwrap_or_else(|_| ".".to_string());
            config.logging.dir = Some(PathBuf::from(dir));
            config.logging.json = true;
        }

        config.apply_args(args)?;
        Ok(config)
    }

    /// Override with command line args
    pub fn apply_args(&mut self, args: &Args) -> Result<()> {
        if let Some(listen) = &args.listen {
            let (host, port) = split_host_port(listen)
                .ok_or_else(|| Error::Config(format!("Invalid listen address: {}", listen)))?;
            self.server.host = host;
            self.server.port = port;
        }
        if let Some(url) = &args.backend_url {
            self.backend.url = url.clone();
        }
        if let Some(max) = args.max_in_flight {
            self.session.max_in_flight = max;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        Ok(())
    }

    /// Rejects settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.session.max_in_flight == 0 {
            return Err(Error::Config("session.max_in_flight must be at least 1".into()));
        }
        if self.server.response_buffer == 0 {
            return Err(Error::Config("server.response_buffer must be at least 1".into()));
        }
        if self.dispatcher.default_queue_capacity == 0 || self.dispatcher.default_workers == 0 {
            return Err(Error::Config(
                "dispatcher defaults must allow at least one queued task and one worker".into(),
            ));
        }
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(Error::Config(format!("Invalid backend url: {}", self.backend.url)));
        }
        for model in &self.models {
            if model.workers == Some(0) || model.queue_capacity == Some(0) {
                return Err(Error::Config(format!(
                    "model {} must allow at least one worker and one queued task",
                    model.name
                )));
            }
        }
        let catalog = self.catalog()?;
        if catalog.is_empty() {
            return Err(Error::Config("Cannot find any model info in configuration".into()));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Builds the model catalog, rejecting duplicate names
    pub fn catalog(&self) -> Result<ModelCatalog> {
        ModelCatalog::from_specs(self.models.iter().cloned())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address: {}", e)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.interval_secs.max(1))
    }
}

// Helper function to split host and port from a string in HOST:PORT format
fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

fn default_host() -> String {
    defaults::HOST.to_string()
}

fn default_port() -> u16 {
    defaults::PORT
}

fn default_shutdown_grace_secs() -> u64 {
    defaults::SHUTDOWN_GRACE_SECS
}

fn default_response_buffer() -> usize {
    defaults::RESPONSE_BUFFER
}

fn default_max_in_flight() -> usize {
    defaults::MAX_IN_FLIGHT
}

fn default_queue_capacity() -> usize {
    defaults::QUEUE_CAPACITY
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_backend_kind() -> BackendKind {
    BackendKind::TfServing
}

fn default_backend_url() -> String {
    defaults::BACKEND_URL.to_string()
}

fn default_backend_timeout_secs() -> u64 {
    defaults::BACKEND_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    defaults::METRICS_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        write!(file, "{}", contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::load(&Args::default()).unwrap();
        assert_eq!(config.session.max_in_flight, 16);
        assert_eq!(config.dispatcher.default_queue_capacity, 64);
        assert_eq!(config.backend.kind, BackendKind::TfServing);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.backend.timeout(), Duration::from_secs(30));
        assert!(config.metrics.enabled);
        assert!(config.dispatcher.default_workers >= 1);
    }

    #[test]
    fn test_yaml_model_file() {
        let (_dir, path) = write_config(
            "config.yaml",
            concat!(
                "models:\n",
                "  - name: model1\n    version: 1\n    input_name: input1\n",
                "  - name: model2\n    version: 2\n    input_name: input2\n    workers: 3\n",
            ),
        );
        let args = Args {
            config: Some(path),
            ..Default::default()
        };
        let config = ServiceConfig::load(&args).unwrap();
        config.validate().unwrap();

        let catalog = config.catalog().unwrap();
        assert_eq!(
            catalog.get("model1").map(|m| m.as_ref().clone()),
            Some(ModelSpec {
                name: "model1".into(),
                version: 1,
                input_name: "input1".into(),
                workers: None,
                queue_capacity: None,
            })
        );
        assert_eq!(catalog.get("model2").unwrap().workers, Some(3));
    }

    #[test]
    fn test_toml_overrides_and_args() {
        let (_dir, path) = write_config(
            "gateway.toml",
            concat!(
                "[session]\nmax_in_flight = 4\n\n",
                "[backend]\ntimeout_secs = 5\n\n",
                "[[models]]\nname = \"m\"\n",
            ),
        );
        let args = Args {
            config: Some(path),
            listen: Some("127.0.0.1:5000".into()),
            backend_url: Some("https://tf.internal/v1".into()),
            ..Default::default()
        };
        let config = ServiceConfig::load(&args).unwrap();
        assert_eq!(config.session.max_in_flight, 4);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.backend.url, "https://tf.internal/v1");
        assert_eq!(config.backend.timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_nonexistent_file() {
        let args = Args {
            config: Some(PathBuf::from("nonexistent.yaml")),
            ..Default::default()
        };
        assert!(ServiceConfig::load(&args).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ServiceConfig::load(&Args::default()).unwrap();
        assert!(config.validate().is_err(), "empty catalog must be rejected");

        config.models = vec![ModelSpec::new("m"), ModelSpec::new("m")];
        assert!(config.validate().is_err(), "duplicates must be rejected");

        config.models = vec![ModelSpec::new("m")];
        config.backend.url = "localhost:8501".into();
        assert!(config.validate().is_err());

        config.backend.url = "http://localhost:8501/v1".into();
        config.session.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("0.0.0.0:1301"), Some(("0.0.0.0".into(), 1301)));
        assert_eq!(split_host_port("nope"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }
}
