//! Configuration management for slednik.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEFAULT_CONTROL_PORT, DEFAULT_DEVICE_PORT};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Apply the environment overrides `LISTEN_PORT`, `CONTROL_PORT` and
    /// `LOG_DIR` on top of whatever the file provided.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(port) = env_port("LISTEN_PORT")? {
            self.server.listen_port = port;
        }
        if let Some(port) = env_port("CONTROL_PORT")? {
            self.server.control_port = port;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            if !dir.is_empty() {
                self.logging.dir = Some(PathBuf::from(dir));
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_port == self.server.control_port {
            return Err(Error::InvalidConfig(format!(
                "device and control ports collide on {}",
                self.server.listen_port
            )));
        }
        if self.server.outbound_queue == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("net", "slednik", "slednik").map_or_else(
            || PathBuf::from("slednik.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

fn env_port(name: &str) -> Result<Option<u16>> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<u16>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}={raw} is not a valid port"))),
        _ => Ok(None),
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port devices connect to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Port for the operator HTTP surface.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Bind host for both listeners.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Outbound frames queued per session before the session is considered
    /// too slow and closed.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Grace period for draining sessions on shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

fn default_listen_port() -> u16 {
    DEFAULT_DEVICE_PORT
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_outbound_queue() -> usize {
    64
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            control_port: default_control_port(),
            bind_host: default_bind_host(),
            outbound_queue: default_outbound_queue(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily-rolled log files; stdout only when unset.
    pub dir: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
///
/// Returns the appender guard when a log directory is configured; dropping
/// it flushes the file sink, so the caller holds it for the process
/// lifetime.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let (writer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "slednik.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, Some(guard))
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (writer, Some(guard))
        }
    };

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_ansi(config.color && config.dir.is_none())
                    .with_writer(writer),
            )
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(guard)
}
