use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub relay: RelaySettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds without a heartbeat reply before the connection counts as lost
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifySettings {
    /// Command line to run; `%m` is replaced by the notification text
    #[serde(default = "default_notify_command")]
    pub command: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSettings {
    /// Largest frame accepted from the relay (unlimited when unset)
    #[serde(default)]
    pub max_frame_bytes: Option<u32>,
    /// Write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsSettings {
    /// Directory receiving crash reports for undecodable frames
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

/// Flat layout of the older `config.json` files
#[derive(Debug, Clone, Deserialize)]
struct LegacyConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    password: String,
    #[serde(default = "default_true")]
    heartbeat: bool,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_notify_command")]
    notify: String,
}

fn default_port() -> u16 {
    9001
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_notify_command() -> String {
    "notify-send %m".to_string()
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    30
}

fn default_crash_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            command: default_notify_command(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: None,
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            crash_dir: default_crash_dir(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl From<LegacyConfig> for ClientConfig {
    fn from(legacy: LegacyConfig) -> Self {
        Self {
            relay: RelaySettings {
                host: legacy.host,
                port: legacy.port,
                password: legacy.password,
            },
            heartbeat: HeartbeatSettings {
                enabled: legacy.heartbeat,
                timeout_secs: legacy.timeout,
            },
            notify: NotifySettings {
                command: legacy.notify,
            },
            reconnect: ReconnectSettings::default(),
            limits: LimitsSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Loads TOML, or the legacy JSON layout for `.json` paths
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> anyhow::Result<Self> {
        let legacy: LegacyConfig = serde_json::from_str(contents)?;
        Ok(legacy.into())
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout_secs)
    }
}
