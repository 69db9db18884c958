use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where applications live and how their workers are launched
    #[serde(default)]
    pub apps: AppSettings,

    /// Idle monitor settings
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 20559, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// Filesystem layout and worker launch settings shared by every application.
///
/// `socket_root` and `log_root` default to `_sockets` and `_logs` inside
/// `host_root` when left unset; use the accessor methods rather than the raw
/// fields to get the effective paths.
#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    /// Directory holding one entry per application
    #[serde(default = "default_host_root")]
    pub host_root: PathBuf,

    /// Directory for worker sockets (default: `<host_root>/_sockets`)
    pub socket_root: Option<PathBuf>,

    /// Directory for worker logs (default: `<host_root>/_logs`)
    pub log_root: Option<PathBuf>,

    /// Executable started once per worker as `<launcher> --server <socket>`
    #[serde(default = "default_launcher")]
    pub launcher: PathBuf,

    /// Application name used when no candidate matches the request host
    #[serde(default = "default_app_name")]
    pub default_app: String,

    /// Maximum time to wait for a worker's socket to appear
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// PATH handed to workers (default: the proxy's own PATH)
    pub worker_path: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host_root: default_host_root(),
            socket_root: None,
            log_root: None,
            launcher: default_launcher(),
            default_app: default_app_name(),
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
            worker_path: None,
        }
    }
}

impl AppSettings {
    /// Settings rooted at `host_root`, everything else defaulted
    pub fn with_host_root(host_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            ..Self::default()
        }
    }

    /// Set the launcher executable (builder pattern)
    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Set the readiness timeout in seconds (builder pattern)
    pub fn with_startup_timeout_secs(mut self, secs: u64) -> Self {
        self.startup_timeout_secs = secs;
        self
    }

    pub fn socket_root(&self) -> PathBuf {
        self.socket_root
            .clone()
            .unwrap_or_else(|| self.host_root.join("_sockets"))
    }

    pub fn log_root(&self) -> PathBuf {
        self.log_root
            .clone()
            .unwrap_or_else(|| self.host_root.join("_logs"))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// PATH value for spawned workers
    pub fn worker_path(&self) -> String {
        self.worker_path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".to_string())
    }

    fn validate(&self) -> Result<(), String> {
        if self.launcher.as_os_str().is_empty() {
            return Err("apps: 'launcher' must not be empty".to_string());
        }
        if self.startup_timeout_secs == 0 {
            return Err("apps: 'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms >= 1000 {
            return Err("apps: 'poll_interval_ms' must be between 1 and 999".to_string());
        }
        if self.default_app.is_empty() {
            return Err("apps: 'default_app' must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Idle time in seconds after which an application's workers are killed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle monitor checks for idle applications
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    20559
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_host_root() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devgate")
}

fn default_launcher() -> PathBuf {
    PathBuf::from("devgate-launcher")
}

fn default_app_name() -> String {
    "default".to_string()
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_poll_interval() -> u64 {
    100 // 100ms
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_reap_interval() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.apps.validate() {
            errors.push(e);
        }
        if self.monitor.reap_interval_secs == 0 {
            errors.push("monitor: 'reap_interval_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
