//! Dial-home configuration: TOML file + CLI overrides.

use crate::backoff::CeilingMode;
use crate::connector::{Connector, DialTarget};
use crate::supervisor::{MonitorPolicy, SupervisorConfig};
use rssh_core::{ConnectionParameters, Credentials, Dialer, Mode, RsshError, RsshResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub home: HomeSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub shell: ShellSection,
}

/// `[home]` section: the rendezvous host.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeSection {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub bind_port: u16,
}

impl Default for HomeSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            bind_port: 0,
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default)]
    pub password: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            key: default_key_path(),
            password: String::new(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Negative retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default)]
    pub ceiling: CeilingMode,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            ceiling: CeilingMode::default(),
        }
    }
}

/// `[monitor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub policy: MonitorPolicy,
    #[serde(default)]
    pub restart_on_failure: bool,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            policy: MonitorPolicy::default(),
            restart_on_failure: false,
        }
    }
}

/// `[shell]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub no_shell: bool,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            no_shell: false,
        }
    }
}

fn default_port() -> u16 {
    7000
}
fn default_user() -> String {
    "rssh".to_string()
}
fn default_key_path() -> String {
    "~/.rssh/id_ed25519".to_string()
}
fn default_max_attempts() -> i64 {
    -1
}
fn default_interval_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// Values given on the command line. Each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub bind_port: Option<u16>,
    pub key: Option<String>,
    pub password: Option<String>,
    pub max_attempts: Option<i64>,
    pub shell: Option<String>,
    pub no_shell: bool,
}

/// Resolved dial-home configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub params: ConnectionParameters,
    pub key_path: PathBuf,
    pub password: String,
    pub max_attempts: i64,
    pub ceiling: CeilingMode,
    pub supervisor: SupervisorConfig,
}

impl ClientConfig {
    /// Load config from a TOML file (defaults if absent), then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RsshResult<Self> {
        let file = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                parse(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, overrides)
    }

    pub fn from_toml(content: &str, overrides: ConfigOverrides) -> RsshResult<Self> {
        Self::resolve(parse(content)?, overrides)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RsshResult<Self> {
        let home_host = overrides.host.unwrap_or(file.home.host);
        if home_host.is_empty() {
            return Err(RsshError::Config("home host is required".into()));
        }
        if file.monitor.interval_secs == 0 {
            return Err(RsshError::Config("monitor interval must be positive".into()));
        }

        let params = ConnectionParameters {
            user: overrides.user.unwrap_or(file.home.user),
            home_host,
            home_port: overrides.port.unwrap_or(file.home.port),
            bind_port: overrides.bind_port.unwrap_or(file.home.bind_port),
            mode: Mode::Reverse,
            shell: overrides.shell.unwrap_or(file.shell.shell),
            no_shell: overrides.no_shell || file.shell.no_shell,
        };
        let key = overrides.key.unwrap_or(file.auth.key);

        Ok(Self {
            params,
            key_path: expand_tilde_str(&key),
            password: overrides.password.unwrap_or(file.auth.password),
            max_attempts: overrides.max_attempts.unwrap_or(file.retry.max_attempts),
            ceiling: file.retry.ceiling,
            supervisor: SupervisorConfig {
                probe_interval: Duration::from_secs(file.monitor.interval_secs),
                probe_timeout: Duration::from_secs(file.monitor.probe_timeout_secs),
                monitor: file.monitor.policy,
                restart_on_failure: file.monitor.restart_on_failure,
                restart_ceiling: file.retry.ceiling,
            },
        })
    }

    /// Read the private key named by the config.
    pub fn credentials(&self) -> RsshResult<Credentials> {
        Credentials::load(&self.key_path, self.password.clone())
    }

    pub fn target(&self, credentials: Credentials) -> DialTarget {
        DialTarget::new(&self.params, credentials)
    }

    pub fn connector<D: Dialer>(&self, dialer: D) -> Connector<D> {
        Connector::new(dialer)
            .with_max_attempts(self.max_attempts)
            .with_ceiling_mode(self.ceiling)
    }
}

fn parse(content: &str) -> RsshResult<ConfigFile> {
    toml::from_str(content).map_err(|e| RsshError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
