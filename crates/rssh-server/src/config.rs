//! Rendezvous configuration: TOML file + CLI overrides.

use crate::policy::ServerPolicy;
use rssh_core::keys::{load_authorized_key, parse_authorized_key};
use rssh_core::{ConnectionParameters, Mode, RsshError, RsshResult};
use serde::Deserialize;
use ssh_key::PublicKey;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub shell: ShellSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Password accepted from dial-home peers. Unset disables passwords.
    #[serde(default)]
    pub password: Option<String>,
    /// Inline `authorized_keys` line, or a path to such a file.
    #[serde(default)]
    pub authorized_key: Option<String>,
}

/// `[shell]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// In listen mode this flips to "allow shell and local forwarding".
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
fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// Resolved rendezvous configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub params: ConnectionParameters,
    pub password: Option<String>,
    pub authorized_key: Option<PublicKey>,
}

impl ServerConfig {
    /// Load config from a TOML file (defaults if absent), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_no_shell: bool,
    ) -> RsshResult<Self> {
        let file = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                parse(&std::fs::read_to_string(&path)?)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, cli_port, cli_no_shell)
    }

    pub fn from_toml(content: &str, cli_port: Option<u16>, cli_no_shell: bool) -> RsshResult<Self> {
        Self::resolve(parse(content)?, cli_port, cli_no_shell)
    }

    fn resolve(file: ConfigFile, cli_port: Option<u16>, cli_no_shell: bool) -> RsshResult<Self> {
        let authorized_key = match file.auth.authorized_key.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(line) if line.starts_with("ssh-") || line.starts_with("ecdsa-") => {
                Some(parse_authorized_key(line)?)
            }
            Some(path) => Some(load_authorized_key(&expand_tilde_str(path))?),
        };
        if authorized_key.is_none() && file.auth.password.is_none() {
            return Err(RsshError::Config(
                "no authentication configured: set auth.password or auth.authorized_key".into(),
            ));
        }

        let params = ConnectionParameters {
            home_port: cli_port.unwrap_or(file.server.port),
            mode: Mode::Listen,
            shell: file.shell.shell,
            no_shell: cli_no_shell || file.shell.no_shell,
            ..Default::default()
        };
        Ok(Self {
            params,
            password: file.auth.password,
            authorized_key,
        })
    }

    /// Address to listen on.
    pub fn listen_address(&self) -> String {
        format!("0.0.0.0:{}", self.params.home_port)
    }

    pub fn policy(&self) -> ServerPolicy {
        ServerPolicy::new(
            self.password.clone(),
            self.authorized_key.clone(),
            self.params.effective_no_shell(),
        )
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
