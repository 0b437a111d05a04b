//! Server configuration: TOML file + CLI overrides + environment secrets.

use crate::session::ManagerConfig;
use ptyhub_core::{HubError, HubResult, WorkspaceType};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable holding the API bearer token.
pub const ENV_API_TOKEN: &str = "PTYHUB_API_TOKEN";
/// Environment variable holding the credential encryption key (64 hex chars).
pub const ENV_ENCRYPTION_KEY: &str = "PTYHUB_ENCRYPTION_KEY";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Largest accepted request frame, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token: None,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl std::fmt::Debug for ServerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSection")
            .field("bind", &self.bind)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("max_message_bytes", &self.max_message_bytes)
            .finish()
    }
}

/// `[manager]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
    #[serde(default = "default_workspace_base")]
    pub workspace_base: String,
    #[serde(default)]
    pub workspace_type: WorkspaceType,
    /// Agent binary; `$SHELL` or `/bin/sh` when unset.
    #[serde(default)]
    pub agent_command: Option<String>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_per_user: default_max_per_user(),
            timeout_minutes: default_timeout_minutes(),
            output_buffer_size: default_output_buffer_size(),
            workspace_base: default_workspace_base(),
            workspace_type: WorkspaceType::default(),
            agent_command: None,
            agent_args: Vec::new(),
            cols: default_cols(),
            rows: default_rows(),
            kill_grace_secs: default_kill_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// `[rate_limit]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// `[store]` section of the config TOML.
#[derive(Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Directory of the JSON file store; no persistence when unset.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for StoreSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSection")
            .field("path", &self.path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_bind() -> String {
    "127.0.0.1:7681".to_string()
}
fn default_max_message_bytes() -> usize {
    1_048_576
}
fn default_max_per_user() -> usize {
    3
}
fn default_timeout_minutes() -> u64 {
    30
}
fn default_output_buffer_size() -> usize {
    1000
}
fn default_workspace_base() -> String {
    "~/.ptyhub/workspaces".to_string()
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    40
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_capacity() -> u32 {
    30
}
fn default_refill_per_sec() -> f64 {
    5.0
}
fn default_retention_secs() -> u64 {
    600
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub max_per_user: Option<usize>,
    pub timeout_minutes: Option<u64>,
    pub workspace_base: Option<String>,
    pub agent_command: Option<String>,
    pub store_path: Option<String>,
}

/// Token bucket settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub api_token: Option<String>,
    pub max_message_bytes: usize,
    pub manager: ManagerConfig,
    pub rate_limit: RateLimitConfig,
    pub store_path: Option<PathBuf>,
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("auth_enabled", &self.api_token.is_some())
            .field("max_message_bytes", &self.max_message_bytes)
            .field("manager", &self.manager)
            .field("rate_limit", &self.rate_limit)
            .field("store_path", &self.store_path)
            .field("encryption_enabled", &self.encryption_key.is_some())
            .finish()
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides and environment
    /// secrets.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides, |name| std::env::var(name).ok())
    }

    /// Merge file values, CLI overrides and secrets looked up with `env`.
    pub fn resolve(
        file: ConfigFile,
        overrides: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> HubResult<Self> {
        let bind_str = overrides.bind.clone().unwrap_or(file.server.bind);
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|e| HubError::Validation(format!("invalid bind address {bind_str:?}: {e}")))?;

        let api_token = env(ENV_API_TOKEN)
            .or(file.server.api_token)
            .filter(|t| !t.is_empty());
        let encryption_key = env(ENV_ENCRYPTION_KEY)
            .or(file.store.encryption_key)
            .filter(|k| !k.is_empty());

        let m = file.manager;
        let max_per_user = overrides.max_per_user.unwrap_or(m.max_per_user);
        let timeout_minutes = overrides.timeout_minutes.unwrap_or(m.timeout_minutes);
        if max_per_user == 0 {
            return Err(HubError::Validation("max_per_user must be at least 1".into()));
        }
        if timeout_minutes == 0 {
            return Err(HubError::Validation("timeout_minutes must be at least 1".into()));
        }
        if m.output_buffer_size == 0 {
            return Err(HubError::Validation(
                "output_buffer_size must be at least 1".into(),
            ));
        }
        if m.cols == 0 || m.rows == 0 {
            return Err(HubError::Validation("terminal size must be non-zero".into()));
        }

        let workspace_base = overrides
            .workspace_base
            .clone()
            .unwrap_or(m.workspace_base);
        let agent_command = overrides
            .agent_command
            .clone()
            .or(m.agent_command)
            .or_else(|| env("SHELL"))
            .unwrap_or_else(|| "/bin/sh".to_string());

        let manager = ManagerConfig {
            max_per_user,
            idle_timeout: Duration::from_secs(timeout_minutes * 60),
            output_buffer_size: m.output_buffer_size,
            workspace_base: expand_tilde_str(&workspace_base),
            workspace_type: m.workspace_type,
            agent_command,
            agent_args: m.agent_args,
            cols: m.cols,
            rows: m.rows,
            kill_grace: Duration::from_secs(m.kill_grace_secs),
            sweep_interval: Duration::from_secs(m.sweep_interval_secs.max(1)),
        };

        let r = file.rate_limit;
        let rate_limit = RateLimitConfig {
            capacity: r.capacity.max(1),
            refill_per_sec: r.refill_per_sec,
            retention: Duration::from_secs(r.retention_secs),
            sweep_interval: Duration::from_secs(r.sweep_interval_secs.max(1)),
        };

        let store_path = overrides
            .store_path
            .clone()
            .or(file.store.path)
            .map(|p| expand_tilde_str(&p));

        Ok(Self {
            bind,
            api_token,
            max_message_bytes: file.server.max_message_bytes,
            manager,
            rate_limit,
            store_path,
            encryption_key,
        })
    }
}

/// Parse the TOML text of a config file.
pub fn parse_config(content: &str) -> HubResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HubError::Validation(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
