//! Layered configuration.
//!
//! Precedence: CLI flags > environment (`PORT`, `HOST`,
//! `BEADS_POLL_INTERVAL`, `WORKSPACE_CWD`) > `.ralph/config.toml` >
//! built-in defaults. Unknown environment variables are ignored.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::adapter;
use crate::orchestrator::DEFAULT_MAX_WORKERS;
use crate::paths;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4100;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    /// Adapter id (`claude`, `codex`).
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            agent: adapter::DEFAULT_ADAPTER.to_string(),
            model: None,
            allowed_tools: Vec::new(),
            workspace_id: None,
        }
    }
}

/// CLI-level overrides, applied last.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub agent: Option<String>,
    pub max_workers: Option<usize>,
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// The workspace root: `WORKSPACE_CWD` when set, the process cwd otherwise.
pub fn workspace_dir() -> Result<PathBuf> {
    match std::env::var_os("WORKSPACE_CWD") {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(std::env::current_dir()?),
    }
}

/// Load `.ralph/config.toml` under the workspace, falling back to defaults
/// when the file is missing.
pub fn load(workspace: &Path) -> Result<Config> {
    let path = paths::config_path(workspace);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

/// Apply environment overrides through a lookup function (injectable for
/// tests). Malformed values are ignored like unknown variables.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
        config.port = port;
    }
    if let Some(host) = lookup("HOST") {
        config.host = host;
    }
    if let Some(interval) = lookup("BEADS_POLL_INTERVAL").and_then(|v| v.parse().ok()) {
        config.poll_interval_ms = interval;
    }
}

/// Full resolution: file, then environment, then CLI overrides.
pub fn resolve(workspace: &Path, overrides: &Overrides) -> Result<Config> {
    let mut config = load(workspace)?;
    apply_env(&mut config, |key| std::env::var(key).ok());
    if let Some(ref agent) = overrides.agent {
        config.agent = agent.clone();
    }
    if let Some(max_workers) = overrides.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(ref host) = overrides.host {
        config.host = host.clone();
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load(tmp.path()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.agent, "claude");
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn file_values_override_defaults() {
        let tmp = TempDir::new().unwrap();
        let dir = paths::state_dir(tmp.path());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            paths::config_path(tmp.path()),
            "port = 9000\nagent = \"codex\"\nmax_workers = 5\n",
        )
        .unwrap();

        let config = load(tmp.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.agent, "codex");
        assert_eq!(config.max_workers, 5);
        // Unspecified keys keep defaults
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn env_overrides_file_and_ignores_junk() {
        let mut config = Config::default();
        apply_env(&mut config, |key| match key {
            "PORT" => Some("8080".into()),
            "HOST" => Some("0.0.0.0".into()),
            "BEADS_POLL_INTERVAL" => Some("250".into()),
            _ => None,
        });
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.poll_interval_ms, 250);

        // Malformed values are ignored
        apply_env(&mut config, |key| match key {
            "PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn cli_overrides_win() {
        let tmp = TempDir::new().unwrap();
        let overrides = Overrides {
            agent: Some("codex".into()),
            max_workers: Some(1),
            port: Some(7),
            host: Some("::1".into()),
        };
        let config = resolve(tmp.path(), &overrides).unwrap();
        assert_eq!(config.agent, "codex");
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.port, 7);
        assert_eq!(config.host, "::1");
    }
}
