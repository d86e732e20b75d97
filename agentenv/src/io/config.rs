//! Settings stored in `settings.toml` and per-worktree environment configs
//! stored under `.agentenv/environment.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::config::EnvironmentConfig;

/// Directory inside a worktree holding agentenv files.
pub const WORKTREE_DIR: &str = ".agentenv";
/// Environment config file name inside [`WORKTREE_DIR`].
pub const ENVIRONMENT_FILE: &str = "environment.toml";
/// Setting this variable to `1` forces every loaded environment into host mode.
pub const DEFAULT_HOST_VAR: &str = "AGENTENV_DEFAULT_HOST";

/// Process-wide tunables (TOML).
///
/// Missing fields default to the values below, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Deadline for a background service to report that it started.
    pub service_start_timeout_secs: u64,

    /// Grace between SIGTERM and SIGKILL when stopping a host background process.
    pub kill_grace_millis: u64,

    /// Poll interval while waiting for a repository lock.
    pub lock_poll_millis: u64,

    /// Shared directory for repository lock files. `None` uses the system temp dir.
    pub lock_dir: Option<PathBuf>,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Load every environment in host mode.
    pub default_host: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_start_timeout_secs: 60,
            kill_grace_millis: 500,
            lock_poll_millis: 100,
            lock_dir: None,
            output_limit_bytes: 1_000_000,
            default_host: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.service_start_timeout_secs == 0 {
            return Err(anyhow!("service_start_timeout_secs must be > 0"));
        }
        if self.lock_poll_millis == 0 {
            return Err(anyhow!("lock_poll_millis must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if let Some(dir) = &self.lock_dir
            && dir.as_os_str().is_empty()
        {
            return Err(anyhow!("lock_dir must not be empty"));
        }
        Ok(())
    }

    pub fn service_start_timeout(&self) -> Duration {
        Duration::from_secs(self.service_start_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("agentenv-locks"))
    }

    /// Whether loaded environments must run in host mode, from the setting or
    /// the [`DEFAULT_HOST_VAR`] environment variable.
    pub fn force_host(&self) -> bool {
        self.default_host || std::env::var(DEFAULT_HOST_VAR).is_ok_and(|v| v == "1")
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn environment_config_path(worktree: &Path) -> PathBuf {
    worktree.join(WORKTREE_DIR).join(ENVIRONMENT_FILE)
}

/// Load the environment config stored in `worktree`.
///
/// If the file is missing, returns `EnvironmentConfig::default()`.
pub fn load_environment_config(worktree: &Path) -> Result<EnvironmentConfig> {
    let path = environment_config_path(worktree);
    if !path.exists() {
        debug!(path = %path.display(), "no environment config, using defaults");
        return Ok(EnvironmentConfig::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write the environment config into `worktree`.
pub fn save_environment_config(worktree: &Path, config: &EnvironmentConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(config).context("serialize environment toml")?;
    buf.push('\n');
    write_atomic(&environment_config_path(worktree), &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        fs::write(&path, "kill_grace_millis = 50\n").expect("write");
        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.kill_grace(), Duration::from_millis(50));
        assert_eq!(settings.lock_poll_millis, 100);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let settings = Settings {
            lock_poll_millis: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn environment_config_round_trips_through_worktree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EnvironmentConfig {
            base_image: "alpine:3.20".to_string(),
            setup_commands: vec!["apk add git".to_string()],
            env: vec!["A=1".to_string()],
            ..EnvironmentConfig::default()
        };
        save_environment_config(temp.path(), &config).expect("save");
        let loaded = load_environment_config(temp.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_environment_config_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = load_environment_config(temp.path()).expect("load");
        assert_eq!(loaded, EnvironmentConfig::default());
    }
}
