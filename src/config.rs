use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::relay::handoff::RetryPolicy;

const APP_DIR: &str = "h2tun";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub relay: RelayConfig,
    pub engine: EngineConfig,
    pub handoff: HandoffConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Working directory for the relay, the handoff socket and the engine config.
    pub private_dir: Option<PathBuf>,
    /// Log to this file instead of the terminal.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub executable: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("tun2socks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executable: PathBuf,
    /// Arguments placed before `--config <file>`.
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("hysteria"),
            args: vec!["client".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl HandoffConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts.max(1),
            std::time::Duration::from_millis(self.base_delay_ms),
        )
    }
}

impl AppConfig {
    /// Private directory from config, or `<state dir>/h2tun`.
    #[must_use]
    pub fn private_dir(&self) -> PathBuf {
        self.general
            .private_dir
            .clone()
            .unwrap_or_else(default_private_dir)
    }
}

/// Root config directory: ~/.config/h2tun/
#[must_use]
pub fn app_config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join(APP_DIR)
}

/// Config file: ~/.config/h2tun/config.json
#[must_use]
pub fn config_path() -> PathBuf {
    app_config_dir().join("config.json")
}

/// Profile store: ~/.config/h2tun/profiles.json
#[must_use]
pub fn profiles_path() -> PathBuf {
    app_config_dir().join("profiles.json")
}

/// Default private directory: ~/.local/state/h2tun/
#[must_use]
pub fn default_private_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", ".local/state").join(APP_DIR)
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(var) {
        PathBuf::from(dir)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(home_relative)
    } else {
        PathBuf::from("/tmp")
    }
}

/// Create `dir` (and parents) with mode 0700 if it does not exist yet.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `data` to `path` and restrict it to the owner.
pub fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Load `config.json`; defaults when it is missing or unreadable.
#[must_use]
pub fn load_config() -> AppConfig {
    load_config_from(&config_path())
}

#[must_use]
pub fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(crate::error::AppError::from)
        .and_then(|json| serde_json::from_str::<AppConfig>(&json).map_err(Into::into));
    match parsed {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = ?path.display().to_string(), error = ?e.to_string(), "config_load_failed");
            AppConfig::default()
        }
    }
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_private_file(path, json.as_bytes())?;
    tracing::info!("Config saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"relay":{"executable":"/opt/tun2socks"}}"#).unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.relay.executable, PathBuf::from("/opt/tun2socks"));
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.handoff.max_attempts, 6);
        assert_eq!(config.handoff.base_delay_ms, 50);
    }

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(load_config_from(&path), AppConfig::default());
    }

    #[test]
    fn save_config_round_trips_and_restricts_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.general.private_dir = Some(dir.path().join("private"));
        save_config_to(&path, &config).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(load_config_from(&path), config);
        assert_eq!(load_config_from(&path).private_dir(), dir.path().join("private"));
    }
}
