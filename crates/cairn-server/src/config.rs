use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, ensure};
use libcairn::SessionManagerConfig;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UiConfig {
    /// Idle time after which a UI session is dropped.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_session_check_interval_secs")]
    pub session_check_interval_secs: u64,
    /// UI user name to password.
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}

impl ServerConfig {
    /// Load `path`, or the default config file when `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.ui.session_check_interval_secs > 0,
            "ui.session_check_interval_secs must be greater than zero"
        );
        ensure!(
            self.ui.session_timeout_secs > 0,
            "ui.session_timeout_secs must be greater than zero"
        );
        Ok(())
    }
}

impl UiConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            check_interval: Duration::from_secs(self.session_check_interval_secs),
            ..SessionManagerConfig::default()
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            session_check_interval_secs: default_session_check_interval_secs(),
            accounts: HashMap::new(),
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("cairn")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("cairn")
    } else {
        PathBuf::from("/tmp/cairn")
    }
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_session_check_interval_secs() -> u64 {
    60
}
