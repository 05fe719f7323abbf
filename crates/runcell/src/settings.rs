//! Settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runcell/settings.json
//! - Linux: ~/.config/runcell/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runcell\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What to do when code is evaluated on a buffer with no attached kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoInit {
    /// Fail with `NotAttached`.
    #[default]
    Raise,
    /// Start a kernel on `server_url` and attach it first.
    Init,
}

impl std::fmt::Display for AutoInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoInit::Raise => write!(f, "raise"),
            AutoInit::Init => write!(f, "init"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host polling cadence for `tick` / `tick_input`.
    pub tick_rate_ms: u64,

    /// Most messages a single `tick` will drain.
    pub tick_batch_size: usize,

    pub ready_timeout_secs: u64,
    pub ready_poll_interval_ms: u64,

    /// How long a session stays `Interrupting` without hearing back.
    pub interrupt_timeout_secs: u64,

    /// Per-candidate timeout during endpoint discovery.
    pub probe_timeout_secs: u64,

    /// Accept self-signed certificates on HTTPS lifecycle calls.
    pub accept_invalid_certs: bool,

    pub auto_init: AutoInit,

    /// Server used by `AutoInit::Init`.
    pub server_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_rate_ms: 500,
            tick_batch_size: 64,
            ready_timeout_secs: 30,
            ready_poll_interval_ms: 100,
            interrupt_timeout_secs: 5,
            probe_timeout_secs: 5,
            accept_invalid_certs: true,
            auto_init: AutoInit::Raise,
            server_url: None,
        }
    }
}

impl Settings {
    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_secs(self.interrupt_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runcell")
        .join("settings.json")
}

/// Load settings from the default location.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, returning defaults if it is missing or unreadable.
pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| match serde_json::from_str(&s) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("[settings] Ignoring unparseable {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
