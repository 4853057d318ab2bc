use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

const APP_DIR: &str = "tunbox";
const HOME_ENV: &str = "TUNBOX_HOME";

/// Engine executable name inside `<app dir>/bin/`.
#[cfg(windows)]
pub const ENGINE_BINARY: &str = "sing-box.exe";
#[cfg(not(windows))]
pub const ENGINE_BINARY: &str = "sing-box";

/// Root data directory: $TUNBOX_HOME, else ~/.config/tunbox/
///
/// This is also the engine working directory (`-D`), so the engine cache
/// file and downloaded rule-sets land next to our own state.
#[must_use]
pub fn app_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    xdg_config_home().join(APP_DIR)
}

fn xdg_config_home() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else if let Some(appdata) = std::env::var_os("APPDATA") {
        PathBuf::from(appdata)
    } else {
        std::env::temp_dir()
    }
}

#[must_use]
pub fn settings_path(dir: &Path) -> PathBuf {
    dir.join("settings.json")
}

#[must_use]
pub fn profiles_path(dir: &Path) -> PathBuf {
    dir.join("profiles.json")
}

#[must_use]
pub fn subscriptions_path(dir: &Path) -> PathBuf {
    dir.join("subscriptions.json")
}

/// Synthesized engine configuration, rewritten before every launch.
#[must_use]
pub fn engine_config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

#[must_use]
pub fn bin_dir(dir: &Path) -> PathBuf {
    dir.join("bin")
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

/// Write `value` as pretty JSON, creating the parent directory if needed.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    tracing::debug!(path = %path.display(), "state_saved");
    Ok(())
}

/// Read a JSON file; a missing file is `Ok(None)`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&json)?))
}
