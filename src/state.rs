use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PresenceError;
use crate::types::Config;

/// Directory under the home directory holding config and database.
const STATE_DIR: &str = ".home-presence";

/// Get the state directory path (`~/.home-presence`)
pub fn state_dir() -> Result<PathBuf, PresenceError> {
    let home = dirs::home_dir().ok_or(PresenceError::HomeDirNotFound)?;
    Ok(home.join(STATE_DIR))
}

pub fn config_path() -> Result<PathBuf, PresenceError> {
    Ok(state_dir()?.join("config.json"))
}

pub fn db_path() -> Result<PathBuf, PresenceError> {
    Ok(state_dir()?.join("presence.db"))
}

/// Load configuration from `~/.home-presence/config.json`
pub fn load_config() -> Result<Config, PresenceError> {
    load_config_from(&config_path()?)
}

/// Load and validate configuration from an explicit path
pub fn load_config_from(path: &Path) -> Result<Config, PresenceError> {
    if !path.exists() {
        return Err(PresenceError::ConfigNotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)
        .map_err(|e| PresenceError::Configuration(format!("Failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}
