//! Centralized filesystem paths for the agent.
//!
//! Persistent state lives under `~/.cua/`; session logs go to `./logs/` in
//! the working directory so they sit next to the invocation that produced
//! them. Both roots can be overridden via environment variables for tests.

use std::path::PathBuf;

/// Persistent data root, `~/.cua/` by default.
///
/// Override with the `CUA_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CUA_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::home_dir()
        .map(|d| d.join(".cua"))
        .unwrap_or_else(|| PathBuf::from("/tmp/cua-data"))
}

/// Path of the persisted memory file.
#[must_use]
pub fn memory_path() -> PathBuf {
    data_dir().join("memory.json")
}

/// Session log directory, `./logs/` by default.
///
/// Override with the `CUA_LOGS_DIR` environment variable.
#[must_use]
pub fn logs_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CUA_LOGS_DIR") {
        return PathBuf::from(override_dir);
    }
    PathBuf::from("logs")
}

/// Path of the optional TOML config file, `~/.cua/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}
