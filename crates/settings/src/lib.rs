//! DecoyNet Settings
//!
//! Configuration for the server and node roles, stored as one JSON file.
//!
//! ## Usage
//!
//! ```no_run
//! use decoynet_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.node.server_addr = "decoy.example.net:7443".to_string();
//! settings.save()?;
//! # Ok::<(), decoynet_settings::SettingsError>(())
//! ```

mod config;

pub use config::{
    ReconnectSettings, ScanSettings, ServerSettings, SessionSettings, Settings, NodeSettings,
    TlsSettings,
};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// `$DECOYNET_HOME`, else `~/.decoynet`
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DECOYNET_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".decoynet")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
