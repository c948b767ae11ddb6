//! Command-line interface configuration
//!
//! The [Config] type holds the defaults read from `lpcflash.toml`, which is
//! looked for in the current directory, its parent, and finally the user's
//! configuration directory. Command-line arguments take precedence over
//! anything configured here.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::connection::DEFAULT_CRYSTAL_FREQUENCY;

const CONFIG_FILE_NAME: &str = "lpcflash.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate of the serial port
    pub baudrate: Option<u32>,
}

/// Properties of the target device
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Target {
    /// Crystal frequency, in kHz
    pub crystal_frequency: u32,
    /// Parts description file
    pub parts_file: Option<PathBuf>,
    /// Compute the vector table checksum instead of verifying it
    pub compute_user_code: bool,
}

impl Default for Target {
    fn default() -> Self {
        Target {
            crystal_frequency: DEFAULT_CRYSTAL_FREQUENCY,
            parts_file: None,
            compute_user_code: true,
        }
    }
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Target device defaults
    #[serde(default)]
    pub target: Target,
}

impl Config {
    /// Load the first configuration file found, or the defaults if none is
    pub fn load() -> Result<Self> {
        let Some(path) = Self::find_config_path(CONFIG_FILE_NAME) else {
            debug!("No configuration file found");
            return Ok(Config::default());
        };

        let config = Self::from_file(&path)?;
        debug!("Config from {}: {:#?}", path.display(), &config);

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&data)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    fn find_config_path(filename: &str) -> Option<PathBuf> {
        if let Ok(current_dir) = std::env::current_dir() {
            let local_config = current_dir.join(filename);
            if local_config.exists() {
                return Some(local_config);
            }
            if let Some(parent_folder) = current_dir.parent() {
                let workspace_config = parent_folder.join(filename);
                if workspace_config.exists() {
                    return Some(workspace_config);
                }
            }
        }

        let project_dirs = ProjectDirs::from("rs", "lpcflash", "lpcflash")?;
        let global_config = project_dirs.config_dir().join(filename);

        global_config.exists().then_some(global_config)
    }
}
