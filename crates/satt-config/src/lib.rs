//! Daemon configuration: file discovery, parsing, and resilient defaults.
//!
//! Follows the teacher's `core-config` shape: prefer a local config file,
//! fall back to a platform config directory via `dirs`, and fall back again
//! to built-in defaults on a missing or malformed file rather than erroring
//! out of startup.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub enum SetModeFile {
    Low,
    High,
}

impl Default for SetModeFile {
    fn default() -> Self {
        Self::Low
    }
}

/// Parsed `attenuator.toml` contents. Unknown fields are ignored so older
/// daemon versions can read files written by newer ones.
#[derive(Debug, Deserialize, Clone)]
pub struct ConfigFile {
    #[serde(default = "ConfigFile::default_prefix")]
    pub prefix: String,
    #[serde(default = "ConfigFile::default_blade_count")]
    pub blade_count: usize,
    #[serde(default = "ConfigFile::default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub set_mode: SetModeFile,
    #[serde(default = "ConfigFile::default_motion_timeout_ms")]
    pub motion_timeout_ms: u64,
    #[serde(default = "ConfigFile::default_run_clear_retries")]
    pub run_clear_retries: u32,
}

impl ConfigFile {
    fn default_prefix() -> String {
        "AT2L0".to_string()
    }
    fn default_blade_count() -> usize {
        18
    }
    fn default_data_dir() -> String {
        "./data".to_string()
    }
    fn default_motion_timeout_ms() -> u64 {
        5000
    }
    fn default_run_clear_retries() -> u32 {
        3
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            prefix: Self::default_prefix(),
            blade_count: Self::default_blade_count(),
            data_dir: Self::default_data_dir(),
            set_mode: SetModeFile::default(),
            motion_timeout_ms: Self::default_motion_timeout_ms(),
            run_clear_retries: Self::default_run_clear_retries(),
        }
    }
}

/// Best-effort config path: local working directory first, then the
/// platform config dir, falling back to the bare relative filename.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("attenuator.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("attenuator").join("attenuator.toml");
    }
    PathBuf::from("attenuator.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<ConfigFile> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(file),
            Err(e) => {
                tracing::warn!(
                    target: "config",
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, falling back to defaults"
                );
                Ok(ConfigFile::default())
            }
        }
    } else {
        Ok(ConfigFile::default())
    }
}
