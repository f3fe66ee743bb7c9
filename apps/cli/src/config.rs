//! CLI defaults file.
//!
//! Loaded from `STRATA_CONFIG` when set, else `~/.strata/config.toml`.
//! Command line flags always win over values found here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Parent directory for run outputs
    #[serde(default)]
    pub output_directory: Option<PathBuf>,

    /// Execution backend name
    #[serde(default)]
    pub backend: Option<String>,

    /// Log level
    #[serde(default)]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".strata").join("config.toml"))
    }

    /// A missing file means defaults; a malformed one is an error.
    pub fn discover_and_load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "output_directory = \"/tmp/runs\"\n").unwrap();

        let config = CliConfig::load_from_file(&path).unwrap();
        assert_eq!(config.output_directory, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.backend, None);
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "output_directory = [").unwrap();

        let err = CliConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
