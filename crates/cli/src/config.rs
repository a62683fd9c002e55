use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration, loaded from a TOML file. Every field has a
/// default so the hub runs without any config file at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Address the HTTP server (and therefore the data relay) binds to.
    pub bind: String,
    /// Path of the JSON account store.
    pub store_path: PathBuf,
    /// Directory holding the per-platform agent artifacts (MT4/, MT5/).
    pub resources_dir: PathBuf,
    /// Where terminal workspaces are allocated; system temp dir if unset.
    pub temp_root: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            store_path: PathBuf::from("accounts.json"),
            resources_dir: PathBuf::from("resources"),
            temp_root: None,
        }
    }
}

impl AppConfig {
    /// Load the config file if it exists; otherwise fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/trading-viewer.toml")).unwrap();
        assert_eq!(config.bind, "127.0.0.1:3001");
        assert!(config.temp_root.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trading-viewer.toml");
        std::fs::write(&path, "bind = \"0.0.0.0:4000\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:4000");
        assert_eq!(config.store_path, PathBuf::from("accounts.json"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trading-viewer.toml");
        std::fs::write(&path, "bindd = \"oops\"\n").unwrap();

        assert!(AppConfig::load(&path).is_err());
    }
}
