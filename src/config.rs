use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_prefs_path")]
    pub prefs_path: String,

    #[serde(default = "default_narou_api_url")]
    pub narou_api_url: String,

    #[serde(default = "default_novel_base_url")]
    pub novel_base_url: String,

    /// Catalog snapshot used when self-server mode is off.
    pub catalog_path: Option<String>,

    /// Merge imports read from a temporary copy of local sources.
    #[serde(default = "default_import_snapshot")]
    pub import_snapshot: bool,
}

fn data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nr-reader");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir
}

fn default_db_path() -> String {
    data_dir().join("novels.db").to_string_lossy().to_string()
}

fn default_prefs_path() -> String {
    data_dir().join("preferences.toml").to_string_lossy().to_string()
}

fn default_narou_api_url() -> String {
    "https://api.syosetu.com/novelapi/api/".to_string()
}

fn default_novel_base_url() -> String {
    "https://ncode.syosetu.com".to_string()
}

fn default_import_snapshot() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            prefs_path: default_prefs_path(),
            narou_api_url: default_narou_api_url(),
            novel_base_url: default_novel_base_url(),
            catalog_path: None,
            import_snapshot: default_import_snapshot(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nr-reader")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str("catalog_path = \"/tmp/list.html\"").unwrap();
        assert_eq!(config.catalog_path.as_deref(), Some("/tmp/list.html"));
        assert_eq!(config.novel_base_url, "https://ncode.syosetu.com");
        assert!(config.db_path.ends_with("novels.db"));
        assert!(config.import_snapshot);
    }
}
