//! Key-value reader preferences, persisted as one TOML snapshot.
//!
//! Every write replaces the whole file (temp file + rename) and then
//! publishes the new value on a watch channel, so readers either poll
//! [`PreferenceStore::current`] or wait on a subscription.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::converter::ConverterInputs;
use crate::error::{AppError, Result};

/// Reading size as a fraction of the body font size.
pub const RUBY_SCALE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextOrientation {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub theme: ThemeMode,
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    #[serde(default)]
    pub orientation: TextOrientation,
    #[serde(default)]
    pub self_server: bool,
    #[serde(default)]
    pub self_server_path: String,
    #[serde(default)]
    pub external_db_uri: String,
    /// Whole-file copy instead of row merge when importing.
    #[serde(default)]
    pub copy_mode: bool,
    #[serde(default)]
    pub external_db_enabled: bool,
    #[serde(default)]
    pub converter: ConverterInputs,
}

fn default_font_family() -> String {
    "serif".to_string()
}

fn default_font_size() -> f32 {
    16.0
}

fn default_background_color() -> String {
    "#FFFFFF".to_string()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: ThemeMode::default(),
            font_family: default_font_family(),
            font_size: default_font_size(),
            background_color: default_background_color(),
            orientation: TextOrientation::default(),
            self_server: false,
            self_server_path: String::new(),
            external_db_uri: String::new(),
            copy_mode: false,
            external_db_enabled: false,
            converter: ConverterInputs::default(),
        }
    }
}

impl Preferences {
    /// Body and reading font sizes for the ruby renderer.
    pub fn font_sizes(&self) -> (f32, f32) {
        (self.font_size, self.font_size * RUBY_SCALE)
    }

    /// Catalog snapshot to load. The self-server root wins when enabled; a
    /// directory root resolves to its `index.html`.
    pub fn catalog_source(&self, fallback: Option<&str>) -> Option<String> {
        if self.self_server && !self.self_server_path.trim().is_empty() {
            let root = PathBuf::from(self.self_server_path.trim());
            let path = if root.is_dir() { root.join("index.html") } else { root };
            return Some(path.to_string_lossy().to_string());
        }
        fallback.map(str::to_string)
    }
}

pub struct PreferenceStore {
    path: PathBuf,
    tx: watch::Sender<Preferences>,
}

impl PreferenceStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let prefs = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Preferences::default()
        };
        let (tx, _rx) = watch::channel(prefs);
        Ok(Self { path, tx })
    }

    pub fn current(&self) -> Preferences {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Preferences> {
        self.tx.subscribe()
    }

    /// Apply `f` to a copy of the current preferences, persist the full
    /// snapshot, then notify subscribers.
    pub fn update<F>(&self, f: F) -> Result<Preferences>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut next = self.current();
        f(&mut next);
        write_snapshot(&self.path, &next)?;
        self.tx.send_replace(next.clone());
        tracing::debug!("Preferences saved to {}", self.path.display());
        Ok(next)
    }
}

fn write_snapshot(path: &Path, prefs: &Preferences) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let content = toml::to_string_pretty(prefs).map_err(|e| AppError::Config(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
