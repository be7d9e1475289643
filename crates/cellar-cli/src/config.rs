use std::{
    fs,
    path::{Path, PathBuf},
};

use cellar_core::{config::EncryptionConfig, error::CellarError};
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Default key vault location when nothing is configured.
pub const DEFAULT_ENDPOINT: &str = "file://vault";

/// User-level configuration loaded from `~/.config/cellar/config.toml` (platform-specific),
/// overlaid with environment variables.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Key vault endpoint: `memory://` or `file://<dir>`.
    pub endpoint: Option<String>,
    /// `database.collection` holding DEK documents.
    pub vault_namespace: Option<String>,
    /// Directory of per-provider master key files.
    pub key_dir: Option<PathBuf>,
    /// Per-call vault timeout.
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Settings for the key lifecycle. Fails if no endpoint is configured.
    pub fn encryption(&self) -> Result<EncryptionConfig, CellarError> {
        EncryptionConfig::new(
            self.endpoint.clone(),
            self.vault_namespace.as_deref(),
            self.key_dir.clone(),
        )
    }

    /// Environment wins over the file: `CELLAR_ENDPOINT` (or `MONGODB_URI`),
    /// `CELLAR_VAULT_NAMESPACE`, `CELLAR_KEY_DIR`.
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        if let Some(endpoint) = var("CELLAR_ENDPOINT").or_else(|| var("MONGODB_URI")) {
            self.endpoint = Some(endpoint);
        }
        if let Some(namespace) = var("CELLAR_VAULT_NAMESPACE") {
            self.vault_namespace = Some(namespace);
        }
        if let Some(dir) = var("CELLAR_KEY_DIR") {
            self.key_dir = Some(PathBuf::from(dir));
        }
        self
    }
}

/// Load config from the default path plus the process environment.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    Ok(load_from_path(path)?.with_env(|name| std::env::var(name).ok()))
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("cellar").join("config.toml"))
}

/// Writes a starter config unless one exists; never clobbers user edits.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let starter = Config {
        endpoint: config
            .endpoint
            .clone()
            .or_else(|| Some(DEFAULT_ENDPOINT.to_string())),
        ..config.clone()
    };
    fs::write(path, toml::to_string_pretty(&starter)?)?;
    Ok(path.to_path_buf())
}
