use std::path::{Path, PathBuf};

use crate::{error::CellarError, vault::VaultNamespace};

/// Key vault namespace used when none is configured.
pub const DEFAULT_VAULT_NAMESPACE: &str = "csfle_keyvault.datakeys";
/// Master key directory used when none is configured (relative to the working dir).
pub const DEFAULT_KEY_DIR: &str = "keys";

/// Everything the key lifecycle needs from the outside world, built once at the
/// process boundary and handed to each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    endpoint: String,
    vault_namespace: VaultNamespace,
    key_dir: PathBuf,
}

impl EncryptionConfig {
    /// Fails with a config error when the endpoint is absent or blank, or the
    /// namespace is not `database.collection`.
    pub fn new(
        endpoint: Option<String>,
        vault_namespace: Option<&str>,
        key_dir: Option<PathBuf>,
    ) -> Result<Self, CellarError> {
        let endpoint = endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| CellarError::config("endpoint", "connection endpoint is not set"))?;
        let vault_namespace = vault_namespace
            .unwrap_or(DEFAULT_VAULT_NAMESPACE)
            .parse()?;
        Ok(Self {
            endpoint,
            vault_namespace,
            key_dir: key_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn vault_namespace(&self) -> &VaultNamespace {
        &self.vault_namespace
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }
}
