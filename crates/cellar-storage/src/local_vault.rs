//! Local key vault: DEK documents in a [`KeyCollection`], wrapped and used by
//! the local [`engine`](crate::engine).

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use cellar_core::{
    error::CellarError,
    kms::KmsProviders,
    schema::Algorithm,
    tenant::ProviderName,
    value::EncryptedValue,
    vault::{
        DekId, ExplicitEncryption, KeyDocument, KeyVault, VaultConnector, VaultError,
        VaultNamespace,
    },
};
use serde_json::Value;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::{
    collection::{FileCollection, KeyCollection, MemoryCollection, StoredKey},
    engine,
};

const MEMORY_SCHEME: &str = "memory://";
const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone)]
enum Backend {
    Memory(Arc<Mutex<HashMap<VaultNamespace, MemoryCollection>>>),
    Directory {
        root: PathBuf,
        /// One handle per file, so every client writes under the same lock.
        open: Arc<Mutex<HashMap<PathBuf, Arc<FileCollection>>>>,
    },
}

/// Opens [`LocalVaultClient`]s over in-process or on-disk collections.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    backend: Backend,
}

impl LocalConnector {
    /// Collections live in this process; every clone of the connector shares them.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::default()),
        }
    }

    /// Collections are `<root>/<database>/<collection>.json`. Clones of the
    /// connector share open collections, so their writes are serialised.
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Directory {
                root: root.into(),
                open: Arc::default(),
            },
        }
    }

    /// `memory://` or `file://<dir>`. Other schemes belong to remote document
    /// stores, which need their own connector.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, CellarError> {
        let endpoint = endpoint.trim();
        if endpoint == MEMORY_SCHEME {
            return Ok(Self::in_memory());
        }
        match endpoint.strip_prefix(FILE_SCHEME) {
            Some(path) if !path.is_empty() => Ok(Self::directory(path)),
            _ => Err(CellarError::Config {
                parameter: "endpoint",
                reason: format!(
                    "unsupported endpoint '{endpoint}', expected {MEMORY_SCHEME} or {FILE_SCHEME}<dir>"
                ),
            }),
        }
    }

    fn collection(&self, namespace: &VaultNamespace) -> Result<Arc<dyn KeyCollection>, VaultError> {
        match &self.backend {
            Backend::Memory(collections) => {
                let mut collections = collections.lock().map_err(poisoned)?;
                let collection = collections.entry(namespace.clone()).or_default().clone();
                Ok(Arc::new(collection))
            }
            Backend::Directory { root, open } => {
                let path = root
                    .join(namespace.database())
                    .join(format!("{}.json", namespace.collection()));
                let mut open = open.lock().map_err(poisoned)?;
                let collection = open
                    .entry(path)
                    .or_insert_with_key(|path| Arc::new(FileCollection::new(path.clone())))
                    .clone();
                Ok(collection)
            }
        }
    }
}

#[async_trait]
impl VaultConnector for LocalConnector {
    type Client = LocalVaultClient;

    async fn connect(
        &self,
        namespace: &VaultNamespace,
        kms: &KmsProviders,
    ) -> Result<LocalVaultClient, VaultError> {
        debug!(%namespace, providers = kms.len(), "opening local key vault");
        Ok(LocalVaultClient {
            collection: self.collection(namespace)?,
            kms: kms.clone(),
            dek_cache: Mutex::new(HashMap::new()),
        })
    }
}

/// Vault client bound to one namespace and one KMS configuration. Unwrapped
/// DEKs are cached for the lifetime of the client.
pub struct LocalVaultClient {
    collection: Arc<dyn KeyCollection>,
    kms: KmsProviders,
    dek_cache: Mutex<HashMap<DekId, Zeroizing<Vec<u8>>>>,
}

impl LocalVaultClient {
    fn unwrapped_dek(&self, key_id: DekId) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if let Some(dek) = self.cached(key_id)? {
            return Ok(dek);
        }

        let stored = self
            .collection
            .find_by_id(&key_id)?
            .ok_or(VaultError::KeyNotFound { key_id })?;
        let provider = &stored.master_key.provider;
        let master = self
            .kms
            .key_for(provider)
            .ok_or_else(|| VaultError::UnknownProvider {
                provider: provider.to_string(),
            })?;
        let dek = engine::unwrap_dek(master, provider, &stored.wrapped_key()?)?;

        self.dek_cache
            .lock()
            .map_err(poisoned)?
            .insert(key_id, dek.clone());
        Ok(dek)
    }

    fn cached(&self, key_id: DekId) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        Ok(self.dek_cache.lock().map_err(poisoned)?.get(&key_id).cloned())
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> VaultError {
    VaultError::Unavailable {
        reason: format!("lock poisoned: {err}"),
    }
}

#[async_trait]
impl KeyVault for LocalVaultClient {
    async fn find_key_by_alt_name(
        &self,
        alt_name: &str,
    ) -> Result<Option<KeyDocument>, VaultError> {
        Ok(self
            .collection
            .find_by_alt_name(alt_name)?
            .map(|key| key.to_document()))
    }

    #[instrument(skip_all, fields(%provider))]
    async fn create_data_key(
        &self,
        provider: &ProviderName,
        alt_names: &[String],
    ) -> Result<DekId, VaultError> {
        let master = self
            .kms
            .key_for(provider)
            .ok_or_else(|| VaultError::UnknownProvider {
                provider: provider.to_string(),
            })?;
        let dek = engine::generate_dek();
        let wrapped = engine::wrap_dek(master, provider, &dek)?;
        let stored = StoredKey::new(provider.clone(), alt_names.to_vec(), &wrapped);
        let id = stored.id;
        self.collection.insert(stored)?;
        debug!(key_id = %id, "stored new data key");
        Ok(id)
    }

    async fn delete_key_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError> {
        self.collection.delete_by_alt_name(alt_name)
    }
}

#[async_trait]
impl ExplicitEncryption for LocalVaultClient {
    async fn encrypt(
        &self,
        key_id: DekId,
        algorithm: Algorithm,
        value: &Value,
    ) -> Result<EncryptedValue, VaultError> {
        let dek = self.unwrapped_dek(key_id)?;
        engine::encrypt_value(&dek, key_id, algorithm, value)
    }

    async fn decrypt(&self, value: &EncryptedValue) -> Result<Value, VaultError> {
        let header = value.header().map_err(|e| VaultError::Crypto {
            reason: e.to_string(),
        })?;
        let dek = self.unwrapped_dek(header.key_id)?;
        engine::decrypt_value(&dek, value)
    }
}
