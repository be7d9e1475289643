use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::{rngs::OsRng, RngCore};

use crate::{
    error::CellarError,
    kms::{MasterKey, MASTER_KEY_LEN},
    tenant::ProviderName,
};

/// Provides each provider's master key, generating it on first use.
///
/// Implementations must be idempotent: once a key exists for a provider it is
/// returned unchanged on every later call, across restarts for durable stores.
pub trait MasterKeyStore: Send + Sync {
    fn load_or_create(&self, provider: &ProviderName) -> Result<MasterKey, CellarError>;
}

impl<T: MasterKeyStore + ?Sized> MasterKeyStore for Arc<T> {
    fn load_or_create(&self, provider: &ProviderName) -> Result<MasterKey, CellarError> {
        (**self).load_or_create(provider)
    }
}

/// Fresh key from the OS CSPRNG.
pub fn generate_master_key() -> MasterKey {
    let mut bytes = [0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let key = MasterKey::from_bytes(bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    key
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMasterKeyStore {
    inner: Arc<Mutex<HashMap<ProviderName, MasterKey>>>,
}

impl InMemoryMasterKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MasterKeyStore for InMemoryMasterKeyStore {
    fn load_or_create(&self, provider: &ProviderName) -> Result<MasterKey, CellarError> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard
            .entry(provider.clone())
            .or_insert_with(generate_master_key)
            .clone())
    }
}
