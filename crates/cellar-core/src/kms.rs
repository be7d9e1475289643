//! Master key material and the KMS provider configuration built from it.

use std::{collections::BTreeMap, fmt};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::tenant::ProviderName;

/// Length of a local KMS master key, in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// A tenant's local master key. Zeroized on drop; `Debug` shows only the fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    bytes: Zeroizing<[u8; MASTER_KEY_LEN]>,
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Returns `None` unless `slice` is exactly [`MASTER_KEY_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; MASTER_KEY_LEN] = slice.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }

    /// Short non-secret identifier for logs (never log key bytes).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.bytes.as_slice());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Settings for a single local KMS provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalKmsProvider {
    pub key: MasterKey,
}

/// KMS provider configuration handed to the encryption engine so it can
/// wrap and unwrap DEKs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KmsProviders {
    providers: BTreeMap<ProviderName, LocalKmsProvider>,
}

impl KmsProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration holding exactly one provider.
    pub fn local(provider: ProviderName, key: MasterKey) -> Self {
        let mut kms = Self::new();
        kms.insert(provider, key);
        kms
    }

    pub fn insert(&mut self, provider: ProviderName, key: MasterKey) {
        self.providers.insert(provider, LocalKmsProvider { key });
    }

    pub fn key_for(&self, provider: &ProviderName) -> Option<&MasterKey> {
        self.providers.get(provider).map(|p| &p.key)
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &ProviderName> {
        self.providers.keys()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Document form `{provider: {key: <base64>}}` as consumed by the
    /// collaborator's encryption options. Contains raw key material.
    pub fn to_document(&self) -> Value {
        let map: Map<String, Value> = self
            .providers
            .iter()
            .map(|(name, provider)| {
                (
                    name.to_string(),
                    json!({ "key": STANDARD.encode(provider.key.as_bytes()) }),
                )
            })
            .collect();
        Value::Object(map)
    }
}
