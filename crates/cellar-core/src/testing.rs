//! Scriptable in-memory vault used by this crate's unit tests.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    kms::KmsProviders,
    schema::{Algorithm, DataType},
    tenant::ProviderName,
    value::{EncryptedValue, ValueHeader},
    vault::{
        DekId, ExplicitEncryption, KeyDocument, KeyVault, VaultConnector, VaultError,
        VaultNamespace, ID_FIELD, KEY_ALT_NAMES_FIELD,
    },
};

#[derive(Debug, Clone)]
pub(crate) struct FakeKey {
    pub id: DekId,
    pub alt_names: Vec<String>,
    pub provider: ProviderName,
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub keys: Vec<FakeKey>,
    pub connects: usize,
    pub creates: usize,
    pub lookup_failure: Option<VaultError>,
    pub create_failure: Option<VaultError>,
    pub corrupt_ids: bool,
    pub delay: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state lock")
    }
}

pub(crate) struct FakeClient {
    state: Arc<Mutex<FakeState>>,
    kms: KmsProviders,
}

impl FakeClient {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state lock")
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl VaultConnector for FakeConnector {
    type Client = FakeClient;

    async fn connect(
        &self,
        _namespace: &VaultNamespace,
        kms: &KmsProviders,
    ) -> Result<FakeClient, VaultError> {
        self.state().connects += 1;
        Ok(FakeClient {
            state: self.state.clone(),
            kms: kms.clone(),
        })
    }
}

#[async_trait]
impl KeyVault for FakeClient {
    async fn find_key_by_alt_name(
        &self,
        alt_name: &str,
    ) -> Result<Option<KeyDocument>, VaultError> {
        self.pause().await;
        let state = self.state();
        if let Some(err) = state.lookup_failure.clone() {
            return Err(err);
        }
        let found = state
            .keys
            .iter()
            .find(|k| k.alt_names.iter().any(|n| n == alt_name));
        Ok(found.map(|key| {
            let id = if state.corrupt_ids {
                json!("not-a-uuid")
            } else {
                key.id.to_extended_json()
            };
            let mut doc = KeyDocument::new();
            doc.insert(ID_FIELD.into(), id);
            doc.insert(KEY_ALT_NAMES_FIELD.into(), json!(key.alt_names));
            doc
        }))
    }

    async fn create_data_key(
        &self,
        provider: &ProviderName,
        alt_names: &[String],
    ) -> Result<DekId, VaultError> {
        self.pause().await;
        let mut state = self.state();
        state.creates += 1;
        if let Some(err) = state.create_failure.clone() {
            return Err(err);
        }
        if self.kms.key_for(provider).is_none() {
            return Err(VaultError::UnknownProvider {
                provider: provider.to_string(),
            });
        }
        if let Some(taken) = alt_names
            .iter()
            .find(|n| state.keys.iter().any(|k| k.alt_names.contains(*n)))
        {
            return Err(VaultError::DuplicateAltName {
                alt_name: taken.clone(),
            });
        }
        let id = DekId::new_random();
        state.keys.push(FakeKey {
            id,
            alt_names: alt_names.to_vec(),
            provider: provider.clone(),
        });
        Ok(id)
    }

    async fn delete_key_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError> {
        let mut state = self.state();
        let before = state.keys.len();
        state
            .keys
            .retain(|k| !k.alt_names.iter().any(|n| n == alt_name));
        Ok(state.keys.len() != before)
    }
}

const MASK_BYTE: u8 = 0x5A;

// XOR stands in for the engine's cipher; only the key bookkeeping matters here.
fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

#[async_trait]
impl ExplicitEncryption for FakeClient {
    async fn encrypt(
        &self,
        key_id: DekId,
        algorithm: Algorithm,
        value: &Value,
    ) -> Result<EncryptedValue, VaultError> {
        let data_type = DataType::of(value).ok_or_else(|| VaultError::Crypto {
            reason: "cannot encrypt null".into(),
        })?;
        let plaintext = serde_json::to_vec(value).map_err(|e| VaultError::Crypto {
            reason: e.to_string(),
        })?;
        Ok(EncryptedValue::assemble(
            ValueHeader {
                algorithm,
                key_id,
                data_type,
            },
            &mask(&plaintext),
        ))
    }

    async fn decrypt(&self, value: &EncryptedValue) -> Result<Value, VaultError> {
        self.pause().await;
        let header = value.header().map_err(|e| VaultError::Crypto {
            reason: e.to_string(),
        })?;
        let provider = self
            .state()
            .keys
            .iter()
            .find(|k| k.id == header.key_id)
            .map(|k| k.provider.clone())
            .ok_or(VaultError::KeyNotFound {
                key_id: header.key_id,
            })?;
        if self.kms.key_for(&provider).is_none() {
            return Err(VaultError::UnknownProvider {
                provider: provider.to_string(),
            });
        }
        serde_json::from_slice(&mask(value.payload())).map_err(|e| VaultError::Crypto {
            reason: e.to_string(),
        })
    }
}
