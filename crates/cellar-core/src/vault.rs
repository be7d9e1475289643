//! Contracts for the remote key vault and its encryption engine.
//!
//! The core never talks to a document store directly. It needs a vault that
//! can find, register and remove DEKs by alternate name ([`KeyVault`]) and an
//! engine that can encrypt or decrypt an opaque value given key material
//! ([`ExplicitEncryption`]). A [`VaultConnector`] opens a client offering both
//! for one vault namespace and one KMS provider configuration.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::CellarError, kms::KmsProviders, schema::Algorithm, tenant::ProviderName,
    value::EncryptedValue,
};

/// Raw key document as returned by a vault lookup.
pub type KeyDocument = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const KEY_ALT_NAMES_FIELD: &str = "keyAltNames";

/// BSON binary subtype used for UUIDs.
const UUID_SUBTYPE: &str = "04";

/// Failures reported by vault/engine collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("vault unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("vault operation timed out")]
    TimedOut,
    #[error("malformed key document: {reason}")]
    MalformedDocument { reason: String },
    #[error("a key with alt name '{alt_name}' already exists")]
    DuplicateAltName { alt_name: String },
    #[error("no KMS provider configured for '{provider}'")]
    UnknownProvider { provider: String },
    #[error("key {key_id} not found in vault")]
    KeyNotFound { key_id: DekId },
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },
}

/// 128-bit DEK identifier (the key document's `_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DekId(Uuid);

impl DekId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Extended-JSON binary form: `{"$binary": {"base64": .., "subType": "04"}}`.
    pub fn to_extended_json(&self) -> Value {
        json!({
            "$binary": {
                "base64": STANDARD.encode(self.as_bytes()),
                "subType": UUID_SUBTYPE,
            }
        })
    }

    /// Accepts the extended-JSON binary form or a hyphenated UUID string.
    pub fn from_extended_json(value: &Value) -> Result<Self, VaultError> {
        if let Some(text) = value.as_str() {
            return Uuid::parse_str(text)
                .map(Self)
                .map_err(|e| malformed(format!("invalid uuid string: {e}")));
        }

        let binary = value
            .get("$binary")
            .ok_or_else(|| malformed("_id is not a binary value"))?;
        let subtype = binary.get("subType").and_then(Value::as_str);
        if subtype != Some(UUID_SUBTYPE) {
            return Err(malformed(format!(
                "_id has binary subtype {subtype:?}, expected {UUID_SUBTYPE}"
            )));
        }
        let encoded = binary
            .get("base64")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("_id binary has no base64 payload"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| malformed(format!("_id payload: {e}")))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| malformed(format!("_id is {} bytes, expected 16", b.len())))?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for DekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DekId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| malformed(format!("invalid key id: {e}")))
    }
}

/// Pulls the DEK identifier out of a looked-up key document.
pub fn decode_key_id(doc: &KeyDocument) -> Result<DekId, VaultError> {
    let id = doc
        .get(ID_FIELD)
        .ok_or_else(|| malformed("key document missing _id field"))?;
    DekId::from_extended_json(id)
}

fn malformed(reason: impl Into<String>) -> VaultError {
    VaultError::MalformedDocument {
        reason: reason.into(),
    }
}

/// Location of the key vault collection, `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VaultNamespace {
    database: String,
    collection: String,
}

impl VaultNamespace {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl FromStr for VaultNamespace {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, collection))
                if !database.is_empty()
                    && !collection.is_empty()
                    && !database.contains(['/', '\\', '\0'])
                    && !collection.contains(['/', '\\', '\0']) =>
            {
                Ok(Self {
                    database: database.to_string(),
                    collection: collection.to_string(),
                })
            }
            _ => Err(CellarError::config(
                "vault_namespace",
                format!("expected `database.collection`, got '{s}'"),
            )),
        }
    }
}

impl TryFrom<String> for VaultNamespace {
    type Error = CellarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VaultNamespace> for String {
    fn from(value: VaultNamespace) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VaultNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Find, register and remove DEKs by alternate name.
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// `Ok(None)` is the one recognised not-found outcome; anything else that
    /// goes wrong must be an `Err`.
    async fn find_key_by_alt_name(&self, alt_name: &str)
        -> Result<Option<KeyDocument>, VaultError>;

    /// Generates a DEK, wraps it under `provider`'s master key and stores it
    /// with the given alternate names. Alternate names are unique vault-wide.
    async fn create_data_key(
        &self,
        provider: &ProviderName,
        alt_names: &[String],
    ) -> Result<DekId, VaultError>;

    /// Deletes the key registered under `alt_name`; returns whether one existed.
    async fn delete_key_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError>;
}

/// Explicit encryption of single values under a vault-held DEK.
#[async_trait]
pub trait ExplicitEncryption: Send + Sync {
    async fn encrypt(
        &self,
        key_id: DekId,
        algorithm: Algorithm,
        value: &Value,
    ) -> Result<EncryptedValue, VaultError>;

    /// Resolves the DEK named in the value's header and decrypts it.
    async fn decrypt(&self, value: &EncryptedValue) -> Result<Value, VaultError>;
}

/// Opens vault clients. Each call is a fresh client bound to one namespace
/// and one KMS configuration.
#[async_trait]
pub trait VaultConnector: Send + Sync {
    type Client: KeyVault + ExplicitEncryption;

    async fn connect(
        &self,
        namespace: &VaultNamespace,
        kms: &KmsProviders,
    ) -> Result<Self::Client, VaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn dek_id_extended_json_round_trip() {
        let id = DekId::new_random();
        let doc = id.to_extended_json();
        assert_eq!(doc["$binary"]["subType"], "04");
        assert_eq!(DekId::from_extended_json(&doc).expect("decode"), id);
        assert_eq!(
            DekId::from_extended_json(&Value::String(id.to_string())).expect("decode"),
            id
        );
    }

    #[test]
    fn decode_key_id_rejects_missing_or_wrong_id() {
        let mut doc = KeyDocument::new();
        assert!(matches!(
            decode_key_id(&doc),
            Err(VaultError::MalformedDocument { .. })
        ));

        doc.insert(ID_FIELD.into(), json!(42));
        assert!(decode_key_id(&doc).is_err());

        doc.insert(
            ID_FIELD.into(),
            json!({"$binary": {"base64": STANDARD.encode([0u8; 16]), "subType": "00"}}),
        );
        assert!(decode_key_id(&doc).is_err());

        doc.insert(
            ID_FIELD.into(),
            json!({"$binary": {"base64": STANDARD.encode([0u8; 4]), "subType": "04"}}),
        );
        assert!(decode_key_id(&doc).is_err());
    }

    #[test]
    fn namespace_parses_database_and_collection() {
        let ns: VaultNamespace = "csfle_keyvault.datakeys".parse().expect("parse");
        assert_eq!(ns.database(), "csfle_keyvault");
        assert_eq!(ns.collection(), "datakeys");
        assert_eq!(ns.to_string(), "csfle_keyvault.datakeys");
    }

    #[test]
    fn namespace_rejects_malformed_input() {
        for bad in ["datakeys", ".datakeys", "keyvault.", "a/b.c", ""] {
            let err = bad.parse::<VaultNamespace>().expect_err("should fail");
            assert_eq!(err.kind(), ErrorKind::Config, "input {bad:?}");
        }
    }
}
