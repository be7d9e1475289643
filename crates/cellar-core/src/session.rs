//! Parameters for opening an encryption-capable storage session, and one-off
//! explicit decryption.
//!
//! Callers are expected to open one session per tenant, so a compromised or
//! misconfigured KMS entry only ever affects that tenant's resource pool.
//! Nothing here enforces it.

use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::{
    context::CallContext,
    error::CellarError,
    kms::KmsProviders,
    schema::{EncryptedFieldsMap, SchemaMap},
    value::EncryptedValue,
    vault::{ExplicitEncryption, VaultConnector, VaultNamespace},
};

/// Everything the collaborator needs to open an auto-encrypting session.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionSessionParams {
    pub vault_namespace: VaultNamespace,
    pub kms_providers: KmsProviders,
    pub schema_map: SchemaMap,
    /// Queryable-encryption field definitions, when the session creates such collections.
    pub encrypted_fields_map: Option<EncryptedFieldsMap>,
    /// When set the session performs no automatic field encryption; the caller
    /// encrypts explicitly. Automatic decryption still applies.
    pub bypass_auto_encryption: bool,
}

/// Pure assembly of session parameters; performs no I/O.
pub fn build_session_params(
    vault_namespace: &VaultNamespace,
    schema_map: SchemaMap,
    kms_providers: KmsProviders,
    bypass_auto_encryption: bool,
) -> EncryptionSessionParams {
    EncryptionSessionParams {
        vault_namespace: vault_namespace.clone(),
        kms_providers,
        schema_map,
        encrypted_fields_map: None,
        bypass_auto_encryption,
    }
}

impl EncryptionSessionParams {
    pub fn with_encrypted_fields(mut self, fields: EncryptedFieldsMap) -> Self {
        self.encrypted_fields_map = Some(fields);
        self
    }

    /// Collaborator-facing options document. Contains raw key material.
    pub fn auto_encryption_options(&self) -> Value {
        let mut doc = json!({
            "keyVaultNamespace": self.vault_namespace.to_string(),
            "kmsProviders": self.kms_providers.to_document(),
            "schemaMap": self.schema_map.to_document(),
            "bypassAutoEncryption": self.bypass_auto_encryption,
        });
        if let Some(fields) = &self.encrypted_fields_map {
            doc["encryptedFieldsMap"] = fields.to_document();
        }
        doc
    }
}

impl fmt::Debug for EncryptionSessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<String> = self
            .kms_providers
            .provider_names()
            .map(ToString::to_string)
            .collect();
        f.debug_struct("EncryptionSessionParams")
            .field("vault_namespace", &self.vault_namespace.to_string())
            .field("kms_providers", &providers)
            .field("encrypted_fields", &self.schema_map.len())
            .field("encrypted_fields_map", &self.encrypted_fields_map.is_some())
            .field("bypass_auto_encryption", &self.bypass_auto_encryption)
            .finish()
    }
}

/// Decrypts a single value using only the DEK reference in its header.
///
/// Empty or malformed input is rejected before any connection is made.
#[instrument(skip_all, fields(%namespace))]
pub async fn decrypt_opaque_value<C: VaultConnector>(
    connector: &C,
    namespace: &VaultNamespace,
    kms: &KmsProviders,
    value: &EncryptedValue,
    ctx: &CallContext,
) -> Result<Value, CellarError> {
    let header = value.header()?;
    debug!(key_id = %header.key_id, algorithm = header.algorithm.as_str(), "decrypting value");

    let client = ctx
        .run(connector.connect(namespace, kms))
        .await
        .map_err(|source| CellarError::Decrypt {
            reason: "could not open key vault".into(),
            source: Some(source),
        })?;
    ctx.run(client.decrypt(value))
        .await
        .map_err(|source| CellarError::Decrypt {
            reason: format!("could not decrypt value under key {}", header.key_id),
            source: Some(source),
        })
}
