//! Auto-encrypting session over the local vault.
//!
//! Writes are encrypted field by field according to the session's schema map
//! and queryable-encryption field map; reads decrypt every encrypted value
//! found, whether or not either map names it.

use cellar_core::{
    context::CallContext,
    schema::{Algorithm, DataType, EncryptionDescriptor},
    session::EncryptionSessionParams,
    value::EncryptedValue,
    vault::{ExplicitEncryption, VaultConnector, VaultError},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::local_vault::{LocalConnector, LocalVaultClient};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("expected a JSON object document")]
    NotDocument,
    #[error("field '{field}' is declared {expected} but holds {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field '{field}' is randomly encrypted and cannot be matched by equality")]
    NotQueryable { field: String },
    #[error("queryable field '{field}' has no data key")]
    NoKey { field: String },
    #[error("field '{field}': {source}")]
    Field {
        field: String,
        #[source]
        source: VaultError,
    },
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// One tenant's view of the store: its KMS configuration, schema and vault client.
pub struct LocalSession {
    params: EncryptionSessionParams,
    client: LocalVaultClient,
}

impl LocalSession {
    #[instrument(skip_all, fields(namespace = %params.vault_namespace))]
    pub async fn open(
        connector: &LocalConnector,
        params: EncryptionSessionParams,
        ctx: &CallContext,
    ) -> Result<Self, SessionError> {
        if let Some((namespace, field)) = params
            .encrypted_fields_map
            .iter()
            .flat_map(|map| map.iter())
            .find(|(_, field)| field.key_id.is_none())
        {
            return Err(SessionError::NoKey {
                field: format!("{namespace}.{}", field.path),
            });
        }
        let client = ctx
            .run(connector.connect(&params.vault_namespace, &params.kms_providers))
            .await?;
        debug!(
            fields = params.schema_map.len(),
            queryable = params.encrypted_fields_map.is_some(),
            bypass = params.bypass_auto_encryption,
            "opened session"
        );
        Ok(Self { params, client })
    }

    pub fn params(&self) -> &EncryptionSessionParams {
        &self.params
    }

    /// For explicit encryption when auto encryption is bypassed.
    pub fn client(&self) -> &LocalVaultClient {
        &self.client
    }

    /// Encrypts the declared fields of `namespace` present in `doc`. Absent or
    /// null fields and values that are already encrypted are left alone.
    pub async fn encrypt_document(
        &self,
        namespace: &str,
        mut doc: Value,
    ) -> Result<Value, SessionError> {
        if !doc.is_object() {
            return Err(SessionError::NotDocument);
        }
        if self.params.bypass_auto_encryption {
            return Ok(doc);
        }
        for (field, descriptor) in self.declared_fields(namespace) {
            let Some(slot) = doc.pointer_mut(&json_pointer(&field)) else {
                continue;
            };
            if slot.is_null() || EncryptedValue::from_extended_json(slot).is_some() {
                continue;
            }
            *slot = self.encrypt_field(&field, &descriptor, slot).await?;
        }
        Ok(doc)
    }

    /// Encrypts equality operands in a filter keyed by dotted field paths.
    /// Only deterministically encrypted fields can be matched this way, which
    /// for queryable fields means those declaring equality queries.
    pub async fn encrypt_filter(
        &self,
        namespace: &str,
        mut filter: Value,
    ) -> Result<Value, SessionError> {
        let Some(conditions) = filter.as_object_mut() else {
            return Err(SessionError::NotDocument);
        };
        if self.params.bypass_auto_encryption {
            return Ok(filter);
        }
        for (field, descriptor) in self.declared_fields(namespace) {
            let Some(operand) = conditions.get_mut(&field) else {
                continue;
            };
            if descriptor.algorithm != Algorithm::Deterministic {
                return Err(SessionError::NotQueryable { field });
            }
            *operand = self.encrypt_field(&field, &descriptor, operand).await?;
        }
        Ok(filter)
    }

    /// Replaces every encrypted value in `doc` with its plaintext.
    pub async fn decrypt_document(&self, mut doc: Value) -> Result<Value, SessionError> {
        let mut pointers = Vec::new();
        collect_encrypted(&doc, String::new(), &mut pointers);
        for pointer in pointers {
            let Some(slot) = doc.pointer_mut(&pointer) else {
                continue;
            };
            let Some(encrypted) = EncryptedValue::from_extended_json(slot) else {
                continue;
            };
            *slot = self
                .client
                .decrypt(&encrypted)
                .await
                .map_err(|source| SessionError::Field {
                    field: pointer.clone(),
                    source,
                })?;
        }
        Ok(doc)
    }

    /// Schema-map fields followed by queryable fields of `namespace`.
    fn declared_fields(&self, namespace: &str) -> Vec<(String, EncryptionDescriptor)> {
        let mut declared: Vec<_> = self
            .params
            .schema_map
            .fields_in(namespace)
            .map(|(path, descriptor)| (path.field(), descriptor.clone()))
            .collect();
        if let Some(map) = &self.params.encrypted_fields_map {
            declared.extend(map.fields(namespace).iter().filter_map(|field| {
                let key_id = field.key_id?;
                let descriptor = match field.algorithm() {
                    Algorithm::Deterministic => {
                        EncryptionDescriptor::deterministic(field.data_type, key_id)
                    }
                    Algorithm::Random => EncryptionDescriptor::random(field.data_type, key_id),
                };
                Some((field.path.clone(), descriptor))
            }));
        }
        declared
    }

    async fn encrypt_field(
        &self,
        field: &str,
        descriptor: &EncryptionDescriptor,
        value: &Value,
    ) -> Result<Value, SessionError> {
        let found = DataType::of(value);
        if !found.is_some_and(|found| fits(descriptor.data_type, found)) {
            return Err(SessionError::TypeMismatch {
                field: field.to_string(),
                expected: descriptor.data_type.as_str(),
                found: found.map_or("null", |t| t.as_str()),
            });
        }
        let key_id = descriptor.key_ids.first().copied().ok_or_else(|| SessionError::Field {
            field: field.to_string(),
            source: VaultError::MalformedDocument {
                reason: "no key id".into(),
            },
        })?;
        let encrypted = self
            .client
            .encrypt(key_id, descriptor.algorithm, value)
            .await
            .map_err(|source| SessionError::Field {
                field: field.to_string(),
                source,
            })?;
        Ok(encrypted.to_extended_json())
    }
}

/// JSON numbers carry no width, so narrower integers satisfy wider declarations.
fn fits(declared: DataType, found: DataType) -> bool {
    declared == found
        || matches!(
            (declared, found),
            (DataType::Long, DataType::Int) | (DataType::Double, DataType::Int | DataType::Long)
        )
}

fn json_pointer(dotted: &str) -> String {
    dotted
        .split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn collect_encrypted(value: &Value, pointer: String, out: &mut Vec<String>) {
    if EncryptedValue::from_extended_json(value).is_some() {
        out.push(pointer);
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let segment = key.replace('~', "~0").replace('/', "~1");
                collect_encrypted(child, format!("{pointer}/{segment}"), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_encrypted(child, format!("{pointer}/{index}"), out);
            }
        }
        _ => {}
    }
}
