use std::path::PathBuf;

use cellar_core::{
    schema::{
        Algorithm, DataType, EncryptedField, EncryptedFieldsMap, EncryptionDescriptor, FieldPath,
        QueryType, SchemaMap,
    },
    session::{build_session_params, decrypt_opaque_value},
    tenant::{resolve_provider, ProviderName},
    value::EncryptedValue,
    vault::{DekId, ExplicitEncryption, VaultConnector},
};
use cellar_storage::LocalSession;
use color_eyre::{eyre::eyre, Result};
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use tracing::info;

use crate::bootstrap::App;

const USERS_NAMESPACE: &str = "csfle_db.users";
const QUERYABLE_USERS_NAMESPACE: &str = "qe_db.users";
const REDACTED: &str = "<redacted>";

pub struct MasterKeyInfo {
    pub provider: ProviderName,
    pub path: PathBuf,
    pub fingerprint: String,
}

pub fn master_key(app: &App, tenant: &str) -> Result<MasterKeyInfo> {
    let provider = resolve_provider(tenant)?;
    let kms = app.registry.kms_providers_for(&provider)?;
    let key = kms
        .key_for(&provider)
        .ok_or_else(|| eyre!("no master key loaded for {provider}"))?;
    Ok(MasterKeyInfo {
        path: app.key_store.path_for(&provider),
        fingerprint: key.fingerprint(),
        provider,
    })
}

pub async fn ensure_dek(app: &App, tenant: &str) -> Result<(ProviderName, DekId)> {
    let provider = resolve_provider(tenant)?;
    let (key_id, _) = app
        .registry
        .get_or_create_dek(&provider, app.settings.vault_namespace(), &app.ctx)
        .await?;
    Ok((provider, key_id))
}

pub async fn remove_dek(app: &App, tenant: &str) -> Result<(ProviderName, bool)> {
    let provider = resolve_provider(tenant)?;
    let removed = app
        .registry
        .remove_dek(&provider, app.settings.vault_namespace(), &app.ctx)
        .await?;
    Ok((provider, removed))
}

/// Auto-encryption options for one field under the tenant's DEK, plus the
/// queryable users collection when `queryable` is set. Master keys are
/// redacted unless `show_keys` is set.
pub async fn schema(
    app: &App,
    tenant: &str,
    field: &str,
    bson_type: &str,
    algorithm: &str,
    show_keys: bool,
    queryable: bool,
) -> Result<Value> {
    let path: FieldPath = field.parse()?;
    let data_type: DataType = bson_type.parse()?;
    let algorithm: Algorithm = algorithm.parse()?;

    let provider = resolve_provider(tenant)?;
    let namespace = app.settings.vault_namespace();
    let (key_id, kms) = app
        .registry
        .get_or_create_dek(&provider, namespace, &app.ctx)
        .await?;
    let descriptor = EncryptionDescriptor {
        data_type,
        algorithm,
        key_ids: vec![key_id],
    };
    let mut params =
        build_session_params(namespace, SchemaMap::single(path, descriptor)?, kms, false);
    if queryable {
        params = params.with_encrypted_fields(queryable_users(key_id)?);
    }

    let mut options = params.auto_encryption_options();
    if !show_keys {
        redact_keys(&mut options["kmsProviders"]);
    }
    Ok(options)
}

/// `qe_db.users`: `ssn` matched by equality, `age` by range, `email` stored only.
fn queryable_users(key_id: DekId) -> Result<EncryptedFieldsMap> {
    let mut fields = EncryptedFieldsMap::new();
    for (path, data_type, queries) in [
        ("ssn", DataType::String, vec![QueryType::Equality]),
        ("age", DataType::Int, vec![QueryType::Range { min: 0, max: 120 }]),
        ("email", DataType::String, vec![]),
    ] {
        fields.add(
            QUERYABLE_USERS_NAMESPACE,
            EncryptedField {
                path: path.to_string(),
                data_type,
                key_id: Some(key_id),
                queries,
            },
        )?;
    }
    Ok(fields)
}

fn redact_keys(providers: &mut Value) {
    if let Some(providers) = providers.as_object_mut() {
        for provider in providers.values_mut() {
            provider["key"] = json!(REDACTED);
        }
    }
}

/// Encrypts `raw` (JSON, or else a plain string) and returns the value as base64.
pub async fn encrypt(app: &App, tenant: &str, raw: &str, algorithm: &str) -> Result<String> {
    let algorithm: Algorithm = algorithm.parse()?;
    let value = parse_value(raw);
    let provider = resolve_provider(tenant)?;
    let namespace = app.settings.vault_namespace();
    let (key_id, kms) = app
        .registry
        .get_or_create_dek(&provider, namespace, &app.ctx)
        .await?;

    let client = app.ctx.run(app.connector().connect(namespace, &kms)).await?;
    let encrypted = app
        .ctx
        .run(client.encrypt(key_id, algorithm, &value))
        .await?;
    Ok(encrypted.to_base64())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn decrypt(app: &App, tenant: &str, encoded: &str) -> Result<Value> {
    let value = EncryptedValue::from_base64(encoded)?;
    let provider = resolve_provider(tenant)?;
    let kms = app.registry.kms_providers_for(&provider)?;
    let plain = decrypt_opaque_value(
        app.connector(),
        app.settings.vault_namespace(),
        &kms,
        &value,
        &app.ctx,
    )
    .await?;
    Ok(plain)
}

/// Outcome of the end-to-end flow, one entry per step.
#[derive(Debug)]
pub struct DemoReport {
    pub provider: ProviderName,
    pub key_id: DekId,
    /// The user document as the store holds it.
    pub stored: Value,
    /// Equality lookup on the encrypted field through the schema-aware session.
    pub by_ssn: Option<Value>,
    /// Encrypted field decrypted explicitly, as a downstream reader would.
    pub explicit_ssn: Value,
    /// Same document read through a session without a schema map.
    pub schemaless_read: Value,
    /// Whether a plaintext filter on the encrypted field matched without a schema.
    pub schemaless_ssn_matched: bool,
}

/// Writes a user with an encrypted SSN into an in-process collection, then
/// reads it back every way a client could.
pub async fn demo(app: &App, tenant: &str) -> Result<DemoReport> {
    let provider = resolve_provider(tenant)?;
    let namespace = app.settings.vault_namespace();
    let (key_id, kms) = app
        .registry
        .get_or_create_dek(&provider, namespace, &app.ctx)
        .await?;
    info!(%provider, %key_id, "DEK ready for tenant");

    let schema = SchemaMap::single(
        format!("{USERS_NAMESPACE}.ssn").parse()?,
        EncryptionDescriptor::deterministic(DataType::String, key_id),
    )?;
    let session = LocalSession::open(
        app.connector(),
        build_session_params(namespace, schema, kms.clone(), false),
        &app.ctx,
    )
    .await?;

    let ssn = random_ssn();
    let email = format!("{ssn}@example.com");
    let user = session
        .encrypt_document(
            USERS_NAMESPACE,
            json!({ "name": "Bob", "email": email, "ssn": ssn }),
        )
        .await?;
    let users = vec![user];

    let filter = session
        .encrypt_filter(USERS_NAMESPACE, json!({ "ssn": ssn }))
        .await?;
    let by_ssn = match find_one(&users, &filter) {
        Some(doc) => Some(session.decrypt_document(doc.clone()).await?),
        None => None,
    };

    let stored = find_one(&users, &json!({ "email": email }))
        .cloned()
        .ok_or_else(|| eyre!("user {email} was not stored"))?;
    let encrypted_ssn = EncryptedValue::from_extended_json(&stored["ssn"])
        .ok_or_else(|| eyre!("stored ssn is not an encrypted value"))?;
    let explicit_ssn =
        decrypt_opaque_value(app.connector(), namespace, &kms, &encrypted_ssn, &app.ctx).await?;

    let schemaless = LocalSession::open(
        app.connector(),
        build_session_params(namespace, SchemaMap::new(), kms, false),
        &app.ctx,
    )
    .await?;
    let schemaless_read = schemaless.decrypt_document(stored.clone()).await?;
    let plain_filter = schemaless
        .encrypt_filter(USERS_NAMESPACE, json!({ "ssn": ssn }))
        .await?;
    let schemaless_ssn_matched = find_one(&users, &plain_filter).is_some();

    Ok(DemoReport {
        provider,
        key_id,
        stored,
        by_ssn,
        explicit_ssn,
        schemaless_read,
        schemaless_ssn_matched,
    })
}

/// First document whose top-level fields equal every field of `filter`.
fn find_one<'a>(docs: &'a [Value], filter: &Value) -> Option<&'a Value> {
    let conditions = filter.as_object()?;
    docs.iter()
        .find(|doc| conditions.iter().all(|(field, want)| doc.get(field) == Some(want)))
}

/// Random well-formed SSN: area 100-999, group 10-99, serial 0000-9999.
fn random_ssn() -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    let area = 100 + u32::from(bytes[0]) % 900;
    let group = 10 + u32::from(bytes[1]) % 90;
    let serial = u32::from(bytes[2]) % 10_000;
    format!("{area:03}-{group:02}-{serial:04}")
}

#[cfg(test)]
mod tests {
    use cellar_core::error::{CellarError, ErrorKind};

    use super::*;
    use crate::bootstrap::test_app;

    const TENANT: &str = "don:identity:dvrv-us-1:devo/10";

    #[tokio::test]
    async fn dek_ensure_is_idempotent_and_remove_reports_presence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());

        let (provider, first) = ensure_dek(&app, TENANT).await.expect("ensure");
        let (_, second) = ensure_dek(&app, TENANT).await.expect("ensure again");
        assert_eq!(provider.as_str(), "local:10");
        assert_eq!(first, second);

        assert!(remove_dek(&app, TENANT).await.expect("remove").1);
        assert!(!remove_dek(&app, TENANT).await.expect("remove again").1);
        let (_, third) = ensure_dek(&app, TENANT).await.expect("recreate");
        assert_ne!(first, third);
    }

    #[test]
    fn master_key_reports_file_and_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());
        let info = master_key(&app, TENANT).expect("master key");
        assert!(info.path.exists());
        assert_eq!(info.fingerprint.len(), 16);
        assert_eq!(
            master_key(&app, TENANT).expect("again").fingerprint,
            info.fingerprint
        );
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_from_cli_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());

        let encoded = encrypt(&app, TENANT, "987-65-4320", "deterministic")
            .await
            .expect("encrypt");
        assert_eq!(
            encrypt(&app, TENANT, "987-65-4320", "deterministic")
                .await
                .expect("again"),
            encoded
        );
        assert_eq!(
            decrypt(&app, TENANT, &encoded).await.expect("decrypt"),
            json!("987-65-4320")
        );

        let age = encrypt(&app, TENANT, "30", "random").await.expect("encrypt");
        assert_eq!(decrypt(&app, TENANT, &age).await.expect("decrypt"), json!(30));
    }

    #[tokio::test]
    async fn decrypt_rejects_empty_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());
        let err = decrypt(&app, TENANT, "").await.expect_err("empty");
        let err = err.downcast::<CellarError>().expect("cellar error");
        assert_eq!(err.kind(), ErrorKind::Decrypt);
    }

    #[tokio::test]
    async fn schema_output_hides_keys_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());

        let options = schema(&app, TENANT, "csfle_db.users.ssn", "string", "deterministic", false, false)
            .await
            .expect("schema");
        assert_eq!(options["kmsProviders"]["local:10"]["key"], REDACTED);
        assert!(options.get("encryptedFieldsMap").is_none());
        assert_eq!(
            options["schemaMap"]["csfle_db.users"]["properties"]["ssn"]["encrypt"]["bsonType"],
            "string"
        );

        let options = schema(&app, TENANT, "csfle_db.users.ssn", "string", "deterministic", true, false)
            .await
            .expect("schema");
        assert_ne!(options["kmsProviders"]["local:10"]["key"], REDACTED);

        let err = schema(&app, TENANT, "csfle_db.users.ssn", "bool", "deterministic", false, false)
            .await
            .expect_err("bool cannot be deterministic");
        let err = err.downcast::<CellarError>().expect("cellar error");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn queryable_schema_declares_users_fields_under_the_tenant_dek() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());
        let (_, key_id) = ensure_dek(&app, TENANT).await.expect("dek");

        let options = schema(&app, TENANT, "csfle_db.users.ssn", "string", "deterministic", false, true)
            .await
            .expect("schema");
        let fields = options["encryptedFieldsMap"]["qe_db.users"]["fields"]
            .as_array()
            .expect("fields");
        let paths: Vec<_> = fields.iter().map(|f| f["path"].as_str().expect("path")).collect();
        assert_eq!(paths, ["ssn", "age", "email"]);
        assert!(fields.iter().all(|f| f["keyId"] == key_id.to_extended_json()));
        assert_eq!(fields[0]["queries"][0]["queryType"], "equality");
        assert_eq!(fields[1]["queries"][0]["queryType"], "range");
        assert_eq!(fields[1]["queries"][0]["max"], 120);
        assert!(fields[2].get("queries").is_none());
        assert_eq!(options["kmsProviders"]["local:10"]["key"], REDACTED);
    }

    #[tokio::test]
    async fn demo_walks_the_whole_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path());

        let report = demo(&app, TENANT).await.expect("demo");
        let ssn = report.explicit_ssn.as_str().expect("ssn").to_string();

        assert!(EncryptedValue::from_extended_json(&report.stored["ssn"]).is_some());
        assert_eq!(report.stored["name"], "Bob");
        assert_eq!(
            report.by_ssn.as_ref().expect("found by ssn")["ssn"],
            json!(ssn)
        );
        assert_eq!(report.schemaless_read["ssn"], json!(ssn));
        assert!(!report.schemaless_ssn_matched);

        let again = demo(&app, TENANT).await.expect("demo again");
        assert_eq!(again.key_id, report.key_id);
    }

    #[test]
    fn random_ssns_are_well_formed() {
        for _ in 0..32 {
            let ssn = random_ssn();
            let parts: Vec<&str> = ssn.split('-').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!((parts[0].len(), parts[1].len(), parts[2].len()), (3, 2, 4));
            assert!(parts[0].parse::<u32>().expect("area") >= 100);
        }
    }

    #[test]
    fn non_json_input_is_a_string() {
        assert_eq!(parse_value("987-65-4320"), json!("987-65-4320"));
        assert_eq!(parse_value("30"), json!(30));
        assert_eq!(parse_value("\"30\""), json!("30"));
    }
}
