//! Lookup-or-create registration of per-tenant DEKs.

use tracing::{debug, info, instrument};

use crate::{
    context::CallContext,
    error::CellarError,
    kms::KmsProviders,
    master_key::MasterKeyStore,
    tenant::ProviderName,
    vault::{decode_key_id, DekId, KeyVault, VaultConnector, VaultNamespace},
};

/// Ties a tenant's master key to its DEK in the vault.
pub struct DekRegistry<S, C> {
    master_keys: S,
    connector: C,
}

impl<S: MasterKeyStore, C: VaultConnector> DekRegistry<S, C> {
    pub fn new(master_keys: S, connector: C) -> Self {
        Self {
            master_keys,
            connector,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// KMS configuration for one provider, backed by its (possibly new) master key.
    pub fn kms_providers_for(&self, provider: &ProviderName) -> Result<KmsProviders, CellarError> {
        let key = self.master_keys.load_or_create(provider)?;
        debug!(%provider, fingerprint = %key.fingerprint(), "master key ready");
        Ok(KmsProviders::local(provider.clone(), key))
    }

    /// Returns the provider's DEK id, registering a new DEK only when the vault
    /// positively reports that none exists under the provider's alt name.
    #[instrument(skip_all, fields(%provider, %namespace))]
    pub async fn get_or_create_dek(
        &self,
        provider: &ProviderName,
        namespace: &VaultNamespace,
        ctx: &CallContext,
    ) -> Result<(DekId, KmsProviders), CellarError> {
        let kms = self.kms_providers_for(provider)?;
        let alt_name = provider.dek_alt_name();

        let lookup_error = |source| CellarError::VaultLookup {
            alt_name: alt_name.clone(),
            source,
        };
        let client = ctx
            .run(self.connector.connect(namespace, &kms))
            .await
            .map_err(lookup_error)?;
        let found = ctx
            .run(client.find_key_by_alt_name(&alt_name))
            .await
            .map_err(lookup_error)?;

        if let Some(doc) = found {
            let id = decode_key_id(&doc).map_err(lookup_error)?;
            info!(%alt_name, key_id = %id, "found existing DEK");
            return Ok((id, kms));
        }

        info!(%alt_name, "DEK not found, creating a new one");
        let id = ctx
            .run(client.create_data_key(provider, std::slice::from_ref(&alt_name)))
            .await
            .map_err(|source| CellarError::VaultCreate {
                alt_name: alt_name.clone(),
                source,
            })?;
        info!(%alt_name, key_id = %id, "created DEK");
        Ok((id, kms))
    }

    /// Deletes the provider's DEK. Returns `false` if there was none.
    ///
    /// Every value encrypted under the removed DEK becomes undecryptable.
    #[instrument(skip_all, fields(%provider, %namespace))]
    pub async fn remove_dek(
        &self,
        provider: &ProviderName,
        namespace: &VaultNamespace,
        ctx: &CallContext,
    ) -> Result<bool, CellarError> {
        let kms = self.kms_providers_for(provider)?;
        let alt_name = provider.dek_alt_name();
        let remove_error = |source| CellarError::VaultRemove {
            alt_name: alt_name.clone(),
            source,
        };
        let client = ctx
            .run(self.connector.connect(namespace, &kms))
            .await
            .map_err(remove_error)?;
        let removed = ctx
            .run(client.delete_key_by_alt_name(&alt_name))
            .await
            .map_err(remove_error)?;
        info!(%alt_name, removed, "DEK removal finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::ErrorKind,
        master_key::InMemoryMasterKeyStore,
        tenant::resolve_provider,
        testing::FakeConnector,
        vault::VaultError,
    };

    fn fixture() -> (
        DekRegistry<InMemoryMasterKeyStore, FakeConnector>,
        FakeConnector,
        ProviderName,
        VaultNamespace,
    ) {
        let connector = FakeConnector::default();
        let registry = DekRegistry::new(InMemoryMasterKeyStore::new(), connector.clone());
        let provider = resolve_provider("don:identity:dvrv-us-1:devo/10").expect("resolve");
        let namespace = "csfle_keyvault.datakeys".parse().expect("namespace");
        (registry, connector, provider, namespace)
    }

    #[tokio::test]
    async fn creates_then_reuses_same_dek() {
        let (registry, connector, provider, ns) = fixture();
        let ctx = CallContext::background();

        let (first, kms_first) = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("first");
        let (second, kms_second) = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("second");

        assert_eq!(first, second);
        assert_eq!(kms_first, kms_second);
        assert!(kms_first.key_for(&provider).is_some());
        assert_eq!(connector.state().creates, 1);
        assert_eq!(connector.state().keys[0].alt_names, vec!["dek-local:10"]);
    }

    #[tokio::test]
    async fn tenants_get_separate_deks() {
        let (registry, connector, provider, ns) = fixture();
        let other = resolve_provider("don:identity:dvrv-us-1:devo/11").expect("resolve");
        let ctx = CallContext::background();

        let (a, kms_a) = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("a");
        let (b, kms_b) = registry
            .get_or_create_dek(&other, &ns, &ctx)
            .await
            .expect("b");

        assert_ne!(a, b);
        assert!(kms_a.key_for(&other).is_none());
        assert!(kms_b.key_for(&provider).is_none());
        assert_eq!(connector.state().keys.len(), 2);
    }

    #[tokio::test]
    async fn lookup_failure_never_falls_through_to_create() {
        let (registry, connector, provider, ns) = fixture();
        connector.state().lookup_failure = Some(VaultError::Unavailable {
            reason: "connection reset".into(),
        });

        let err = registry
            .get_or_create_dek(&provider, &ns, &CallContext::background())
            .await
            .expect_err("lookup should fail");

        assert_eq!(err.kind(), ErrorKind::VaultLookup);
        assert_eq!(connector.state().creates, 0);
    }

    #[tokio::test]
    async fn undecodable_document_is_a_lookup_error() {
        let (registry, connector, provider, ns) = fixture();
        let ctx = CallContext::background();
        registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("create");
        connector.state().corrupt_ids = true;

        let err = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect_err("decode should fail");

        assert_eq!(err.kind(), ErrorKind::VaultLookup);
        assert_eq!(connector.state().creates, 1);
    }

    #[tokio::test]
    async fn create_failure_is_reported_as_create_error() {
        let (registry, connector, provider, ns) = fixture();
        connector.state().create_failure = Some(VaultError::DuplicateAltName {
            alt_name: provider.dek_alt_name(),
        });

        let err = registry
            .get_or_create_dek(&provider, &ns, &CallContext::background())
            .await
            .expect_err("create should fail");

        assert_eq!(err.kind(), ErrorKind::VaultCreate);
        assert!(matches!(
            err,
            CellarError::VaultCreate {
                source: VaultError::DuplicateAltName { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_lookup_honours_deadline() {
        let (registry, connector, provider, ns) = fixture();
        connector.state().delay = Some(Duration::from_secs(5));

        let err = registry
            .get_or_create_dek(
                &provider,
                &ns,
                &CallContext::with_timeout(Duration::from_millis(20)),
            )
            .await
            .expect_err("should time out");

        assert!(matches!(
            err,
            CellarError::VaultLookup {
                source: VaultError::TimedOut,
                ..
            }
        ));
        assert_eq!(connector.state().creates, 0);
    }

    #[tokio::test]
    async fn remove_dek_reports_whether_one_existed() {
        let (registry, _connector, provider, ns) = fixture();
        let ctx = CallContext::background();
        let (first, _) = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("create");

        assert!(registry.remove_dek(&provider, &ns, &ctx).await.expect("remove"));
        assert!(!registry.remove_dek(&provider, &ns, &ctx).await.expect("remove again"));

        let (second, _) = registry
            .get_or_create_dek(&provider, &ns, &ctx)
            .await
            .expect("recreate");
        assert_ne!(first, second);
    }
}
