use std::time::Duration;

use cellar_core::{config::EncryptionConfig, context::CallContext, registry::DekRegistry};
use cellar_storage::{FileMasterKeyStore, LocalConnector};
use color_eyre::Result;
use tracing::debug;

use crate::config::Config;

pub type Registry = DekRegistry<FileMasterKeyStore, LocalConnector>;

/// Everything a command needs, built once from configuration.
pub struct App {
    pub settings: EncryptionConfig,
    pub key_store: FileMasterKeyStore,
    pub registry: Registry,
    /// One deadline for every vault call the command makes.
    pub ctx: CallContext,
}

impl App {
    /// `timeout_secs` from the command line wins over the config file.
    pub fn from_config(config: &Config, timeout_secs: Option<u64>) -> Result<Self> {
        let settings = config.encryption()?;
        let connector = LocalConnector::from_endpoint(settings.endpoint())?;
        let ctx = call_context(timeout_secs.or(config.timeout_secs));
        debug!(
            endpoint = settings.endpoint(),
            key_dir = %settings.key_dir().display(),
            namespace = %settings.vault_namespace(),
            "initializing key lifecycle"
        );
        Ok(Self::new(settings, connector, ctx))
    }

    pub fn new(settings: EncryptionConfig, connector: LocalConnector, ctx: CallContext) -> Self {
        let key_store = FileMasterKeyStore::new(settings.key_dir());
        Self {
            registry: DekRegistry::new(key_store.clone(), connector),
            key_store,
            settings,
            ctx,
        }
    }

    pub fn connector(&self) -> &LocalConnector {
        self.registry.connector()
    }
}

fn call_context(timeout_secs: Option<u64>) -> CallContext {
    match timeout_secs {
        Some(secs) => CallContext::with_timeout(Duration::from_secs(secs)),
        None => CallContext::background(),
    }
}

/// App over an in-memory vault with master keys under `key_dir`.
#[cfg(test)]
pub fn test_app(key_dir: &std::path::Path) -> App {
    let settings = EncryptionConfig::new(
        Some("memory://".into()),
        None,
        Some(key_dir.to_path_buf()),
    )
    .expect("test settings");
    App::new(settings, LocalConnector::in_memory(), CallContext::background())
}
