//! Key vault collections: where DEK documents live.

use std::{
    fs::{self, File},
    io::{ErrorKind as IoErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cellar_core::{
    tenant::ProviderName,
    vault::{DekId, KeyDocument, VaultError, ID_FIELD, KEY_ALT_NAMES_FIELD},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::instrument;

/// Wrapping-key reference stored with each DEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRef {
    pub provider: ProviderName,
}

/// A DEK document as persisted in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKey {
    #[serde(rename = "_id")]
    pub id: DekId,
    pub key_alt_names: Vec<String>,
    /// Base64 of the wrapped DEK.
    pub key_material: String,
    pub creation_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
    pub status: i32,
    pub master_key: MasterKeyRef,
}

impl StoredKey {
    pub fn new(provider: ProviderName, alt_names: Vec<String>, wrapped: &[u8]) -> Self {
        let now = Utc::now();
        Self {
            id: DekId::new_random(),
            key_alt_names: alt_names,
            key_material: STANDARD.encode(wrapped),
            creation_date: now,
            update_date: now,
            status: 0,
            master_key: MasterKeyRef { provider },
        }
    }

    pub fn wrapped_key(&self) -> Result<Vec<u8>, VaultError> {
        STANDARD
            .decode(&self.key_material)
            .map_err(|e| VaultError::MalformedDocument {
                reason: format!("keyMaterial of {}: {e}", self.id),
            })
    }

    /// Lookup-result form, with `_id` and `keyMaterial` as extended-JSON binaries.
    pub fn to_document(&self) -> KeyDocument {
        let mut doc = KeyDocument::new();
        doc.insert(ID_FIELD.into(), self.id.to_extended_json());
        doc.insert(KEY_ALT_NAMES_FIELD.into(), json!(self.key_alt_names));
        doc.insert(
            "keyMaterial".into(),
            json!({ "$binary": { "base64": self.key_material, "subType": "00" } }),
        );
        doc.insert(
            "creationDate".into(),
            json!({ "$date": self.creation_date.to_rfc3339() }),
        );
        doc.insert(
            "updateDate".into(),
            json!({ "$date": self.update_date.to_rfc3339() }),
        );
        doc.insert("status".into(), json!(self.status));
        doc.insert(
            "masterKey".into(),
            json!({ "provider": self.master_key.provider }),
        );
        doc
    }
}

/// Storage for DEK documents. Alternate names and ids are unique per collection.
pub trait KeyCollection: Send + Sync {
    fn find_by_alt_name(&self, alt_name: &str) -> Result<Option<StoredKey>, VaultError>;
    fn find_by_id(&self, id: &DekId) -> Result<Option<StoredKey>, VaultError>;
    fn insert(&self, key: StoredKey) -> Result<(), VaultError>;
    fn delete_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError>;
}

fn find_alt<'a>(keys: &'a [StoredKey], alt_name: &str) -> Option<&'a StoredKey> {
    keys.iter()
        .find(|k| k.key_alt_names.iter().any(|n| n == alt_name))
}

fn check_unique(keys: &[StoredKey], key: &StoredKey) -> Result<(), VaultError> {
    if let Some(taken) = key
        .key_alt_names
        .iter()
        .find(|n| find_alt(keys, n).is_some())
    {
        return Err(VaultError::DuplicateAltName {
            alt_name: taken.clone(),
        });
    }
    if keys.iter().any(|k| k.id == key.id) {
        return Err(VaultError::Unavailable {
            reason: format!("duplicate key id {}", key.id),
        });
    }
    Ok(())
}

fn remove_alt(keys: &mut Vec<StoredKey>, alt_name: &str) -> bool {
    let before = keys.len();
    keys.retain(|k| !k.key_alt_names.iter().any(|n| n == alt_name));
    keys.len() != before
}

/// Process-local collection; state is shared between clones.
#[derive(Debug, Default, Clone)]
pub struct MemoryCollection {
    keys: Arc<Mutex<Vec<StoredKey>>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<StoredKey>>, VaultError> {
        self.keys.lock().map_err(|err| VaultError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

impl KeyCollection for MemoryCollection {
    fn find_by_alt_name(&self, alt_name: &str) -> Result<Option<StoredKey>, VaultError> {
        Ok(find_alt(&*self.lock()?, alt_name).cloned())
    }

    fn find_by_id(&self, id: &DekId) -> Result<Option<StoredKey>, VaultError> {
        Ok(self.lock()?.iter().find(|k| &k.id == id).cloned())
    }

    fn insert(&self, key: StoredKey) -> Result<(), VaultError> {
        let mut keys = self.lock()?;
        check_unique(&keys[..], &key)?;
        keys.push(key);
        Ok(())
    }

    fn delete_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError> {
        Ok(remove_alt(&mut *self.lock()?, alt_name))
    }
}

/// One JSON file per collection, rewritten atomically on every change.
///
/// Writers through the same instance are serialised, so callers in one process
/// must share it (see `LocalConnector::directory`). Separate processes sharing
/// the file are not, so the last rewrite wins. Use it for local development only.
#[derive(Debug)]
pub struct FileCollection {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCollection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<StoredKey>, VaultError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(&self.path, err)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| unavailable(&self.path, e))?;
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&buf).map_err(|e| VaultError::MalformedDocument {
            reason: format!("{}: {e}", self.path.display()),
        })
    }

    fn save(&self, keys: &[StoredKey]) -> Result<(), VaultError> {
        let parent = self.path.parent().ok_or_else(|| VaultError::Unavailable {
            reason: "invalid collection path".to_string(),
        })?;
        fs::create_dir_all(parent).map_err(|e| unavailable(parent, e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| unavailable(parent, e))?;
        let json = serde_json::to_vec_pretty(keys).map_err(|e| VaultError::Unavailable {
            reason: e.to_string(),
        })?;
        tmp.write_all(&json)
            .and_then(|_| tmp.flush())
            .map_err(|e| unavailable(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| unavailable(&self.path, e.error))?;
        Ok(())
    }

    fn modify<T>(
        &self,
        change: impl FnOnce(&mut Vec<StoredKey>) -> Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let _guard = self.write_lock.lock().map_err(|err| VaultError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })?;
        let mut keys = self.load()?;
        let out = change(&mut keys)?;
        self.save(&keys)?;
        Ok(out)
    }
}

impl KeyCollection for FileCollection {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn find_by_alt_name(&self, alt_name: &str) -> Result<Option<StoredKey>, VaultError> {
        Ok(find_alt(&self.load()?, alt_name).cloned())
    }

    fn find_by_id(&self, id: &DekId) -> Result<Option<StoredKey>, VaultError> {
        Ok(self.load()?.into_iter().find(|k| &k.id == id))
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn insert(&self, key: StoredKey) -> Result<(), VaultError> {
        self.modify(|keys| {
            check_unique(keys, &key)?;
            keys.push(key);
            Ok(())
        })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn delete_by_alt_name(&self, alt_name: &str) -> Result<bool, VaultError> {
        self.modify(|keys| Ok(remove_alt(keys, alt_name)))
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> VaultError {
    VaultError::Unavailable {
        reason: format!("{}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use cellar_core::{tenant::resolve_provider, vault::decode_key_id};

    use super::*;

    fn key(alt: &str) -> StoredKey {
        StoredKey::new(
            resolve_provider("org/10").expect("resolve"),
            vec![alt.to_string()],
            &[1, 2, 3],
        )
    }

    fn exercise(collection: &dyn KeyCollection) {
        let stored = key("dek-local:10");
        collection.insert(stored.clone()).expect("insert");

        let found = collection
            .find_by_alt_name("dek-local:10")
            .expect("find")
            .expect("present");
        assert_eq!(found, stored);
        assert_eq!(
            collection.find_by_id(&stored.id).expect("by id"),
            Some(stored.clone())
        );
        assert_eq!(collection.find_by_alt_name("dek-local:99").expect("find"), None);

        let err = collection.insert(key("dek-local:10")).expect_err("duplicate");
        assert!(matches!(err, VaultError::DuplicateAltName { .. }));

        assert!(collection.delete_by_alt_name("dek-local:10").expect("delete"));
        assert!(!collection.delete_by_alt_name("dek-local:10").expect("delete again"));
        assert_eq!(collection.find_by_alt_name("dek-local:10").expect("find"), None);
    }

    #[test]
    fn memory_collection_enforces_unique_alt_names() {
        exercise(&MemoryCollection::new());
    }

    #[test]
    fn file_collection_enforces_unique_alt_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise(&FileCollection::new(dir.path().join("keyvault").join("datakeys.json")));
    }

    #[test]
    fn file_collection_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("datakeys.json");
        let stored = key("dek-local:10");
        FileCollection::new(&path).insert(stored.clone()).expect("insert");

        let reopened = FileCollection::new(&path);
        assert_eq!(
            reopened.find_by_alt_name("dek-local:10").expect("find"),
            Some(stored)
        );
    }

    #[test]
    fn corrupt_file_is_malformed_not_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("datakeys.json");
        fs::write(&path, b"{ not json").expect("write");

        let err = FileCollection::new(&path)
            .find_by_alt_name("dek-local:10")
            .expect_err("corrupt");
        assert!(matches!(err, VaultError::MalformedDocument { .. }));
    }

    #[test]
    fn document_form_decodes_back_to_id() {
        let stored = key("dek-local:10");
        let doc = stored.to_document();
        assert_eq!(decode_key_id(&doc).expect("id"), stored.id);
        assert_eq!(doc[KEY_ALT_NAMES_FIELD], json!(["dek-local:10"]));
        assert_eq!(doc["masterKey"]["provider"], "local:10");
        assert_eq!(stored.wrapped_key().expect("material"), vec![1, 2, 3]);
    }
}
