use std::{
    fs::{self, File},
    io::{ErrorKind as IoErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use cellar_core::{
    error::CellarError,
    kms::{MasterKey, MASTER_KEY_LEN},
    master_key::{generate_master_key, MasterKeyStore},
    tenant::ProviderName,
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

#[cfg(unix)]
const KEY_DIR_MODE: u32 = 0o700;

/// One raw 96-byte file per provider under a directory only the owner can
/// enter. Whoever can read this directory can unwrap every tenant's DEKs.
///
/// First use publishes the key with an atomic create-exclusive link, so a
/// reader never sees a half-written key and concurrent first callers (threads
/// or processes) all end up with the key of whichever writer linked first.
#[derive(Debug, Clone)]
pub struct FileMasterKeyStore {
    root: PathBuf,
}

impl FileMasterKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, provider: &ProviderName) -> PathBuf {
        self.root.join(provider.key_file_name())
    }

    fn ensure_dir(&self) -> Result<(), CellarError> {
        create_private_dir(&self.root)
            .map_err(|e| CellarError::io("create master key directory", &self.root, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&self.root) {
                let mode = meta.permissions().mode() & 0o777;
                if mode & 0o077 != 0 {
                    warn!(root = %self.root.display(), mode = %format!("{mode:o}"), "master key directory is accessible to other users");
                }
            }
        }
        Ok(())
    }

    fn create_key(&self, path: &Path) -> Result<MasterKey, CellarError> {
        let key = generate_master_key();

        let mut tmp = NamedTempFile::new_in(&self.root)
            .map_err(|e| CellarError::io("create temporary master key file", &self.root, e))?;
        tmp.write_all(key.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CellarError::io("write master key to file", tmp.path(), e))?;

        match tmp.persist_noclobber(path) {
            Ok(_) => {
                info!(path = %path.display(), fingerprint = %key.fingerprint(), "generated new master key");
                Ok(key)
            }
            Err(err) if err.error.kind() == IoErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "another writer created the master key first");
                read_key(path)
            }
            Err(err) => Err(CellarError::io("publish master key file", path, err.error)),
        }
    }
}

impl MasterKeyStore for FileMasterKeyStore {
    #[instrument(skip_all, fields(%provider))]
    fn load_or_create(&self, provider: &ProviderName) -> Result<MasterKey, CellarError> {
        self.ensure_dir()?;
        let path = self.path_for(provider);
        match fs::symlink_metadata(&path) {
            Ok(_) => read_key(&path),
            Err(err) if err.kind() == IoErrorKind::NotFound => self.create_key(&path),
            Err(err) => Err(CellarError::io("check master key file status", &path, err)),
        }
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(KEY_DIR_MODE);
    }
    builder.create(path)
}

/// Reads a key file, refusing anything that is not exactly [`MASTER_KEY_LEN`] bytes.
/// At most one byte past the key length is read.
fn read_key(path: &Path) -> Result<MasterKey, CellarError> {
    let file = File::open(path).map_err(|e| CellarError::io("open master key file", path, e))?;
    let mut buf = Zeroizing::new(Vec::with_capacity(MASTER_KEY_LEN + 1));
    (&file)
        .take(MASTER_KEY_LEN as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(|e| CellarError::io("read master key from file", path, e))?;

    MasterKey::from_slice(&buf).ok_or_else(|| {
        let read = buf.len() as u64;
        let actual = if buf.len() > MASTER_KEY_LEN {
            file.metadata().map_or(read, |meta| meta.len().max(read))
        } else {
            read
        };
        CellarError::SizeMismatch {
            path: path.to_path_buf(),
            expected: MASTER_KEY_LEN,
            actual,
        }
    })
}
