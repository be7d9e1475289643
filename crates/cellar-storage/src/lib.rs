//! Concrete backends for the key lifecycle: file-backed master keys, a local
//! key vault with its crypto engine, and an auto-encrypting session on top.

pub mod collection;
pub mod engine;
pub mod local_vault;
pub mod master_key_file;
pub mod session;

pub use local_vault::{LocalConnector, LocalVaultClient};
pub use master_key_file::FileMasterKeyStore;
pub use session::{LocalSession, SessionError};
