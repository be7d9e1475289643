//! Core key lifecycle for tenant envelope encryption: provider resolution,
//! master key contracts, DEK registration and encryption session assembly.
//! Storage and vault backends live in `cellar-storage`.

pub mod config;
pub mod context;
pub mod error;
pub mod kms;
pub mod master_key;
pub mod registry;
pub mod schema;
pub mod session;
pub mod tenant;
pub mod value;
pub mod vault;

#[cfg(test)]
mod testing;

pub use error::{CellarError, ErrorKind};
