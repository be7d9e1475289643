//! Local crypto engine: DEK wrapping under a provider's master key and
//! single-value encryption under a DEK.
//!
//! This stands in for the document store's own engine so the key lifecycle
//! can run end to end locally. It is AES-256-GCM throughout, not the store's
//! CBC-HMAC construction, and its ciphertexts are only readable by this engine.
//!
//! Key layout (both master keys and DEKs are 96 bytes): bytes `0..32` are the
//! AES key, bytes `32..64` seed deterministic nonces, the rest is unused.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use cellar_core::{
    kms::MasterKey,
    schema::{Algorithm, DataType},
    tenant::ProviderName,
    value::{EncryptedValue, ValueHeader},
    vault::{DekId, VaultError},
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of a data encryption key.
pub const DEK_LEN: usize = 96;
const AES_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const NONCE_INFO: &[u8] = b"cellar deterministic nonce v1";

/// Fresh DEK from the OS CSPRNG.
pub fn generate_dek() -> Zeroizing<Vec<u8>> {
    let mut dek = Zeroizing::new(vec![0u8; DEK_LEN]);
    OsRng.fill_bytes(&mut dek);
    dek
}

/// `nonce || ciphertext` of the DEK under the master key, bound to the provider name.
pub fn wrap_dek(
    master: &MasterKey,
    provider: &ProviderName,
    dek: &[u8],
) -> Result<Vec<u8>, VaultError> {
    let cipher = cipher_for(master.as_bytes())?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: dek,
                aad: provider.as_str().as_bytes(),
            },
        )
        .map_err(|e| crypto(format!("wrap DEK: {e}")))?;
    Ok([nonce.as_slice(), &sealed].concat())
}

pub fn unwrap_dek(
    master: &MasterKey,
    provider: &ProviderName,
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if wrapped.len() <= NONCE_LEN {
        return Err(crypto("wrapped DEK is truncated"));
    }
    let (nonce, sealed) = wrapped.split_at(NONCE_LEN);
    let dek = cipher_for(master.as_bytes())?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: provider.as_str().as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| crypto("DEK does not unwrap under this master key"))?;
    if dek.len() != DEK_LEN {
        return Err(crypto(format!("unwrapped DEK is {} bytes", dek.len())));
    }
    Ok(dek)
}

/// Encrypts a JSON value under `dek`. Deterministic mode derives the nonce from
/// the plaintext, so equal inputs give equal outputs under the same key.
pub fn encrypt_value(
    dek: &[u8],
    key_id: DekId,
    algorithm: Algorithm,
    value: &Value,
) -> Result<EncryptedValue, VaultError> {
    let data_type = DataType::of(value).ok_or_else(|| crypto("cannot encrypt a null value"))?;
    if algorithm == Algorithm::Deterministic
        && matches!(
            data_type,
            DataType::Double | DataType::Bool | DataType::Object | DataType::Array
        )
    {
        return Err(crypto(format!(
            "deterministic encryption is not supported for {}",
            data_type.as_str()
        )));
    }
    let header = ValueHeader {
        algorithm,
        key_id,
        data_type,
    };
    let aad = EncryptedValue::assemble(header, &[]);
    let plaintext = Zeroizing::new(
        serde_json::to_vec(value).map_err(|e| crypto(format!("encode plaintext: {e}")))?,
    );

    let nonce = match algorithm {
        Algorithm::Deterministic => deterministic_nonce(dek, aad.as_bytes(), &plaintext)?,
        Algorithm::Random => {
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            nonce
        }
    };
    let sealed = cipher_for(dek)?
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| crypto(format!("encrypt value: {e}")))?;
    Ok(EncryptedValue::assemble(
        header,
        &[nonce.as_slice(), &sealed].concat(),
    ))
}

pub fn decrypt_value(dek: &[u8], value: &EncryptedValue) -> Result<Value, VaultError> {
    let header = value.header().map_err(|e| crypto(e.to_string()))?;
    let payload = value.payload();
    if payload.len() <= NONCE_LEN {
        return Err(crypto("encrypted payload is truncated"));
    }
    let (nonce, sealed) = payload.split_at(NONCE_LEN);
    let aad = EncryptedValue::assemble(header, &[]);
    let plaintext = cipher_for(dek)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: aad.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| crypto("value does not authenticate under its DEK"))?;
    serde_json::from_slice(&plaintext).map_err(|e| crypto(format!("decode plaintext: {e}")))
}

fn deterministic_nonce(
    dek: &[u8],
    header: &[u8],
    plaintext: &[u8],
) -> Result<[u8; NONCE_LEN], VaultError> {
    let seed = dek
        .get(AES_KEY_LEN..2 * AES_KEY_LEN)
        .ok_or_else(|| crypto("DEK too short for deterministic mode"))?;
    let hk = Hkdf::<Sha256>::new(Some(header), seed);
    let mut nonce = [0u8; NONCE_LEN];
    hk.expand_multi_info(&[NONCE_INFO, plaintext], &mut nonce)
        .map_err(|e| crypto(format!("derive nonce: {e}")))?;
    Ok(nonce)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, VaultError> {
    let key = key
        .get(..AES_KEY_LEN)
        .ok_or_else(|| crypto("key too short for AES-256"))?;
    Aes256Gcm::new_from_slice(key).map_err(|e| crypto(format!("cipher init failed: {e}")))
}

fn crypto(reason: impl Into<String>) -> VaultError {
    VaultError::Crypto {
        reason: reason.into(),
    }
}
