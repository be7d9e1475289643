//! Opaque encrypted field values.
//!
//! Layout: `[algorithm:1][key_id:16][bson_type:1][payload..]`. The header is
//! what lets a holder of the KMS configuration decrypt a value without knowing
//! which field it came from.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use crate::{
    error::CellarError,
    schema::{Algorithm, DataType},
    vault::DekId,
};

/// BSON binary subtype for encrypted values.
pub const ENCRYPTED_SUBTYPE: &str = "06";

const HEADER_LEN: usize = 1 + 16 + 1;

/// Parsed header of an [`EncryptedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueHeader {
    pub algorithm: Algorithm,
    pub key_id: DekId,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue(Vec<u8>);

impl EncryptedValue {
    /// Wraps raw bytes without validation; use [`EncryptedValue::header`] to check them.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn assemble(header: ValueHeader, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.push(header.algorithm.marker());
        bytes.extend_from_slice(header.key_id.as_bytes());
        bytes.push(header.data_type.type_byte());
        bytes.extend_from_slice(payload);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn header(&self) -> Result<ValueHeader, CellarError> {
        if self.0.is_empty() {
            return Err(CellarError::decrypt("encrypted value is empty"));
        }
        if self.0.len() <= HEADER_LEN {
            return Err(CellarError::decrypt(format!(
                "encrypted value is {} bytes, shorter than its header",
                self.0.len()
            )));
        }
        let algorithm = Algorithm::from_marker(self.0[0]).ok_or_else(|| {
            CellarError::decrypt(format!("unknown algorithm marker {}", self.0[0]))
        })?;
        let mut key_id = [0u8; 16];
        key_id.copy_from_slice(&self.0[1..17]);
        let data_type = DataType::from_type_byte(self.0[17]).ok_or_else(|| {
            CellarError::decrypt(format!("unknown bson type byte {:#04x}", self.0[17]))
        })?;
        Ok(ValueHeader {
            algorithm,
            key_id: DekId::from_bytes(key_id),
            data_type,
        })
    }

    /// Everything after the header. Empty if the value is too short to have one.
    pub fn payload(&self) -> &[u8] {
        self.0.get(HEADER_LEN..).unwrap_or_default()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CellarError> {
        STANDARD
            .decode(encoded.trim())
            .map(Self)
            .map_err(|e| CellarError::decrypt(format!("value is not valid base64: {e}")))
    }

    /// Extended-JSON binary with subtype 6, as stored in a document.
    pub fn to_extended_json(&self) -> Value {
        json!({
            "$binary": {
                "base64": self.to_base64(),
                "subType": ENCRYPTED_SUBTYPE,
            }
        })
    }

    /// `Some` only for an extended-JSON binary of subtype 6.
    pub fn from_extended_json(value: &Value) -> Option<Self> {
        let binary = value.get("$binary")?;
        if binary.get("subType")?.as_str()? != ENCRYPTED_SUBTYPE {
            return None;
        }
        let encoded = binary.get("base64")?.as_str()?;
        STANDARD.decode(encoded).ok().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn header() -> ValueHeader {
        ValueHeader {
            algorithm: Algorithm::Deterministic,
            key_id: DekId::new_random(),
            data_type: DataType::String,
        }
    }

    #[test]
    fn header_is_read_back() {
        let header = header();
        let value = EncryptedValue::assemble(header, b"ciphertext");
        assert_eq!(value.header().expect("header"), header);
        assert_eq!(value.payload(), b"ciphertext");
    }

    #[test]
    fn empty_and_short_values_fail_as_decrypt_errors() {
        let empty = EncryptedValue::from_bytes(Vec::new());
        assert_eq!(empty.header().expect_err("empty").kind(), ErrorKind::Decrypt);

        let short = EncryptedValue::from_bytes(vec![1u8; 10]);
        assert_eq!(short.header().expect_err("short").kind(), ErrorKind::Decrypt);
        assert!(short.payload().is_empty());

        let mut bytes = EncryptedValue::assemble(header(), b"x").as_bytes().to_vec();
        bytes[0] = 9;
        let bad_marker = EncryptedValue::from_bytes(bytes);
        assert_eq!(bad_marker.header().expect_err("marker").kind(), ErrorKind::Decrypt);
    }

    #[test]
    fn extended_json_requires_encrypted_subtype() {
        let value = EncryptedValue::assemble(header(), b"payload");
        let doc = value.to_extended_json();
        assert_eq!(EncryptedValue::from_extended_json(&doc), Some(value.clone()));

        let uuid_binary = DekId::new_random().to_extended_json();
        assert_eq!(EncryptedValue::from_extended_json(&uuid_binary), None);
        assert_eq!(EncryptedValue::from_extended_json(&json!("plain")), None);

        let decoded = EncryptedValue::from_base64(&value.to_base64()).expect("base64");
        assert_eq!(decoded, value);
        assert!(EncryptedValue::from_base64("%%%").is_err());
    }
}
