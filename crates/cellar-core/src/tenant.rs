//! Tenant identifier to KMS provider name resolution.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CellarError;

/// Namespace prefix for providers backed by a locally stored master key.
pub const LOCAL_PROVIDER_PREFIX: &str = "local:";

const TENANT_SEPARATOR: char = '/';
const DEK_ALT_NAME_PREFIX: &str = "dek-";
const KEY_FILE_SUFFIX: &str = "_master_key.bin";

/// Stable name of a tenant's key-management namespace. Used as the KMS
/// provider map key and to name the tenant's master key file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderName(String);

impl ProviderName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Alternate name under which this provider's DEK is registered in the vault.
    pub fn dek_alt_name(&self) -> String {
        format!("{DEK_ALT_NAME_PREFIX}{}", self.0)
    }

    pub fn key_file_name(&self) -> String {
        format!("{}{KEY_FILE_SUFFIX}", self.0)
    }

    fn from_segment(segment: &str) -> Self {
        Self(format!("{LOCAL_PROVIDER_PREFIX}{segment}"))
    }
}

/// Derives the provider name from a hierarchical tenant identifier such as
/// `don:identity:dvrv-us-1:devo/10` (yielding `local:10`).
pub fn resolve_provider(tenant: &str) -> Result<ProviderName, CellarError> {
    match tenant.rfind(TENANT_SEPARATOR) {
        Some(idx) if idx > 0 => {
            let segment = &tenant[idx + TENANT_SEPARATOR.len_utf8()..];
            if segment.is_empty() || segment.contains('\0') {
                return Err(format_error(tenant));
            }
            Ok(ProviderName::from_segment(segment))
        }
        _ => Err(format_error(tenant)),
    }
}

fn format_error(tenant: &str) -> CellarError {
    CellarError::Format {
        identifier: tenant.to_string(),
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderName {
    type Err = CellarError;

    /// Parses an already-resolved name (`local:<segment>`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(LOCAL_PROVIDER_PREFIX) {
            Some(segment)
                if !segment.is_empty()
                    && !segment.contains(TENANT_SEPARATOR)
                    && !segment.contains('\0') =>
            {
                Ok(Self::from_segment(segment))
            }
            _ => Err(format_error(s)),
        }
    }
}

impl TryFrom<String> for ProviderName {
    type Error = CellarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderName> for String {
    fn from(value: ProviderName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn resolves_trailing_segment() {
        let provider = resolve_provider("don:identity:dvrv-us-1:devo/10").expect("resolve");
        assert_eq!(provider.as_str(), "local:10");
        assert_eq!(provider.dek_alt_name(), "dek-local:10");
        assert_eq!(provider.key_file_name(), "local:10_master_key.bin");
    }

    #[test]
    fn uses_last_separator_only() {
        let provider = resolve_provider("a/b/c").expect("resolve");
        assert_eq!(provider.as_str(), "local:c");
    }

    #[test]
    fn same_input_same_output() {
        let first = resolve_provider("don:identity:dvrv-us-1:devo/100").expect("resolve");
        let second = resolve_provider("don:identity:dvrv-us-1:devo/100").expect("resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_identifier_without_separator() {
        let err = resolve_provider("no-separator-here").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn rejects_leading_separator_and_empty_segment() {
        for bad in ["/10", "devo/", "", "/"] {
            let err = resolve_provider(bad).expect_err("should fail");
            assert_eq!(err.kind(), ErrorKind::Format, "input {bad:?}");
        }
    }

    #[test]
    fn parses_resolved_form() {
        let provider: ProviderName = "local:42".parse().expect("parse");
        assert_eq!(provider, resolve_provider("org/42").expect("resolve"));
        assert!("aws:42".parse::<ProviderName>().is_err());
        assert!("local:".parse::<ProviderName>().is_err());
        assert!("local:a/b".parse::<ProviderName>().is_err());
    }

    #[test]
    fn serde_round_trips_as_plain_string() {
        let provider = resolve_provider("org/7").expect("resolve");
        let json = serde_json::to_string(&provider).expect("serialize");
        assert_eq!(json, "\"local:7\"");
        let back: ProviderName = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, provider);
        assert!(serde_json::from_str::<ProviderName>("\"bogus\"").is_err());
    }
}
