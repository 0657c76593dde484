use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content fingerprint of a base VM: lowercase hex SHA-256.
///
/// Assigned once when the base VM is captured and copied onto every artifact derived from it.
/// Two images with the same fingerprint are assumed to resume from the same disk+memory baseline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseVmFingerprint(String);

impl BaseVmFingerprint {
    /// Derive the fingerprint of a base VM captured from `instance_id`.
    pub fn from_instance_id(instance_id: &str) -> Self {
        let digest = Sha256::digest(instance_id.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        BaseVmFingerprint(hex)
    }

    /// Accepts any 64-char hex string; normalizes to lowercase.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() != 64 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(BaseVmFingerprint(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseVmFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BaseVmFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BaseVmFingerprint::parse(&value).ok_or_else(|| format!("invalid base VM fingerprint: {}", value))
    }
}

impl From<BaseVmFingerprint> for String {
    fn from(value: BaseVmFingerprint) -> Self {
        value.0
    }
}
