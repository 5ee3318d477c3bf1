use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IncomparableHashError;
use crate::hashing::{HashToken, PerceptualHashes};

const SEPARATOR: char = '_';
const GROUP_KEY_LEN: usize = 16;

/// `<average>_<perceptual>_<difference>`; each part stays readable on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the fingerprint back into its three hash tokens.
    pub fn hash_set(&self) -> Result<PerceptualHashes, IncomparableHashError> {
        let malformed = || IncomparableHashError::Malformed {
            fingerprint: self.0.clone(),
        };

        let mut parts = self.0.split(SEPARATOR).map(HashToken::parse);
        let (Some(Some(average)), Some(Some(perceptual)), Some(Some(difference)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        Ok(PerceptualHashes {
            average,
            perceptual,
            difference,
        })
    }

    pub fn group_key(&self) -> GroupKey {
        let digest = blake3::hash(self.0.as_bytes());
        GroupKey(digest.to_hex()[..GROUP_KEY_LEN].to_string())
    }
}

impl From<&PerceptualHashes> for Fingerprint {
    fn from(hashes: &PerceptualHashes) -> Self {
        Self(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            hashes.average, hashes.perceptual, hashes.difference
        ))
    }
}

impl From<String> for Fingerprint {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key: a short digest of a [`Fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Combine three hashes into the stored fingerprint and its group key.
pub fn build(hashes: &PerceptualHashes) -> (Fingerprint, GroupKey) {
    let fingerprint = Fingerprint::from(hashes);
    let key = fingerprint.group_key();
    (fingerprint, key)
}
