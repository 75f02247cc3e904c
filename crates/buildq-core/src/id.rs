//! Build identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of a build, as assigned by the Build-Status API.
///
/// Serialized as a bare number so that payloads written by producers
/// (`{"buildId": 42}`) round-trip unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct BuildId(u64);

impl BuildId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Field name used for this build in keyed hashes.
    pub fn as_field(&self) -> String {
        self.0.to_string()
    }
}

impl From<u64> for BuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<BuildId> for u64 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}
