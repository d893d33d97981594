//! Protocol versioning for Tether.
//!
//! Clients announce the revision they speak in the `EIO` query parameter.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current protocol revision.
pub const PROTOCOL_VERSION: Version = Version { revision: 4 };

/// Protocol revision announced by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Revision number. Revisions are not compatible with each other.
    pub revision: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(revision: u8) -> Self {
        Self { revision }
    }

    /// Check if a peer speaking `other` can talk to us.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.revision == other.revision
    }
}

impl FromStr for Version {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Version::new)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.revision)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
