//! Content-derived entity tags.
//!
//! An [`ETag`] is the lowercase hex SHA-256 of a document's UTF-8 bytes, so
//! two documents share an etag exactly when their contents are equal.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Compute the etag of `content`.
    pub fn compute(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `content` hashes to this etag.
    pub fn matches(&self, content: &str) -> bool {
        *self == Self::compute(content)
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ETag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ETag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ETag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
