//! Cache namespaces and storage keys.

use std::fmt;
use std::str::FromStr;

/// One of the two keyspaces of the Bazel HTTP caching protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Action cache (`/ac/`).
    Ac,
    /// Content-addressed store (`/cas/`).
    Cas,
}

impl Namespace {
    /// All namespaces, in route order.
    pub const ALL: [Namespace; 2] = [Namespace::Ac, Namespace::Cas];

    /// Path segment and key prefix for this namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ac => "ac",
            Self::Cas => "cas",
        }
    }
}

impl FromStr for Namespace {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ac" => Ok(Self::Ac),
            "cas" => Ok(Self::Cas),
            other => Err(crate::Error::InvalidNamespace(other.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache entry address: namespace plus an opaque, caller-supplied digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Namespace,
    digest: String,
}

impl CacheKey {
    /// Create from an already validated namespace.
    pub fn new(namespace: Namespace, digest: impl Into<String>) -> Self {
        Self {
            namespace,
            digest: digest.into(),
        }
    }

    /// Parse a raw namespace string. Only `ac` and `cas` are accepted.
    pub fn parse(namespace: &str, digest: &str) -> crate::Result<Self> {
        Ok(Self::new(namespace.parse()?, digest))
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Object key inside the bucket: `<namespace>/<digest>`.
    ///
    /// Existing buckets are laid out this way; changing it orphans cached data.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.namespace.as_str(), self.digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.digest)
    }
}
