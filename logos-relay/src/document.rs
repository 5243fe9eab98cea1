//! Document identifiers taken from the connection request path.

use std::fmt;
use std::sync::Arc;

/// Paths browsers request on their own; never a document.
const RESERVED: &[&str] = &["favicon.ico"];

/// Prefix for cache-tier keys.
const CACHE_KEY_PREFIX: &str = "doc:";

/// Why a request path does not name a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDocumentId {
    #[error("empty document identifier")]
    Empty,
    #[error("reserved document identifier: {0}")]
    Reserved(String),
}

/// Opaque, non-empty key naming one collaboratively edited document.
///
/// Cheap to clone: the name is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Arc<str>);

impl DocumentId {
    /// Validate a raw identifier.
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidDocumentId> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(InvalidDocumentId::Empty);
        }
        if RESERVED.contains(&name) {
            return Err(InvalidDocumentId::Reserved(name.to_string()));
        }
        Ok(Self(Arc::from(name)))
    }

    /// Extract the identifier from a request path such as `/notes/today?v=2`.
    ///
    /// The leading separator is removed and the query string stripped; the
    /// remainder is taken verbatim (nested segments included).
    pub fn from_request_path(path: &str) -> Result<Self, InvalidDocumentId> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let name = path.split('?').next().unwrap_or_default();
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which the cache tier stores this document's snapshot.
    pub fn cache_key(&self) -> String {
        format!("{CACHE_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
