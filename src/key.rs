//! Key model: namespace + byte key, and collection-name extraction.

use crate::error::{EngineError, Result};
use std::cmp::Ordering;

/// Which logical key space a key belongs to.
///
/// Keys compare lexicographically by namespace first, then by bytes, so
/// the ordering here (`DefaultCollection < Collections < System`) is load
/// bearing for range scans and checkpoint ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// The legacy, unnamed default collection.
    DefaultCollection,
    /// A user-created, named collection (prefix before `separator`).
    Collections,
    /// Reserved for engine-internal meta-events (collection system events).
    System,
}

/// The minimum and maximum length of a collection separator (spec.md §3).
pub const SEPARATOR_MIN_LEN: usize = 1;
/// See [`SEPARATOR_MIN_LEN`].
pub const SEPARATOR_MAX_LEN: usize = 250;

/// Default collection separator.
pub const DEFAULT_SEPARATOR: &str = "::";

/// A fully qualified key: `(namespace, bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredKey {
    /// Logical key space.
    pub namespace: Namespace,
    /// Raw key bytes. For `Collections` keys this includes the collection
    /// prefix and separator.
    pub bytes: Vec<u8>,
}

impl PartialOrd for StoredKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoredKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then_with(|| self.bytes.cmp(&other.bytes))
    }
}

impl StoredKey {
    /// Builds a key in the default (unnamed) collection.
    pub fn default_collection(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: Namespace::DefaultCollection,
            bytes: bytes.into(),
        }
    }

    /// Builds a key in the named-collections namespace. `bytes` must
    /// already contain `<collection>` + `separator` + `<suffix>`.
    pub fn collections(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: Namespace::Collections,
            bytes: bytes.into(),
        }
    }

    /// Builds a reserved system-event marker key.
    pub fn system(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: Namespace::System,
            bytes: bytes.into(),
        }
    }

    /// Extracts the collection name from a `Collections`-namespace key.
    ///
    /// The boundary is the first occurrence of `separator` inside the key
    /// bytes. Returns `None` for any namespace other than `Collections`, or
    /// if `separator` does not occur.
    pub fn collection_name<'a>(&'a self, separator: &str) -> Option<&'a [u8]> {
        if self.namespace != Namespace::Collections {
            return None;
        }
        find_subslice(&self.bytes, separator.as_bytes()).map(|pos| &self.bytes[..pos])
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Validates a collection name per spec.md §3: non-empty, must not start
/// with `_`; a leading `$` is reserved for the implicit `$default`.
pub fn validate_collection_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidArgument(
            "collection name must not be empty".into(),
        ));
    }
    if name[0] == b'_' {
        return Err(EngineError::InvalidArgument(
            "collection name must not start with '_'".into(),
        ));
    }
    if name[0] == b'$' && name != b"$default" {
        return Err(EngineError::InvalidArgument(
            "'$'-prefixed collection names are reserved for $default".into(),
        ));
    }
    Ok(())
}

/// Validates a configured separator length per spec.md §3: `1..=250` bytes.
pub fn validate_separator(separator: &str) -> Result<()> {
    let len = separator.len();
    if !(SEPARATOR_MIN_LEN..=SEPARATOR_MAX_LEN).contains(&len) {
        return Err(EngineError::InvalidArgument(format!(
            "separator length {len} outside [{SEPARATOR_MIN_LEN}..={SEPARATOR_MAX_LEN}]"
        )));
    }
    Ok(())
}
