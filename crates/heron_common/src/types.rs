//! Identifier newtypes shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Opaque session identifier. Compared for identity only; the storage
/// core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Transaction identifier, monotonically increasing per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Row identifier within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row-{}", self.0)
    }
}

/// Global commit sequence number.
///
/// `0` and `u64::MAX` are reserved: the version store uses them as the
/// pending and discarded sentinels on version slots, so no committed
/// version ever carries either value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const MIN: SequenceNumber = SequenceNumber(0);
    pub const MAX: SequenceNumber = SequenceNumber(u64::MAX);

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Validated, dot-qualified collection name, e.g. `app.users`.
///
/// Normalized to lowercase at construction; every component must be
/// non-empty and start with an ASCII letter or underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionFullName(String);

impl CollectionFullName {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(StorageError::InvalidCollectionName {
                name: raw.to_string(),
                reason: "empty name".to_string(),
            });
        }
        for part in normalized.split('.') {
            if part.is_empty() {
                return Err(StorageError::InvalidCollectionName {
                    name: raw.to_string(),
                    reason: "empty path component".to_string(),
                });
            }
            let mut chars = part.chars();
            let first = chars.next().unwrap_or('.');
            if !(first.is_ascii_alphabetic() || first == '_') {
                return Err(StorageError::InvalidCollectionName {
                    name: raw.to_string(),
                    reason: format!("component `{part}` must start with a letter or underscore"),
                });
            }
            if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(StorageError::InvalidCollectionName {
                    name: raw.to_string(),
                    reason: format!("component `{part}` contains invalid characters"),
                });
            }
        }
        Ok(CollectionFullName(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionFullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CollectionFullName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_number_ordering() {
        assert!(SequenceNumber(10) < SequenceNumber(11));
        assert_eq!(SequenceNumber(10).next(), SequenceNumber(11));
        assert!(SequenceNumber::MIN < SequenceNumber::MAX);
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(TxnId(7).to_string(), "txn-7");
        assert_eq!(RowId(42).to_string(), "row-42");
        assert_eq!(SequenceNumber(3).to_string(), "seq-3");
        assert_eq!(SessionId(1).to_string(), "session-1");
    }

    #[test]
    fn test_collection_name_normalization() {
        let name = CollectionFullName::parse(" App.Users ").unwrap();
        assert_eq!(name.as_str(), "app.users");
        assert_eq!(name, CollectionFullName::parse("app.users").unwrap());
    }

    #[test]
    fn test_collection_name_rejects_bad_input() {
        assert!(CollectionFullName::parse("").is_err());
        assert!(CollectionFullName::parse("app..users").is_err());
        assert!(CollectionFullName::parse("1app.users").is_err());
        assert!(CollectionFullName::parse("app.us ers").is_err());
        assert!(CollectionFullName::parse("app.users;drop").is_err());
    }

    #[test]
    fn test_collection_name_single_component() {
        let name = CollectionFullName::parse("_metrics").unwrap();
        assert_eq!(name.as_str(), "_metrics");
    }
}
