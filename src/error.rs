//! Error types for registry namespace, search and hive operations.
//!
//! Lookups that simply find nothing are not errors: they return `None` or an
//! empty iterator. The variants here cover misuse of the API, internal
//! invariant violations and corrupted hive data.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while building or querying the registry namespace.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The key path starts with a root key outside the supported set.
    #[error("Unsupported root key: {0}")]
    UnsupportedRoot(String),

    /// More than one of key path, glob and regex was given to a find specification.
    #[error("The key path, key path glob and key path regex cannot be used at the same time")]
    ConflictingPattern,

    /// A find specification was given a pattern it cannot represent.
    #[error("Unsupported pattern: {0}")]
    InvalidPatternType(String),

    /// A glob or regex pattern is malformed.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// A mapped key path prefix does not prefix the key path it was selected for.
    #[error("Key path prefix mismatch: {prefix} is not a prefix of {key_path}")]
    PrefixMismatch {
        prefix: String,
        key_path: String,
    },

    /// A subkey or value with the same name already exists.
    #[error("{item_type} '{name}' already exists")]
    DuplicateKey {
        item_type: &'static str,
        name: String,
    },

    /// A subkey index is outside the number of subkeys.
    #[error("Subkey index {index} out of bounds (number of subkeys: {count})")]
    IndexOutOfRange {
        index: usize,
        count: usize,
    },

    /// Value data does not match its declared type.
    #[error("Unable to decode data of value '{name}': {reason}")]
    ValueDecode {
        name: String,
        reason: String,
    },

    /// A registry file matches more than one file mapping template.
    #[error("Unable to resolve registry file mapping, candidates: {0:?}")]
    AmbiguousMapping(Vec<String>),

    /// The configured ASCII codepage is not known.
    #[error("Unknown codepage: {0}")]
    UnknownCodepage(String),

    /// I/O error occurred while reading a hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in the hive header.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is out of bounds.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        offset: u32,
        hive_size: usize,
    },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        size: i32,
        offset: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        size: usize,
        minimum: usize,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?} at offset {offset:#x}")]
    InvalidSubkeyList {
        list_type: [u8; 2],
        offset: u32,
    },
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates a duplicate subkey error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_vfs::error::RegistryError;
    /// let err = RegistryError::duplicate_subkey("Software");
    /// assert_eq!(err.to_string(), "Subkey 'Software' already exists");
    /// ```
    pub fn duplicate_subkey(name: &str) -> Self {
        Self::DuplicateKey {
            item_type: "Subkey",
            name: name.to_string(),
        }
    }

    /// Creates a duplicate value error.
    pub fn duplicate_value(name: &str) -> Self {
        Self::DuplicateKey {
            item_type: "Value",
            name: name.to_string(),
        }
    }

    /// Creates a value decode error for the named value.
    pub fn value_decode(name: &str, reason: impl Into<String>) -> Self {
        Self::ValueDecode {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the input can never be served,
    /// as opposed to data corruption in a particular hive.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedRoot(_)
                | Self::ConflictingPattern
                | Self::InvalidPatternType(_)
                | Self::InvalidPattern(_)
                | Self::DuplicateKey { .. }
                | Self::IndexOutOfRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_messages() {
        let err = RegistryError::duplicate_value("Current");
        assert_eq!(err.to_string(), "Value 'Current' already exists");
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_format_errors_are_not_usage_errors() {
        let err = RegistryError::invalid_offset(0x20, 0x1000);
        assert!(!err.is_usage_error());
        assert!(err.to_string().contains("0x20"));
    }
}
