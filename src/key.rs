//! Registry key contract shared by file-backed, virtual and fake keys.

use crate::error::Result;
use crate::fake::FakeKey;
use crate::key_path::split_key_path;
use crate::regf::RegfKey;
use crate::value::Value;
use crate::virtual_key::VirtualKey;
use chrono::{DateTime, Utc};
use std::fmt;

/// Number of 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH_DELTA: u64 = 116_444_736_000_000_000;

/// Last written time of a key.
///
/// Keys without a backing registry file have no timestamp; this is stated
/// explicitly as `NotSet` rather than left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastWrittenTime {
    /// The key has no last written time.
    NotSet,

    /// Windows FILETIME: 100ns intervals since 1601-01-01 UTC.
    Filetime(u64),
}

impl LastWrittenTime {
    /// Returns true if a timestamp is set.
    pub fn is_set(&self) -> bool {
        matches!(self, LastWrittenTime::Filetime(_))
    }

    /// Converts the timestamp to a UTC date and time.
    ///
    /// Returns `None` if not set or outside the range chrono supports.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            LastWrittenTime::NotSet => None,
            LastWrittenTime::Filetime(filetime) => {
                let unix_ticks = i128::from(*filetime) - i128::from(FILETIME_UNIX_EPOCH_DELTA);
                let seconds = unix_ticks.div_euclid(10_000_000);
                let nanoseconds = (unix_ticks.rem_euclid(10_000_000) * 100) as u32;
                DateTime::<Utc>::from_timestamp(i64::try_from(seconds).ok()?, nanoseconds)
            }
        }
    }
}

impl fmt::Display for LastWrittenTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S%.7f")),
            None if self.is_set() => write!(f, "Invalid FILETIME"),
            None => write!(f, "Not set"),
        }
    }
}

/// Operations every registry key supports.
///
/// Lookups that find nothing return `None`; only misuse such as an out of
/// range index is an error.
pub trait RegistryKey {
    /// Returns the key name.
    fn name(&self) -> &str;

    /// Returns the class name, if any.
    fn class_name(&self) -> Option<String>;

    /// Returns the last written time.
    fn last_written_time(&self) -> LastWrittenTime;

    /// Returns the number of subkeys.
    fn number_of_subkeys(&self) -> usize;

    /// Returns the number of values.
    fn number_of_values(&self) -> usize;

    /// Returns the offset of the key within its registry file, if any.
    fn offset(&self) -> Option<u32>;

    /// Returns the absolute key path.
    fn path(&self) -> String;

    /// Retrieves a subkey by index.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::IndexOutOfRange` if `index` is not below
    /// `number_of_subkeys()`.
    fn get_subkey_by_index(&self, index: usize) -> Result<Key>;

    /// Retrieves a subkey by name, ignoring case.
    fn get_subkey_by_name(&self, name: &str) -> Option<Key>;

    /// Returns the subkeys. Every call walks the subkeys afresh.
    fn get_subkeys(&self) -> Box<dyn Iterator<Item = Key>>;

    /// Retrieves a value by name, ignoring case. An empty name selects the default value.
    fn get_value_by_name(&self, name: &str) -> Option<Value>;

    /// Returns the values.
    fn get_values(&self) -> Box<dyn Iterator<Item = Value>>;

    /// Retrieves a subkey by a path relative to this key.
    ///
    /// An empty path returns the key itself.
    fn get_subkey_by_path(&self, key_path: &str) -> Option<Key>
    where
        Self: Clone + Into<Key>,
    {
        let mut key: Key = self.clone().into();
        for segment in split_key_path(key_path) {
            key = key.get_subkey_by_name(segment)?;
        }
        Some(key)
    }
}

/// A key from any of the key implementations.
#[derive(Debug, Clone)]
pub enum Key {
    /// Key stored in an NT registry file.
    Regf(RegfKey),

    /// Key synthesized by the registry.
    Virtual(VirtualKey),

    /// Key of an in-memory registry file.
    Fake(FakeKey),
}

impl Key {
    fn as_dyn(&self) -> &dyn RegistryKey {
        match self {
            Key::Regf(key) => key,
            Key::Virtual(key) => key,
            Key::Fake(key) => key,
        }
    }

    /// Returns the same key presented at another absolute path.
    ///
    /// File-backed keys get a new handle; virtual keys are re-stamped in
    /// place together with their synthetic subkeys.
    pub fn with_path(self, key_path: String) -> Key {
        match self {
            Key::Regf(key) => Key::Regf(key.with_path(key_path)),
            Key::Fake(key) => Key::Fake(key.with_path(key_path)),
            Key::Virtual(key) => {
                key.set_path(key_path);
                Key::Virtual(key)
            }
        }
    }

    /// Returns the virtual key, if this is one.
    pub fn as_virtual(&self) -> Option<&VirtualKey> {
        match self {
            Key::Virtual(key) => Some(key),
            _ => None,
        }
    }

    /// Walks this key and all of its descendants, depth first, parents before children.
    pub fn recurse_keys(&self) -> RecurseKeys {
        RecurseKeys {
            pending: Some(self.clone()),
            stack: Vec::new(),
        }
    }
}

impl RegistryKey for Key {
    fn name(&self) -> &str {
        self.as_dyn().name()
    }

    fn class_name(&self) -> Option<String> {
        self.as_dyn().class_name()
    }

    fn last_written_time(&self) -> LastWrittenTime {
        self.as_dyn().last_written_time()
    }

    fn number_of_subkeys(&self) -> usize {
        self.as_dyn().number_of_subkeys()
    }

    fn number_of_values(&self) -> usize {
        self.as_dyn().number_of_values()
    }

    fn offset(&self) -> Option<u32> {
        self.as_dyn().offset()
    }

    fn path(&self) -> String {
        self.as_dyn().path()
    }

    fn get_subkey_by_index(&self, index: usize) -> Result<Key> {
        self.as_dyn().get_subkey_by_index(index)
    }

    fn get_subkey_by_name(&self, name: &str) -> Option<Key> {
        self.as_dyn().get_subkey_by_name(name)
    }

    fn get_subkeys(&self) -> Box<dyn Iterator<Item = Key>> {
        self.as_dyn().get_subkeys()
    }

    fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.as_dyn().get_value_by_name(name)
    }

    fn get_values(&self) -> Box<dyn Iterator<Item = Value>> {
        self.as_dyn().get_values()
    }
}

impl From<RegfKey> for Key {
    fn from(key: RegfKey) -> Self {
        Key::Regf(key)
    }
}

impl From<VirtualKey> for Key {
    fn from(key: VirtualKey) -> Self {
        Key::Virtual(key)
    }
}

impl From<FakeKey> for Key {
    fn from(key: FakeKey) -> Self {
        Key::Fake(key)
    }
}

/// Depth-first iterator over a key and its descendants.
///
/// Subkeys are only read when the walk reaches them, so dropping the
/// iterator early avoids reading the rest of the tree.
pub struct RecurseKeys {
    pending: Option<Key>,
    stack: Vec<Box<dyn Iterator<Item = Key>>>,
}

impl Iterator for RecurseKeys {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if let Some(key) = self.pending.take() {
            self.stack.push(key.get_subkeys());
            return Some(key);
        }

        while let Some(subkeys) = self.stack.last_mut() {
            match subkeys.next() {
                Some(key) => {
                    self.stack.push(key.get_subkeys());
                    return Some(key);
                }
                None => {
                    self.stack.pop();
                }
            }
        }

        None
    }
}
