//! In-memory registry file, keys and values.
//!
//! Used to seed a registry without hive files, mostly in tests.
//!
//! ```rust
//! use reg_vfs::fake::{FakeFile, FakeKey, FakeValue};
//! use reg_vfs::{RegistryFile, RegistryKey};
//!
//! # fn main() -> reg_vfs::Result<()> {
//! let file = FakeFile::new();
//! let select = file.add_key_by_path("\\", FakeKey::new("Select"))?;
//! select.add_value(FakeValue::dword("Current", 1))?;
//!
//! let key = file.get_key_by_path("\\Select").unwrap();
//! assert_eq!(key.number_of_values(), 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{RegistryError, Result};
use crate::file::{relative_key_path, RegistryFile};
use crate::key::{Key, LastWrittenTime, RegistryKey};
use crate::key_path::{join_key_path, key_names_equal, split_key_path};
use crate::value::{RegistryValue, Value, ValueType};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// In-memory registry file.
pub struct FakeFile {
    root: Rc<FakeNode>,
    key_path_prefix: RefCell<String>,
    closed: Cell<bool>,
}

impl FakeFile {
    /// Creates an empty file with an unnamed root key.
    pub fn new() -> Self {
        Self {
            root: Rc::new(FakeNode::new(String::new())),
            key_path_prefix: RefCell::new(String::new()),
            closed: Cell::new(false),
        }
    }

    /// Adds a key below the key at `key_path`, creating missing parent keys.
    ///
    /// `key_path` is relative to the file root and starts with a separator,
    /// or is absolute under the key path prefix.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKey` if the parent already has a
    /// subkey with the same name, and `RegistryError::InvalidFormat` if the
    /// key path is not inside this file.
    pub fn add_key_by_path(&self, key_path: &str, key: FakeKey) -> Result<FakeKey> {
        let key_path_prefix = self.key_path_prefix.borrow().clone();
        let relative_path = relative_key_path(key_path, &key_path_prefix).ok_or_else(|| {
            RegistryError::InvalidFormat(format!(
                "key path {} is not inside registry file mounted at {}",
                key_path, key_path_prefix
            ))
        })?;

        let mut parent = self.root_handle();
        for segment in split_key_path(&relative_path) {
            parent = match parent.find_subkey(segment) {
                Some(subkey) => subkey,
                None => parent.add_subkey(FakeKey::new(segment))?,
            };
        }

        parent.add_subkey(key)
    }

    fn root_handle(&self) -> FakeKey {
        FakeKey {
            node: Rc::clone(&self.root),
            path: join_key_path([self.key_path_prefix.borrow().as_str()]),
        }
    }
}

impl Default for FakeFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFile for FakeFile {
    fn key_path_prefix(&self) -> String {
        self.key_path_prefix.borrow().clone()
    }

    fn set_key_path_prefix(&self, key_path_prefix: &str) {
        *self.key_path_prefix.borrow_mut() = key_path_prefix.to_string();
    }

    fn root_key(&self) -> Option<Key> {
        if self.closed.get() {
            return None;
        }
        Some(Key::Fake(self.root_handle()))
    }

    fn get_key_by_path(&self, key_path: &str) -> Option<Key> {
        if self.closed.get() {
            return None;
        }
        let relative_path = relative_key_path(key_path, &self.key_path_prefix.borrow())?;

        let mut key = self.root_handle();
        for segment in split_key_path(&relative_path) {
            key = key.find_subkey(segment)?;
        }
        Some(Key::Fake(key))
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

#[derive(Debug, Clone)]
struct FakeNode {
    name: String,
    class_name: Option<String>,
    last_written_time: LastWrittenTime,
    offset: Option<u32>,
    subkeys: RefCell<Vec<Rc<FakeNode>>>,
    values: RefCell<Vec<FakeValue>>,
}

impl FakeNode {
    fn new(name: String) -> Self {
        Self {
            name,
            class_name: None,
            last_written_time: LastWrittenTime::NotSet,
            offset: None,
            subkeys: RefCell::new(Vec::new()),
            values: RefCell::new(Vec::new()),
        }
    }
}

/// In-memory registry key.
///
/// Handles are cheap to clone; clones share subkeys and values.
#[derive(Clone)]
pub struct FakeKey {
    node: Rc<FakeNode>,
    path: String,
}

impl FakeKey {
    /// Creates a detached key without subkeys or values.
    pub fn new(name: &str) -> Self {
        Self {
            node: Rc::new(FakeNode::new(name.to_string())),
            path: join_key_path([name]),
        }
    }

    /// Sets the last written time as a FILETIME.
    pub fn with_last_written_time(mut self, filetime: u64) -> Self {
        Rc::make_mut(&mut self.node).last_written_time = LastWrittenTime::Filetime(filetime);
        self
    }

    /// Sets the offset within the registry file.
    pub fn with_offset(mut self, offset: u32) -> Self {
        Rc::make_mut(&mut self.node).offset = Some(offset);
        self
    }

    /// Sets the class name.
    pub fn with_class_name(mut self, class_name: &str) -> Self {
        Rc::make_mut(&mut self.node).class_name = Some(class_name.to_string());
        self
    }

    /// Adds a subkey and returns a handle to it at its new path.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKey` if a subkey with the same name,
    /// ignoring case, already exists.
    pub fn add_subkey(&self, subkey: FakeKey) -> Result<FakeKey> {
        if self.find_subkey(&subkey.node.name).is_some() {
            return Err(RegistryError::duplicate_subkey(&subkey.node.name));
        }
        self.node.subkeys.borrow_mut().push(Rc::clone(&subkey.node));
        Ok(self.child(subkey.node))
    }

    /// Adds a value.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKey` if a value with the same name,
    /// ignoring case, already exists.
    pub fn add_value(&self, value: FakeValue) -> Result<()> {
        let mut values = self.node.values.borrow_mut();
        if values.iter().any(|existing| key_names_equal(&existing.name, &value.name)) {
            return Err(RegistryError::duplicate_value(&value.name));
        }
        values.push(value);
        Ok(())
    }

    pub(crate) fn with_path(self, path: String) -> Self {
        Self { node: self.node, path }
    }

    fn child(&self, node: Rc<FakeNode>) -> FakeKey {
        let path = join_key_path([self.path.as_str(), node.name.as_str()]);
        FakeKey { node, path }
    }

    fn find_subkey(&self, name: &str) -> Option<FakeKey> {
        let node = self
            .node
            .subkeys
            .borrow()
            .iter()
            .find(|subkey| key_names_equal(&subkey.name, name))
            .cloned()?;
        Some(self.child(node))
    }
}

impl fmt::Debug for FakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeKey")
            .field("name", &self.node.name)
            .field("path", &self.path)
            .finish()
    }
}

impl RegistryKey for FakeKey {
    fn name(&self) -> &str {
        &self.node.name
    }

    fn class_name(&self) -> Option<String> {
        self.node.class_name.clone()
    }

    fn last_written_time(&self) -> LastWrittenTime {
        self.node.last_written_time
    }

    fn number_of_subkeys(&self) -> usize {
        self.node.subkeys.borrow().len()
    }

    fn number_of_values(&self) -> usize {
        self.node.values.borrow().len()
    }

    fn offset(&self) -> Option<u32> {
        self.node.offset
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn get_subkey_by_index(&self, index: usize) -> Result<Key> {
        let subkeys = self.node.subkeys.borrow();
        let node = subkeys.get(index).ok_or(RegistryError::IndexOutOfRange {
            index,
            count: subkeys.len(),
        })?;
        Ok(Key::Fake(self.child(Rc::clone(node))))
    }

    fn get_subkey_by_name(&self, name: &str) -> Option<Key> {
        self.find_subkey(name).map(Key::Fake)
    }

    fn get_subkeys(&self) -> Box<dyn Iterator<Item = Key>> {
        let parent = self.clone();
        let nodes = self.node.subkeys.borrow().clone();
        Box::new(nodes.into_iter().map(move |node| Key::Fake(parent.child(node))))
    }

    fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.node
            .values
            .borrow()
            .iter()
            .find(|value| key_names_equal(&value.name, name))
            .cloned()
            .map(Value::Fake)
    }

    fn get_values(&self) -> Box<dyn Iterator<Item = Value>> {
        let values = self.node.values.borrow().clone();
        Box::new(values.into_iter().map(Value::Fake))
    }
}

/// In-memory registry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeValue {
    name: String,
    data: Vec<u8>,
    data_type: ValueType,
    offset: Option<u32>,
}

impl FakeValue {
    /// Creates a value with raw data.
    pub fn new(name: &str, data: Vec<u8>, data_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            data,
            data_type,
            offset: None,
        }
    }

    /// Creates a REG_SZ value, stored NUL terminated.
    pub fn string(name: &str, text: &str) -> Self {
        Self::new(name, encode_utf16(&[text]), ValueType::String)
    }

    /// Creates a REG_EXPAND_SZ value, stored NUL terminated.
    pub fn expand_string(name: &str, text: &str) -> Self {
        Self::new(name, encode_utf16(&[text]), ValueType::ExpandString)
    }

    /// Creates a REG_MULTI_SZ value.
    pub fn multi_string(name: &str, strings: &[&str]) -> Self {
        let mut data = encode_utf16(strings);
        data.extend_from_slice(&[0, 0]);
        Self::new(name, data, ValueType::MultiString)
    }

    /// Creates a REG_DWORD value.
    pub fn dword(name: &str, value: u32) -> Self {
        Self::new(name, value.to_le_bytes().to_vec(), ValueType::Dword)
    }

    /// Creates a REG_QWORD value.
    pub fn qword(name: &str, value: u64) -> Self {
        Self::new(name, value.to_le_bytes().to_vec(), ValueType::Qword)
    }

    /// Sets the offset within the registry file.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl RegistryValue for FakeValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_type(&self) -> ValueType {
        self.data_type
    }

    fn data(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn offset(&self) -> Option<u32> {
        self.offset
    }
}

/// Encodes strings as UTF-16LE, each followed by a NUL character.
fn encode_utf16(strings: &[&str]) -> Vec<u8> {
    strings
        .iter()
        .flat_map(|text| text.encode_utf16().chain(std::iter::once(0)))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueData;

    fn software_file() -> FakeFile {
        let file = FakeFile::new();
        let microsoft = file
            .add_key_by_path("\\", FakeKey::new("Microsoft").with_offset(0x20))
            .unwrap();
        microsoft
            .add_value(FakeValue::string("Owner", "Contoso"))
            .unwrap();
        file.add_key_by_path("\\Microsoft\\Windows", FakeKey::new("CurrentVersion"))
            .unwrap();
        file
    }

    #[test]
    fn test_add_key_by_path_creates_parents() {
        let file = software_file();
        let key = file
            .get_key_by_path("\\Microsoft\\Windows\\CurrentVersion")
            .unwrap();
        assert_eq!(key.name(), "CurrentVersion");
        assert_eq!(key.path(), "\\Microsoft\\Windows\\CurrentVersion");
        assert!(matches!(
            file.add_key_by_path("\\Microsoft\\Windows", FakeKey::new("CURRENTVERSION")),
            Err(RegistryError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_key_path_prefix() {
        let file = software_file();
        file.set_key_path_prefix("HKEY_LOCAL_MACHINE\\Software");

        let key = file
            .get_key_by_path("HKEY_LOCAL_MACHINE\\Software\\microsoft")
            .unwrap();
        assert_eq!(key.path(), "HKEY_LOCAL_MACHINE\\Software\\Microsoft");
        assert_eq!(key.offset(), Some(0x20));

        assert!(file.get_key_by_path("HKEY_LOCAL_MACHINE\\System").is_none());
        assert_eq!(file.root_key().unwrap().path(), "HKEY_LOCAL_MACHINE\\Software");
    }

    #[test]
    fn test_subkey_by_index() {
        let file = software_file();
        let root = file.root_key().unwrap();
        assert_eq!(root.get_subkey_by_index(0).unwrap().name(), "Microsoft");
        assert!(matches!(
            root.get_subkey_by_index(1),
            Err(RegistryError::IndexOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_values() {
        let key = FakeKey::new("Select");
        key.add_value(FakeValue::dword("Current", 1)).unwrap();
        assert!(matches!(
            key.add_value(FakeValue::dword("current", 2)),
            Err(RegistryError::DuplicateKey { .. })
        ));

        let value = key.get_value_by_name("CURRENT").unwrap();
        assert!(value.data_is_integer());
        assert_eq!(value.get_data_as_object().unwrap(), ValueData::Dword(1));
        assert_eq!(key.get_values().count(), 1);
    }

    #[test]
    fn test_multi_string_value() {
        let value = FakeValue::multi_string("List", &["a", "b"]);
        assert_eq!(
            value.get_data_as_object().unwrap(),
            ValueData::MultiString(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_closed_file() {
        let file = software_file();
        file.close();
        file.close();
        assert!(file.root_key().is_none());
        assert!(file.get_key_by_path("\\Microsoft").is_none());
    }

    #[test]
    fn test_recurse_keys() {
        let file = software_file();
        let names: Vec<String> = file.recurse_keys().map(|key| key.path()).collect();
        assert_eq!(
            names,
            vec![
                "\\",
                "\\Microsoft",
                "\\Microsoft\\Windows",
                "\\Microsoft\\Windows\\CurrentVersion"
            ]
        );
    }
}
