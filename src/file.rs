//! Registry file (hive backend) contract.
//!
//! A registry file holds one subtree of the registry. It is mounted at a key
//! path prefix, such as `HKEY_LOCAL_MACHINE\System`, and translates absolute
//! key paths under that prefix into its own relative paths.

use crate::error::Result;
use crate::key::Key;
use crate::key_path::strip_key_path_prefix;
use encoding_rs::Encoding;
use std::rc::Rc;

/// Operations every registry file supports.
pub trait RegistryFile {
    /// Returns the key path prefix the file is mounted at.
    fn key_path_prefix(&self) -> String;

    /// Sets the key path prefix the file is mounted at.
    fn set_key_path_prefix(&self, key_path_prefix: &str);

    /// Returns the root key, or `None` if the file has none or is closed.
    fn root_key(&self) -> Option<Key>;

    /// Retrieves a key by path.
    ///
    /// The path is either absolute, starting with the key path prefix, or
    /// relative to the file root, starting with a separator.
    fn get_key_by_path(&self, key_path: &str) -> Option<Key>;

    /// Closes the file. Closing twice has no effect.
    fn close(&self);

    /// Walks all keys of the file, starting with the root key.
    fn recurse_keys(&self) -> Box<dyn Iterator<Item = Key>> {
        match self.root_key() {
            Some(root_key) => Box::new(root_key.recurse_keys()),
            None => Box::new(std::iter::empty()),
        }
    }
}

/// Opens registry files by their conventional Windows path.
///
/// The path is templated, for example `%SystemRoot%\System32\config\SYSTEM`;
/// substituting and locating it is up to the implementation.
pub trait RegistryFileReader {
    /// Opens the registry file at `path`.
    ///
    /// Returns `Ok(None)` if no such file is available.
    fn open(&self, path: &str, ascii_codepage: &'static Encoding) -> Result<Option<Rc<dyn RegistryFile>>>;
}

impl<F> RegistryFileReader for F
where
    F: Fn(&str, &'static Encoding) -> Result<Option<Rc<dyn RegistryFile>>>,
{
    fn open(&self, path: &str, ascii_codepage: &'static Encoding) -> Result<Option<Rc<dyn RegistryFile>>> {
        self(path, ascii_codepage)
    }
}

/// Translates a key path into a path relative to the file root.
///
/// Relative paths start with a separator and are returned as they are,
/// absolute paths must start with the key path prefix.
pub(crate) fn relative_key_path(key_path: &str, key_path_prefix: &str) -> Option<String> {
    if key_path.starts_with('\\') {
        return Some(key_path.to_string());
    }
    strip_key_path_prefix(key_path, key_path_prefix)
}
