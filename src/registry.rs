//! The registry namespace.
//!
//! A [`Registry`] mounts registry files under key path prefixes and answers
//! lookups of absolute key paths. Two regions of the namespace are computed
//! rather than stored:
//!
//! - `HKEY_LOCAL_MACHINE\System\CurrentControlSet` is redirected to the
//!   control set selected in `HKEY_LOCAL_MACHINE\System\Select`.
//! - `HKEY_USERS\<SID>` is served by the user registry file of the profile
//!   listed in the `ProfileList` of the software registry file.
//!
//! # Examples
//!
//! ```rust
//! use reg_vfs::fake::{FakeFile, FakeKey};
//! use reg_vfs::{Registry, RegistryKey, RegistryOptions};
//! use std::rc::Rc;
//!
//! # fn main() -> reg_vfs::Result<()> {
//! let software = FakeFile::new();
//! software.add_key_by_path("\\Microsoft", FakeKey::new("Windows"))?;
//!
//! let registry = Registry::new(RegistryOptions::default(), None)?;
//! registry.map_file("HKLM\\Software", Rc::new(software))?;
//!
//! let key = registry.get_key_by_path("HKEY_LOCAL_MACHINE\\Software\\Microsoft\\Windows")?;
//! assert_eq!(key.unwrap().name(), "Windows");
//! # Ok(())
//! # }
//! ```

use crate::error::{RegistryError, Result};
use crate::file::{RegistryFile, RegistryFileReader};
use crate::key::{Key, RegistryKey};
use crate::key_path::{
    has_key_path_prefix, join_key_path, key_names_equal, resolve_root_key, split_key_path,
    strip_key_path_prefix, ROOT_KEYS,
};
use crate::value::{RegistryValue, ValueData};
use crate::virtual_key::VirtualKey;
use encoding_rs::Encoding;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};
use tracing::{debug, instrument, warn};

const CURRENT_CONTROL_SET_KEY_PATH: &str = "HKEY_LOCAL_MACHINE\\System\\CurrentControlSet";
const SELECT_KEY_PATH: &str = "HKEY_LOCAL_MACHINE\\System\\Select";
const PROFILE_LIST_KEY_PATH: &str =
    "HKEY_LOCAL_MACHINE\\Software\\Microsoft\\Windows NT\\CurrentVersion\\ProfileList";
const USERS_KEY_PATH: &str = "HKEY_USERS";

/// `Select` values checked for the current control set, in priority order.
const CONTROL_SET_VALUE_NAMES: [&str; 3] = ["Current", "Default", "LastKnownGood"];

/// Security identifier the `.DEFAULT` user key stands for.
const DEFAULT_USER_SID: &str = "S-1-5-18";
const CLASSES_SUFFIX: &str = "_CLASSES";

/// Conventional location and content of a registry file.
struct FileMapping {
    key_path_prefix: &'static str,
    windows_path: &'static str,

    /// Key paths that identify the registry file by content.
    unique_key_paths: &'static [&'static str],
}

const NT_FILE_MAPPINGS: [FileMapping; 7] = [
    FileMapping {
        key_path_prefix: "HKEY_CURRENT_USER",
        windows_path: "%UserProfile%\\NTUSER.DAT",
        unique_key_paths: &["\\Software\\Microsoft\\Windows\\CurrentVersion\\Explorer"],
    },
    FileMapping {
        key_path_prefix: "HKEY_CURRENT_USER\\Software\\Classes",
        windows_path: "%UserProfile%\\AppData\\Local\\Microsoft\\Windows\\UsrClass.dat",
        unique_key_paths: &["\\Local Settings\\Software\\Microsoft\\Windows\\CurrentVersion"],
    },
    FileMapping {
        key_path_prefix: "HKEY_CURRENT_USER\\Software\\Classes",
        windows_path: "%UserProfile%\\Local Settings\\Application Data\\Microsoft\\Windows\\UsrClass.dat",
        unique_key_paths: &[],
    },
    FileMapping {
        key_path_prefix: "HKEY_LOCAL_MACHINE\\SAM",
        windows_path: "%SystemRoot%\\System32\\config\\SAM",
        unique_key_paths: &["\\SAM\\Domains\\Account\\Users"],
    },
    FileMapping {
        key_path_prefix: "HKEY_LOCAL_MACHINE\\Security",
        windows_path: "%SystemRoot%\\System32\\config\\SECURITY",
        unique_key_paths: &["\\Policy\\PolAdtEv"],
    },
    FileMapping {
        key_path_prefix: "HKEY_LOCAL_MACHINE\\Software",
        windows_path: "%SystemRoot%\\System32\\config\\SOFTWARE",
        unique_key_paths: &["\\Microsoft\\Windows\\CurrentVersion\\App Paths"],
    },
    FileMapping {
        key_path_prefix: "HKEY_LOCAL_MACHINE\\System",
        windows_path: "%SystemRoot%\\System32\\config\\SYSTEM",
        unique_key_paths: &["\\Select"],
    },
];

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryOptions {
    /// Codepage of key and value names stored as ASCII, for example `cp1252`.
    pub ascii_codepage: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            ascii_codepage: "cp1252".to_string(),
        }
    }
}

/// A registry file and the key path prefix it was mounted at.
struct MappedFile {
    key_path_prefix: String,
    file: Rc<dyn RegistryFile>,
}

/// Windows Registry namespace assembled from registry files.
pub struct Registry {
    state: Rc<RegistryState>,
}

/// State shared between a registry and the virtual keys it creates.
pub(crate) struct RegistryState {
    ascii_codepage: &'static Encoding,
    reader: Option<Box<dyn RegistryFileReader>>,

    /// Mounted registry files, keyed by upper case key path prefix.
    files: RefCell<HashMap<String, MappedFile>>,

    /// User registry files, keyed by upper case Windows path.
    user_files: RefCell<HashMap<String, Rc<dyn RegistryFile>>>,

    /// Cleared whenever the set of mapped files changes.
    root_key: RefCell<Option<VirtualKey>>,
}

impl Drop for RegistryState {
    fn drop(&mut self) {
        let mut closed = HashSet::new();
        let files = self.files.get_mut().drain().map(|(_, mapped)| mapped.file);
        let user_files = self.user_files.get_mut().drain().map(|(_, file)| file);

        for file in files.chain(user_files) {
            if closed.insert(Rc::as_ptr(&file) as *const ()) {
                file.close();
            }
        }
    }
}

impl Registry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `options` - Registry configuration.
    /// * `reader` - Opens registry files at their conventional Windows path
    ///   when a lookup needs a file that is not mapped yet.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownCodepage` if the ASCII codepage is not
    /// a known encoding label.
    pub fn new(options: RegistryOptions, reader: Option<Box<dyn RegistryFileReader>>) -> Result<Self> {
        let ascii_codepage = Encoding::for_label(options.ascii_codepage.as_bytes())
            .ok_or_else(|| RegistryError::UnknownCodepage(options.ascii_codepage.clone()))?;

        Ok(Self {
            state: Rc::new(RegistryState {
                ascii_codepage,
                reader,
                files: RefCell::new(HashMap::new()),
                user_files: RefCell::new(HashMap::new()),
                root_key: RefCell::new(None),
            }),
        })
    }

    pub(crate) fn upgrade(state: &Weak<RegistryState>) -> Option<Registry> {
        state.upgrade().map(|state| Registry { state })
    }

    /// Returns the codepage of key and value names stored as ASCII.
    pub fn ascii_codepage(&self) -> &'static Encoding {
        self.state.ascii_codepage
    }

    /// Mounts a registry file at a key path prefix.
    ///
    /// A file previously mounted at the same prefix is closed.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnsupportedRoot` if the prefix does not start
    /// with a root key.
    pub fn map_file(&self, key_path_prefix: &str, file: Rc<dyn RegistryFile>) -> Result<()> {
        let key_path_prefix = normalize_key_path(key_path_prefix)?;
        file.set_key_path_prefix(&key_path_prefix);

        let mapped = MappedFile {
            key_path_prefix: key_path_prefix.clone(),
            file: Rc::clone(&file),
        };
        let replaced = self
            .state
            .files
            .borrow_mut()
            .insert(key_path_prefix.to_uppercase(), mapped);
        if let Some(replaced) = replaced {
            if !Rc::ptr_eq(&replaced.file, &file) {
                replaced.file.close();
            }
        }
        self.state.root_key.borrow_mut().take();

        debug!(key_path_prefix = %key_path_prefix, "Mapped registry file");
        Ok(())
    }

    /// Registers a user registry file by its Windows path, for example
    /// `C:\Users\user\NTUSER.DAT`.
    ///
    /// User registry files are mounted under `HKEY_USERS` when a lookup
    /// resolves to the profile they belong to.
    pub fn map_user_file(&self, path: &str, file: Rc<dyn RegistryFile>) {
        let replaced = self
            .state
            .user_files
            .borrow_mut()
            .insert(path.to_uppercase(), Rc::clone(&file));
        if let Some(replaced) = replaced {
            if !Rc::ptr_eq(&replaced, &file) {
                replaced.close();
            }
        }
        self.state.root_key.borrow_mut().take();
        debug!(path = %path, "Mapped user registry file");
    }

    /// Retrieves a key by its absolute path.
    ///
    /// Returns `Ok(None)` if no registry file provides the key.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnsupportedRoot` if the path does not start
    /// with a root key or alias, and `RegistryError::PrefixMismatch` if the
    /// selected registry file is not mounted above the path.
    #[instrument(skip(self))]
    pub fn get_key_by_path(&self, key_path: &str) -> Result<Option<Key>> {
        let key_path = normalize_key_path(key_path)?;

        if let Some(remainder) = strip_key_path_prefix(&key_path, CURRENT_CONTROL_SET_KEY_PATH) {
            return self.get_current_control_set_key(&key_path, &remainder);
        }
        if let Some(remainder) = strip_key_path_prefix(&key_path, USERS_KEY_PATH) {
            return self.get_user_key(&key_path, &remainder);
        }

        let key_path_upper = key_path.to_uppercase();
        let Some((key_path_prefix_upper, file)) = self.get_file_by_path(&key_path_upper) else {
            debug!("No registry file mapped");
            return Ok(None);
        };

        if !has_key_path_prefix(&key_path_upper, &key_path_prefix_upper) {
            return Err(RegistryError::PrefixMismatch {
                prefix: key_path_prefix_upper,
                key_path,
            });
        }
        let relative_key_path = strip_key_path_prefix(&key_path, &key_path_prefix_upper).ok_or_else(|| {
            RegistryError::PrefixMismatch {
                prefix: key_path_prefix_upper.clone(),
                key_path: key_path.clone(),
            }
        })?;

        Ok(file.get_key_by_path(&relative_key_path))
    }

    /// Returns the root key of the namespace.
    ///
    /// The root key has a subkey per root key name and a virtual key at
    /// every conventional mount point and every prefix passed to
    /// [`Registry::map_file`], with the keys between them. The virtual keys
    /// resolve their content through this registry when first accessed.
    ///
    /// Keys keep their resolution once accessed. Mapping a file discards the
    /// cached root key, so only root keys retrieved afterwards see it.
    pub fn get_root_key(&self) -> VirtualKey {
        if let Some(root_key) = &*self.state.root_key.borrow() {
            return root_key.clone();
        }
        let root_key = self.build_root_key();
        *self.state.root_key.borrow_mut() = Some(root_key.clone());
        root_key
    }

    /// Determines the key path prefix of a registry file from its content.
    ///
    /// Returns `Ok(None)` if the file matches no known registry file.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AmbiguousMapping` if the file matches more
    /// than one known registry file.
    pub fn get_registry_file_mapping(&self, file: &dyn RegistryFile) -> Result<Option<String>> {
        let candidates: BTreeSet<&'static str> = NT_FILE_MAPPINGS
            .iter()
            .filter(|mapping| !mapping.unique_key_paths.is_empty())
            .filter(|mapping| {
                mapping
                    .unique_key_paths
                    .iter()
                    .all(|key_path| file.get_key_by_path(key_path).is_some())
            })
            .map(|mapping| mapping.key_path_prefix)
            .collect();

        let mut prefixes = candidates.iter();
        match (prefixes.next(), prefixes.next(), prefixes.next()) {
            (None, _, _) => Ok(None),
            (Some(prefix), None, _) => Ok(Some(prefix.to_string())),
            (Some(&"HKEY_CURRENT_USER"), Some(&"HKEY_CURRENT_USER\\Software\\Classes"), None) => {
                Ok(Some("HKEY_CURRENT_USER".to_string()))
            }
            _ => Err(RegistryError::AmbiguousMapping(
                candidates.iter().map(|prefix| prefix.to_string()).collect(),
            )),
        }
    }

    /// Splits a key path into its segments.
    pub fn split_key_path<'a>(&self, key_path: &'a str) -> Vec<&'a str> {
        split_key_path(key_path)
    }

    fn build_root_key(&self) -> VirtualKey {
        let registry = Rc::downgrade(&self.state);
        let root_key = VirtualKey::new("");

        for root_key_name in ROOT_KEYS {
            add_virtual_subkey(&root_key, VirtualKey::with_resolver(root_key_name, Weak::clone(&registry)));
        }

        let mut mapped_key_path_prefixes: Vec<String> = self
            .state
            .files
            .borrow()
            .values()
            .map(|mapped| mapped.key_path_prefix.clone())
            .collect();
        mapped_key_path_prefixes.sort();

        let key_path_prefixes = NT_FILE_MAPPINGS
            .iter()
            .map(|mapping| mapping.key_path_prefix.to_string())
            .chain(mapped_key_path_prefixes);
        for key_path_prefix in key_path_prefixes {
            // Computed regions list their own subkeys.
            if strip_key_path_prefix(&key_path_prefix, CURRENT_CONTROL_SET_KEY_PATH).is_some()
                || strip_key_path_prefix(&key_path_prefix, USERS_KEY_PATH).is_some()
            {
                continue;
            }

            let mut parent = root_key.clone();
            for name in split_key_path(&key_path_prefix) {
                parent = match parent.virtual_subkey(name) {
                    Some(subkey) => subkey,
                    None => {
                        let subkey = VirtualKey::with_resolver(name, Weak::clone(&registry));
                        add_virtual_subkey(&parent, subkey.clone());
                        subkey
                    }
                };
            }
        }
        root_key
    }

    /// Finds the registry file mounted at the longest prefix of the key path,
    /// opening one through the reader if none is mounted.
    fn get_file_by_path(&self, key_path_upper: &str) -> Option<(String, Rc<dyn RegistryFile>)> {
        let cached = self
            .state
            .files
            .borrow()
            .iter()
            .filter(|(prefix_upper, _)| has_key_path_prefix(key_path_upper, prefix_upper))
            .max_by_key(|(prefix_upper, _)| prefix_upper.len())
            .map(|(prefix_upper, mapped)| (prefix_upper.clone(), Rc::clone(&mapped.file)));
        if cached.is_some() {
            return cached;
        }

        let mut candidates: Vec<&FileMapping> = NT_FILE_MAPPINGS
            .iter()
            .filter(|mapping| has_key_path_prefix(key_path_upper, &mapping.key_path_prefix.to_uppercase()))
            .collect();
        candidates.sort_by_key(|mapping| std::cmp::Reverse(mapping.key_path_prefix.len()));

        for mapping in candidates {
            let file = match self.open_file(mapping.windows_path) {
                Ok(Some(file)) => file,
                Ok(None) => continue,
                Err(error) => {
                    warn!(path = %mapping.windows_path, error = %error, "Unable to open registry file");
                    continue;
                }
            };

            if let Err(error) = self.map_file(mapping.key_path_prefix, Rc::clone(&file)) {
                warn!(error = %error, "Unable to map registry file");
                continue;
            }
            return Some((mapping.key_path_prefix.to_uppercase(), file));
        }
        None
    }

    fn open_file(&self, path: &str) -> Result<Option<Rc<dyn RegistryFile>>> {
        match &self.state.reader {
            Some(reader) => {
                debug!(path = %path, "Opening registry file");
                reader.open(path, self.state.ascii_codepage)
            }
            None => Ok(None),
        }
    }

    fn get_current_control_set_key(&self, key_path: &str, remainder: &str) -> Result<Option<Key>> {
        let Some(control_set_key_path) = self.get_current_control_set_key_path()? else {
            debug!("Unable to determine current control set");
            return Ok(None);
        };

        let resolved_key_path = join_key_path([control_set_key_path.as_str(), remainder]);
        let key = self.get_key_by_path(&resolved_key_path)?;
        Ok(key.map(|key| key.with_path(key_path.to_string())))
    }

    /// Determines the key path of the current control set, for example
    /// `HKEY_LOCAL_MACHINE\System\ControlSet001`.
    fn get_current_control_set_key_path(&self) -> Result<Option<String>> {
        let Some(select_key) = self.get_key_by_path(SELECT_KEY_PATH)? else {
            return Ok(None);
        };

        for value_name in CONTROL_SET_VALUE_NAMES {
            let Some(value) = select_key.get_value_by_name(value_name) else {
                continue;
            };
            if !value.data_is_integer() {
                continue;
            }

            let control_set = match value.get_data_as_object() {
                Ok(data) => data.as_integer(),
                Err(error) => {
                    warn!(value_name, error = %error, "Unable to read control set number");
                    continue;
                }
            };
            if let Some(control_set) = control_set.filter(|number| (1..=999).contains(number)) {
                return Ok(Some(format!("HKEY_LOCAL_MACHINE\\System\\ControlSet{:03}", control_set)));
            }
        }
        Ok(None)
    }

    fn get_user_key(&self, key_path: &str, remainder: &str) -> Result<Option<Key>> {
        let segments = split_key_path(remainder);
        let Some(&user_key_name) = segments.first() else {
            return Ok(Some(Key::Virtual(self.get_users_key()?)));
        };

        let (profile_name, class_file) = match strip_suffix_ignore_ascii_case(user_key_name, CLASSES_SUFFIX) {
            Some(profile_name) => (profile_name, true),
            None => (user_key_name, false),
        };
        let profile_name = if profile_name.eq_ignore_ascii_case(".DEFAULT") {
            DEFAULT_USER_SID
        } else {
            profile_name
        };

        let Some(profile_key) = self.get_profile_key(profile_name)? else {
            debug!(profile_name, "No such profile");
            return Ok(None);
        };
        let Some(profile_path) = profile_image_path(&profile_key) else {
            return Ok(None);
        };
        let Some(file) = self.get_user_file(&profile_path, class_file) else {
            debug!(profile_path = %profile_path, class_file, "User registry file not mapped");
            return Ok(None);
        };

        file.set_key_path_prefix(&join_key_path([USERS_KEY_PATH, user_key_name]));
        let key = file.get_key_by_path(key_path);
        Ok(key.map(|key| key.with_path(key_path.to_string())))
    }

    /// Lists the profiles with a mapped user registry file as subkeys of
    /// `HKEY_USERS`.
    fn get_users_key(&self) -> Result<VirtualKey> {
        let registry = Rc::downgrade(&self.state);
        let users_key = VirtualKey::new(USERS_KEY_PATH);

        let Some(profile_list_key) = self.get_key_by_path(PROFILE_LIST_KEY_PATH)? else {
            return Ok(users_key);
        };
        for profile_key in profile_list_key.get_subkeys() {
            let Some(profile_path) = profile_image_path(&profile_key) else {
                continue;
            };
            if self.get_user_file(&profile_path, false).is_some() {
                let name = profile_key.name();
                add_virtual_subkey(&users_key, VirtualKey::with_resolver(name, Weak::clone(&registry)));
            }
            if self.get_user_file(&profile_path, true).is_some() {
                let name = format!("{}_Classes", profile_key.name());
                add_virtual_subkey(&users_key, VirtualKey::with_resolver(&name, Weak::clone(&registry)));
            }
        }
        Ok(users_key)
    }

    fn get_profile_key(&self, profile_name: &str) -> Result<Option<Key>> {
        let Some(profile_list_key) = self.get_key_by_path(PROFILE_LIST_KEY_PATH)? else {
            return Ok(None);
        };
        let profile_key = profile_list_key
            .get_subkeys()
            .find(|profile_key| key_names_equal(profile_key.name(), profile_name));
        Ok(profile_key)
    }

    fn get_user_file(&self, profile_path: &str, class_file: bool) -> Option<Rc<dyn RegistryFile>> {
        let profile_path = profile_path.trim_end_matches('\\');
        let path = if class_file {
            format!("{}\\AppData\\Local\\Microsoft\\Windows\\UsrClass.dat", profile_path)
        } else {
            format!("{}\\NTUSER.DAT", profile_path)
        };
        self.state.user_files.borrow().get(&path.to_uppercase()).cloned()
    }
}

/// Resolves the root key alias and collapses separators.
fn normalize_key_path(key_path: &str) -> Result<String> {
    let mut segments = split_key_path(key_path);
    let root_key_name = segments.first().copied().unwrap_or_default();
    let root_key = resolve_root_key(root_key_name)
        .ok_or_else(|| RegistryError::UnsupportedRoot(root_key_name.to_string()))?;

    segments[0] = root_key;
    Ok(join_key_path(segments))
}

fn profile_image_path(profile_key: &Key) -> Option<String> {
    let value = profile_key.get_value_by_name("ProfileImagePath")?;
    match value.get_data_as_object() {
        Ok(ValueData::String(path)) => Some(path),
        Ok(_) => {
            warn!(key_path = %profile_key.path(), "ProfileImagePath is not a string");
            None
        }
        Err(error) => {
            warn!(key_path = %profile_key.path(), error = %error, "Unable to read ProfileImagePath");
            None
        }
    }
}

fn strip_suffix_ignore_ascii_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) || !name[split..].eq_ignore_ascii_case(suffix) {
        return None;
    }
    Some(&name[..split])
}

fn add_virtual_subkey(parent: &VirtualKey, subkey: VirtualKey) {
    if let Err(error) = parent.add_subkey(subkey) {
        warn!(key_path = %parent.path(), error = %error, "Unable to add virtual key");
    }
}
