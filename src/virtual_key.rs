//! Keys synthesized by the registry.
//!
//! A virtual key either proxies a key found through the registry, holds
//! synthetic subkeys, or both. The root key, the mount points of registry
//! files and `HKEY_LOCAL_MACHINE\System\CurrentControlSet` are virtual keys.
//!
//! Resolution happens once, on first access. Afterwards the key never asks
//! the registry again, even when resolution found nothing. The resolved
//! delegate and its subkeys are published together, so a read made while
//! resolution is still running resolves on its own instead of observing a
//! half-built key.

use crate::error::{RegistryError, Result};
use crate::key::{Key, LastWrittenTime, RegistryKey};
use crate::key_path::{join_key_path, key_names_equal};
use crate::registry::{Registry, RegistryState};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

const SYSTEM_KEY_PATH: &str = "HKEY_LOCAL_MACHINE\\System";
const CURRENT_CONTROL_SET: &str = "CurrentControlSet";

/// A key with no direct representation in a registry file.
///
/// Handles are cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct VirtualKey(Rc<VirtualNode>);

struct VirtualNode {
    name: String,
    path: RefCell<String>,
    resolution: RefCell<Resolution>,
    subkeys: RefCell<Vec<Key>>,
}

enum Resolution {
    Unresolved(Source),
    Resolved(Option<Key>),
}

#[derive(Clone)]
enum Source {
    /// Looks up the key path of the virtual key in the registry.
    Registry(Weak<RegistryState>),

    /// Delegates to a known key.
    Key(Key),
}

impl VirtualKey {
    /// Creates a virtual key without delegate.
    pub fn new(name: &str) -> Self {
        Self::with_resolution(name, Resolution::Resolved(None))
    }

    /// Creates a virtual key that delegates values and metadata to `key`
    /// and exposes its subkeys next to its own.
    pub fn with_key(name: &str, key: Key) -> Self {
        Self::with_resolution(name, Resolution::Unresolved(Source::Key(key)))
    }

    /// Creates a virtual key resolved through the registry at its key path.
    pub(crate) fn with_resolver(name: &str, registry: Weak<RegistryState>) -> Self {
        Self::with_resolution(name, Resolution::Unresolved(Source::Registry(registry)))
    }

    fn with_resolution(name: &str, resolution: Resolution) -> Self {
        VirtualKey(Rc::new(VirtualNode {
            name: name.to_string(),
            path: RefCell::new(join_key_path([name])),
            resolution: RefCell::new(resolution),
            subkeys: RefCell::new(Vec::new()),
        }))
    }

    /// Adds a synthetic subkey, stamping it with its path below this key.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKey` if a subkey with the same name,
    /// ignoring case, already exists.
    pub fn add_subkey(&self, subkey: impl Into<Key>) -> Result<()> {
        let subkey = subkey.into();
        if self.find_subkey(subkey.name()).is_some() {
            return Err(RegistryError::duplicate_subkey(subkey.name()));
        }

        let subkey_path = join_key_path([self.0.path.borrow().as_str(), subkey.name()]);
        let subkey = subkey.with_path(subkey_path);
        self.0.subkeys.borrow_mut().push(subkey);
        Ok(())
    }

    /// Moves the key to another path, re-stamping all subkeys below it.
    pub fn set_path(&self, key_path: String) {
        let mut subkeys = self.0.subkeys.borrow_mut();
        for subkey in subkeys.iter_mut() {
            let subkey_path = join_key_path([key_path.as_str(), subkey.name()]);
            *subkey = subkey.clone().with_path(subkey_path);
        }
        *self.0.path.borrow_mut() = key_path;
    }

    /// Returns the key this key delegates to, resolving it if needed.
    pub fn delegate(&self) -> Option<Key> {
        self.materialize();
        match &*self.0.resolution.borrow() {
            Resolution::Resolved(key) => key.clone(),
            Resolution::Unresolved(_) => None,
        }
    }

    /// Returns the synthetic virtual subkey named `name` without resolving
    /// this key.
    pub(crate) fn virtual_subkey(&self, name: &str) -> Option<VirtualKey> {
        self.find_subkey(name)?.as_virtual().cloned()
    }

    fn find_subkey(&self, name: &str) -> Option<Key> {
        self.0
            .subkeys
            .borrow()
            .iter()
            .find(|subkey| key_names_equal(subkey.name(), name))
            .cloned()
    }

    fn materialize(&self) {
        let source = match &*self.0.resolution.borrow() {
            Resolution::Resolved(_) => return,
            Resolution::Unresolved(source) => source.clone(),
        };

        let key_path = self.0.path.borrow().clone();
        let (delegate, registry) = match source {
            Source::Key(key) => (Some(key), None),
            Source::Registry(registry) => (resolve(&registry, &key_path), Some(registry)),
        };

        let mut absorbed = Vec::new();
        if let Some(delegate) = &delegate {
            for subkey in delegate.get_subkeys() {
                let subkey_path = join_key_path([key_path.as_str(), subkey.name()]);
                absorbed.push(subkey.with_path(subkey_path));
            }
            if let Some(registry) = registry {
                if key_names_equal(&key_path, SYSTEM_KEY_PATH) {
                    let current_control_set = VirtualKey::with_resolver(CURRENT_CONTROL_SET, registry);
                    current_control_set.set_path(join_key_path([key_path.as_str(), CURRENT_CONTROL_SET]));
                    absorbed.push(Key::Virtual(current_control_set));
                }
            }
        } else {
            debug!(key_path = %key_path, "Virtual key has no backing key");
        }

        let mut resolution = self.0.resolution.borrow_mut();
        // A nested read may have resolved the key in the meantime.
        if matches!(*resolution, Resolution::Resolved(_)) {
            return;
        }
        for subkey in absorbed {
            if self.find_subkey(subkey.name()).is_none() {
                self.0.subkeys.borrow_mut().push(subkey);
            }
        }
        *resolution = Resolution::Resolved(delegate);
    }
}

fn resolve(registry: &Weak<RegistryState>, key_path: &str) -> Option<Key> {
    let registry = Registry::upgrade(registry)?;
    match registry.get_key_by_path(key_path) {
        Ok(key) => key,
        Err(error) => {
            warn!(key_path = %key_path, error = %error, "Unable to resolve virtual key");
            None
        }
    }
}

impl fmt::Debug for VirtualKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualKey")
            .field("name", &self.0.name)
            .field("path", &*self.0.path.borrow())
            .field("subkeys", &self.0.subkeys.borrow().len())
            .finish()
    }
}

impl RegistryKey for VirtualKey {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn class_name(&self) -> Option<String> {
        self.delegate()?.class_name()
    }

    fn last_written_time(&self) -> LastWrittenTime {
        self.delegate()
            .map_or(LastWrittenTime::NotSet, |key| key.last_written_time())
    }

    fn number_of_subkeys(&self) -> usize {
        self.materialize();
        self.0.subkeys.borrow().len()
    }

    fn number_of_values(&self) -> usize {
        self.delegate().map_or(0, |key| key.number_of_values())
    }

    fn offset(&self) -> Option<u32> {
        self.delegate()?.offset()
    }

    fn path(&self) -> String {
        self.0.path.borrow().clone()
    }

    fn get_subkey_by_index(&self, index: usize) -> Result<Key> {
        self.materialize();
        let subkeys = self.0.subkeys.borrow();
        subkeys.get(index).cloned().ok_or(RegistryError::IndexOutOfRange {
            index,
            count: subkeys.len(),
        })
    }

    fn get_subkey_by_name(&self, name: &str) -> Option<Key> {
        self.materialize();
        self.find_subkey(name)
    }

    fn get_subkeys(&self) -> Box<dyn Iterator<Item = Key>> {
        self.materialize();
        let subkeys = self.0.subkeys.borrow().clone();
        Box::new(subkeys.into_iter())
    }

    fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.delegate()?.get_value_by_name(name)
    }

    fn get_values(&self) -> Box<dyn Iterator<Item = Value>> {
        match self.delegate() {
            Some(key) => key.get_values(),
            None => Box::new(std::iter::empty()),
        }
    }
}
