//! # Windows Registry Namespace
//!
//! A virtual Windows Registry assembled from registry files, with key search
//! by literal path, glob or regular expression.
//!
//! ## Features
//!
//! - **Unified namespace**: registry files mounted under key path prefixes such as
//!   `HKEY_LOCAL_MACHINE\System`, resolved by longest prefix match
//! - **Virtual keys**: `HKEY_LOCAL_MACHINE\System\CurrentControlSet` and the
//!   per-user keys under `HKEY_USERS` are computed from the registry content
//! - **Lazy loading**: registry files are opened on first use through a
//!   caller-supplied reader, keys are read only when visited
//! - **Search**: literal, glob and regular expression key path patterns with
//!   depth-bounded traversal
//! - **NT registry files**: memory-mapped, read-only REGF parser
//!
//! ## Architecture
//!
//! ```text
//! Registry ──── key path prefix ──► RegistryFile (RegfFile, FakeFile)
//!    │                                   │
//!    └── get_root_key ──► VirtualKey ──► Key ──► Value
//!                            ▲
//! RegistrySearcher ── FindSpec
//! ```
//!
//! ## Examples
//!
//! ### Looking up keys
//!
//! ```no_run
//! use reg_vfs::regf::RegfFile;
//! use reg_vfs::{Registry, RegistryKey, RegistryOptions, RegistryValue};
//! use std::rc::Rc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new(RegistryOptions::default(), None)?;
//! let system = RegfFile::open("SYSTEM", registry.ascii_codepage())?;
//! registry.map_file("HKEY_LOCAL_MACHINE\\System", Rc::new(system))?;
//!
//! let key = registry
//!     .get_key_by_path("HKLM\\System\\CurrentControlSet\\Control\\ComputerName\\ComputerName")?
//!     .ok_or("key not found")?;
//! for value in key.get_values() {
//!     println!("{} = {}", value.name(), value.get_data_as_object()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Searching
//!
//! ```no_run
//! use reg_vfs::{FindSpec, Registry, RegistryOptions, RegistrySearcher};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let registry = Registry::new(RegistryOptions::default(), None)?;
//! let find_spec = FindSpec::builder()
//!     .key_path_glob("HKEY_LOCAL_MACHINE\\System\\ControlSet*\\Services\\*")
//!     .build()?;
//!
//! for key_path in RegistrySearcher::new(&registry).find(vec![find_spec]) {
//!     println!("{}", key_path);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fake;
pub mod file;
pub mod glob;
pub mod key;
pub mod key_path;
pub mod regf;
pub mod registry;
pub mod searcher;
pub mod value;
pub mod virtual_key;

// Re-export main types for convenience
pub use error::{RegistryError, Result};
pub use file::{RegistryFile, RegistryFileReader};
pub use key::{Key, LastWrittenTime, RecurseKeys, RegistryKey};
pub use registry::{Registry, RegistryOptions};
pub use searcher::{Find, FindSpec, FindSpecBuilder, PatternSource, RegistrySearcher};
pub use value::{RegistryValue, Value, ValueData, ValueType};
pub use virtual_key::VirtualKey;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
