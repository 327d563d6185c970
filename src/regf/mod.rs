//! Windows NT registry file (REGF) backend.
//!
//! A read-only parser that maps hive files into memory and reads key nodes,
//! subkey lists and values on demand. Parsed key nodes are cached per hive.
//!
//! Navigation never fails because of a corrupted structure: the problem is
//! logged and the affected key or value is treated as absent.

mod cell;

use crate::error::{RegistryError, Result};
use crate::file::{relative_key_path, RegistryFile};
use crate::key::{Key, LastWrittenTime, RegistryKey};
use crate::key_path::{join_key_path, key_names_equal, split_key_path};
use crate::value::{RegistryValue, Value, ValueType};
use cell::{
    read_i32_le, read_u32_le, BaseBlock, BigData, KeyNode, SubkeyList, ValueKey, BASE_BLOCK_SIZE,
    HBIN_START_OFFSET, MAX_DIRECT_DATA_SIZE, NO_CELL,
};
use encoding_rs::{Encoding, UTF_16LE};
use memmap2::Mmap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, instrument, warn};

/// Depth limit for nested subkey lists; only one level of `ri` is valid.
const MAX_SUBKEY_LIST_DEPTH: usize = 2;

/// Hive data - either memory-mapped or owned.
enum HiveData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl HiveData {
    fn as_slice(&self) -> &[u8] {
        match self {
            HiveData::Mapped(mmap) => mmap,
            HiveData::Owned(data) => data,
        }
    }
}

/// Parsed hive shared by a file and all keys and values read from it.
struct Hive {
    data: HiveData,
    base_block: BaseBlock,
    codepage: &'static Encoding,

    /// Cache of parsed key nodes (offset -> KeyNode).
    key_cache: RefCell<HashMap<u32, Rc<KeyNode>>>,
}

impl Hive {
    fn from_data(data: HiveData, codepage: &'static Encoding) -> Result<Self> {
        let bytes = data.as_slice();
        let base_block = BaseBlock::parse(bytes)?;

        if base_block.major_version != 1 {
            return Err(RegistryError::InvalidFormat(format!(
                "unsupported format version {}.{}",
                base_block.major_version, base_block.minor_version
            )));
        }
        if BaseBlock::calculate_checksum(bytes) != base_block.checksum {
            warn!(checksum = base_block.checksum, "Base block checksum mismatch");
        }
        if base_block.hive_length as usize > bytes.len() - HBIN_START_OFFSET {
            warn!(
                hive_length = base_block.hive_length,
                size = bytes.len(),
                "Hive bins extend past the end of the file"
            );
        }

        Ok(Self {
            data,
            base_block,
            codepage,
            key_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Reads a cell at the given offset.
    ///
    /// # Returns
    ///
    /// Returns the cell data (excluding the size field).
    fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        let data = self.data.as_slice();
        let abs_offset = HBIN_START_OFFSET + offset as usize;

        if offset == NO_CELL || abs_offset >= data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        let size = read_i32_le(data, abs_offset).map_err(|_| RegistryError::TruncatedData {
            offset,
            expected: 4,
            actual: data.len() - abs_offset,
        })?;
        let abs_size = size.unsigned_abs() as usize;
        if abs_size < 4 {
            return Err(RegistryError::InvalidCellSize { size, offset });
        }

        let data_end = abs_offset + abs_size;
        if data_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: abs_size,
                actual: data.len() - abs_offset,
            });
        }

        Ok(&data[abs_offset + 4..data_end])
    }

    fn key_node(&self, offset: u32) -> Result<Rc<KeyNode>> {
        if let Some(node) = self.key_cache.borrow().get(&offset) {
            return Ok(Rc::clone(node));
        }

        let node = Rc::new(KeyNode::parse(self.read_cell(offset)?, offset, self.codepage)?);
        self.key_cache.borrow_mut().insert(offset, Rc::clone(&node));
        Ok(node)
    }

    /// Collects key node offsets of a subkey list, following index roots.
    fn subkey_offsets(&self, list_offset: u32, depth: usize, offsets: &mut Vec<u32>) -> Result<()> {
        if depth >= MAX_SUBKEY_LIST_DEPTH {
            return Err(RegistryError::InvalidFormat(format!(
                "subkey lists nested too deep at offset {:#x}",
                list_offset
            )));
        }

        match SubkeyList::parse(self.read_cell(list_offset)?, list_offset)? {
            SubkeyList::Leaf(key_offsets) => offsets.extend(key_offsets),
            SubkeyList::IndexRoot(list_offsets) => {
                for list_offset in list_offsets {
                    self.subkey_offsets(list_offset, depth + 1, offsets)?;
                }
            }
        }
        Ok(())
    }

    fn value_offsets(&self, node: &KeyNode) -> Result<Vec<u32>> {
        if node.number_of_values == 0 || node.value_list_offset == NO_CELL {
            return Ok(Vec::new());
        }

        let list = self.read_cell(node.value_list_offset)?;
        (0..node.number_of_values as usize)
            .map(|index| read_u32_le(list, index * 4))
            .collect()
    }

    fn class_name(&self, node: &KeyNode) -> Result<Option<String>> {
        if !node.has_class_name() {
            return Ok(None);
        }

        let data = self.read_cell(node.class_name_offset)?;
        let length = node.class_name_length as usize;
        let data = data.get(..length).ok_or(RegistryError::TruncatedData {
            offset: node.class_name_offset,
            expected: length,
            actual: data.len(),
        })?;
        let (class_name, _) = UTF_16LE.decode_without_bom_handling(data);
        Ok(Some(class_name.trim_end_matches('\0').to_string()))
    }

    fn value_data(&self, value: &ValueKey) -> Result<Vec<u8>> {
        if value.is_inline() {
            return Ok(value.inline_data());
        }

        let length = value.data_length();
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > MAX_DIRECT_DATA_SIZE && self.base_block.minor_version >= 4 {
            return self.read_big_data(value.data_offset, length);
        }

        let data = self.read_cell(value.data_offset)?;
        let data = data.get(..length as usize).ok_or(RegistryError::TruncatedData {
            offset: value.data_offset,
            expected: length as usize,
            actual: data.len(),
        })?;
        Ok(data.to_vec())
    }

    /// Reads value data spread over the segments of a big data block.
    fn read_big_data(&self, offset: u32, expected_length: u32) -> Result<Vec<u8>> {
        let big_data = BigData::parse(self.read_cell(offset)?, offset)?;
        debug!(
            offset = %format!("{:#x}", offset),
            segments = big_data.segment_count,
            "Reading big data block"
        );

        let segment_list = self.read_cell(big_data.segment_list_offset)?;
        // The length field is not trusted for sizing the buffer.
        let capacity = (expected_length as usize)
            .min(usize::from(big_data.segment_count) * MAX_DIRECT_DATA_SIZE as usize)
            .min(self.data.as_slice().len());
        let mut data = Vec::with_capacity(capacity);
        for index in 0..big_data.segment_count as usize {
            let segment_offset = read_u32_le(segment_list, index * 4)?;
            let segment = self.read_cell(segment_offset)?;
            // Segment cells carry alignment padding past the segment data.
            let remaining = expected_length as usize - data.len();
            let segment_length = segment.len().min(MAX_DIRECT_DATA_SIZE as usize).min(remaining);
            data.extend_from_slice(&segment[..segment_length]);
            if data.len() >= expected_length as usize {
                break;
            }
        }

        if data.len() < expected_length as usize {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: expected_length as usize,
                actual: data.len(),
            });
        }
        data.truncate(expected_length as usize);
        Ok(data)
    }
}

/// Windows NT registry file.
pub struct RegfFile {
    hive: Rc<Hive>,
    key_path_prefix: RefCell<String>,
    closed: Cell<bool>,
}

impl RegfFile {
    /// Opens a registry file by memory mapping it.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the registry file.
    /// * `ascii_codepage` - Codepage of key and value names stored as ASCII.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a registry file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use reg_vfs::regf::RegfFile;
    ///
    /// let file = RegfFile::open("SYSTEM", encoding_rs::WINDOWS_1252).unwrap();
    /// ```
    #[instrument(skip(path, ascii_codepage), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P, ascii_codepage: &'static Encoding) -> Result<Self> {
        let file = File::open(&path)?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: file_size,
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // SAFETY: The file is opened read-only and every access to the map is
        // bounds-checked. Concurrent modification of the file by another
        // process is outside what the parser can guard against.
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(size = mmap.len(), "Memory mapped registry file");

        Self::from_data(HiveData::Mapped(mmap), ascii_codepage)
    }

    /// Parses a registry file from owned data.
    pub fn from_vec(data: Vec<u8>, ascii_codepage: &'static Encoding) -> Result<Self> {
        Self::from_data(HiveData::Owned(data), ascii_codepage)
    }

    fn from_data(data: HiveData, ascii_codepage: &'static Encoding) -> Result<Self> {
        Ok(Self {
            hive: Rc::new(Hive::from_data(data, ascii_codepage)?),
            key_path_prefix: RefCell::new(String::new()),
            closed: Cell::new(false),
        })
    }

    fn root_handle(&self) -> Option<RegfKey> {
        if self.closed.get() {
            return None;
        }

        let offset = self.hive.base_block.root_cell_offset;
        match self.hive.key_node(offset) {
            Ok(node) => Some(RegfKey {
                hive: Rc::clone(&self.hive),
                offset,
                node,
                path: join_key_path([self.key_path_prefix.borrow().as_str()]),
            }),
            Err(error) => {
                warn!(offset = %format!("{:#x}", offset), error = %error, "Unable to read root key");
                None
            }
        }
    }
}

impl RegistryFile for RegfFile {
    fn key_path_prefix(&self) -> String {
        self.key_path_prefix.borrow().clone()
    }

    fn set_key_path_prefix(&self, key_path_prefix: &str) {
        *self.key_path_prefix.borrow_mut() = key_path_prefix.to_string();
    }

    fn root_key(&self) -> Option<Key> {
        self.root_handle().map(Key::Regf)
    }

    fn get_key_by_path(&self, key_path: &str) -> Option<Key> {
        let relative_path = relative_key_path(key_path, &self.key_path_prefix.borrow())?;

        let mut key = self.root_handle()?;
        for segment in split_key_path(&relative_path) {
            key = key.find_subkey(segment)?;
        }
        Some(Key::Regf(key))
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            debug!(key_path_prefix = %self.key_path_prefix.borrow(), "Closed registry file");
        }
    }
}

/// Key of a Windows NT registry file.
#[derive(Clone)]
pub struct RegfKey {
    hive: Rc<Hive>,
    offset: u32,
    node: Rc<KeyNode>,
    path: String,
}

impl RegfKey {
    pub(crate) fn with_path(self, path: String) -> Self {
        Self { path, ..self }
    }

    fn subkey_offsets(&self) -> Vec<u32> {
        let node = &self.node;
        if node.number_of_subkeys == 0 || node.subkey_list_offset == NO_CELL {
            return Vec::new();
        }

        let mut offsets = Vec::new();
        if let Err(error) = self.hive.subkey_offsets(node.subkey_list_offset, 0, &mut offsets) {
            warn!(key_path = %self.path, error = %error, "Unable to read subkey list");
        }
        if offsets.len() != node.number_of_subkeys as usize {
            warn!(
                key_path = %self.path,
                count = node.number_of_subkeys,
                listed = offsets.len(),
                "Subkey list does not match the subkey count"
            );
        }
        offsets
    }

    fn load_subkey(&self, offset: u32) -> Result<RegfKey> {
        let node = self.hive.key_node(offset)?;
        let path = join_key_path([self.path.as_str(), node.name.as_str()]);
        Ok(RegfKey {
            hive: Rc::clone(&self.hive),
            offset,
            node,
            path,
        })
    }

    fn load_subkey_or_warn(&self, offset: u32) -> Option<RegfKey> {
        self.load_subkey(offset)
            .map_err(|error| {
                warn!(
                    key_path = %self.path,
                    offset = %format!("{:#x}", offset),
                    error = %error,
                    "Unable to read subkey"
                );
            })
            .ok()
    }

    fn find_subkey(&self, name: &str) -> Option<RegfKey> {
        self.subkey_offsets()
            .into_iter()
            .filter_map(|offset| self.load_subkey_or_warn(offset))
            .find(|subkey| key_names_equal(&subkey.node.name, name))
    }

    fn load_values(&self) -> Vec<RegfValue> {
        let offsets = match self.hive.value_offsets(&self.node) {
            Ok(offsets) => offsets,
            Err(error) => {
                warn!(key_path = %self.path, error = %error, "Unable to read value list");
                return Vec::new();
            }
        };

        offsets
            .into_iter()
            .filter_map(|offset| {
                let value = self
                    .hive
                    .read_cell(offset)
                    .and_then(|data| ValueKey::parse(data, offset, self.hive.codepage));
                match value {
                    Ok(value) => Some(RegfValue {
                        hive: Rc::clone(&self.hive),
                        offset,
                        value,
                    }),
                    Err(error) => {
                        warn!(key_path = %self.path, error = %error, "Unable to read value");
                        None
                    }
                }
            })
            .collect()
    }
}

impl fmt::Debug for RegfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegfKey")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("name", &self.node.name)
            .field("path", &self.path)
            .finish()
    }
}

impl RegistryKey for RegfKey {
    fn name(&self) -> &str {
        &self.node.name
    }

    fn class_name(&self) -> Option<String> {
        self.hive
            .class_name(&self.node)
            .map_err(|error| warn!(key_path = %self.path, error = %error, "Unable to read class name"))
            .ok()
            .flatten()
    }

    fn last_written_time(&self) -> LastWrittenTime {
        LastWrittenTime::Filetime(self.node.last_written)
    }

    fn number_of_subkeys(&self) -> usize {
        self.node.number_of_subkeys as usize
    }

    fn number_of_values(&self) -> usize {
        self.node.number_of_values as usize
    }

    fn offset(&self) -> Option<u32> {
        Some(self.offset)
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn get_subkey_by_index(&self, index: usize) -> Result<Key> {
        let count = self.number_of_subkeys();
        if index >= count {
            return Err(RegistryError::IndexOutOfRange { index, count });
        }

        let offset = *self.subkey_offsets().get(index).ok_or_else(|| {
            RegistryError::InvalidFormat(format!(
                "subkey list of {} is shorter than its count of {}",
                self.path, count
            ))
        })?;
        Ok(Key::Regf(self.load_subkey(offset)?))
    }

    fn get_subkey_by_name(&self, name: &str) -> Option<Key> {
        self.find_subkey(name).map(Key::Regf)
    }

    fn get_subkeys(&self) -> Box<dyn Iterator<Item = Key>> {
        let parent = self.clone();
        let offsets = self.subkey_offsets();
        Box::new(
            offsets
                .into_iter()
                .filter_map(move |offset| parent.load_subkey_or_warn(offset).map(Key::Regf)),
        )
    }

    fn get_value_by_name(&self, name: &str) -> Option<Value> {
        self.load_values()
            .into_iter()
            .find(|value| key_names_equal(&value.value.name, name))
            .map(Value::Regf)
    }

    fn get_values(&self) -> Box<dyn Iterator<Item = Value>> {
        Box::new(self.load_values().into_iter().map(Value::Regf))
    }
}

/// Value of a Windows NT registry file.
#[derive(Clone)]
pub struct RegfValue {
    hive: Rc<Hive>,
    offset: u32,
    value: ValueKey,
}

impl fmt::Debug for RegfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegfValue")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("name", &self.value.name)
            .field("data_type", &self.data_type())
            .finish()
    }
}

impl RegistryValue for RegfValue {
    fn name(&self) -> &str {
        &self.value.name
    }

    fn data_type(&self) -> ValueType {
        ValueType::from_u32(self.value.data_type)
    }

    fn data(&self) -> Result<Vec<u8>> {
        self.hive.value_data(&self.value)
    }

    fn offset(&self) -> Option<u32> {
        Some(self.offset)
    }
}
