//! On-disk structures of the NT registry file format.
//!
//! All structures are parsed from cell data, which excludes the 4-byte cell
//! size. Offsets stored in the file are relative to the first hive bin.

use crate::error::{RegistryError, Result};
use byteorder::{ByteOrder, LittleEndian};
use encoding_rs::{Encoding, UTF_16LE};

/// Size of the base block at the start of the file.
pub(crate) const BASE_BLOCK_SIZE: usize = 0x1000;

/// Offset of the first hive bin; cell offsets are relative to it.
pub(crate) const HBIN_START_OFFSET: usize = 0x1000;

/// Base block signature.
pub(crate) const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Largest value data stored in a single cell on hives of minor version 4 and later.
pub(crate) const MAX_DIRECT_DATA_SIZE: u32 = 16344;

/// Cell offset meaning "no cell".
pub(crate) const NO_CELL: u32 = 0xFFFF_FFFF;

/// Key name is stored in the ASCII codepage rather than UTF-16LE.
const KEY_COMP_NAME: u16 = 0x0020;

/// Value name is stored in the ASCII codepage rather than UTF-16LE.
const VALUE_COMP_NAME: u16 = 0x0001;

/// Value data is stored in the data offset field.
const DATA_IN_OFFSET: u32 = 0x8000_0000;

/// Reads `length` bytes at `offset`, failing on truncated data.
pub(crate) fn read_bytes(data: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    match offset.checked_add(length) {
        Some(end) if end <= data.len() => Ok(&data[offset..end]),
        _ => Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: length,
            actual: data.len().saturating_sub(offset),
        }),
    }
}

pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(read_bytes(data, offset, 2)?))
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(read_bytes(data, offset, 4)?))
}

pub(crate) fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    Ok(LittleEndian::read_i32(read_bytes(data, offset, 4)?))
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    Ok(LittleEndian::read_u64(read_bytes(data, offset, 8)?))
}

/// Decodes a key or value name.
///
/// Compressed names use the ASCII codepage, others UTF-16LE. Undecodable
/// characters are replaced rather than rejected.
fn decode_name(data: &[u8], compressed: bool, codepage: &'static Encoding) -> String {
    let (name, _) = if compressed {
        codepage.decode_without_bom_handling(data)
    } else {
        UTF_16LE.decode_without_bom_handling(data)
    };
    name.trim_end_matches('\0').to_string()
}

fn check_signature(data: &[u8], expected: &[u8; 2], offset: u32) -> Result<()> {
    let signature = read_bytes(data, 0, 2).map_err(|_| RegistryError::TruncatedData {
        offset,
        expected: 2,
        actual: data.len(),
    })?;
    if signature != expected {
        return Err(RegistryError::invalid_signature(expected, signature));
    }
    Ok(())
}

/// Fields of the base block used for navigation.
#[derive(Debug, Clone)]
pub(crate) struct BaseBlock {
    pub major_version: u32,
    pub minor_version: u32,
    pub root_cell_offset: u32,
    pub hive_length: u32,
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses the base block.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is smaller than a base block or the
    /// signature is not `regf`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        let signature = &data[0..4];
        if signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, signature));
        }

        Ok(BaseBlock {
            major_version: read_u32_le(data, 0x14)?,
            minor_version: read_u32_le(data, 0x18)?,
            root_cell_offset: read_u32_le(data, 0x24)?,
            hive_length: read_u32_le(data, 0x28)?,
            checksum: read_u32_le(data, 0x1FC)?,
        })
    }

    /// Computes the XOR-32 checksum over the first 508 bytes.
    pub fn calculate_checksum(data: &[u8]) -> u32 {
        data[..0x1FC]
            .chunks_exact(4)
            .fold(0, |checksum, dword| checksum ^ LittleEndian::read_u32(dword))
    }
}

/// Key node (nk).
#[derive(Debug, Clone)]
pub(crate) struct KeyNode {
    pub name: String,
    pub last_written: u64,
    pub number_of_subkeys: u32,
    pub subkey_list_offset: u32,
    pub number_of_values: u32,
    pub value_list_offset: u32,
    pub class_name_offset: u32,
    pub class_name_length: u16,
}

impl KeyNode {
    const HEADER_SIZE: usize = 0x4C;

    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    /// * `codepage` - Codepage of compressed key names.
    pub fn parse(data: &[u8], offset: u32, codepage: &'static Encoding) -> Result<Self> {
        check_signature(data, b"nk", offset)?;
        if data.len() < Self::HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::HEADER_SIZE,
                actual: data.len(),
            });
        }

        let flags = read_u16_le(data, 0x02)?;
        let name_length = read_u16_le(data, 0x48)? as usize;
        let name_data = read_bytes(data, Self::HEADER_SIZE, name_length)?;

        Ok(KeyNode {
            name: decode_name(name_data, flags & KEY_COMP_NAME != 0, codepage),
            last_written: read_u64_le(data, 0x04)?,
            number_of_subkeys: read_u32_le(data, 0x14)?,
            subkey_list_offset: read_u32_le(data, 0x1C)?,
            number_of_values: read_u32_le(data, 0x24)?,
            value_list_offset: read_u32_le(data, 0x28)?,
            class_name_offset: read_u32_le(data, 0x30)?,
            class_name_length: read_u16_le(data, 0x4A)?,
        })
    }

    pub fn has_class_name(&self) -> bool {
        self.class_name_offset != NO_CELL && self.class_name_length > 0
    }
}

/// Value key (vk).
#[derive(Debug, Clone)]
pub(crate) struct ValueKey {
    pub name: String,
    pub data_size: u32,
    pub data_offset: u32,
    pub data_type: u32,
}

impl ValueKey {
    const HEADER_SIZE: usize = 0x14;

    /// Parses a value key from cell data.
    pub fn parse(data: &[u8], offset: u32, codepage: &'static Encoding) -> Result<Self> {
        check_signature(data, b"vk", offset)?;
        if data.len() < Self::HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::HEADER_SIZE,
                actual: data.len(),
            });
        }

        let name_length = read_u16_le(data, 0x02)? as usize;
        let flags = read_u16_le(data, 0x10)?;
        let name_data = read_bytes(data, Self::HEADER_SIZE, name_length)?;

        Ok(ValueKey {
            name: decode_name(name_data, flags & VALUE_COMP_NAME != 0, codepage),
            data_size: read_u32_le(data, 0x04)?,
            data_offset: read_u32_le(data, 0x08)?,
            data_type: read_u32_le(data, 0x0C)?,
        })
    }

    /// Returns true if the data is stored in the data offset field.
    pub fn is_inline(&self) -> bool {
        self.data_size & DATA_IN_OFFSET != 0
    }

    pub fn data_length(&self) -> u32 {
        self.data_size & !DATA_IN_OFFSET
    }

    /// Returns the data stored in the data offset field, at most 4 bytes.
    pub fn inline_data(&self) -> Vec<u8> {
        let length = (self.data_length() as usize).min(4);
        self.data_offset.to_le_bytes()[..length].to_vec()
    }
}

/// Subkey list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubkeyList {
    /// Key node offsets (li, lf, lh).
    Leaf(Vec<u32>),

    /// Offsets of further subkey lists (ri).
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let list_type = [data[0], data[1]];
        let count = read_u16_le(data, 2)? as usize;

        // li and ri entries are a 4-byte offset, lf and lh entries add a 4-byte hint.
        let entry_size = match &list_type {
            b"li" | b"ri" => 4,
            b"lf" | b"lh" => 8,
            _ => return Err(RegistryError::InvalidSubkeyList { list_type, offset }),
        };

        let entries = read_bytes(data, 4, count * entry_size)?;
        let offsets = entries
            .chunks_exact(entry_size)
            .map(LittleEndian::read_u32)
            .collect();

        if &list_type == b"ri" {
            Ok(SubkeyList::IndexRoot(offsets))
        } else {
            Ok(SubkeyList::Leaf(offsets))
        }
    }
}

/// Big data header (db).
#[derive(Debug, Clone)]
pub(crate) struct BigData {
    pub segment_count: u16,
    pub segment_list_offset: u32,
}

impl BigData {
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        check_signature(data, b"db", offset)?;
        Ok(BigData {
            segment_count: read_u16_le(data, 0x02)?,
            segment_list_offset: read_u32_le(data, 0x04)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::WINDOWS_1252;

    fn key_node_cell(name: &[u8], flags: u16) -> Vec<u8> {
        let mut data = vec![0u8; KeyNode::HEADER_SIZE];
        data[0..2].copy_from_slice(b"nk");
        data[0x02..0x04].copy_from_slice(&flags.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&2u32.to_le_bytes());
        data[0x30..0x34].copy_from_slice(&NO_CELL.to_le_bytes());
        data[0x48..0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(name);
        data
    }

    #[test]
    fn test_key_node_ascii_name() {
        let data = key_node_cell(b"Caf\xe9", KEY_COMP_NAME);
        let node = KeyNode::parse(&data, 0x20, WINDOWS_1252).unwrap();
        assert_eq!(node.name, "Café");
        assert_eq!(node.number_of_subkeys, 2);
        assert!(!node.has_class_name());
    }

    #[test]
    fn test_key_node_utf16_name() {
        let name: Vec<u8> = "Select".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let data = key_node_cell(&name, 0);
        let node = KeyNode::parse(&data, 0x20, WINDOWS_1252).unwrap();
        assert_eq!(node.name, "Select");
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = key_node_cell(b"Select", KEY_COMP_NAME);
        data[0..2].copy_from_slice(b"vk");
        assert!(matches!(
            KeyNode::parse(&data, 0x20, WINDOWS_1252),
            Err(RegistryError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_key_node_truncated_name() {
        let mut data = key_node_cell(b"Select", KEY_COMP_NAME);
        data.truncate(KeyNode::HEADER_SIZE + 3);
        assert!(matches!(
            KeyNode::parse(&data, 0x20, WINDOWS_1252),
            Err(RegistryError::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_value_key_inline_data() {
        let mut data = vec![0u8; ValueKey::HEADER_SIZE];
        data[0..2].copy_from_slice(b"vk");
        data[0x02..0x04].copy_from_slice(&7u16.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&(4 | DATA_IN_OFFSET).to_le_bytes());
        data[0x08..0x0C].copy_from_slice(&1u32.to_le_bytes());
        data[0x0C..0x10].copy_from_slice(&4u32.to_le_bytes());
        data[0x10..0x12].copy_from_slice(&VALUE_COMP_NAME.to_le_bytes());
        data.extend_from_slice(b"Current");

        let value = ValueKey::parse(&data, 0x80, WINDOWS_1252).unwrap();
        assert_eq!(value.name, "Current");
        assert!(value.is_inline());
        assert_eq!(value.data_length(), 4);
        assert_eq!(value.inline_data(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_subkey_lists() {
        let mut lf = b"lf\x02\x00".to_vec();
        for (offset, hint) in [(0x20u32, *b"Sele"), (0x120, *b"Cont")] {
            lf.extend_from_slice(&offset.to_le_bytes());
            lf.extend_from_slice(&hint);
        }
        assert_eq!(SubkeyList::parse(&lf, 0).unwrap(), SubkeyList::Leaf(vec![0x20, 0x120]));

        let mut ri = b"ri\x01\x00".to_vec();
        ri.extend_from_slice(&0x400u32.to_le_bytes());
        assert_eq!(SubkeyList::parse(&ri, 0).unwrap(), SubkeyList::IndexRoot(vec![0x400]));

        assert!(matches!(
            SubkeyList::parse(b"xx\x00\x00", 0x10),
            Err(RegistryError::InvalidSubkeyList { offset: 0x10, .. })
        ));
        assert!(matches!(
            SubkeyList::parse(b"li\x02\x00\x20\x00\x00\x00", 0),
            Err(RegistryError::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_base_block() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(REGF_SIGNATURE);
        data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        data[0x18..0x1C].copy_from_slice(&5u32.to_le_bytes());
        data[0x24..0x28].copy_from_slice(&0x20u32.to_le_bytes());
        let block = BaseBlock::parse(&data).unwrap();
        assert_eq!(block.minor_version, 5);
        assert_eq!(block.root_cell_offset, 0x20);

        assert!(matches!(
            BaseBlock::parse(&data[..0x200]),
            Err(RegistryError::HiveTooSmall { .. })
        ));
        data[0] = b'x';
        assert!(matches!(
            BaseBlock::parse(&data),
            Err(RegistryError::InvalidSignature { .. })
        ));
    }
}
