//! Registry value contract and data decoding.

use crate::error::{RegistryError, Result};
use crate::fake::FakeValue;
use crate::regf::RegfValue;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use encoding_rs::UTF_16LE;
use std::fmt;

/// Registry value data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// No value type.
    None,

    /// String (null-terminated).
    String,

    /// String with environment variables.
    ExpandString,

    /// Binary data.
    Binary,

    /// 32-bit little-endian integer.
    Dword,

    /// 32-bit big-endian integer.
    DwordBigEndian,

    /// Symbolic link (Unicode).
    Link,

    /// Multiple strings.
    MultiString,

    /// Resource list.
    ResourceList,

    /// Full resource descriptor.
    FullResourceDescriptor,

    /// Resource requirements list.
    ResourceRequirementsList,

    /// 64-bit little-endian integer.
    Qword,

    /// Non-standard value type, holding the raw type value.
    Unknown(u32),
}

impl ValueType {
    /// Converts a raw data type. Types above 11 are kept as `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            _ => ValueType::Unknown(value),
        }
    }

    /// Returns the raw data type value.
    pub fn as_u32(&self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(value) => *value,
        }
    }

    /// Returns the name of this value type, `UNKNOWN` for non-standard types.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::None => "REG_NONE",
            ValueType::String => "REG_SZ",
            ValueType::ExpandString => "REG_EXPAND_SZ",
            ValueType::Binary => "REG_BINARY",
            ValueType::Dword => "REG_DWORD_LE",
            ValueType::DwordBigEndian => "REG_DWORD_BE",
            ValueType::Link => "REG_LINK",
            ValueType::MultiString => "REG_MULTI_SZ",
            ValueType::ResourceList => "REG_RESOURCE_LIST",
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR",
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST",
            ValueType::Qword => "REG_QWORD",
            ValueType::Unknown(_) => "UNKNOWN",
        }
    }

    /// Returns true for REG_SZ, REG_EXPAND_SZ and REG_LINK.
    pub fn is_string(&self) -> bool {
        matches!(self, ValueType::String | ValueType::ExpandString | ValueType::Link)
    }

    /// Returns true for REG_DWORD, REG_DWORD_BIG_ENDIAN and REG_QWORD.
    pub fn is_integer(&self) -> bool {
        matches!(self, ValueType::Dword | ValueType::DwordBigEndian | ValueType::Qword)
    }
}

/// Decoded registry value data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueData {
    /// No data.
    None,

    /// String, expandable string or link.
    String(String),

    /// 32-bit integer, either byte order.
    Dword(u32),

    /// 64-bit integer.
    Qword(u64),

    /// Multiple strings, empty strings removed.
    MultiString(Vec<String>),

    /// Binary data and types without a decoding.
    Binary(Vec<u8>),
}

impl ValueData {
    /// Decodes raw value data according to its data type.
    ///
    /// # Arguments
    ///
    /// * `name` - Value name, for error reporting.
    /// * `data` - Raw value data bytes.
    /// * `data_type` - Declared type of the value.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::ValueDecode` if the data size does not match
    /// an integer type or string data is not valid UTF-16LE.
    pub fn decode(name: &str, data: &[u8], data_type: ValueType) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match data_type {
            ValueType::String | ValueType::ExpandString | ValueType::Link => {
                Ok(ValueData::String(decode_utf16(name, data)?))
            }

            ValueType::Dword => Ok(ValueData::Dword(LittleEndian::read_u32(
                fixed_size(name, data, 4)?,
            ))),

            ValueType::DwordBigEndian => Ok(ValueData::Dword(BigEndian::read_u32(
                fixed_size(name, data, 4)?,
            ))),

            ValueType::Qword => Ok(ValueData::Qword(LittleEndian::read_u64(
                fixed_size(name, data, 8)?,
            ))),

            ValueType::MultiString => {
                let strings = decode_utf16(name, data)?
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            _ => Ok(ValueData::Binary(data.to_vec())),
        }
    }

    /// Returns the integer for DWORD and QWORD data.
    pub fn as_integer(&self) -> Option<u64> {
        match self {
            ValueData::Dword(value) => Some(u64::from(*value)),
            ValueData::Qword(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string for string data.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ValueData::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::None => write!(f, "(none)"),
            ValueData::String(s) => write!(f, "{}", s),
            ValueData::Dword(d) => write!(f, "{} (0x{:08X})", d, d),
            ValueData::Qword(q) => write!(f, "{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => write!(f, "{}", strings.join(", ")),
            ValueData::Binary(b) => write!(f, "{}", hex::encode_upper(b)),
        }
    }
}

fn fixed_size<'a>(name: &str, data: &'a [u8], size: usize) -> Result<&'a [u8]> {
    if data.len() != size {
        return Err(RegistryError::value_decode(
            name,
            format!("expected {} bytes of data, got {}", size, data.len()),
        ));
    }
    Ok(data)
}

fn decode_utf16(name: &str, data: &[u8]) -> Result<String> {
    if data.len() % 2 != 0 {
        return Err(RegistryError::value_decode(name, "odd number of bytes in UTF-16 string"));
    }

    let (decoded, had_errors) = UTF_16LE.decode_without_bom_handling(data);
    if had_errors {
        return Err(RegistryError::value_decode(name, "invalid UTF-16 string"));
    }

    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Operations every registry value supports.
pub trait RegistryValue {
    /// Returns the value name, empty for the default value.
    fn name(&self) -> &str;

    /// Returns the declared data type.
    fn data_type(&self) -> ValueType;

    /// Returns the raw value data.
    fn data(&self) -> Result<Vec<u8>>;

    /// Returns the offset of the value within its registry file, if known.
    fn offset(&self) -> Option<u32>;

    /// Returns the name of the data type.
    fn data_type_string(&self) -> &'static str {
        self.data_type().name()
    }

    /// Returns true if the data is binary data.
    fn data_is_binary_data(&self) -> bool {
        self.data_type() == ValueType::Binary
    }

    /// Returns true if the data is an integer.
    fn data_is_integer(&self) -> bool {
        self.data_type().is_integer()
    }

    /// Returns true if the data is a multi string.
    fn data_is_multi_string(&self) -> bool {
        self.data_type() == ValueType::MultiString
    }

    /// Returns true if the data is a string. REG_LINK is not included.
    fn data_is_string(&self) -> bool {
        matches!(self.data_type(), ValueType::String | ValueType::ExpandString)
    }

    /// Decodes the data according to the data type.
    fn get_data_as_object(&self) -> Result<ValueData> {
        ValueData::decode(self.name(), &self.data()?, self.data_type())
    }
}

/// A value from any of the registry file implementations.
#[derive(Debug, Clone)]
pub enum Value {
    /// Value stored in an NT registry file.
    Regf(RegfValue),

    /// Value of an in-memory registry file.
    Fake(FakeValue),
}

impl Value {
    fn as_dyn(&self) -> &dyn RegistryValue {
        match self {
            Value::Regf(value) => value,
            Value::Fake(value) => value,
        }
    }
}

impl RegistryValue for Value {
    fn name(&self) -> &str {
        self.as_dyn().name()
    }

    fn data_type(&self) -> ValueType {
        self.as_dyn().data_type()
    }

    fn data(&self) -> Result<Vec<u8>> {
        self.as_dyn().data()
    }

    fn offset(&self) -> Option<u32> {
        self.as_dyn().offset()
    }
}

impl From<RegfValue> for Value {
    fn from(value: RegfValue) -> Self {
        Value::Regf(value)
    }
}

impl From<FakeValue> for Value {
    fn from(value: FakeValue) -> Self {
        Value::Fake(value)
    }
}
