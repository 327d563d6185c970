//! Shared fixtures: in-memory registry files and a synthetic REGF hive builder.

#![allow(dead_code)]

use reg_vfs::fake::{FakeFile, FakeKey, FakeValue};
use reg_vfs::{Registry, RegistryOptions};
use std::rc::Rc;

pub const ALICE_SID: &str = "S-1-5-21-1000";
pub const ALICE_PROFILE_PATH: &str = "C:\\Users\\alice";
pub const SYSTEM_PROFILE_PATH: &str = "%systemroot%\\system32\\config\\systemprofile";

/// SYSTEM file with two control sets, the first one current.
pub fn system_file() -> FakeFile {
    system_file_with_select(&[("Current", 1), ("Default", 1), ("LastKnownGood", 1)])
}

pub fn system_file_with_select(select_values: &[(&str, u32)]) -> FakeFile {
    let file = FakeFile::new();
    let select = file.add_key_by_path("\\", FakeKey::new("Select")).unwrap();
    for (name, control_set) in select_values {
        select.add_value(FakeValue::dword(name, *control_set)).unwrap();
    }

    let computer_name = file
        .add_key_by_path("\\ControlSet001\\Control\\ComputerName", FakeKey::new("ComputerName"))
        .unwrap();
    computer_name
        .add_value(FakeValue::string("ComputerName", "WKS-01"))
        .unwrap();
    file.add_key_by_path("\\ControlSet001", FakeKey::new("Enum").with_offset(0x1120))
        .unwrap();
    file.add_key_by_path("\\ControlSet002", FakeKey::new("Control").with_offset(0x2200))
        .unwrap();
    file
}

/// SOFTWARE file with a profile list for the system account and alice.
pub fn software_file() -> FakeFile {
    let file = FakeFile::new();
    file.add_key_by_path("\\Microsoft\\Windows\\CurrentVersion", FakeKey::new("App Paths"))
        .unwrap();

    let profile_list_path = "\\Microsoft\\Windows NT\\CurrentVersion\\ProfileList";
    for (sid, profile_path) in [("S-1-5-18", SYSTEM_PROFILE_PATH), (ALICE_SID, ALICE_PROFILE_PATH)] {
        let profile = file
            .add_key_by_path(profile_list_path, FakeKey::new(sid))
            .unwrap();
        profile
            .add_value(FakeValue::expand_string("ProfileImagePath", profile_path))
            .unwrap();
    }
    file
}

/// NTUSER.DAT file.
pub fn ntuser_file() -> FakeFile {
    let file = FakeFile::new();
    file.add_key_by_path("\\Software\\Microsoft\\Windows\\CurrentVersion", FakeKey::new("Explorer"))
        .unwrap();
    let environment = file
        .add_key_by_path("\\", FakeKey::new("Environment"))
        .unwrap();
    environment
        .add_value(FakeValue::expand_string("TEMP", "%USERPROFILE%\\AppData\\Local\\Temp"))
        .unwrap();
    file
}

/// UsrClass.dat file.
pub fn usrclass_file() -> FakeFile {
    let file = FakeFile::new();
    file.add_key_by_path(
        "\\Local Settings\\Software\\Microsoft\\Windows",
        FakeKey::new("CurrentVersion"),
    )
    .unwrap();
    file.add_key_by_path("\\", FakeKey::new("CLSID")).unwrap();
    file
}

/// Registry with the SYSTEM and SOFTWARE files mapped.
pub fn machine_registry() -> Registry {
    let registry = Registry::new(RegistryOptions::default(), None).unwrap();
    registry
        .map_file("HKEY_LOCAL_MACHINE\\System", Rc::new(system_file()))
        .unwrap();
    registry
        .map_file("HKEY_LOCAL_MACHINE\\Software", Rc::new(software_file()))
        .unwrap();
    registry
}

/// Key of a synthetic hive.
#[derive(Debug, Clone, Default)]
pub struct TestKey {
    pub name: String,
    pub class_name: Option<String>,
    pub last_written: u64,
    pub subkeys: Vec<TestKey>,
    pub values: Vec<TestValue>,
}

impl TestKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn subkey(mut self, subkey: TestKey) -> Self {
        self.subkeys.push(subkey);
        self
    }

    pub fn value(mut self, name: &str, data_type: u32, data: Vec<u8>) -> Self {
        self.values.push(TestValue {
            name: name.to_string(),
            data_type,
            data,
        });
        self
    }

    pub fn class_name(mut self, class_name: &str) -> Self {
        self.class_name = Some(class_name.to_string());
        self
    }

    pub fn last_written(mut self, filetime: u64) -> Self {
        self.last_written = filetime;
        self
    }
}

/// Value of a synthetic hive.
#[derive(Debug, Clone)]
pub struct TestValue {
    pub name: String,
    pub data_type: u32,
    pub data: Vec<u8>,
}

/// Subkey list format written by [`HiveBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Lf,
    Lh,
    Li,
    /// Index root over li lists of at most two entries.
    Ri,
}

/// Builds REGF hive bytes from a key tree.
///
/// Cells are written into a single hive bin, children before parents.
pub struct HiveBuilder {
    root: TestKey,
    minor_version: u32,
    list_kind: ListKind,
}

const HBIN_HEADER_SIZE: usize = 0x20;
const NO_CELL: u32 = 0xFFFF_FFFF;
const MAX_SEGMENT_SIZE: usize = 16344;

impl HiveBuilder {
    pub fn new(root: TestKey) -> Self {
        Self {
            root,
            minor_version: 5,
            list_kind: ListKind::Lf,
        }
    }

    pub fn minor_version(mut self, minor_version: u32) -> Self {
        self.minor_version = minor_version;
        self
    }

    pub fn list_kind(mut self, list_kind: ListKind) -> Self {
        self.list_kind = list_kind;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bins = vec![0u8; HBIN_HEADER_SIZE];
        let root_offset = self.write_key(&mut bins, &self.root, true);

        let hbin_size = (bins.len() + 0xFFF) / 0x1000 * 0x1000;
        let free_size = hbin_size - bins.len();
        if free_size >= 8 {
            // Trailing unallocated cell.
            bins.extend_from_slice(&(free_size as i32).to_le_bytes());
        }
        bins.resize(hbin_size, 0);
        bins[0..4].copy_from_slice(b"hbin");
        bins[4..8].copy_from_slice(&0u32.to_le_bytes());
        bins[8..12].copy_from_slice(&(hbin_size as u32).to_le_bytes());

        let mut data = vec![0u8; 0x1000];
        data[0..4].copy_from_slice(b"regf");
        put_u32(&mut data, 0x04, 1);
        put_u32(&mut data, 0x08, 1);
        put_u32(&mut data, 0x14, 1);
        put_u32(&mut data, 0x18, self.minor_version);
        put_u32(&mut data, 0x20, 1);
        put_u32(&mut data, 0x24, root_offset);
        put_u32(&mut data, 0x28, hbin_size as u32);
        put_u32(&mut data, 0x2C, 1);
        let checksum = data[..0x1FC]
            .chunks_exact(4)
            .fold(0u32, |checksum, dword| {
                checksum ^ u32::from_le_bytes([dword[0], dword[1], dword[2], dword[3]])
            });
        put_u32(&mut data, 0x1FC, checksum);

        data.extend_from_slice(&bins);
        data
    }

    fn write_key(&self, bins: &mut Vec<u8>, key: &TestKey, is_root: bool) -> u32 {
        let subkey_offsets: Vec<u32> = key
            .subkeys
            .iter()
            .map(|subkey| self.write_key(bins, subkey, false))
            .collect();
        let subkey_list_offset = if subkey_offsets.is_empty() {
            NO_CELL
        } else {
            self.write_subkey_list(bins, &key.subkeys, &subkey_offsets)
        };

        let value_offsets: Vec<u32> = key
            .values
            .iter()
            .map(|value| self.write_value(bins, value))
            .collect();
        let value_list_offset = if value_offsets.is_empty() {
            NO_CELL
        } else {
            let list: Vec<u8> = value_offsets.iter().flat_map(|offset| offset.to_le_bytes()).collect();
            alloc(bins, &list)
        };

        let class_name = key.class_name.as_deref().map(utf16).unwrap_or_default();
        let class_name_offset = if class_name.is_empty() {
            NO_CELL
        } else {
            alloc(bins, &class_name)
        };

        let (name, compressed) = encode_name(&key.name);
        let mut flags: u16 = if compressed { 0x0020 } else { 0 };
        if is_root {
            flags |= 0x000C;
        }

        let mut nk = vec![0u8; 0x4C];
        nk[0..2].copy_from_slice(b"nk");
        nk[0x02..0x04].copy_from_slice(&flags.to_le_bytes());
        nk[0x04..0x0C].copy_from_slice(&key.last_written.to_le_bytes());
        put_u32(&mut nk, 0x14, subkey_offsets.len() as u32);
        put_u32(&mut nk, 0x1C, subkey_list_offset);
        put_u32(&mut nk, 0x20, NO_CELL);
        put_u32(&mut nk, 0x24, value_offsets.len() as u32);
        put_u32(&mut nk, 0x28, value_list_offset);
        put_u32(&mut nk, 0x2C, NO_CELL);
        put_u32(&mut nk, 0x30, class_name_offset);
        nk[0x48..0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
        nk[0x4A..0x4C].copy_from_slice(&(class_name.len() as u16).to_le_bytes());
        nk.extend_from_slice(&name);
        alloc(bins, &nk)
    }

    fn write_subkey_list(&self, bins: &mut Vec<u8>, subkeys: &[TestKey], offsets: &[u32]) -> u32 {
        match self.list_kind {
            ListKind::Li => alloc(bins, &index_leaf(offsets)),
            ListKind::Ri => {
                let leaves: Vec<u32> = offsets
                    .chunks(2)
                    .map(|chunk| alloc(bins, &index_leaf(chunk)))
                    .collect();
                let mut ri = b"ri".to_vec();
                ri.extend_from_slice(&(leaves.len() as u16).to_le_bytes());
                ri.extend(leaves.iter().flat_map(|offset| offset.to_le_bytes()));
                alloc(bins, &ri)
            }
            ListKind::Lf | ListKind::Lh => {
                let mut list = if self.list_kind == ListKind::Lf {
                    b"lf".to_vec()
                } else {
                    b"lh".to_vec()
                };
                list.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
                for (subkey, offset) in subkeys.iter().zip(offsets) {
                    list.extend_from_slice(&offset.to_le_bytes());
                    let hint = if self.list_kind == ListKind::Lf {
                        let mut hint = [0u8; 4];
                        for (slot, byte) in hint.iter_mut().zip(subkey.name.bytes()) {
                            *slot = byte;
                        }
                        u32::from_le_bytes(hint)
                    } else {
                        name_hash(&subkey.name)
                    };
                    list.extend_from_slice(&hint.to_le_bytes());
                }
                alloc(bins, &list)
            }
        }
    }

    fn write_value(&self, bins: &mut Vec<u8>, value: &TestValue) -> u32 {
        let length = value.data.len();
        let (data_size, data_offset) = if length <= 4 {
            let mut inline = [0u8; 4];
            inline[..length].copy_from_slice(&value.data);
            (length as u32 | 0x8000_0000, u32::from_le_bytes(inline))
        } else if length > MAX_SEGMENT_SIZE && self.minor_version >= 4 {
            let segments: Vec<u32> = value
                .data
                .chunks(MAX_SEGMENT_SIZE)
                .map(|segment| alloc(bins, segment))
                .collect();
            let list: Vec<u8> = segments.iter().flat_map(|offset| offset.to_le_bytes()).collect();
            let list_offset = alloc(bins, &list);

            let mut db = b"db".to_vec();
            db.extend_from_slice(&(segments.len() as u16).to_le_bytes());
            db.extend_from_slice(&list_offset.to_le_bytes());
            (length as u32, alloc(bins, &db))
        } else {
            (length as u32, alloc(bins, &value.data))
        };

        let (name, compressed) = encode_name(&value.name);
        let mut vk = vec![0u8; 0x14];
        vk[0..2].copy_from_slice(b"vk");
        vk[0x02..0x04].copy_from_slice(&(name.len() as u16).to_le_bytes());
        put_u32(&mut vk, 0x04, data_size);
        put_u32(&mut vk, 0x08, data_offset);
        put_u32(&mut vk, 0x0C, value.data_type);
        let flags: u16 = if compressed { 0x0001 } else { 0 };
        vk[0x10..0x12].copy_from_slice(&flags.to_le_bytes());
        vk.extend_from_slice(&name);
        alloc(bins, &vk)
    }
}

/// Appends an allocated cell and returns its offset relative to the first hive bin.
fn alloc(bins: &mut Vec<u8>, data: &[u8]) -> u32 {
    let offset = bins.len() as u32;
    let size = (4 + data.len() + 7) / 8 * 8;
    bins.extend_from_slice(&(-(size as i32)).to_le_bytes());
    bins.extend_from_slice(data);
    bins.resize(offset as usize + size, 0);
    offset
}

fn index_leaf(offsets: &[u32]) -> Vec<u8> {
    let mut li = b"li".to_vec();
    li.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
    li.extend(offsets.iter().flat_map(|offset| offset.to_le_bytes()));
    li
}

fn name_hash(name: &str) -> u32 {
    name.to_uppercase()
        .chars()
        .fold(0u32, |hash, c| hash.wrapping_mul(37).wrapping_add(c as u32))
}

fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name.is_ascii() {
        (name.as_bytes().to_vec(), true)
    } else {
        (utf16(name), false)
    }
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Encodes text as UTF-16LE without terminator.
pub fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Encodes text as UTF-16LE with a NUL terminator.
pub fn utf16z(text: &str) -> Vec<u8> {
    let mut data = utf16(text);
    data.extend_from_slice(&[0, 0]);
    data
}
