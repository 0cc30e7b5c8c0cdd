//! Manifest (`mft`): the compile-time device table embedded in a guest ELF.
//!
//! The manifest is a fixed-size array of entries laid out identically to
//! the wire format stored in the guest's `MFT1_NOTE_TYPE` ELF NOTE. Entry 0
//! is always the version sentinel (`name = "\""`, `type = Reserved`); every
//! other entry declares one device the guest may use.

use std::fmt;

/// Maximum length of a manifest entry name (ASCII, `[A-Za-z0-9]+`).
pub const NAME_MAX: usize = 67;
/// Hard ceiling on the number of entries a manifest may declare (including
/// the sentinel). `spec.md` calls this "M=63 typical"; this implementation
/// makes it the enforced capacity (see `DESIGN.md`).
pub const MFT_MAX_ENTRIES: usize = 63;
/// Alignment (bytes) the manifest NOTE descriptor is padded to.
pub const MFT_NOTE_ALIGN: usize = 8;
/// ELF NOTE type identifying the Solo5-owned manifest descriptor.
pub const MFT_NOTE_TYPE: u32 = 0x5a31_0001;
/// Largest accepted manifest NOTE descriptor, in bytes.
pub const MFT_NOTE_MAX_SIZE: usize = 4096;

const NAME_FIELD_LEN: usize = NAME_MAX + 1; // + NUL terminator
const PARAMS_FIELD_LEN: usize = 16;
const ENTRY_WIRE_LEN: usize = NAME_FIELD_LEN + 4 /* type */ + 4 /* pad */ + PARAMS_FIELD_LEN;
const HEADER_WIRE_LEN: usize = 12; // version, entries, capacity: 3 x u32

/// The version sentinel's name, per `spec.md` §3.
pub const SENTINEL_NAME: &str = "\"";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MftError {
    #[error("manifest too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("manifest size mismatch: header declares capacity {capacity}, expected {expected} total bytes, got {got}")]
    SizeMismatch {
        capacity: u32,
        expected: usize,
        got: usize,
    },
    #[error("manifest capacity {0} exceeds MFT_MAX_ENTRIES ({MFT_MAX_ENTRIES})")]
    CapacityTooLarge(u32),
    #[error("manifest entries count {entries} exceeds capacity {capacity}")]
    EntriesExceedCapacity { entries: u32, capacity: u32 },
    #[error("missing or malformed version sentinel at index 0")]
    BadSentinel,
    #[error("invalid entry name {0:?}: must be 1..={NAME_MAX} ASCII alphanumeric characters")]
    InvalidName(String),
    #[error("duplicate entry name {0:?}")]
    DuplicateName(String),
    #[error("unknown manifest entry type {0}")]
    UnknownType(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MftType {
    /// Sentinel / version-anchor entry. Never a real device.
    Reserved = 0,
    NetBasic = 1,
    BlockBasic = 2,
}

impl MftType {
    fn from_wire(v: u32) -> Result<Self, MftError> {
        match v {
            0 => Ok(Self::Reserved),
            1 => Ok(Self::NetBasic),
            2 => Ok(Self::BlockBasic),
            other => Err(MftError::UnknownType(other)),
        }
    }
}

/// Type-specific, tender-filled parameters for a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MftParams {
    None,
    NetBasic { mac: [u8; 6], mtu: u16 },
    BlockBasic { capacity: u64, block_size: u16 },
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftEntry {
    pub name: String,
    pub ty: MftType,
    pub params: MftParams,
    /// Runtime-only: has the tender attached a host resource to this entry?
    pub attached: bool,
    /// Runtime-only: the host fd backing this entry, once attached.
    pub hostfd: Option<i32>,
}

impl MftEntry {
    fn sentinel() -> Self {
        MftEntry {
            name: SENTINEL_NAME.to_string(),
            ty: MftType::Reserved,
            params: MftParams::None,
            attached: false,
            hostfd: None,
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// A parsed, validated manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    version: u32,
    capacity: u32,
    entries: Vec<MftEntry>,
}

impl Manifest {
    /// Builds an empty manifest (sentinel only) with the given capacity.
    /// Used by tests and by tenders synthesizing a manifest in-process.
    pub fn empty(capacity: u32) -> Result<Self, MftError> {
        if capacity > MFT_MAX_ENTRIES as u32 {
            return Err(MftError::CapacityTooLarge(capacity));
        }
        Ok(Manifest {
            version: 1,
            capacity,
            entries: vec![MftEntry::sentinel()],
        })
    }

    /// Appends a new, unattached entry. Returns an error if the name is
    /// invalid, already used, or the manifest has no remaining capacity.
    pub fn declare(&mut self, name: &str, ty: MftType, params: MftParams) -> Result<(), MftError> {
        if !valid_name(name) {
            return Err(MftError::InvalidName(name.to_string()));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(MftError::DuplicateName(name.to_string()));
        }
        if self.entries.len() as u32 >= self.capacity {
            return Err(MftError::EntriesExceedCapacity {
                entries: self.entries.len() as u32 + 1,
                capacity: self.capacity,
            });
        }
        self.entries.push(MftEntry {
            name: name.to_string(),
            ty,
            params,
            attached: false,
            hostfd: None,
        });
        Ok(())
    }

    /// Parses and validates a manifest from its wire (ELF NOTE descriptor)
    /// representation. See `mft_validate` in `spec.md` §4.1 for the rule set.
    pub fn parse(buf: &[u8]) -> Result<Self, MftError> {
        if buf.len() < HEADER_WIRE_LEN {
            return Err(MftError::TooShort {
                need: HEADER_WIRE_LEN,
                got: buf.len(),
            });
        }
        let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let entries_count = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let capacity = u32::from_le_bytes(buf[8..12].try_into().unwrap());

        if capacity > MFT_MAX_ENTRIES as u32 {
            return Err(MftError::CapacityTooLarge(capacity));
        }
        if entries_count > capacity {
            return Err(MftError::EntriesExceedCapacity {
                entries: entries_count,
                capacity,
            });
        }
        let expected = HEADER_WIRE_LEN + capacity as usize * ENTRY_WIRE_LEN;
        if buf.len() != expected {
            return Err(MftError::SizeMismatch {
                capacity,
                expected,
                got: buf.len(),
            });
        }

        let mut entries = Vec::with_capacity(entries_count as usize);
        for i in 0..entries_count as usize {
            let off = HEADER_WIRE_LEN + i * ENTRY_WIRE_LEN;
            entries.push(parse_entry(&buf[off..off + ENTRY_WIRE_LEN])?);
        }

        let mft = Manifest {
            version,
            capacity,
            entries,
        };
        mft.validate()?;
        Ok(mft)
    }

    fn validate(&self) -> Result<(), MftError> {
        let sentinel = self.entries.first().ok_or(MftError::BadSentinel)?;
        if sentinel.name != SENTINEL_NAME || sentinel.ty != MftType::Reserved {
            return Err(MftError::BadSentinel);
        }
        let mut seen = std::collections::HashSet::new();
        for e in self.entries.iter().skip(1) {
            if !valid_name(&e.name) {
                return Err(MftError::InvalidName(e.name.clone()));
            }
            if !seen.insert(e.name.as_str()) {
                return Err(MftError::DuplicateName(e.name.clone()));
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// All entries, sentinel included, in declaration order.
    pub fn entries(&self) -> &[MftEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [MftEntry] {
        &mut self.entries
    }

    /// Linear scan by name. Rejects the sentinel and, if `ty` is given,
    /// entries whose type does not match.
    pub fn get_by_name(&self, name: &str, ty: Option<MftType>) -> Option<&MftEntry> {
        self.entries.iter().skip(1).find(|e| {
            e.name == name && ty.map(|t| t == e.ty).unwrap_or(true)
        })
    }

    pub fn get_by_name_mut(&mut self, name: &str, ty: Option<MftType>) -> Option<&mut MftEntry> {
        self.entries
            .iter_mut()
            .skip(1)
            .find(|e| e.name == name && ty.map(|t| t == e.ty).unwrap_or(true))
    }

    /// O(1) lookup by index. Index 0 (the sentinel) and type mismatches are
    /// rejected, matching `mft_get_by_index`.
    pub fn get_by_index(&self, i: usize, ty: Option<MftType>) -> Option<&MftEntry> {
        if i == 0 {
            return None;
        }
        let e = self.entries.get(i)?;
        if ty.map(|t| t == e.ty).unwrap_or(true) {
            Some(e)
        } else {
            None
        }
    }

    /// `spec.md` §4.5 startup check and §8 invariant 2: every non-sentinel
    /// entry must be attached, and every attached `BLOCK_BASIC` entry must
    /// carry a nonzero capacity and a 512-byte block size.
    pub fn check_fully_attached(&self) -> Result<(), String> {
        for e in self.entries.iter().skip(1) {
            if !e.attached {
                return Err(format!("Device '{}' declared but not attached", e.name));
            }
            if let MftParams::BlockBasic {
                capacity,
                block_size,
            } = e.params
            {
                if capacity == 0 || block_size != 512 {
                    return Err(format!(
                        "Device '{}' attached with invalid block parameters",
                        e.name
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_entry(buf: &[u8]) -> Result<MftEntry, MftError> {
    let name_field = &buf[0..NAME_FIELD_LEN];
    let nul = name_field.iter().position(|&b| b == 0).unwrap_or(name_field.len());
    let name = String::from_utf8_lossy(&name_field[..nul]).into_owned();

    let ty_off = NAME_FIELD_LEN;
    let ty = MftType::from_wire(u32::from_le_bytes(
        buf[ty_off..ty_off + 4].try_into().unwrap(),
    ))?;

    let params_off = ty_off + 4 + 4; // skip type + pad
    let params_buf = &buf[params_off..params_off + PARAMS_FIELD_LEN];
    let params = match ty {
        MftType::Reserved => MftParams::None,
        MftType::NetBasic => {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&params_buf[0..6]);
            let mtu = u16::from_le_bytes(params_buf[6..8].try_into().unwrap());
            MftParams::NetBasic { mac, mtu }
        }
        MftType::BlockBasic => {
            let capacity = u64::from_le_bytes(params_buf[0..8].try_into().unwrap());
            let block_size = u16::from_le_bytes(params_buf[8..10].try_into().unwrap());
            MftParams::BlockBasic {
                capacity,
                block_size,
            }
        }
    };

    Ok(MftEntry {
        name,
        ty,
        params,
        attached: false,
        hostfd: None,
    })
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mft(version={}, entries={}, capacity={})",
            self.version,
            self.entries.len(),
            self.capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mft_with_one_net() -> Manifest {
        let mut m = Manifest::empty(4).unwrap();
        m.declare(
            "eth",
            MftType::NetBasic,
            MftParams::NetBasic {
                mac: [0; 6],
                mtu: 1500,
            },
        )
        .unwrap();
        m
    }

    #[test]
    fn rejects_empty_buffer() {
        assert_eq!(
            Manifest::parse(&[]),
            Err(MftError::TooShort {
                need: HEADER_WIRE_LEN,
                got: 0
            })
        );
    }

    #[test]
    fn rejects_capacity_over_max() {
        assert_eq!(
            Manifest::empty(MFT_MAX_ENTRIES as u32 + 1),
            Err(MftError::CapacityTooLarge(MFT_MAX_ENTRIES as u32 + 1))
        );
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut m = mft_with_one_net();
        let err = m.declare(
            "eth",
            MftType::NetBasic,
            MftParams::NetBasic {
                mac: [0; 6],
                mtu: 1500,
            },
        );
        assert_eq!(err, Err(MftError::DuplicateName("eth".to_string())));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut m = Manifest::empty(4).unwrap();
        assert_eq!(
            m.declare("bad-name!", MftType::NetBasic, MftParams::None),
            Err(MftError::InvalidName("bad-name!".to_string()))
        );
    }

    #[test]
    fn get_by_index_rejects_sentinel_and_type_mismatch() {
        let m = mft_with_one_net();
        assert!(m.get_by_index(0, None).is_none());
        assert!(m.get_by_index(1, Some(MftType::BlockBasic)).is_none());
        assert!(m.get_by_index(1, Some(MftType::NetBasic)).is_some());
    }

    #[test]
    fn check_fully_attached_reports_unattached_device() {
        let m = mft_with_one_net();
        let err = m.check_fully_attached().unwrap_err();
        assert_eq!(err, "Device 'eth' declared but not attached");
    }

    #[test]
    fn check_fully_attached_succeeds_once_attached() {
        let mut m = mft_with_one_net();
        m.get_by_name_mut("eth", None).unwrap().attached = true;
        assert!(m.check_fully_attached().is_ok());
    }

    #[test]
    fn round_trips_through_wire_format() {
        // Build wire bytes by hand for a manifest with one BLOCK_BASIC entry,
        // then parse it back and check field values survive.
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes()); // version
        buf.extend_from_slice(&2u32.to_le_bytes()); // entries (sentinel + disk)
        buf.extend_from_slice(&2u32.to_le_bytes()); // capacity

        // sentinel
        let mut sentinel_name = [0u8; NAME_FIELD_LEN];
        sentinel_name[0] = b'"';
        buf.extend_from_slice(&sentinel_name);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; PARAMS_FIELD_LEN]);

        // disk: BLOCK_BASIC, capacity=1MiB, block_size=512
        let mut disk_name = [0u8; NAME_FIELD_LEN];
        disk_name[..4].copy_from_slice(b"disk");
        buf.extend_from_slice(&disk_name);
        buf.extend_from_slice(&2u32.to_le_bytes()); // BlockBasic
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut params = [0u8; PARAMS_FIELD_LEN];
        params[0..8].copy_from_slice(&(1024u64 * 1024).to_le_bytes());
        params[8..10].copy_from_slice(&512u16.to_le_bytes());
        buf.extend_from_slice(&params);

        let m = Manifest::parse(&buf).expect("valid manifest");
        let disk = m.get_by_name("disk", Some(MftType::BlockBasic)).unwrap();
        assert_eq!(
            disk.params,
            MftParams::BlockBasic {
                capacity: 1024 * 1024,
                block_size: 512
            }
        );
    }
}
