//! Named-property map (descriptor 0x61).
//!
//! Property ids from 0x8000 up are not fixed: the store keeps a map from
//! each such id to a property set GUID plus a numeric or string name. The
//! map node is a property context with three binary streams:
//!
//! | Property | Stream  | Layout                                        |
//! |----------|---------|-----------------------------------------------|
//! | `0x0002` | GUIDs   | 16 bytes each, little-endian GUID layout      |
//! | `0x0003` | entries | 8 bytes each, see below                       |
//! | `0x0004` | strings | `u32` byte length + UTF-16LE, 4-byte aligned  |
//!
//! ```text
//! 0  u32  numeric name, or offset into the string stream
//! 4  u16  bit 0: name is a string; bits 1..: GUID index
//! 6  u16  property index (id = 0x8000 + index)
//! ```
//!
//! GUID index 1 is `PS_MAPI`, 2 is `PS_PUBLIC_STRINGS`, and 3 onwards
//! count into the GUID stream. An entry that points outside its streams is
//! recorded as an issue and left out; the rest of the map stays usable.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::tags;
use super::types::{decode_utf16, guid};
use super::Properties;
use crate::error::{PffError, Result};

pub const PS_MAPI: Uuid           = Uuid::from_u128(0x00020328_0000_0000_c000_000000000046);
pub const PS_PUBLIC_STRINGS: Uuid = Uuid::from_u128(0x00020329_0000_0000_c000_000000000046);

/// First property id handed out through the map.
pub const FIRST_NAMED_ID: u16 = 0x8000;
const ENTRY_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyName {
    Numeric(u32),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedProperty {
    pub id:   u16,
    pub guid: Uuid,
    pub name: PropertyName,
}

/// An entry that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameIssue {
    pub index:   usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NameToIdMap {
    entries: BTreeMap<u16, NamedProperty>,
    issues:  Vec<NameIssue>,
}

impl NameToIdMap {
    /// Decode the map out of the properties of the map node.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let entries = props
            .bytes(tags::NAMEID_STREAM_ENTRY)
            .ok_or_else(|| PffError::malformed("name-to-id map has no entry stream"))?;
        let guids = props.bytes(tags::NAMEID_STREAM_GUID).unwrap_or(&[]);
        let strings = props.bytes(tags::NAMEID_STREAM_STRING).unwrap_or(&[]);
        Self::decode(guids, entries, strings)
    }

    pub fn decode(guids: &[u8], entries: &[u8], strings: &[u8]) -> Result<Self> {
        if entries.len() % ENTRY_SIZE != 0 {
            return Err(PffError::malformed(format!(
                "name-to-id entry stream of {} bytes is not a multiple of {ENTRY_SIZE}",
                entries.len()
            )));
        }
        let mut map = Self::default();
        for (index, raw) in entries.chunks_exact(ENTRY_SIZE).enumerate() {
            match decode_entry(raw, guids, strings) {
                Ok(entry) => {
                    map.entries.insert(entry.id, entry);
                }
                Err(message) => map.issues.push(NameIssue { index, message }),
            }
        }
        debug!(entries = map.entries.len(), issues = map.issues.len(), "name-to-id map");
        Ok(map)
    }

    pub fn get(&self, id: u16) -> Option<&NamedProperty> {
        self.entries.get(&id)
    }

    /// Id mapped to `guid` and `name`, if any.
    pub fn lookup(&self, guid: Uuid, name: &PropertyName) -> Option<u16> {
        self.entries.values().find(|e| e.guid == guid && &e.name == name).map(|e| e.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedProperty> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn issues(&self) -> &[NameIssue] {
        &self.issues
    }
}

fn decode_entry(raw: &[u8], guids: &[u8], strings: &[u8]) -> std::result::Result<NamedProperty, String> {
    let value = LittleEndian::read_u32(&raw[0..4]);
    let kind = LittleEndian::read_u16(&raw[4..6]);
    let number = LittleEndian::read_u16(&raw[6..8]);
    let id = FIRST_NAMED_ID
        .checked_add(number)
        .ok_or_else(|| format!("property index {number:#x} is past the named range"))?;

    let guid = match kind >> 1 {
        0 => Uuid::nil(),
        1 => PS_MAPI,
        2 => PS_PUBLIC_STRINGS,
        n => {
            let at = (n as usize - 3) * 16;
            let bytes = guids
                .get(at..at + 16)
                .ok_or_else(|| format!("GUID index {n} outside a stream of {} bytes", guids.len()))?;
            guid(bytes)
        }
    };

    let name = if kind & 1 == 0 {
        PropertyName::Numeric(value)
    } else {
        let at = value as usize;
        let size = strings
            .get(at..at + 4)
            .map(LittleEndian::read_u32)
            .ok_or_else(|| format!("string offset {at:#x} outside a stream of {} bytes", strings.len()))?;
        let text = strings
            .get(at + 4..)
            .and_then(|rest| rest.get(..size as usize))
            .ok_or_else(|| format!("string of {size} bytes at {at:#x} overruns the stream"))?;
        PropertyName::String(decode_utf16(text).map_err(|e| e.to_string())?)
    };
    Ok(NamedProperty { id, guid, name })
}

/// Serialised map streams, in property order 0x0002, 0x0003, 0x0004.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameStreams {
    pub guids:   Vec<u8>,
    pub entries: Vec<u8>,
    pub strings: Vec<u8>,
}

/// Build the streams for `names`; the i-th name gets id `0x8000 + i`. Used
/// by the fixture writer.
pub fn encode_streams(names: &[(Uuid, PropertyName)]) -> NameStreams {
    let mut out = NameStreams::default();
    let mut extra: Vec<Uuid> = Vec::new();
    for (number, (set, name)) in names.iter().enumerate() {
        let guid_index: u16 = if set.is_nil() {
            0
        } else if *set == PS_MAPI {
            1
        } else if *set == PS_PUBLIC_STRINGS {
            2
        } else {
            let at = match extra.iter().position(|g| g == set) {
                Some(at) => at,
                None => {
                    extra.push(*set);
                    out.guids.extend_from_slice(&set.to_bytes_le());
                    extra.len() - 1
                }
            };
            3 + at as u16
        };
        let (value, string_bit) = match name {
            PropertyName::Numeric(n) => (*n, 0),
            PropertyName::String(s) => {
                let offset = out.strings.len() as u32;
                let utf16: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
                out.strings.extend_from_slice(&(utf16.len() as u32).to_le_bytes());
                out.strings.extend_from_slice(&utf16);
                out.strings.resize((out.strings.len() + 3) & !3, 0);
                (offset, 1)
            }
        };
        out.entries.extend_from_slice(&value.to_le_bytes());
        out.entries.extend_from_slice(&(guid_index << 1 | string_bit).to_le_bytes());
        out.entries.extend_from_slice(&(number as u16).to_le_bytes());
    }
    out
}
