//! Property tags, the fixed type-tag table and decoded values.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::codepage::decode_codepage;
use crate::error::{PffError, Result};

// ── Tag ──────────────────────────────────────────────────────────────────────

/// Property identifier plus value type, displayed as `0xIIIITTTT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyTag {
    pub id:            u16,
    pub property_type: u16,
}

impl PropertyTag {
    pub fn new(id: u16, property_type: u16) -> Self {
        Self { id, property_type }
    }

    pub fn from_u32(tag: u32) -> Self {
        Self { id: (tag >> 16) as u16, property_type: tag as u16 }
    }

    pub fn as_u32(self) -> u32 {
        ((self.id as u32) << 16) | self.property_type as u32
    }

    pub fn kind(self) -> Option<PropertyType> {
        PropertyType::from_u16(self.property_type)
    }
}

impl fmt::Display for PropertyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.as_u32())
    }
}

impl Serialize for PropertyTag {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// ── Type table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Null,
    Integer16,
    Integer32,
    Floating32,
    Floating64,
    Currency,
    AppTime,
    ErrorCode,
    Boolean,
    Object,
    Integer64,
    String8,
    Unicode,
    Time,
    Guid,
    Binary,
    MultipleInteger16,
    MultipleInteger32,
    MultipleFloating32,
    MultipleFloating64,
    MultipleCurrency,
    MultipleAppTime,
    MultipleInteger64,
    MultipleString8,
    MultipleUnicode,
    MultipleTime,
    MultipleGuid,
    MultipleBinary,
}

impl PropertyType {
    pub fn from_u16(value: u16) -> Option<Self> {
        use PropertyType::*;
        Some(match value {
            0x0001 => Null,
            0x0002 => Integer16,
            0x0003 => Integer32,
            0x0004 => Floating32,
            0x0005 => Floating64,
            0x0006 => Currency,
            0x0007 => AppTime,
            0x000A => ErrorCode,
            0x000B => Boolean,
            0x000D => Object,
            0x0014 => Integer64,
            0x001E => String8,
            0x001F => Unicode,
            0x0040 => Time,
            0x0048 => Guid,
            0x0102 => Binary,
            0x1002 => MultipleInteger16,
            0x1003 => MultipleInteger32,
            0x1004 => MultipleFloating32,
            0x1005 => MultipleFloating64,
            0x1006 => MultipleCurrency,
            0x1007 => MultipleAppTime,
            0x1014 => MultipleInteger64,
            0x101E => MultipleString8,
            0x101F => MultipleUnicode,
            0x1040 => MultipleTime,
            0x1048 => MultipleGuid,
            0x1102 => MultipleBinary,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        use PropertyType::*;
        match self {
            Null               => 0x0001,
            Integer16          => 0x0002,
            Integer32          => 0x0003,
            Floating32         => 0x0004,
            Floating64         => 0x0005,
            Currency           => 0x0006,
            AppTime            => 0x0007,
            ErrorCode          => 0x000A,
            Boolean            => 0x000B,
            Object             => 0x000D,
            Integer64          => 0x0014,
            String8            => 0x001E,
            Unicode            => 0x001F,
            Time               => 0x0040,
            Guid               => 0x0048,
            Binary             => 0x0102,
            MultipleInteger16  => 0x1002,
            MultipleInteger32  => 0x1003,
            MultipleFloating32 => 0x1004,
            MultipleFloating64 => 0x1005,
            MultipleCurrency   => 0x1006,
            MultipleAppTime    => 0x1007,
            MultipleInteger64  => 0x1014,
            MultipleString8    => 0x101E,
            MultipleUnicode    => 0x101F,
            MultipleTime       => 0x1040,
            MultipleGuid       => 0x1048,
            MultipleBinary     => 0x1102,
        }
    }

    /// Size of a single-valued fixed-width type.
    pub fn fixed_size(self) -> Option<usize> {
        use PropertyType::*;
        match self {
            Null                                 => Some(0),
            Boolean                              => Some(1),
            Integer16                            => Some(2),
            Integer32 | Floating32 | ErrorCode   => Some(4),
            Floating64 | Currency | AppTime | Integer64 | Time => Some(8),
            Guid                                 => Some(16),
            _                                    => None,
        }
    }

    /// Element size of a fixed-width multi-valued type.
    pub fn element_size(self) -> Option<usize> {
        use PropertyType::*;
        match self {
            MultipleInteger16  => Some(2),
            MultipleInteger32 | MultipleFloating32 => Some(4),
            MultipleFloating64 | MultipleCurrency | MultipleAppTime | MultipleInteger64 | MultipleTime => Some(8),
            MultipleGuid       => Some(16),
            _                  => None,
        }
    }

    pub fn is_multi(self) -> bool {
        self.as_u16() & 0x1000 != 0
    }

    /// Stored directly in the 4-byte value slot of a property context.
    pub fn is_inline_in_context(self) -> bool {
        matches!(self.fixed_size(), Some(n) if n <= 4)
    }

    /// Stored directly in a table row.
    pub fn is_inline_in_row(self) -> bool {
        matches!(self.fixed_size(), Some(n) if n <= 8)
    }
}

// ── FILETIME ─────────────────────────────────────────────────────────────────

/// 100-nanosecond intervals since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileTime(pub u64);

const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

impl FileTime {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let since_unix = self.0 as i128 - FILETIME_UNIX_EPOCH as i128;
        let secs = since_unix.div_euclid(10_000_000);
        let nanos = (since_unix.rem_euclid(10_000_000) * 100) as u32;
        Utc.timestamp_opt(i64::try_from(secs).ok()?, nanos).single()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let ticks = dt.timestamp() as i128 * 10_000_000 + (dt.timestamp_subsec_nanos() / 100) as i128;
        FileTime((ticks + FILETIME_UNIX_EPOCH as i128).max(0) as u64)
    }
}

impl fmt::Display for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) if self.0 != 0 => write!(f, "{}", dt.to_rfc3339()),
            _ => write!(f, "filetime({:#x})", self.0),
        }
    }
}

impl Serialize for FileTime {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// ── Values ───────────────────────────────────────────────────────────────────

fn hex_bytes<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn hex_list<S: Serializer>(list: &[Vec<u8>], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(list.iter().map(hex::encode))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Null,
    Integer16(i16),
    Integer32(i32),
    Floating32(f32),
    Floating64(f64),
    /// Fixed-point with four decimal places.
    Currency(i64),
    AppTime(f64),
    ErrorCode(u32),
    Boolean(bool),
    /// Reference to a sub-node holding an embedded object.
    Object { id: u32, size: u32 },
    Integer64(i64),
    String8(String),
    Unicode(String),
    Time(FileTime),
    Guid(Uuid),
    Binary(#[serde(serialize_with = "hex_bytes")] Vec<u8>),
    MultipleInteger16(Vec<i16>),
    MultipleInteger32(Vec<i32>),
    MultipleFloating32(Vec<f32>),
    MultipleFloating64(Vec<f64>),
    MultipleCurrency(Vec<i64>),
    MultipleAppTime(Vec<f64>),
    MultipleInteger64(Vec<i64>),
    MultipleString8(Vec<String>),
    MultipleUnicode(Vec<String>),
    MultipleTime(Vec<FileTime>),
    MultipleGuid(Vec<Uuid>),
    MultipleBinary(#[serde(serialize_with = "hex_list")] Vec<Vec<u8>>),
}

impl PropertyValue {
    /// Decode the value bytes of a property of type `ty`. 8-bit strings use
    /// `codepage`.
    pub fn decode(ty: PropertyType, bytes: &[u8], codepage: u16) -> Result<Self> {
        use PropertyType as T;

        if let Some(size) = ty.fixed_size() {
            // Inline slots may carry padding beyond the type's width.
            if bytes.len() < size {
                return Err(PffError::malformed(format!(
                    "{ty:?} value needs {size} bytes, got {}",
                    bytes.len()
                )));
            }
        }
        let value = match ty {
            T::Null       => PropertyValue::Null,
            T::Integer16  => PropertyValue::Integer16(LittleEndian::read_i16(bytes)),
            T::Integer32  => PropertyValue::Integer32(LittleEndian::read_i32(bytes)),
            T::Floating32 => PropertyValue::Floating32(LittleEndian::read_f32(bytes)),
            T::Floating64 => PropertyValue::Floating64(LittleEndian::read_f64(bytes)),
            T::Currency   => PropertyValue::Currency(LittleEndian::read_i64(bytes)),
            T::AppTime    => PropertyValue::AppTime(LittleEndian::read_f64(bytes)),
            T::ErrorCode  => PropertyValue::ErrorCode(LittleEndian::read_u32(bytes)),
            T::Boolean    => PropertyValue::Boolean(bytes[0] != 0),
            T::Integer64  => PropertyValue::Integer64(LittleEndian::read_i64(bytes)),
            T::Time       => PropertyValue::Time(FileTime(LittleEndian::read_u64(bytes))),
            T::Guid       => PropertyValue::Guid(guid(bytes)),
            T::Object => {
                if bytes.len() < 8 {
                    return Err(PffError::malformed(format!("object value of {} bytes", bytes.len())));
                }
                PropertyValue::Object {
                    id:   LittleEndian::read_u32(&bytes[0..4]),
                    size: LittleEndian::read_u32(&bytes[4..8]),
                }
            }
            T::String8 => PropertyValue::String8(decode_codepage(bytes, codepage)),
            T::Unicode => PropertyValue::Unicode(decode_utf16(bytes)?),
            T::Binary  => PropertyValue::Binary(bytes.to_vec()),

            T::MultipleInteger16  => PropertyValue::MultipleInteger16(fixed_elements(ty, bytes, LittleEndian::read_i16)?),
            T::MultipleInteger32  => PropertyValue::MultipleInteger32(fixed_elements(ty, bytes, LittleEndian::read_i32)?),
            T::MultipleFloating32 => PropertyValue::MultipleFloating32(fixed_elements(ty, bytes, LittleEndian::read_f32)?),
            T::MultipleFloating64 => PropertyValue::MultipleFloating64(fixed_elements(ty, bytes, LittleEndian::read_f64)?),
            T::MultipleCurrency   => PropertyValue::MultipleCurrency(fixed_elements(ty, bytes, LittleEndian::read_i64)?),
            T::MultipleAppTime    => PropertyValue::MultipleAppTime(fixed_elements(ty, bytes, LittleEndian::read_f64)?),
            T::MultipleInteger64  => PropertyValue::MultipleInteger64(fixed_elements(ty, bytes, LittleEndian::read_i64)?),
            T::MultipleTime       => PropertyValue::MultipleTime(fixed_elements(ty, bytes, |b| FileTime(LittleEndian::read_u64(b)))?),
            T::MultipleGuid       => PropertyValue::MultipleGuid(fixed_elements(ty, bytes, guid)?),
            T::MultipleString8 => PropertyValue::MultipleString8(
                variable_elements(bytes)?.into_iter().map(|b| decode_codepage(b, codepage)).collect(),
            ),
            T::MultipleUnicode => PropertyValue::MultipleUnicode(
                variable_elements(bytes)?.into_iter().map(decode_utf16).collect::<Result<_>>()?,
            ),
            T::MultipleBinary => PropertyValue::MultipleBinary(
                variable_elements(bytes)?.into_iter().map(<[u8]>::to_vec).collect(),
            ),
        };
        Ok(value)
    }

    /// Text of string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String8(s) | PropertyValue::Unicode(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            PropertyValue::Integer16(v) => Some(v as i64),
            PropertyValue::Integer32(v) => Some(v as i64),
            PropertyValue::Integer64(v) => Some(v),
            PropertyValue::ErrorCode(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PropertyValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<FileTime> {
        match *self {
            PropertyValue::Time(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Type tag this value encodes as.
    pub fn property_type(&self) -> PropertyType {
        use PropertyType as T;
        match self {
            PropertyValue::Null                  => T::Null,
            PropertyValue::Integer16(_)          => T::Integer16,
            PropertyValue::Integer32(_)          => T::Integer32,
            PropertyValue::Floating32(_)         => T::Floating32,
            PropertyValue::Floating64(_)         => T::Floating64,
            PropertyValue::Currency(_)           => T::Currency,
            PropertyValue::AppTime(_)            => T::AppTime,
            PropertyValue::ErrorCode(_)          => T::ErrorCode,
            PropertyValue::Boolean(_)            => T::Boolean,
            PropertyValue::Object { .. }         => T::Object,
            PropertyValue::Integer64(_)          => T::Integer64,
            PropertyValue::String8(_)            => T::String8,
            PropertyValue::Unicode(_)            => T::Unicode,
            PropertyValue::Time(_)               => T::Time,
            PropertyValue::Guid(_)               => T::Guid,
            PropertyValue::Binary(_)             => T::Binary,
            PropertyValue::MultipleInteger16(_)  => T::MultipleInteger16,
            PropertyValue::MultipleInteger32(_)  => T::MultipleInteger32,
            PropertyValue::MultipleFloating32(_) => T::MultipleFloating32,
            PropertyValue::MultipleFloating64(_) => T::MultipleFloating64,
            PropertyValue::MultipleCurrency(_)   => T::MultipleCurrency,
            PropertyValue::MultipleAppTime(_)    => T::MultipleAppTime,
            PropertyValue::MultipleInteger64(_)  => T::MultipleInteger64,
            PropertyValue::MultipleString8(_)    => T::MultipleString8,
            PropertyValue::MultipleUnicode(_)    => T::MultipleUnicode,
            PropertyValue::MultipleTime(_)       => T::MultipleTime,
            PropertyValue::MultipleGuid(_)       => T::MultipleGuid,
            PropertyValue::MultipleBinary(_)     => T::MultipleBinary,
        }
    }

    /// Serialise to value bytes, the inverse of [`decode`](Self::decode).
    /// 8-bit strings are written as Windows-1252.
    pub fn encode(&self) -> Vec<u8> {
        fn fixed<T: Copy>(values: &[T], size: usize, put: fn(&mut [u8], T)) -> Vec<u8> {
            let mut out = vec![0u8; values.len() * size];
            for (i, v) in values.iter().enumerate() {
                put(&mut out[i * size..(i + 1) * size], *v);
            }
            out
        }
        fn variable(items: Vec<Vec<u8>>) -> Vec<u8> {
            let header = 4 + 4 * items.len();
            let mut out = vec![0u8; header];
            LittleEndian::write_u32(&mut out[0..4], items.len() as u32);
            for (i, item) in items.into_iter().enumerate() {
                let at = out.len() as u32;
                LittleEndian::write_u32(&mut out[4 + 4 * i..8 + 4 * i], at);
                out.extend(item);
            }
            out
        }
        match self {
            PropertyValue::Null          => Vec::new(),
            PropertyValue::Integer16(v)  => v.to_le_bytes().to_vec(),
            PropertyValue::Integer32(v)  => v.to_le_bytes().to_vec(),
            PropertyValue::Floating32(v) => v.to_le_bytes().to_vec(),
            PropertyValue::Floating64(v) => v.to_le_bytes().to_vec(),
            PropertyValue::Currency(v)   => v.to_le_bytes().to_vec(),
            PropertyValue::AppTime(v)    => v.to_le_bytes().to_vec(),
            PropertyValue::ErrorCode(v)  => v.to_le_bytes().to_vec(),
            PropertyValue::Boolean(v)    => vec![*v as u8],
            PropertyValue::Object { id, size } => [id.to_le_bytes(), size.to_le_bytes()].concat(),
            PropertyValue::Integer64(v)  => v.to_le_bytes().to_vec(),
            PropertyValue::String8(s)    => encoding_rs::WINDOWS_1252.encode(s).0.into_owned(),
            PropertyValue::Unicode(s)    => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            PropertyValue::Time(t)       => t.0.to_le_bytes().to_vec(),
            PropertyValue::Guid(g)       => g.to_bytes_le().to_vec(),
            PropertyValue::Binary(b)     => b.clone(),
            PropertyValue::MultipleInteger16(v)  => fixed(v, 2, LittleEndian::write_i16),
            PropertyValue::MultipleInteger32(v)  => fixed(v, 4, LittleEndian::write_i32),
            PropertyValue::MultipleFloating32(v) => fixed(v, 4, LittleEndian::write_f32),
            PropertyValue::MultipleFloating64(v) => fixed(v, 8, LittleEndian::write_f64),
            PropertyValue::MultipleCurrency(v)   => fixed(v, 8, LittleEndian::write_i64),
            PropertyValue::MultipleAppTime(v)    => fixed(v, 8, LittleEndian::write_f64),
            PropertyValue::MultipleInteger64(v)  => fixed(v, 8, LittleEndian::write_i64),
            PropertyValue::MultipleTime(v)       => v.iter().flat_map(|t| t.0.to_le_bytes()).collect(),
            PropertyValue::MultipleGuid(v)       => v.iter().flat_map(|g| g.to_bytes_le()).collect(),
            PropertyValue::MultipleString8(v) => variable(
                v.iter().map(|s| encoding_rs::WINDOWS_1252.encode(s).0.into_owned()).collect(),
            ),
            PropertyValue::MultipleUnicode(v) => variable(
                v.iter().map(|s| s.encode_utf16().flat_map(u16::to_le_bytes).collect()).collect(),
            ),
            PropertyValue::MultipleBinary(v) => variable(v.clone()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String8(s) | PropertyValue::Unicode(s) => write!(f, "{s:?}"),
            PropertyValue::Binary(b) if b.len() > 32 => write!(f, "{}… ({} bytes)", hex::encode(&b[..32]), b.len()),
            PropertyValue::Binary(b) => write!(f, "{}", hex::encode(b)),
            PropertyValue::Time(t)   => write!(f, "{t}"),
            PropertyValue::Guid(g)   => write!(f, "{g}"),
            PropertyValue::Boolean(b) => write!(f, "{b}"),
            PropertyValue::Object { id, size } => write!(f, "object {id:#x} ({size} bytes)"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn guid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes_le(raw)
}

pub(crate) fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(PffError::malformed(format!("UTF-16 string of odd length {}", bytes.len())));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
    let end = units.iter().rposition(|&u| u != 0).map_or(0, |i| i + 1);
    Ok(String::from_utf16_lossy(&units[..end]))
}

fn fixed_elements<T>(ty: PropertyType, bytes: &[u8], read: impl Fn(&[u8]) -> T) -> Result<Vec<T>> {
    let size = ty.element_size().unwrap_or(1);
    if bytes.len() % size != 0 {
        return Err(PffError::malformed(format!(
            "{ty:?} value of {} bytes is not a multiple of {size}",
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(size).map(read).collect())
}

/// `count u32, offsets u32[count], data`; each element ends where the next
/// begins, the last at the end of the value.
fn variable_elements(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let malformed = || PffError::malformed("multi-value offsets out of range");
    if bytes.len() < 4 {
        return Err(malformed());
    }
    let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let table_end = count.checked_mul(4).and_then(|n| n.checked_add(4)).ok_or_else(malformed)?;
    if table_end > bytes.len() {
        return Err(malformed());
    }
    let offsets: Vec<usize> = (0..count)
        .map(|i| LittleEndian::read_u32(&bytes[4 + 4 * i..]) as usize)
        .collect();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(bytes.len());
        if start < table_end || start > end || end > bytes.len() {
            return Err(malformed());
        }
        out.push(&bytes[start..end]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display_and_split() {
        let tag = PropertyTag::from_u32(0x0037_001F);
        assert_eq!(tag.id, 0x0037);
        assert_eq!(tag.kind(), Some(PropertyType::Unicode));
        assert_eq!(tag.to_string(), "0x0037001f");
    }

    #[test]
    fn every_type_code_maps_back() {
        for code in 0u16..=0x1200 {
            if let Some(ty) = PropertyType::from_u16(code) {
                assert_eq!(ty.as_u16(), code);
            }
        }
        assert!(PropertyType::from_u16(0x0099).is_none());
    }

    #[test]
    fn scalars() {
        assert_eq!(PropertyValue::decode(PropertyType::Integer32, &[0xFE, 0xFF, 0xFF, 0xFF], 1252).unwrap(), PropertyValue::Integer32(-2));
        assert_eq!(PropertyValue::decode(PropertyType::Boolean, &[1, 0, 0, 0], 1252).unwrap(), PropertyValue::Boolean(true));
        assert_eq!(PropertyValue::decode(PropertyType::Integer16, &[0x34, 0x12, 0, 0], 1252).unwrap(), PropertyValue::Integer16(0x1234));
        assert!(PropertyValue::decode(PropertyType::Integer64, &[0; 4], 1252).is_err());
    }

    #[test]
    fn strings() {
        let utf16: Vec<u8> = "Posteingang\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(PropertyValue::decode(PropertyType::Unicode, &utf16, 1252).unwrap(), PropertyValue::Unicode("Posteingang".into()));
        assert!(PropertyValue::decode(PropertyType::Unicode, &[0x41], 1252).is_err());
        assert_eq!(
            PropertyValue::decode(PropertyType::String8, b"caf\xe9\0", 1252).unwrap(),
            PropertyValue::String8("café".into())
        );
    }

    #[test]
    fn multi_values() {
        let v = PropertyValue::MultipleUnicode(vec!["a".into(), "".into(), "xyz".into()]);
        let bytes = v.encode();
        assert_eq!(PropertyValue::decode(PropertyType::MultipleUnicode, &bytes, 1252).unwrap(), v);

        let ints = PropertyValue::MultipleInteger32(vec![1, -1, 7]);
        assert_eq!(PropertyValue::decode(PropertyType::MultipleInteger32, &ints.encode(), 1252).unwrap(), ints);
        assert!(PropertyValue::decode(PropertyType::MultipleInteger32, &[0; 5], 1252).is_err());

        let mut bad = PropertyValue::MultipleBinary(vec![vec![1, 2]]).encode();
        bad[4] = 0xFF;
        assert!(PropertyValue::decode(PropertyType::MultipleBinary, &bad, 1252).is_err());
    }

    #[test]
    fn filetime_conversion() {
        let t = FileTime(FILETIME_UNIX_EPOCH + 10_000_000);
        let dt = t.to_datetime().unwrap();
        assert_eq!(dt.timestamp(), 1);
        assert_eq!(FileTime::from_datetime(dt), t);
        assert_eq!(FileTime(0).to_datetime().unwrap().timestamp(), -11_644_473_600);
    }

    #[test]
    fn guid_le_layout() {
        let g = Uuid::parse_str("00062008-0000-0000-c000-000000000046").unwrap();
        let v = PropertyValue::Guid(g);
        let bytes = v.encode();
        assert_eq!(&bytes[..4], &[0x08, 0x20, 0x06, 0x00]);
        assert_eq!(PropertyValue::decode(PropertyType::Guid, &bytes, 1252).unwrap(), v);
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_string(&PropertyValue::Binary(vec![0xAB, 0x01])).unwrap();
        assert_eq!(json, r#"{"type":"binary","value":"ab01"}"#);
    }
}
