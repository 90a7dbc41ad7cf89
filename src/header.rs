//! File header: signature, format variant, encryption mode and the two
//! B-tree roots.
//!
//! # Layout
//!
//! | Field | ANSI | Unicode / 4K |
//! |-------|------|--------------|
//! | magic `!BDN` | 0 | 0 |
//! | partial CRC (bytes 8..479) | 4 | 4 |
//! | client magic | 8 | 8 |
//! | data version | 10 | 10 |
//! | client version | 12 | 12 |
//! | next page id | 28 | 32 |
//! | unique counter | 32 | 40 |
//! | file size | 168 | 184 |
//! | descriptors root (id, offset) | 184, 188 | 216, 224 |
//! | offsets root (id, offset) | 192, 196 | 232, 240 |
//! | allocation map valid | 200 | 248 |
//! | sentinel `0x80` | 460 | 512 |
//! | encryption type | 461 | 513 |
//! | next block id | 24 | 516 |
//! | full CRC (bytes 8..523) | – | 524 |
//!
//! All integers are little-endian.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::debug;

use crate::checksum::weak_crc32;
use crate::error::{PffError, Result};
use crate::io_stream::{le_u16, le_u32, le_u64, PffReader};

pub const HEADER_MAGIC: &[u8; 4] = b"!BDN";
pub const ANSI_HEADER_SIZE:    usize = 512;
pub const UNICODE_HEADER_SIZE: usize = 564;
pub const HEADER_SENTINEL:     u8    = 0x80;

const PARTIAL_CRC_RANGE: std::ops::Range<usize> = 8..479;
const FULL_CRC_RANGE:    std::ops::Range<usize> = 8..524;

// ── Enumerations ─────────────────────────────────────────────────────────────

/// Container flavour, from the client magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentType {
    /// Personal storage table (`SM`).
    Pst,
    /// Offline storage table (`SO`).
    Ost,
    /// Personal address book (`AB`).
    Pab,
}

impl ContentType {
    fn from_magic(magic: [u8; 2]) -> Option<Self> {
        match &magic {
            b"SM" => Some(Self::Pst),
            b"SO" => Some(Self::Ost),
            b"AB" => Some(Self::Pab),
            _     => None,
        }
    }

    pub fn magic(self) -> [u8; 2] {
        match self {
            Self::Pst => *b"SM",
            Self::Ost => *b"SO",
            Self::Pab => *b"AB",
        }
    }
}

/// Table layout selected once from the data version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FormatVariant {
    /// 32-bit identifiers and offsets, 512-byte pages.
    Ansi,
    /// 64-bit identifiers and offsets, 512-byte pages.
    Unicode,
    /// 64-bit identifiers, 4 KiB pages, optionally compressed blocks.
    Unicode4k,
}

impl FormatVariant {
    pub fn from_data_version(version: u16) -> Option<Self> {
        match version {
            14 | 15 => Some(Self::Ansi),
            21 | 23 => Some(Self::Unicode),
            36      => Some(Self::Unicode4k),
            _       => None,
        }
    }

    /// Data version written by [`Header::encode`].
    pub fn data_version(self) -> u16 {
        match self {
            Self::Ansi      => 14,
            Self::Unicode   => 23,
            Self::Unicode4k => 36,
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            Self::Ansi => ANSI_HEADER_SIZE,
            _          => UNICODE_HEADER_SIZE,
        }
    }

    /// Size of an identifier or offset field in tables.
    pub fn id_size(self) -> usize {
        match self {
            Self::Ansi => 4,
            _          => 8,
        }
    }

    pub fn page_size(self) -> usize {
        match self {
            Self::Unicode4k => 4096,
            _               => 512,
        }
    }

    /// Blocks start on this boundary and occupy a multiple of it.
    pub fn block_alignment(self) -> u64 {
        match self {
            Self::Unicode4k => 512,
            _               => 64,
        }
    }

    pub fn block_trailer_size(self) -> usize {
        match self {
            Self::Ansi      => 12,
            Self::Unicode   => 16,
            Self::Unicode4k => 24,
        }
    }

    /// Largest on-disk block including its trailer.
    pub fn max_block_size(self) -> usize {
        match self {
            Self::Unicode4k => 65536,
            _               => 8192,
        }
    }

    /// Largest payload a single data block carries.
    pub fn max_block_data(self) -> usize {
        self.max_block_size() - self.block_trailer_size()
    }

    pub fn is_wide(self) -> bool {
        !matches!(self, Self::Ansi)
    }
}

/// Block encryption applied to non-internal data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncryptionType {
    None,
    /// Byte substitution ("compressible encryption").
    Compressible,
    /// Keyed three-table rotor ("high encryption").
    High,
}

impl EncryptionType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Compressible),
            2 => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::None         => 0,
            Self::Compressible => 1,
            Self::High         => 2,
        }
    }
}

/// Reference to a page or block: its id and physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockRef {
    pub id:     u64,
    pub offset: u64,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{:#x}", self.id, self.offset)
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub content_type:     ContentType,
    pub variant:          FormatVariant,
    pub data_version:     u16,
    pub client_version:   u16,
    pub encryption:       EncryptionType,
    pub file_size:        u64,
    pub descriptors_root: BlockRef,
    pub offsets_root:     BlockRef,
    pub next_block_id:    u64,
    pub next_page_id:     u64,
    pub unique:           u32,
}

struct Offsets {
    next_block_id:    usize,
    next_page_id:     usize,
    unique:           usize,
    file_size:        usize,
    descriptors_root: usize,
    offsets_root:     usize,
    amap_valid:       usize,
    sentinel:         usize,
    encryption:       usize,
}

const ANSI_OFFSETS: Offsets = Offsets {
    next_block_id:    24,
    next_page_id:     28,
    unique:           32,
    file_size:        168,
    descriptors_root: 184,
    offsets_root:     192,
    amap_valid:       200,
    sentinel:         460,
    encryption:       461,
};

const UNICODE_OFFSETS: Offsets = Offsets {
    next_block_id:    516,
    next_page_id:     32,
    unique:           40,
    file_size:        184,
    descriptors_root: 216,
    offsets_root:     232,
    amap_valid:       248,
    sentinel:         512,
    encryption:       513,
};

fn offsets_for(variant: FormatVariant) -> &'static Offsets {
    match variant {
        FormatVariant::Ansi => &ANSI_OFFSETS,
        _                   => &UNICODE_OFFSETS,
    }
}

impl Header {
    /// Fresh header for a container of the given shape; roots and sizes are
    /// filled in by the caller.
    pub fn new(content_type: ContentType, variant: FormatVariant, encryption: EncryptionType) -> Self {
        Self {
            content_type,
            variant,
            data_version:     variant.data_version(),
            client_version:   19,
            encryption,
            file_size:        0,
            descriptors_root: BlockRef::default(),
            offsets_root:     BlockRef::default(),
            next_block_id:    4,
            next_page_id:     1,
            unique:           0,
        }
    }

    /// Decode and validate the header at the start of `reader`, verifying
    /// both header checksums.
    pub fn decode(reader: &PffReader) -> Result<Self> {
        Self::decode_with(reader, true)
    }

    pub fn decode_with(reader: &PffReader, verify_checksums: bool) -> Result<Self> {
        let available = reader.size().min(UNICODE_HEADER_SIZE as u64) as usize;
        let bytes = reader.read_at(0, available)?;
        Self::parse(&bytes, reader.size(), verify_checksums)
    }

    /// Decode from the leading header bytes of a container of
    /// `container_size` bytes.
    pub fn parse(bytes: &[u8], container_size: u64, verify_checksums: bool) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != HEADER_MAGIC {
            let found = bytes.get(0..4).map(hex::encode).unwrap_or_default();
            return Err(PffError::invalid_signature(format!("file magic {found:?}")));
        }
        let content_type = ContentType::from_magic([bytes[8], bytes[9]]).ok_or_else(|| {
            PffError::invalid_signature(format!("client magic {}", hex::encode(&bytes[8..10])))
        })?;
        let data_version = LittleEndian::read_u16(&bytes[10..12]);
        let variant = FormatVariant::from_data_version(data_version)
            .ok_or(PffError::UnsupportedVersion { version: data_version })?;

        let size = variant.header_size();
        if bytes.len() < size {
            return Err(PffError::corrupt_header(format!(
                "container holds {} bytes, header needs {size}",
                bytes.len()
            )));
        }
        let bytes = &bytes[..size];

        if verify_checksums {
            let stored = LittleEndian::read_u32(&bytes[4..8]);
            let computed = weak_crc32(&bytes[PARTIAL_CRC_RANGE]);
            if stored != computed {
                return Err(PffError::corrupt_header(format!(
                    "partial CRC {stored:#010x}, computed {computed:#010x}"
                )));
            }
            if variant.is_wide() {
                let stored = LittleEndian::read_u32(&bytes[524..528]);
                let computed = weak_crc32(&bytes[FULL_CRC_RANGE]);
                if stored != computed {
                    return Err(PffError::corrupt_header(format!(
                        "full CRC {stored:#010x}, computed {computed:#010x}"
                    )));
                }
            }
        }

        let at = offsets_for(variant);
        let missing = || PffError::corrupt_header("truncated header field");
        let id = |offset: usize| -> Result<u64> {
            match variant {
                FormatVariant::Ansi => le_u32(bytes, offset).map(u64::from).ok_or_else(missing),
                _                   => le_u64(bytes, offset).ok_or_else(missing),
            }
        };
        let width = variant.id_size();

        if bytes[at.sentinel] != HEADER_SENTINEL {
            return Err(PffError::corrupt_header(format!(
                "sentinel {:#04x}, expected {HEADER_SENTINEL:#04x}",
                bytes[at.sentinel]
            )));
        }
        let encryption = EncryptionType::from_byte(bytes[at.encryption]).ok_or_else(|| {
            PffError::decryption(0, format!("unknown encryption type {:#04x}", bytes[at.encryption]))
        })?;

        let header = Self {
            content_type,
            variant,
            data_version,
            client_version:   le_u16(bytes, 12).ok_or_else(missing)?,
            encryption,
            file_size:        id(at.file_size)?,
            descriptors_root: BlockRef {
                id:     id(at.descriptors_root)?,
                offset: id(at.descriptors_root + width)?,
            },
            offsets_root:     BlockRef {
                id:     id(at.offsets_root)?,
                offset: id(at.offsets_root + width)?,
            },
            next_block_id:    id(at.next_block_id)?,
            next_page_id:     id(at.next_page_id)?,
            unique:           le_u32(bytes, at.unique).ok_or_else(missing)?,
        };
        header.check_sizes(container_size)?;

        debug!(
            variant = ?header.variant,
            content = ?header.content_type,
            encryption = ?header.encryption,
            file_size = header.file_size,
            "decoded header"
        );
        Ok(header)
    }

    fn check_sizes(&self, container_size: u64) -> Result<()> {
        let header_end = self.variant.header_size() as u64;
        if self.file_size < header_end || self.file_size > container_size {
            return Err(PffError::corrupt_header(format!(
                "declared file size {} inconsistent with container size {container_size}",
                self.file_size
            )));
        }
        for (name, root) in [("descriptors", self.descriptors_root), ("offsets", self.offsets_root)] {
            let page_end = root.offset.checked_add(self.variant.page_size() as u64);
            if root.offset < header_end || page_end.map_or(true, |end| end > self.file_size) {
                return Err(PffError::corrupt_header(format!(
                    "{name} root page offset {:#x} outside file of {} bytes",
                    root.offset, self.file_size
                )));
            }
        }
        Ok(())
    }

    /// Serialise to the variant's on-disk layout with fresh checksums.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.variant.header_size()];
        let at = offsets_for(self.variant);
        let width = self.variant.id_size();
        let put = |buf: &mut [u8], offset: usize, value: u64| match width {
            4 => LittleEndian::write_u32(&mut buf[offset..offset + 4], value as u32),
            _ => LittleEndian::write_u64(&mut buf[offset..offset + 8], value),
        };

        buf[0..4].copy_from_slice(HEADER_MAGIC);
        buf[8..10].copy_from_slice(&self.content_type.magic());
        LittleEndian::write_u16(&mut buf[10..12], self.data_version);
        LittleEndian::write_u16(&mut buf[12..14], self.client_version);
        buf[14] = 1;
        buf[15] = 1;
        put(&mut buf, at.next_block_id, self.next_block_id);
        put(&mut buf, at.next_page_id, self.next_page_id);
        LittleEndian::write_u32(&mut buf[at.unique..at.unique + 4], self.unique);
        put(&mut buf, at.file_size, self.file_size);
        put(&mut buf, at.descriptors_root, self.descriptors_root.id);
        put(&mut buf, at.descriptors_root + width, self.descriptors_root.offset);
        put(&mut buf, at.offsets_root, self.offsets_root.id);
        put(&mut buf, at.offsets_root + width, self.offsets_root.offset);
        buf[at.amap_valid] = 2;
        buf[at.sentinel] = HEADER_SENTINEL;
        buf[at.encryption] = self.encryption.as_byte();

        let partial = weak_crc32(&buf[PARTIAL_CRC_RANGE]);
        LittleEndian::write_u32(&mut buf[4..8], partial);
        if self.variant.is_wide() {
            let full = weak_crc32(&buf[FULL_CRC_RANGE]);
            LittleEndian::write_u32(&mut buf[524..528], full);
        }
        buf
    }
}
