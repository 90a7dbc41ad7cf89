//! Data blocks: stored bytes plus trailer, and the decode pipeline.
//!
//! A block occupies `align(size + trailer)` bytes at its offset: the
//! payload, zero padding, then the trailer at the end of the footprint.
//!
//! | | ANSI (12) | Unicode (16) | 4K (24) |
//! |-|-----------|--------------|---------|
//! | stored size u16 | 0 | 0 | 0 |
//! | signature u16 | 2 | 2 | 2 |
//! | CRC u32 | 8 | 4 | 4 |
//! | block id | 4 (u32) | 8 (u64) | 8 (u64) |
//! | inflated size u16 | – | – | 18 |
//!
//! Decoding is `verify trailer → decrypt → decompress`, in that order.
//! Encoding runs the inverse: `compress → encrypt → trailer`.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};

use crate::allocation::{AllocationEntry, AllocationIndex};
use crate::cache::BlockCache;
use crate::checksum::{compute_signature, weak_crc32};
use crate::codec::{get_codec, CodecError, CodecId};
use crate::crypto;
use crate::error::{PffError, Result};
use crate::header::{EncryptionType, FormatVariant};
use crate::io_stream::PffReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTrailer {
    pub size:          u16,
    pub signature:     u16,
    pub crc:           u32,
    pub id:            u64,
    /// 4K variant only; zero elsewhere.
    pub inflated_size: u16,
}

impl BlockTrailer {
    pub fn parse(variant: FormatVariant, buf: &[u8]) -> Self {
        let size = LittleEndian::read_u16(&buf[0..2]);
        let signature = LittleEndian::read_u16(&buf[2..4]);
        match variant {
            FormatVariant::Ansi => Self {
                size,
                signature,
                id:            LittleEndian::read_u32(&buf[4..8]) as u64,
                crc:           LittleEndian::read_u32(&buf[8..12]),
                inflated_size: 0,
            },
            FormatVariant::Unicode => Self {
                size,
                signature,
                crc:           LittleEndian::read_u32(&buf[4..8]),
                id:            LittleEndian::read_u64(&buf[8..16]),
                inflated_size: 0,
            },
            FormatVariant::Unicode4k => Self {
                size,
                signature,
                crc:           LittleEndian::read_u32(&buf[4..8]),
                id:            LittleEndian::read_u64(&buf[8..16]),
                inflated_size: LittleEndian::read_u16(&buf[18..20]),
            },
        }
    }

    pub fn encode(&self, variant: FormatVariant) -> Vec<u8> {
        let mut buf = vec![0u8; variant.block_trailer_size()];
        LittleEndian::write_u16(&mut buf[0..2], self.size);
        LittleEndian::write_u16(&mut buf[2..4], self.signature);
        match variant {
            FormatVariant::Ansi => {
                LittleEndian::write_u32(&mut buf[4..8], self.id as u32);
                LittleEndian::write_u32(&mut buf[8..12], self.crc);
            }
            _ => {
                LittleEndian::write_u32(&mut buf[4..8], self.crc);
                LittleEndian::write_u64(&mut buf[8..16], self.id);
                if variant == FormatVariant::Unicode4k {
                    LittleEndian::write_u16(&mut buf[18..20], self.inflated_size);
                }
            }
        }
        buf
    }
}

/// Block as stored: the (possibly encrypted, possibly compressed) bytes.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub entry:   AllocationEntry,
    pub trailer: BlockTrailer,
    pub stored:  Vec<u8>,
}

impl RawBlock {
    pub fn decode(self, pipeline: &BlockPipeline) -> Result<Block> {
        pipeline.decode(self)
    }
}

/// Decoded block payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id:   u64,
    pub data: Arc<[u8]>,
}

impl Block {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Per-container block transform settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPipeline {
    pub variant:    FormatVariant,
    pub encryption: EncryptionType,
    pub verify:     bool,
}

impl BlockPipeline {
    pub fn new(variant: FormatVariant, encryption: EncryptionType, verify: bool) -> Self {
        Self { variant, encryption, verify }
    }

    /// Read the stored bytes and trailer of `entry` and check the trailer
    /// against the table entry.
    pub fn read_raw(&self, reader: &PffReader, entry: &AllocationEntry) -> Result<RawBlock> {
        let trailer_size = self.variant.block_trailer_size();
        let trailer_at = entry.offset + entry.footprint(self.variant) - trailer_size as u64;
        let stored = reader.read_at(entry.offset, entry.size as usize)?;
        let trailer = BlockTrailer::parse(self.variant, &reader.read_at(trailer_at, trailer_size)?);
        trace!(id = entry.id, offset = entry.offset, size = entry.size, "read block");

        let malformed = |what: String| PffError::malformed(format!("block {:#x}: {what}", entry.id));
        if trailer.size != entry.size {
            return Err(malformed(format!("trailer size {} but table says {}", trailer.size, entry.size)));
        }
        if trailer.id != 0 && (trailer.id & !1) != (entry.id & !1) {
            return Err(malformed(format!("trailer id {:#x}", trailer.id)));
        }
        if trailer.crc != 0 {
            let computed = weak_crc32(&stored);
            if computed != trailer.crc {
                if self.verify {
                    return Err(malformed(format!("CRC {:#010x}, computed {computed:#010x}", trailer.crc)));
                }
                warn!(id = entry.id, "block CRC mismatch tolerated");
            }
        }
        if self.verify && trailer.signature != 0 && trailer.signature != compute_signature(entry.offset, trailer.id) {
            return Err(malformed(format!("signature {:#06x}", trailer.signature)));
        }
        Ok(RawBlock { entry: *entry, trailer, stored })
    }

    /// Decrypt, then decompress.
    pub fn decode(&self, raw: RawBlock) -> Result<Block> {
        let id = raw.entry.id;
        let mut data = raw.stored;

        if self.encryption != EncryptionType::None && !raw.entry.is_internal() {
            crypto::decrypt(self.encryption, id, &mut data);
        }

        if self.variant == FormatVariant::Unicode4k {
            let codec_id = CodecId::for_block(data.len(), raw.trailer.inflated_size as usize);
            if codec_id != CodecId::None {
                data = get_codec(codec_id)
                    .decompress(&data, raw.trailer.inflated_size as usize)
                    .map_err(|e| PffError::decompression(id, e.to_string()))?;
            }
        }
        Ok(Block { id, data: data.into() })
    }

    pub fn read_block(&self, reader: &PffReader, entry: &AllocationEntry) -> Result<Block> {
        let raw = self.read_raw(reader, entry)?;
        self.decode(raw)
    }

    /// Produce the on-disk footprint of a block holding `payload`.
    /// `compress` only has an effect for the 4K variant.
    pub fn encode(&self, id: u64, offset: u64, payload: &[u8], compress: bool) -> std::result::Result<Vec<u8>, CodecError> {
        let mut stored = payload.to_vec();
        let mut inflated_size = 0u16;
        if compress && self.variant == FormatVariant::Unicode4k {
            let packed = get_codec(CodecId::Deflate).compress(payload)?;
            if packed.len() < payload.len() {
                inflated_size = payload.len() as u16;
                stored = packed;
            }
        }
        if self.encryption != EncryptionType::None && id & 0x2 == 0 {
            crypto::encrypt(self.encryption, id, &mut stored);
        }

        let trailer = BlockTrailer {
            size: stored.len() as u16,
            signature: compute_signature(offset, id),
            crc: weak_crc32(&stored),
            id,
            inflated_size,
        };
        let trailer_bytes = trailer.encode(self.variant);
        let align = self.variant.block_alignment() as usize;
        let footprint = (stored.len() + trailer_bytes.len()).div_ceil(align) * align;

        let mut out = stored;
        out.resize(footprint - trailer_bytes.len(), 0);
        out.extend_from_slice(&trailer_bytes);
        Ok(out)
    }
}

/// On-disk footprint of block `id` at `offset`; see [`BlockPipeline::encode`].
pub fn encode_block(
    pipeline: &BlockPipeline,
    id:       u64,
    offset:   u64,
    payload:  &[u8],
    compress: bool,
) -> std::result::Result<Vec<u8>, CodecError> {
    pipeline.encode(id, offset, payload, compress)
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Block access for one open container: table lookup, pipeline and the
/// optional shared cache.
pub struct BlockStore {
    reader:     PffReader,
    allocation: AllocationIndex,
    pipeline:   BlockPipeline,
    cache:      BlockCache,
}

impl BlockStore {
    pub fn new(reader: PffReader, allocation: AllocationIndex, pipeline: BlockPipeline, cache: BlockCache) -> Self {
        Self { reader, allocation, pipeline, cache }
    }

    pub fn variant(&self) -> FormatVariant {
        self.pipeline.variant
    }

    pub fn pipeline(&self) -> &BlockPipeline {
        &self.pipeline
    }

    pub fn reader(&self) -> &PffReader {
        &self.reader
    }

    pub fn allocation(&self) -> &AllocationIndex {
        &self.allocation
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn entry(&self, id: u64) -> Result<&AllocationEntry> {
        self.allocation
            .lookup(id)
            .ok_or_else(|| PffError::malformed(format!("block {id:#x} is not in the offsets table")))
    }

    /// Stored bytes of a block, before any transform.
    pub fn raw(&self, id: u64) -> Result<RawBlock> {
        let entry = self.entry(id)?;
        self.pipeline.read_raw(&self.reader, entry)
    }

    /// Decoded payload of a block, through the cache when one is enabled.
    pub fn block(&self, id: u64) -> Result<Block> {
        let key = id & !1;
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }
        let entry = self.entry(key)?;
        let block = self.pipeline.read_block(&self.reader, entry)?;
        self.cache.insert(block.clone());
        Ok(block)
    }
}

/// Store over a scratch container holding `blocks` back to back.
#[cfg(test)]
pub(crate) fn store_with_blocks(variant: FormatVariant, encryption: EncryptionType, blocks: &[(u64, Vec<u8>)]) -> BlockStore {
    let pipeline = BlockPipeline::new(variant, encryption, true);
    let mut file = vec![0u8; 0x1000];
    let mut entries = Vec::new();
    for (id, payload) in blocks {
        let offset = file.len() as u64;
        let encoded = pipeline.encode(*id, offset, payload, false).unwrap();
        entries.push(AllocationEntry { id: *id, offset, size: payload.len() as u16, ref_count: 2 });
        file.extend(encoded);
    }
    BlockStore::new(
        PffReader::from_bytes(file),
        AllocationIndex::from_entries(variant, entries),
        pipeline,
        BlockCache::new(crate::config::CachePolicy::Disabled),
    )
}
