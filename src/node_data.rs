//! Node data streams.
//!
//! A node's data id names either a plain data block or, when the data
//! does not fit one block, a data array: an internal block starting with
//! signature `0x01`.
//!
//! ```text
//! 0  u8   signature (0x01)
//! 1  u8   level (1 = ids of data blocks, 2 = ids of level-1 arrays)
//! 2  u16  entry count
//! 4  u32  total byte count of the stream
//! 8  ...  block ids (u32 ANSI, u64 otherwise)
//! ```
//!
//! The array structure is resolved at load. Leaf blocks are decoded on
//! first touch, so a ranged read only pulls the leaves it covers. The
//! declared total is checked against the leaves once all of them are in.

use std::fmt;
use std::sync::OnceLock;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::block::{Block, BlockStore};
use crate::error::{PffError, Result};
use crate::header::FormatVariant;

pub const DATA_ARRAY_SIGNATURE: u8 = 0x01;
const DATA_ARRAY_HEADER: usize = 8;

#[derive(Default)]
struct Leaf {
    id:    u64,
    block: OnceLock<Block>,
}

impl Leaf {
    fn loaded(block: Block) -> Self {
        let slot = OnceLock::new();
        let id = block.id;
        let _ = slot.set(block);
        Self { id, block: slot }
    }
}

/// Contiguous data of one node, kept as its leaf blocks.
#[derive(Default)]
pub struct NodeData<'s> {
    store:   Option<&'s BlockStore>,
    data_id: u64,
    leaves:  Vec<Leaf>,
    len:     usize,
}

impl fmt::Debug for NodeData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeData")
            .field("data_id", &self.data_id)
            .field("len", &self.len)
            .field("leaves", &self.leaves.len())
            .field("loaded", &self.loaded_leaves())
            .finish()
    }
}

impl<'s> NodeData<'s> {
    pub fn load(store: &'s BlockStore, data_id: u64) -> Result<Self> {
        if data_id == 0 {
            return Ok(Self::default());
        }
        let root = store.block(data_id)?;
        if !is_data_array(data_id, &root) {
            let len = root.len();
            return Ok(Self { store: Some(store), data_id, leaves: vec![Leaf::loaded(root)], len });
        }

        let (level, total, children) = parse_array(store.variant(), &root)?;
        trace!(data_id, level, total, children = children.len(), "data array");
        let mut leaves = Vec::with_capacity(children.len());
        for child in children {
            if level == 1 {
                leaves.push(Leaf { id: child, ..Leaf::default() });
                continue;
            }
            let block = store.block(child)?;
            if !is_data_array(child, &block) {
                return Err(PffError::malformed(format!(
                    "data array {data_id:#x} level 2 entry {child:#x} is not an array"
                )));
            }
            let (inner_level, _, ids) = parse_array(store.variant(), &block)?;
            if inner_level != 1 {
                return Err(PffError::malformed(format!(
                    "data array {child:#x} has level {inner_level} under a level 2 array"
                )));
            }
            leaves.extend(ids.into_iter().map(|id| Leaf { id, ..Leaf::default() }));
        }
        Ok(Self { store: Some(store), data_id, leaves, len: total as usize })
    }

    /// Wrap already decoded blocks, e.g. a single block read out of band.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let len = blocks.iter().map(Block::len).sum();
        let leaves = blocks.into_iter().map(Leaf::loaded).collect();
        Self { store: None, data_id: 0, leaves, len }
    }

    /// Byte count of the stream as declared by the node.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaves decoded so far.
    pub fn loaded_leaves(&self) -> usize {
        self.leaves.iter().filter(|l| l.block.get().is_some()).count()
    }

    fn leaf(&self, index: usize) -> Result<Option<&Block>> {
        let Some(leaf) = self.leaves.get(index) else {
            return Ok(None);
        };
        if let Some(block) = leaf.block.get() {
            return Ok(Some(block));
        }
        let store = self.store.ok_or_else(|| {
            PffError::malformed(format!("leaf {:#x} of node data has no block store", leaf.id))
        })?;
        let block = store.block(leaf.id)?;
        Ok(Some(leaf.block.get_or_init(|| block)))
    }

    /// Payload of leaf `index`, decoding it on first use.
    pub fn block(&self, index: usize) -> Result<Option<&[u8]>> {
        Ok(self.leaf(index)?.map(Block::data))
    }

    /// Every leaf, decoded. Fails when they do not add up to the declared
    /// total.
    pub fn blocks(&self) -> Result<Vec<Block>> {
        let mut out = Vec::with_capacity(self.leaves.len());
        for index in 0..self.leaves.len() {
            if let Some(block) = self.leaf(index)? {
                out.push(block.clone());
            }
        }
        let held: usize = out.iter().map(Block::len).sum();
        if held != self.len {
            return Err(self.total_mismatch(held));
        }
        Ok(out)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len);
        for block in self.blocks()? {
            out.extend_from_slice(block.data());
        }
        Ok(out)
    }

    /// Copy `length` bytes starting at `offset` of the stream. Only the
    /// leaves up to the end of the range are decoded.
    pub fn read_at(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(length).filter(|&end| end <= self.len).ok_or(PffError::OutOfBounds {
            offset: offset as u64,
            length: length as u64,
            size:   self.len as u64,
        })?;
        let mut out = Vec::with_capacity(length);
        let mut start = 0usize;
        let mut index = 0usize;
        while start < end {
            let Some(block) = self.leaf(index)? else {
                return Err(self.total_mismatch(start));
            };
            let stop = start + block.len();
            if stop > offset {
                let from = offset.max(start) - start;
                let to = end.min(stop) - start;
                out.extend_from_slice(&block.data()[from..to]);
            }
            start = stop;
            index += 1;
        }
        Ok(out)
    }

    fn total_mismatch(&self, held: usize) -> PffError {
        PffError::malformed(format!(
            "data array {:#x} declares {} bytes, blocks hold {held}",
            self.data_id, self.len
        ))
    }
}

fn is_data_array(id: u64, block: &Block) -> bool {
    id & 0x2 != 0 && block.data().first() == Some(&DATA_ARRAY_SIGNATURE)
}

fn parse_array(variant: FormatVariant, block: &Block) -> Result<(u8, u32, Vec<u64>)> {
    let data = block.data();
    if data.len() < DATA_ARRAY_HEADER {
        return Err(PffError::malformed(format!("data array {:#x} shorter than its header", block.id)));
    }
    let level = data[1];
    if level != 1 && level != 2 {
        return Err(PffError::malformed(format!("data array {:#x} has level {level}", block.id)));
    }
    let count = LittleEndian::read_u16(&data[2..4]) as usize;
    let total = LittleEndian::read_u32(&data[4..8]);
    let width = variant.id_size();
    if DATA_ARRAY_HEADER + count * width > data.len() {
        return Err(PffError::malformed(format!(
            "data array {:#x} lists {count} entries in {} bytes",
            block.id,
            data.len()
        )));
    }
    let ids = (0..count)
        .map(|i| {
            let at = DATA_ARRAY_HEADER + i * width;
            match variant {
                FormatVariant::Ansi => LittleEndian::read_u32(&data[at..]) as u64,
                _                   => LittleEndian::read_u64(&data[at..]),
            }
        })
        .collect();
    Ok((level, total, ids))
}

/// Serialise a data array. Used by the fixture writer.
pub fn encode_array(variant: FormatVariant, level: u8, total: u32, ids: &[u64]) -> Vec<u8> {
    let width = variant.id_size();
    let mut out = vec![0u8; DATA_ARRAY_HEADER + ids.len() * width];
    out[0] = DATA_ARRAY_SIGNATURE;
    out[1] = level;
    LittleEndian::write_u16(&mut out[2..4], ids.len() as u16);
    LittleEndian::write_u32(&mut out[4..8], total);
    for (i, id) in ids.iter().enumerate() {
        let at = DATA_ARRAY_HEADER + i * width;
        match variant {
            FormatVariant::Ansi => LittleEndian::write_u32(&mut out[at..], *id as u32),
            _                   => LittleEndian::write_u64(&mut out[at..], *id),
        }
    }
    out
}

/// Entries a single data array block can list.
pub fn array_capacity(variant: FormatVariant) -> usize {
    (variant.max_block_data() - DATA_ARRAY_HEADER) / variant.id_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::store_with_blocks;
    use crate::error::ErrorKind;
    use crate::header::EncryptionType;

    #[test]
    fn single_block() {
        let store = store_with_blocks(FormatVariant::Unicode, EncryptionType::None, &[(0x24, b"plain body".to_vec())]);
        let data = NodeData::load(&store, 0x24).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data.read_all().unwrap(), b"plain body");
        assert!(NodeData::load(&store, 0).unwrap().is_empty());
    }

    #[test]
    fn level_one_array_and_ranges() {
        let v = FormatVariant::Ansi;
        let store = store_with_blocks(v, EncryptionType::Compressible, &[
            (0x24, b"0123456789".to_vec()),
            (0x28, b"abcdef".to_vec()),
            (0x2E, encode_array(v, 1, 16, &[0x24, 0x28])),
        ]);
        let data = NodeData::load(&store, 0x2E).unwrap();
        assert_eq!(data.blocks().unwrap().len(), 2);
        assert_eq!(data.read_all().unwrap(), b"0123456789abcdef");
        assert_eq!(data.read_at(8, 4).unwrap(), b"89ab");
        assert_eq!(data.read_at(16, 0).unwrap(), b"");
        let err = data.read_at(16, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        assert!(matches!(err, PffError::OutOfBounds { offset: 16, length: 1, size: 16 }));
        assert_eq!(data.read_at(usize::MAX, 2).unwrap_err().kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn level_two_array() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::None, &[
            (0x24, b"aa".to_vec()),
            (0x28, b"bb".to_vec()),
            (0x2C, b"cc".to_vec()),
            (0x32, encode_array(v, 1, 4, &[0x24, 0x28])),
            (0x36, encode_array(v, 1, 2, &[0x2C])),
            (0x3A, encode_array(v, 2, 6, &[0x32, 0x36])),
        ]);
        assert_eq!(NodeData::load(&store, 0x3A).unwrap().read_all().unwrap(), b"aabbcc");
    }

    #[test]
    fn total_mismatch_is_malformed() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::None, &[
            (0x24, b"aa".to_vec()),
            (0x2E, encode_array(v, 1, 3, &[0x24])),
        ]);
        let data = NodeData::load(&store, 0x2E).unwrap();
        assert_eq!(data.read_all().unwrap_err().kind(), ErrorKind::MalformedRecord);
        assert_eq!(data.read_at(0, 2).unwrap(), b"aa");
        assert_eq!(data.read_at(1, 2).unwrap_err().kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn leaves_decode_on_first_touch() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::Compressible, &[
            (0x24, b"first".to_vec()),
            (0x28, b"second".to_vec()),
            (0x2C, b"third".to_vec()),
            (0x32, encode_array(v, 1, 16, &[0x24, 0x28, 0x2C])),
        ]);
        let data = NodeData::load(&store, 0x32).unwrap();
        assert_eq!(data.leaf_count(), 3);
        assert_eq!(data.loaded_leaves(), 0);
        assert_eq!(data.read_at(1, 3).unwrap(), b"irs");
        assert_eq!(data.loaded_leaves(), 1);
        assert_eq!(data.block(2).unwrap(), Some(&b"third"[..]));
        assert_eq!(data.loaded_leaves(), 2);
        assert_eq!(data.read_all().unwrap(), b"firstsecondthird");
        assert_eq!(data.loaded_leaves(), 3);
        assert_eq!(data.block(3).unwrap(), None);
    }

    #[test]
    fn missing_leaf_fails_only_when_touched() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::None, &[
            (0x24, b"here".to_vec()),
            (0x2E, encode_array(v, 1, 8, &[0x24, 0x44])),
        ]);
        let data = NodeData::load(&store, 0x2E).unwrap();
        assert_eq!(data.read_at(0, 4).unwrap(), b"here");
        assert_eq!(data.read_at(2, 4).unwrap_err().kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn capacity() {
        assert_eq!(array_capacity(FormatVariant::Ansi), 2043);
        assert_eq!(array_capacity(FormatVariant::Unicode), 1021);
    }
}
