//! Local descriptors: the private sub-node tree of a node.
//!
//! Attachments, recipient tables and large property values live in
//! sub-nodes, addressed by an id that is only meaningful inside the
//! owning node. The tree is stored in internal blocks with signature
//! `0x02`; level 0 blocks list `{id, data id, sub-node id}` and level 1
//! blocks list `{id, child block id}`. ANSI headers are 4 bytes, wide
//! headers carry 4 more bytes of padding.

use std::collections::{BTreeMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use crate::block::BlockStore;
use crate::error::{PffError, Result};
use crate::header::FormatVariant;
use crate::node_data::NodeData;

pub const SUBNODE_SIGNATURE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnodeEntry {
    pub id:          u32,
    pub data_id:     u64,
    pub subnodes_id: u64,
}

/// Every sub-node reachable from one local-descriptors root.
#[derive(Debug, Clone, Default)]
pub struct SubnodeTree {
    entries: BTreeMap<u32, SubnodeEntry>,
}

impl SubnodeTree {
    pub fn load(store: &BlockStore, root: u64) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if root == 0 {
            return Ok(Self { entries });
        }
        let variant = store.variant();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, None::<u8>)];

        while let Some((id, expected_level)) = stack.pop() {
            if !visited.insert(id & !1) {
                return Err(PffError::malformed(format!("sub-node block {id:#x} revisited (cycle)")));
            }
            let block = store.block(id)?;
            let data = block.data();
            let header = header_size(variant);
            if data.len() < header || data[0] != SUBNODE_SIGNATURE {
                return Err(PffError::malformed(format!("block {id:#x} is not a sub-node block")));
            }
            let level = data[1];
            if expected_level.is_some_and(|l| l != level) || level > 1 {
                return Err(PffError::malformed(format!("sub-node block {id:#x} has level {level}")));
            }
            let count = LittleEndian::read_u16(&data[2..4]) as usize;
            let w = variant.id_size();
            let entry_size = if level == 0 { 3 * w } else { 2 * w };
            if header + count * entry_size > data.len() {
                return Err(PffError::malformed(format!("sub-node block {id:#x} lists {count} entries")));
            }
            let read = |at: usize| match variant {
                FormatVariant::Ansi => LittleEndian::read_u32(&data[at..]) as u64,
                _                   => LittleEndian::read_u64(&data[at..]),
            };
            for i in (0..count).rev() {
                let at = header + i * entry_size;
                if level == 0 {
                    let entry = SubnodeEntry {
                        id:          read(at) as u32,
                        data_id:     read(at + w),
                        subnodes_id: read(at + 2 * w),
                    };
                    entries.insert(entry.id, entry);
                } else {
                    stack.push((read(at + w), Some(0)));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, id: u32) -> Option<&SubnodeEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SubnodeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Data of sub-node `id`.
    pub fn data<'s>(&self, store: &'s BlockStore, id: u32) -> Result<NodeData<'s>> {
        let entry = self
            .get(id)
            .ok_or_else(|| PffError::malformed(format!("sub-node {id:#x} not found")))?;
        NodeData::load(store, entry.data_id)
    }
}

fn header_size(variant: FormatVariant) -> usize {
    match variant {
        FormatVariant::Ansi => 4,
        _                   => 8,
    }
}

/// Serialise a level 0 sub-node block. Used by the fixture writer.
pub fn encode_leaf(variant: FormatVariant, entries: &[SubnodeEntry]) -> Vec<u8> {
    let w = variant.id_size();
    let header = header_size(variant);
    let mut out = vec![0u8; header + entries.len() * 3 * w];
    out[0] = SUBNODE_SIGNATURE;
    out[1] = 0;
    LittleEndian::write_u16(&mut out[2..4], entries.len() as u16);
    for (i, e) in entries.iter().enumerate() {
        let at = header + i * 3 * w;
        for (k, value) in [e.id as u64, e.data_id, e.subnodes_id].into_iter().enumerate() {
            match variant {
                FormatVariant::Ansi => LittleEndian::write_u32(&mut out[at + k * w..], value as u32),
                _                   => LittleEndian::write_u64(&mut out[at + k * w..], value),
            }
        }
    }
    out
}

/// Serialise a level 1 sub-node block over `(first id, child block)`.
pub fn encode_branch(variant: FormatVariant, children: &[(u32, u64)]) -> Vec<u8> {
    let w = variant.id_size();
    let header = header_size(variant);
    let mut out = vec![0u8; header + children.len() * 2 * w];
    out[0] = SUBNODE_SIGNATURE;
    out[1] = 1;
    LittleEndian::write_u16(&mut out[2..4], children.len() as u16);
    for (i, (id, block)) in children.iter().enumerate() {
        let at = header + i * 2 * w;
        match variant {
            FormatVariant::Ansi => {
                LittleEndian::write_u32(&mut out[at..], *id);
                LittleEndian::write_u32(&mut out[at + w..], *block as u32);
            }
            _ => {
                LittleEndian::write_u64(&mut out[at..], *id as u64);
                LittleEndian::write_u64(&mut out[at + w..], *block);
            }
        }
    }
    out
}

/// Leaf entries a single sub-node block can hold.
pub fn leaf_capacity(variant: FormatVariant) -> usize {
    (variant.max_block_data() - header_size(variant)) / (3 * variant.id_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::store_with_blocks;
    use crate::error::ErrorKind;
    use crate::header::EncryptionType;

    fn entry(id: u32, data_id: u64) -> SubnodeEntry {
        SubnodeEntry { id, data_id, subnodes_id: 0 }
    }

    #[test]
    fn leaf_tree() {
        for v in [FormatVariant::Ansi, FormatVariant::Unicode] {
            let store = store_with_blocks(v, EncryptionType::High, &[
                (0x24, b"attachment bytes".to_vec()),
                (0x2A, encode_leaf(v, &[entry(0x671, 0x24), entry(0x8025, 0x24)])),
            ]);
            let tree = SubnodeTree::load(&store, 0x2A).unwrap();
            assert_eq!(tree.len(), 2);
            assert_eq!(tree.get(0x671).unwrap().data_id, 0x24);
            assert_eq!(tree.data(&store, 0x8025).unwrap().read_all().unwrap(), b"attachment bytes");
            assert_eq!(tree.data(&store, 0x692).unwrap_err().kind(), ErrorKind::MalformedRecord);
        }
    }

    #[test]
    fn branch_tree() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::None, &[
            (0x2A, encode_leaf(v, &[entry(0x21, 0)])),
            (0x2E, encode_leaf(v, &[entry(0x41, 0), entry(0x61, 0)])),
            (0x32, encode_branch(v, &[(0x21, 0x2A), (0x41, 0x2E)])),
        ]);
        let tree = SubnodeTree::load(&store, 0x32).unwrap();
        let ids: Vec<u32> = tree.entries().map(|e| e.id).collect();
        assert_eq!(ids, vec![0x21, 0x41, 0x61]);
    }

    #[test]
    fn self_referencing_branch_is_rejected() {
        let v = FormatVariant::Ansi;
        let store = store_with_blocks(v, EncryptionType::None, &[(0x32, encode_branch(v, &[(0x21, 0x32)]))]);
        assert_eq!(SubnodeTree::load(&store, 0x32).unwrap_err().kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn wrong_signature() {
        let v = FormatVariant::Unicode;
        let store = store_with_blocks(v, EncryptionType::None, &[(0x2A, vec![0x01, 0, 0, 0, 0, 0, 0, 0])]);
        assert!(SubnodeTree::load(&store, 0x2A).is_err());
        assert!(SubnodeTree::load(&store, 0).unwrap().is_empty());
    }
}
