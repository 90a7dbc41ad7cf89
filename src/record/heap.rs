//! Heap-on-node: variable-size allocations inside a node's data blocks.
//!
//! ```text
//! block 0                              block n > 0
//! 0  u16 page map offset               0  u16 page map offset
//! 2  u8  0xEC                          ... allocations
//! 3  u8  client signature              page map
//! 4  u32 user root HID
//! 8  u32 fill levels
//! 12 ... allocations
//! page map: u16 alloc count, u16 free count, u16 offsets[alloc count + 1]
//! ```
//!
//! Blocks 8, 136, 264, ... carry a 66-byte bitmap header in place of the
//! two-byte page header.
//!
//! A HID packs `(block index, allocation index)` above five zero type
//! bits. The allocation index is 1-based. A HNID whose type bits are set
//! is a sub-node id instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::block::Block;
use crate::error::{PffError, Result};
use crate::header::FormatVariant;
use crate::node_data::NodeData;

pub const HEAP_SIGNATURE: u8 = 0xEC;
/// Largest single allocation; bigger values move to a sub-node.
pub const MAX_ALLOCATION: usize = 3580;

const FIRST_HEADER: usize = 12;
const PAGE_HEADER: usize = 2;
const BITMAP_HEADER: usize = 66;

/// Client signatures stored in the heap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapClient {
    PropertyContext,
    TableContext,
    Tree,
    Other(u8),
}

impl HeapClient {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0xBC => HeapClient::PropertyContext,
            0x7C => HeapClient::TableContext,
            0xB5 => HeapClient::Tree,
            other => HeapClient::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            HeapClient::PropertyContext => 0xBC,
            HeapClient::TableContext    => 0x7C,
            HeapClient::Tree            => 0xB5,
            HeapClient::Other(b)        => b,
        }
    }
}

// ── HID packing ──────────────────────────────────────────────────────────────

/// Sub-node reference rather than a HID.
pub fn is_subnode_ref(hnid: u32) -> bool {
    hnid & 0x1F != 0
}

/// `(block index, 1-based allocation index)` of a HID.
pub fn hid_parts(variant: FormatVariant, hid: u32) -> (usize, usize) {
    match variant {
        FormatVariant::Unicode4k => ((hid >> 19) as usize, ((hid >> 5) & 0x3FFF) as usize),
        _                        => ((hid >> 16) as usize, ((hid >> 5) & 0x7FF) as usize),
    }
}

pub fn make_hid(variant: FormatVariant, block: usize, index: usize) -> u32 {
    match variant {
        FormatVariant::Unicode4k => ((block as u32) << 19) | ((index as u32 & 0x3FFF) << 5),
        _                        => ((block as u32) << 16) | ((index as u32 & 0x7FF) << 5),
    }
}

fn block_header_size(block: usize) -> usize {
    match block {
        0 => FIRST_HEADER,
        n if n % 128 == 8 => BITMAP_HEADER,
        _ => PAGE_HEADER,
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap {
    variant:   FormatVariant,
    client:    HeapClient,
    user_root: u32,
    blocks:    Vec<Block>,
    /// Allocation boundaries per block, `count + 1` entries each.
    maps:      Vec<Vec<u16>>,
}

impl Heap {
    /// Parse the heap over `data`. A missing heap signature on an encrypted
    /// container is reported as a decryption failure.
    pub fn parse(data: &NodeData<'_>, variant: FormatVariant, encrypted: bool) -> Result<Self> {
        let blocks = data.blocks()?;
        let first = blocks.first().map_or(&[][..], Block::data);
        if first.len() < FIRST_HEADER || first[2] != HEAP_SIGNATURE {
            let id = blocks.first().map_or(0, |b| b.id);
            let found = first.get(2).copied();
            return Err(if encrypted {
                PffError::decryption(id, format!("heap signature {found:02x?} after decryption"))
            } else {
                PffError::malformed(format!("block {id:#x} has no heap header (signature {found:02x?})"))
            });
        }
        let client = HeapClient::from_byte(first[3]);
        let user_root = LittleEndian::read_u32(&first[4..8]);

        let mut maps = Vec::with_capacity(blocks.len());
        for (index, block) in blocks.iter().enumerate() {
            maps.push(parse_page_map(block, index)?);
        }
        Ok(Self { variant, client, user_root, blocks, maps })
    }

    pub fn client(&self) -> HeapClient {
        self.client
    }

    pub fn user_root(&self) -> u32 {
        self.user_root
    }

    pub fn variant(&self) -> FormatVariant {
        self.variant
    }

    /// Number of allocations across all blocks.
    pub fn allocation_count(&self) -> usize {
        self.maps.iter().map(|m| m.len().saturating_sub(1)).sum()
    }

    /// Bytes of allocation `hid`. HID 0 is the empty allocation.
    pub fn item(&self, hid: u32) -> Result<&[u8]> {
        if hid == 0 {
            return Ok(&[]);
        }
        if is_subnode_ref(hid) {
            return Err(PffError::malformed(format!("{hid:#x} is not a heap id")));
        }
        let (block, index) = hid_parts(self.variant, hid);
        let map = self
            .maps
            .get(block)
            .ok_or_else(|| PffError::malformed(format!("HID {hid:#x} names heap block {block} of {}", self.maps.len())))?;
        if index == 0 || index >= map.len() {
            return Err(PffError::malformed(format!("HID {hid:#x} names allocation {index} of {}", map.len().saturating_sub(1))));
        }
        let start = map[index - 1] as usize;
        let end = map[index] as usize;
        Ok(&self.blocks[block].data()[start..end])
    }
}

fn parse_page_map(block: &Block, index: usize) -> Result<Vec<u16>> {
    let data = block.data();
    let bad = |what: &str| PffError::malformed(format!("heap block {index} ({:#x}): {what}", block.id));
    if data.len() < PAGE_HEADER {
        return Err(bad("shorter than its header"));
    }
    let at = LittleEndian::read_u16(&data[0..2]) as usize;
    if at + 4 > data.len() {
        return Err(bad("page map offset out of range"));
    }
    let count = LittleEndian::read_u16(&data[at..at + 2]) as usize;
    let table = at + 4;
    if table + (count + 1) * 2 > data.len() {
        return Err(bad("page map overruns block"));
    }
    let offsets: Vec<u16> = (0..=count)
        .map(|i| LittleEndian::read_u16(&data[table + 2 * i..]))
        .collect();
    let floor = block_header_size(index).min(at);
    let mut previous = floor;
    for &o in &offsets {
        let o = o as usize;
        if o < previous || o > at {
            return Err(bad("allocation offsets not ascending inside the block"));
        }
        previous = o;
    }
    Ok(offsets)
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Lays out allocations into heap blocks. Used by the fixture writer.
#[derive(Debug)]
pub struct HeapBuilder {
    variant:   FormatVariant,
    client:    HeapClient,
    user_root: u32,
    blocks:    Vec<Vec<Vec<u8>>>,
}

impl HeapBuilder {
    pub fn new(variant: FormatVariant, client: HeapClient) -> Self {
        Self { variant, client, user_root: 0, blocks: vec![Vec::new()] }
    }

    fn block_bytes(&self, block: usize, extra_items: usize, extra_bytes: usize) -> usize {
        let items = &self.blocks[block];
        let data: usize = items.iter().map(Vec::len).sum::<usize>() + extra_bytes;
        let count = items.len() + extra_items;
        block_header_size(block) + data.next_multiple_of(2) + 4 + 2 * (count + 1)
    }

    /// Store `bytes` and return its HID.
    pub fn allocate(&mut self, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > MAX_ALLOCATION {
            return Err(PffError::malformed(format!("heap allocation of {} bytes", bytes.len())));
        }
        let limit = self.variant.max_block_data();
        let mut block = self.blocks.len() - 1;
        if self.block_bytes(block, 1, bytes.len()) > limit {
            self.blocks.push(Vec::new());
            block += 1;
        }
        self.blocks[block].push(bytes.to_vec());
        Ok(make_hid(self.variant, block, self.blocks[block].len()))
    }

    pub fn set_user_root(&mut self, hid: u32) {
        self.user_root = hid;
    }

    /// Block payloads in order.
    pub fn finish(self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(self.blocks.len());
        for (index, items) in self.blocks.iter().enumerate() {
            let header = block_header_size(index);
            let mut data = vec![0u8; header];
            if index == 0 {
                data[2] = HEAP_SIGNATURE;
                data[3] = self.client.as_byte();
                LittleEndian::write_u32(&mut data[4..8], self.user_root);
            }
            let mut offsets = vec![header as u16];
            for item in items {
                data.extend_from_slice(item);
                offsets.push(data.len() as u16);
            }
            if data.len() % 2 != 0 {
                data.push(0);
            }
            let map_at = data.len();
            LittleEndian::write_u16(&mut data[0..2], map_at as u16);
            data.extend_from_slice(&(items.len() as u16).to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes());
            for o in offsets {
                data.extend_from_slice(&o.to_le_bytes());
            }
            out.push(data);
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn node_data_from(payloads: Vec<Vec<u8>>) -> NodeData<'static> {
    let blocks = payloads
        .into_iter()
        .enumerate()
        .map(|(i, p)| Block { id: 0x100 + 4 * i as u64, data: p.into() })
        .collect();
    NodeData::from_blocks(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn hid_packing() {
        assert_eq!(hid_parts(FormatVariant::Unicode, 0x20), (0, 1));
        assert_eq!(hid_parts(FormatVariant::Unicode, 0x0001_0040), (1, 2));
        assert_eq!(make_hid(FormatVariant::Ansi, 1, 2), 0x0001_0040);
        let hid = make_hid(FormatVariant::Unicode4k, 3, 1000);
        assert_eq!(hid_parts(FormatVariant::Unicode4k, hid), (3, 1000));
        assert!(!is_subnode_ref(hid));
        assert!(is_subnode_ref(0x8025));
    }

    #[test]
    fn builder_round_trip() {
        let mut b = HeapBuilder::new(FormatVariant::Unicode, HeapClient::PropertyContext);
        let a = b.allocate(b"first").unwrap();
        let c = b.allocate(b"").unwrap();
        let d = b.allocate(b"third!").unwrap();
        b.set_user_root(a);
        let heap = Heap::parse(&node_data_from(b.finish()), FormatVariant::Unicode, false).unwrap();
        assert_eq!(heap.client(), HeapClient::PropertyContext);
        assert_eq!(heap.user_root(), a);
        assert_eq!(heap.item(a).unwrap(), b"first");
        assert_eq!(heap.item(c).unwrap(), b"");
        assert_eq!(heap.item(d).unwrap(), b"third!");
        assert_eq!(heap.item(0).unwrap(), b"");
        assert_eq!(heap.allocation_count(), 3);
    }

    #[test]
    fn spills_into_more_blocks() {
        let mut b = HeapBuilder::new(FormatVariant::Ansi, HeapClient::TableContext);
        let hids: Vec<u32> = (0..12u8).map(|i| b.allocate(&[i; 3000]).unwrap()).collect();
        let payloads = b.finish();
        assert!(payloads.len() > 1);
        assert!(payloads.iter().all(|p| p.len() <= FormatVariant::Ansi.max_block_data()));
        let heap = Heap::parse(&node_data_from(payloads), FormatVariant::Ansi, false).unwrap();
        for (i, hid) in hids.iter().enumerate() {
            assert_eq!(heap.item(*hid).unwrap(), &[i as u8; 3000][..]);
        }
    }

    #[test]
    fn oversized_allocation() {
        let mut b = HeapBuilder::new(FormatVariant::Ansi, HeapClient::TableContext);
        assert!(b.allocate(&[0; MAX_ALLOCATION + 1]).is_err());
        assert!(b.allocate(&[0; MAX_ALLOCATION]).is_ok());
    }

    #[test]
    fn bad_ids() {
        let mut b = HeapBuilder::new(FormatVariant::Unicode, HeapClient::PropertyContext);
        b.allocate(b"x").unwrap();
        let heap = Heap::parse(&node_data_from(b.finish()), FormatVariant::Unicode, false).unwrap();
        assert_eq!(heap.item(0x40).unwrap_err().kind(), ErrorKind::MalformedRecord);
        assert_eq!(heap.item(0x0001_0020).unwrap_err().kind(), ErrorKind::MalformedRecord);
        assert_eq!(heap.item(0x21).unwrap_err().kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn missing_signature() {
        let mut payload = HeapBuilder::new(FormatVariant::Unicode, HeapClient::PropertyContext).finish();
        payload[0][2] = 0x13;
        let data = node_data_from(payload);
        assert_eq!(Heap::parse(&data, FormatVariant::Unicode, false).unwrap_err().kind(), ErrorKind::MalformedRecord);
        assert_eq!(Heap::parse(&data, FormatVariant::Unicode, true).unwrap_err().kind(), ErrorKind::DecryptionError);
        assert!(Heap::parse(&NodeData::default(), FormatVariant::Unicode, false).is_err());
    }
}
