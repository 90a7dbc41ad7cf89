//! B-tree-on-heap: sorted fixed-width records stored in heap allocations.
//!
//! The header allocation is `{0xB5, key size, entry size, levels, root HID}`.
//! Leaf allocations hold `key ‖ data` records; intermediate allocations
//! hold `key ‖ child HID`.

use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};

use super::heap::{Heap, HeapBuilder, MAX_ALLOCATION};
use crate::error::{PffError, Result};

pub const BTH_SIGNATURE: u8 = 0xB5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BthHeader {
    pub key_size:   u8,
    pub entry_size: u8,
    pub levels:     u8,
    pub root:       u32,
}

impl BthHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || bytes[0] != BTH_SIGNATURE {
            return Err(PffError::malformed(format!(
                "tree header of {} bytes with signature {:02x?}",
                bytes.len(),
                bytes.first()
            )));
        }
        let header = Self {
            key_size:   bytes[1],
            entry_size: bytes[2],
            levels:     bytes[3],
            root:       LittleEndian::read_u32(&bytes[4..8]),
        };
        if !matches!(header.key_size, 2 | 4 | 8 | 16) {
            return Err(PffError::malformed(format!("tree key size {}", header.key_size)));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = BTH_SIGNATURE;
        out[1] = self.key_size;
        out[2] = self.entry_size;
        out[3] = self.levels;
        LittleEndian::write_u32(&mut out[4..8], self.root);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BthRecord<'a> {
    pub key:  &'a [u8],
    pub data: &'a [u8],
}

/// Header and every leaf record, in key order.
pub fn read_records(heap: &Heap, header_hid: u32) -> Result<(BthHeader, Vec<BthRecord<'_>>)> {
    let header = BthHeader::parse(heap.item(header_hid)?)?;
    let mut records = Vec::new();
    if header.root == 0 {
        return Ok((header, records));
    }
    let key = header.key_size as usize;
    let mut visited = HashSet::new();
    let mut stack = vec![(header.root, header.levels)];

    while let Some((hid, level)) = stack.pop() {
        if !visited.insert(hid) {
            return Err(PffError::malformed(format!("tree allocation {hid:#x} referenced twice")));
        }
        let item = heap.item(hid)?;
        let width = if level == 0 { key + header.entry_size as usize } else { key + 4 };
        if width == 0 || item.len() % width != 0 {
            return Err(PffError::malformed(format!(
                "tree allocation {hid:#x} of {} bytes is not a multiple of {width}",
                item.len()
            )));
        }
        if level == 0 {
            records.extend(item.chunks_exact(width).map(|r| BthRecord { key: &r[..key], data: &r[key..] }));
        } else {
            for r in item.chunks_exact(width).rev() {
                stack.push((LittleEndian::read_u32(&r[key..]), level - 1));
            }
        }
    }
    Ok((header, records))
}

/// Store `records` (already sorted by key) and return the header HID.
/// Used by the fixture writer.
pub fn build(heap: &mut HeapBuilder, key_size: u8, entry_size: u8, records: &[(Vec<u8>, Vec<u8>)]) -> Result<u32> {
    let mut header = BthHeader { key_size, entry_size, levels: 0, root: 0 };
    if !records.is_empty() {
        let width = key_size as usize + entry_size as usize;
        let per = (MAX_ALLOCATION / width).max(1);
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();
        for chunk in records.chunks(per) {
            let bytes: Vec<u8> = chunk.iter().flat_map(|(k, d)| k.iter().chain(d.iter()).copied()).collect();
            level.push((chunk[0].0.clone(), heap.allocate(&bytes)?));
        }
        let per_branch = MAX_ALLOCATION / (key_size as usize + 4);
        while level.len() > 1 {
            header.levels += 1;
            let mut next = Vec::new();
            for chunk in level.chunks(per_branch) {
                let bytes: Vec<u8> = chunk
                    .iter()
                    .flat_map(|(k, hid)| k.iter().copied().chain(hid.to_le_bytes()))
                    .collect();
                next.push((chunk[0].0.clone(), heap.allocate(&bytes)?));
            }
            level = next;
        }
        header.root = level[0].1;
    }
    heap.allocate(&header.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FormatVariant;
    use crate::record::heap::{node_data_from, HeapClient};

    fn records(n: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n).map(|i| (i.to_le_bytes().to_vec(), (i * 3).to_le_bytes().to_vec())).collect()
    }

    #[test]
    fn single_leaf() {
        let mut hb = HeapBuilder::new(FormatVariant::Unicode, HeapClient::Tree);
        let hid = build(&mut hb, 4, 4, &records(10)).unwrap();
        let heap = Heap::parse(&node_data_from(hb.finish()), FormatVariant::Unicode, false).unwrap();
        let (header, recs) = read_records(&heap, hid).unwrap();
        assert_eq!(header.levels, 0);
        assert_eq!(recs.len(), 10);
        assert_eq!(recs[4].data, &12u32.to_le_bytes());
    }

    #[test]
    fn intermediate_levels_preserve_order() {
        let mut hb = HeapBuilder::new(FormatVariant::Unicode, HeapClient::Tree);
        let hid = build(&mut hb, 4, 4, &records(2000)).unwrap();
        let heap = Heap::parse(&node_data_from(hb.finish()), FormatVariant::Unicode, false).unwrap();
        let (header, recs) = read_records(&heap, hid).unwrap();
        assert_eq!(header.levels, 1);
        let keys: Vec<u32> = recs.iter().map(|r| LittleEndian::read_u32(r.key)).collect();
        assert_eq!(keys, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn empty_tree_and_bad_header() {
        let mut hb = HeapBuilder::new(FormatVariant::Ansi, HeapClient::Tree);
        let hid = build(&mut hb, 2, 6, &[]).unwrap();
        let junk = hb.allocate(&[0xB5, 3, 6, 0, 0, 0, 0, 0]).unwrap();
        let heap = Heap::parse(&node_data_from(hb.finish()), FormatVariant::Ansi, false).unwrap();
        assert!(read_records(&heap, hid).unwrap().1.is_empty());
        assert!(read_records(&heap, junk).is_err());
    }

    #[test]
    fn ragged_leaf_is_malformed() {
        let mut hb = HeapBuilder::new(FormatVariant::Ansi, HeapClient::Tree);
        let leaf = hb.allocate(&[1, 2, 3]).unwrap();
        let header = hb.allocate(&BthHeader { key_size: 2, entry_size: 6, levels: 0, root: leaf }.encode()).unwrap();
        let heap = Heap::parse(&node_data_from(hb.finish()), FormatVariant::Ansi, false).unwrap();
        assert!(read_records(&heap, header).is_err());
    }
}
