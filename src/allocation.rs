//! Offsets table: block id → physical location.
//!
//! The table is a B-tree of pages rooted at the header's offsets root.
//! [`decode_allocation_tables`] walks it completely at open time into an
//! arena of entries sorted by id. The walk is iterative over page offsets;
//! every page is recorded in a visited set, so a page reachable twice (a
//! child pointing back at an ancestor, or at itself) is reported as
//! corruption instead of looping. The number of pages visited is also
//! bounded by `file_size / page_size`.
//!
//! After the walk the arena is checked for duplicate ids, entries outside
//! the declared file size and live entries whose on-disk footprints
//! overlap.

use std::collections::HashSet;

use tracing::debug;

use crate::btree::{read_page, OffsetsEntry, PageEntries, PageLayout, PageType};
use crate::error::{PffError, Result};
use crate::header::{BlockRef, FormatVariant, Header};
use crate::io_stream::PffReader;

/// Location of one stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEntry {
    pub id:        u64,
    pub offset:    u64,
    /// Stored payload size, excluding the trailer.
    pub size:      u16,
    pub ref_count: u16,
}

impl AllocationEntry {
    /// Bytes the block occupies on disk: payload plus trailer, rounded up
    /// to the variant's block alignment.
    pub fn footprint(&self, variant: FormatVariant) -> u64 {
        let raw = self.size as u64 + variant.block_trailer_size() as u64;
        let align = variant.block_alignment();
        raw.div_ceil(align) * align
    }

    /// Internal blocks hold structure (data arrays, sub-node trees) and
    /// are never encrypted.
    pub fn is_internal(&self) -> bool {
        self.id & 0x2 != 0
    }
}

impl From<OffsetsEntry> for AllocationEntry {
    fn from(e: OffsetsEntry) -> Self {
        Self { id: e.id, offset: e.offset, size: e.size, ref_count: e.ref_count }
    }
}

/// Every block of the container, sorted by id.
#[derive(Debug, Clone)]
pub struct AllocationIndex {
    variant: FormatVariant,
    entries: Vec<AllocationEntry>,
    pages:   usize,
}

impl AllocationIndex {
    /// Index over already-known entries, sorted by id.
    pub(crate) fn from_entries(variant: FormatVariant, mut entries: Vec<AllocationEntry>) -> Self {
        entries.sort_by_key(|e| e.id);
        Self { variant, entries, pages: 0 }
    }

    /// Look up a block. Bit 0 of block ids is reserved and ignored.
    pub fn lookup(&self, id: u64) -> Option<&AllocationEntry> {
        let key = id & !1;
        self.entries
            .binary_search_by_key(&key, |e| e.id)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn entries(&self) -> impl Iterator<Item = &AllocationEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of table pages read to build the index.
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Sum of block footprints.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.footprint(self.variant)).sum()
    }
}

/// Walk the offsets B-tree from the header's root.
pub fn decode_allocation_tables(reader: &PffReader, header: &Header, verify: bool) -> Result<AllocationIndex> {
    let layout = PageLayout::new(header.variant);
    let max_pages = (header.file_size / layout.page_size() as u64).max(1) as usize;

    let mut visited: HashSet<u64> = HashSet::new();
    let mut entries: Vec<AllocationEntry> = Vec::new();
    // (page, level the page must have; None for the root)
    let mut stack: Vec<(BlockRef, Option<u8>)> = vec![(header.offsets_root, None)];

    while let Some((page_ref, expected_level)) = stack.pop() {
        if !visited.insert(page_ref.offset) {
            return Err(PffError::corrupt_table(page_ref.offset, "offsets table page revisited (cycle)"));
        }
        if visited.len() > max_pages {
            return Err(PffError::corrupt_table(
                page_ref.offset,
                format!("offsets table exceeds {max_pages} pages"),
            ));
        }

        let page = read_page(reader, &layout, page_ref, PageType::Offsets, verify)?;
        if let Some(level) = expected_level {
            if page.level() != level {
                return Err(PffError::corrupt_table(
                    page_ref.offset,
                    format!("page level {}, parent expects {level}", page.level()),
                ));
            }
        }

        match page.entries {
            PageEntries::Branch(children) => {
                let child_level = page.trailer.level - 1;
                for child in children.iter().rev() {
                    stack.push((child.child, Some(child_level)));
                }
            }
            PageEntries::Offsets(leaf) => entries.extend(leaf.into_iter().map(AllocationEntry::from)),
            PageEntries::Descriptors(_) => {
                return Err(PffError::corrupt_table(page_ref.offset, "descriptor entries in offsets table"));
            }
        }
    }

    validate(header, &entries)?;
    debug!(blocks = entries.len(), pages = visited.len(), "decoded offsets table");
    Ok(AllocationIndex { variant: header.variant, entries, pages: visited.len() })
}

fn validate(header: &Header, entries: &[AllocationEntry]) -> Result<()> {
    let root = header.offsets_root.offset;
    if entries.windows(2).any(|w| w[0].id >= w[1].id) {
        let dup = entries.windows(2).find(|w| w[0].id >= w[1].id).map_or(0, |w| w[1].id);
        return Err(PffError::corrupt_table(root, format!("block id {dup:#x} duplicated or out of order")));
    }

    for e in entries {
        let end = e.offset.checked_add(e.footprint(header.variant));
        if end.map_or(true, |end| end > header.file_size) {
            return Err(PffError::corrupt_table(
                root,
                format!("block {:#x} at {:#x} lies outside the file", e.id, e.offset),
            ));
        }
    }

    let mut live: Vec<&AllocationEntry> = entries.iter().filter(|e| e.ref_count > 0).collect();
    live.sort_by_key(|e| e.offset);
    for pair in live.windows(2) {
        if pair[0].offset + pair[0].footprint(header.variant) > pair[1].offset {
            return Err(PffError::corrupt_table(
                root,
                format!("blocks {:#x} and {:#x} overlap at {:#x}", pair[0].id, pair[1].id, pair[1].offset),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::header::{ContentType, EncryptionType};

    fn header(variant: FormatVariant) -> Header {
        let mut h = Header::new(ContentType::Pst, variant, EncryptionType::None);
        h.file_size = 0x10000;
        h
    }

    fn entry(id: u64, offset: u64, size: u16) -> AllocationEntry {
        AllocationEntry { id, offset, size, ref_count: 2 }
    }

    #[test]
    fn footprint_alignment() {
        assert_eq!(entry(4, 0, 52).footprint(FormatVariant::Ansi), 64);
        assert_eq!(entry(4, 0, 53).footprint(FormatVariant::Ansi), 128);
        assert_eq!(entry(4, 0, 48).footprint(FormatVariant::Unicode), 64);
        assert_eq!(entry(4, 0, 100).footprint(FormatVariant::Unicode4k), 512);
    }

    #[test]
    fn overlap_detected() {
        let h = header(FormatVariant::Unicode);
        let ok = [entry(4, 0x1000, 40), entry(8, 0x1040, 40)];
        assert!(validate(&h, &ok).is_ok());
        let bad = [entry(4, 0x1000, 100), entry(8, 0x1040, 40)];
        assert_eq!(validate(&h, &bad).unwrap_err().kind(), ErrorKind::CorruptAllocationTable);
    }

    #[test]
    fn dead_entries_may_share_space() {
        let h = header(FormatVariant::Unicode);
        let mut dead = entry(8, 0x1000, 40);
        dead.ref_count = 0;
        assert!(validate(&h, &[entry(4, 0x1000, 40), dead]).is_ok());
    }

    #[test]
    fn duplicates_and_out_of_file() {
        let h = header(FormatVariant::Ansi);
        let dup = [entry(4, 0x1000, 40), entry(4, 0x2000, 40)];
        assert_eq!(validate(&h, &dup).unwrap_err().kind(), ErrorKind::CorruptAllocationTable);
        let outside = [entry(4, 0xFFF0, 40)];
        assert_eq!(validate(&h, &outside).unwrap_err().kind(), ErrorKind::CorruptAllocationTable);
    }

    #[test]
    fn lookup_masks_reserved_bit() {
        let index = AllocationIndex {
            variant: FormatVariant::Unicode,
            entries: vec![entry(4, 0x1000, 40), entry(0x8, 0x1040, 40), entry(0xE, 0x1080, 8)],
            pages:   1,
        };
        assert_eq!(index.lookup(0x5).map(|e| e.offset), Some(0x1000));
        assert_eq!(index.lookup(0xF).map(|e| e.offset), Some(0x1080));
        assert!(index.lookup(0xC).is_none());
        assert!(index.lookup(0xE).unwrap().is_internal());
        assert!(!index.lookup(0x8).unwrap().is_internal());
    }
}
