//! On-disk B-tree pages shared by the offsets table and the descriptors
//! table.
//!
//! A page is a fixed-size array of entries followed by a trailer. Branch
//! pages (level > 0) hold `{key, child id, child offset}` triples; leaf
//! pages hold table-specific entries. The trailer carries the entry count,
//! the level, the page type twice, a signature, a CRC over the entry region
//! and the page's own id (the back pointer a parent must agree with).
//!
//! | | ANSI | Unicode | 4K |
//! |-|------|---------|----|
//! | page size | 512 | 512 | 4096 |
//! | entry region | 496 | 488 | 4056 |
//! | count / max / entry size / level | 496.. (u8) | 488.. (u8) | 4056.. (u16, u16, u8, u8) |
//! | type, type copy, signature | 500 | 496 | 4072 |
//! | CRC over `0..trailer` | 508 | 500 | 4076 |
//! | page id | 504 (u32) | 504 (u64) | 4080 (u64) |

use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};

use crate::checksum::{compute_signature, weak_crc32};
use crate::error::{ErrorKind, PffError, Result};
use crate::header::{BlockRef, FormatVariant};
use crate::io_stream::PffReader;

// ── Page types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Offsets (block) table.
    Offsets,
    /// Descriptors (node) table.
    Descriptors,
}

impl PageType {
    pub fn as_byte(self) -> u8 {
        match self {
            PageType::Offsets     => 0x80,
            PageType::Descriptors => 0x81,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PageType::Offsets     => "offsets",
            PageType::Descriptors => "descriptors",
        }
    }
}

// ── Layout ───────────────────────────────────────────────────────────────────

/// Field positions of a page, selected once from the format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub variant: FormatVariant,
}

impl PageLayout {
    pub fn new(variant: FormatVariant) -> Self {
        Self { variant }
    }

    pub fn page_size(&self) -> usize {
        self.variant.page_size()
    }

    /// Bytes available for entries.
    pub fn entry_region(&self) -> usize {
        match self.variant {
            FormatVariant::Ansi      => 496,
            FormatVariant::Unicode   => 488,
            FormatVariant::Unicode4k => 4056,
        }
    }

    /// Start of the type/signature/CRC part of the trailer; the CRC covers
    /// everything before it.
    fn trailer_offset(&self) -> usize {
        match self.variant {
            FormatVariant::Ansi      => 500,
            FormatVariant::Unicode   => 496,
            FormatVariant::Unicode4k => 4072,
        }
    }

    pub fn branch_entry_size(&self) -> usize {
        3 * self.variant.id_size()
    }

    pub fn offsets_entry_size(&self) -> usize {
        match self.variant {
            FormatVariant::Ansi => 12,
            _                   => 24,
        }
    }

    pub fn descriptor_entry_size(&self) -> usize {
        match self.variant {
            FormatVariant::Ansi => 16,
            _                   => 32,
        }
    }

    pub fn leaf_entry_size(&self, page_type: PageType) -> usize {
        match page_type {
            PageType::Offsets     => self.offsets_entry_size(),
            PageType::Descriptors => self.descriptor_entry_size(),
        }
    }

    pub fn entry_size(&self, page_type: PageType, level: u8) -> usize {
        if level == 0 { self.leaf_entry_size(page_type) } else { self.branch_entry_size() }
    }

    pub fn max_entries(&self, entry_size: usize) -> usize {
        self.entry_region() / entry_size
    }

    fn read_id(&self, buf: &[u8]) -> u64 {
        match self.variant {
            FormatVariant::Ansi => LittleEndian::read_u32(buf) as u64,
            _                   => LittleEndian::read_u64(buf),
        }
    }

    fn write_id(&self, buf: &mut [u8], value: u64) {
        match self.variant {
            FormatVariant::Ansi => LittleEndian::write_u32(buf, value as u32),
            _                   => LittleEndian::write_u64(buf, value),
        }
    }
}

// ── Entries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEntry {
    /// Smallest key stored under `child`.
    pub key:   u64,
    pub child: BlockRef,
}

/// Leaf entry of the offsets table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetsEntry {
    pub id:        u64,
    pub offset:    u64,
    /// Stored data size, excluding the trailer.
    pub size:      u16,
    pub ref_count: u16,
}

/// Leaf entry of the descriptors table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub id:          u32,
    pub data_id:     u64,
    pub subnodes_id: u64,
    pub parent:      u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEntries {
    Branch(Vec<BranchEntry>),
    Offsets(Vec<OffsetsEntry>),
    Descriptors(Vec<DescriptorEntry>),
}

impl PageEntries {
    pub fn len(&self) -> usize {
        match self {
            PageEntries::Branch(v)      => v.len(),
            PageEntries::Offsets(v)     => v.len(),
            PageEntries::Descriptors(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<u64> {
        match self {
            PageEntries::Branch(v)      => v.iter().map(|e| e.key).collect(),
            PageEntries::Offsets(v)     => v.iter().map(|e| e.id).collect(),
            PageEntries::Descriptors(v) => v.iter().map(|e| e.id as u64).collect(),
        }
    }
}

// ── Page ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTrailer {
    pub entry_count:    u16,
    pub max_entries:    u16,
    pub entry_size:     u8,
    pub level:          u8,
    pub page_type:      u8,
    pub page_type_copy: u8,
    pub signature:      u16,
    pub crc:            u32,
    pub id:             u64,
}

impl PageTrailer {
    fn parse(layout: &PageLayout, page: &[u8]) -> Self {
        let region = layout.entry_region();
        let (entry_count, max_entries, entry_size, level) = match layout.variant {
            FormatVariant::Unicode4k => (
                LittleEndian::read_u16(&page[region..]),
                LittleEndian::read_u16(&page[region + 2..]),
                page[region + 4],
                page[region + 5],
            ),
            _ => (page[region] as u16, page[region + 1] as u16, page[region + 2], page[region + 3]),
        };
        let t = layout.trailer_offset();
        let (crc, id) = match layout.variant {
            FormatVariant::Ansi => (LittleEndian::read_u32(&page[t + 8..]), LittleEndian::read_u32(&page[t + 4..]) as u64),
            _                   => (LittleEndian::read_u32(&page[t + 4..]), LittleEndian::read_u64(&page[t + 8..])),
        };
        Self {
            entry_count,
            max_entries,
            entry_size,
            level,
            page_type:      page[t],
            page_type_copy: page[t + 1],
            signature:      LittleEndian::read_u16(&page[t + 2..]),
            crc,
            id,
        }
    }
}

/// One decoded B-tree page.
#[derive(Debug, Clone)]
pub struct IndexPage {
    pub offset:  u64,
    pub trailer: PageTrailer,
    pub entries: PageEntries,
}

impl IndexPage {
    pub fn level(&self) -> u8 {
        self.trailer.level
    }

    pub fn is_leaf(&self) -> bool {
        self.trailer.level == 0
    }
}

/// Read and validate the page referenced by `page_ref`.
///
/// Every failure, including a reference past the end of the container,
/// is reported as `CorruptAllocationTable`.
pub fn read_page(
    reader:    &PffReader,
    layout:    &PageLayout,
    page_ref:  BlockRef,
    page_type: PageType,
    verify:    bool,
) -> Result<IndexPage> {
    let offset = page_ref.offset;
    let corrupt = |details: String| PffError::corrupt_table(offset, details);

    let page = reader.read_at(offset, layout.page_size()).map_err(|e| match e.kind() {
        ErrorKind::OutOfBounds => corrupt(format!("{} page lies outside the container", page_type.name())),
        _ => e,
    })?;
    let trailer = PageTrailer::parse(layout, &page);
    trace!(offset, id = trailer.id, level = trailer.level, count = trailer.entry_count, "read page");

    if trailer.page_type != page_type.as_byte() {
        return Err(corrupt(format!(
            "page type {:#04x}, expected {} page",
            trailer.page_type,
            page_type.name()
        )));
    }
    if trailer.page_type_copy != trailer.page_type {
        return Err(corrupt(format!(
            "page type copy {:#04x} disagrees with {:#04x}",
            trailer.page_type_copy, trailer.page_type
        )));
    }
    if page_ref.id != 0 && trailer.id != 0 && (page_ref.id & !1) != (trailer.id & !1) {
        return Err(corrupt(format!(
            "page id {:#x} does not match reference {:#x}",
            trailer.id, page_ref.id
        )));
    }

    let computed = weak_crc32(&page[..layout.trailer_offset()]);
    if trailer.crc != 0 && trailer.crc != computed {
        if verify {
            return Err(corrupt(format!("page CRC {:#010x}, computed {computed:#010x}", trailer.crc)));
        }
        warn!(offset, "page CRC mismatch tolerated");
    }
    if trailer.signature != 0 {
        let expected = compute_signature(offset, trailer.id);
        if trailer.signature != expected {
            if verify {
                return Err(corrupt(format!(
                    "page signature {:#06x}, expected {expected:#06x}",
                    trailer.signature
                )));
            }
            warn!(offset, "page signature mismatch tolerated");
        }
    }

    let expected_size = layout.entry_size(page_type, trailer.level);
    let entry_size = match trailer.entry_size as usize {
        0 => expected_size,
        n if n == expected_size => n,
        n => return Err(corrupt(format!("entry size {n}, expected {expected_size}"))),
    };
    let count = trailer.entry_count as usize;
    if count > layout.max_entries(entry_size) {
        return Err(corrupt(format!(
            "{count} entries exceed page capacity {}",
            layout.max_entries(entry_size)
        )));
    }

    let entries = parse_entries(layout, page_type, trailer.level, &page, count, entry_size);
    let keys = entries.keys();
    if keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(corrupt("entry keys are not strictly ascending".to_string()));
    }
    Ok(IndexPage { offset, trailer, entries })
}

fn parse_entries(
    layout:     &PageLayout,
    page_type:  PageType,
    level:      u8,
    page:       &[u8],
    count:      usize,
    entry_size: usize,
) -> PageEntries {
    let w = layout.variant.id_size();
    let slots = (0..count).map(|i| &page[i * entry_size..(i + 1) * entry_size]);
    if level > 0 {
        return PageEntries::Branch(
            slots
                .map(|e| BranchEntry {
                    key:   layout.read_id(e),
                    child: BlockRef { id: layout.read_id(&e[w..]), offset: layout.read_id(&e[2 * w..]) },
                })
                .collect(),
        );
    }
    match page_type {
        PageType::Offsets => PageEntries::Offsets(
            slots
                .map(|e| OffsetsEntry {
                    id:        layout.read_id(e) & !1,
                    offset:    layout.read_id(&e[w..]),
                    size:      LittleEndian::read_u16(&e[2 * w..]),
                    ref_count: LittleEndian::read_u16(&e[2 * w + 2..]),
                })
                .collect(),
        ),
        PageType::Descriptors => PageEntries::Descriptors(
            slots
                .map(|e| DescriptorEntry {
                    id:          layout.read_id(e) as u32,
                    data_id:     layout.read_id(&e[w..]),
                    subnodes_id: layout.read_id(&e[2 * w..]),
                    parent:      LittleEndian::read_u32(&e[3 * w..]),
                })
                .collect(),
        ),
    }
}

/// Serialise a page with a valid trailer. Used by the fixture writer.
pub fn encode_page(
    layout:    &PageLayout,
    page_type: PageType,
    level:     u8,
    entries:   &PageEntries,
    page_ref:  BlockRef,
) -> Vec<u8> {
    let mut page = vec![0u8; layout.page_size()];
    let w = layout.variant.id_size();
    let entry_size = layout.entry_size(page_type, level);

    for i in 0..entries.len() {
        let e = &mut page[i * entry_size..(i + 1) * entry_size];
        match entries {
            PageEntries::Branch(v) => {
                layout.write_id(e, v[i].key);
                layout.write_id(&mut e[w..], v[i].child.id);
                layout.write_id(&mut e[2 * w..], v[i].child.offset);
            }
            PageEntries::Offsets(v) => {
                layout.write_id(e, v[i].id);
                layout.write_id(&mut e[w..], v[i].offset);
                LittleEndian::write_u16(&mut e[2 * w..], v[i].size);
                LittleEndian::write_u16(&mut e[2 * w + 2..], v[i].ref_count);
            }
            PageEntries::Descriptors(v) => {
                layout.write_id(e, v[i].id as u64);
                layout.write_id(&mut e[w..], v[i].data_id);
                layout.write_id(&mut e[2 * w..], v[i].subnodes_id);
                LittleEndian::write_u32(&mut e[3 * w..], v[i].parent);
            }
        }
    }

    let region = layout.entry_region();
    let max = layout.max_entries(entry_size);
    match layout.variant {
        FormatVariant::Unicode4k => {
            LittleEndian::write_u16(&mut page[region..], entries.len() as u16);
            LittleEndian::write_u16(&mut page[region + 2..], max as u16);
            page[region + 4] = entry_size as u8;
            page[region + 5] = level;
        }
        _ => {
            page[region] = entries.len() as u8;
            page[region + 1] = max as u8;
            page[region + 2] = entry_size as u8;
            page[region + 3] = level;
        }
    }

    let t = layout.trailer_offset();
    page[t] = page_type.as_byte();
    page[t + 1] = page_type.as_byte();
    LittleEndian::write_u16(&mut page[t + 2..], compute_signature(page_ref.offset, page_ref.id));
    let crc = weak_crc32(&page[..t]);
    match layout.variant {
        FormatVariant::Ansi => {
            LittleEndian::write_u32(&mut page[t + 4..], page_ref.id as u32);
            LittleEndian::write_u32(&mut page[t + 8..], crc);
        }
        _ => {
            LittleEndian::write_u32(&mut page[t + 4..], crc);
            LittleEndian::write_u64(&mut page[t + 8..], page_ref.id);
        }
    }
    page
}

/// Recompute the CRC of a page in a mutable buffer after patching its
/// entries.
pub fn reseal_page(layout: &PageLayout, page: &mut [u8]) {
    let t = layout.trailer_offset();
    let crc = weak_crc32(&page[..t]);
    match layout.variant {
        FormatVariant::Ansi => LittleEndian::write_u32(&mut page[t + 8..], crc),
        _                   => LittleEndian::write_u32(&mut page[t + 4..], crc),
    }
}
