//! Table contexts: rows of typed cells, used for attachment and recipient
//! lists and folder contents tables.
//!
//! The heap user root is the table info allocation:
//!
//! ```text
//! 0   u8      0x7C
//! 1   u8      column count
//! 2   u16[4]  group ends: 8/4-byte cells, 2-byte, 1-byte, existence bitmap
//! 10  u32     row index HID (BTH: row id → row number)
//! 14  u32     row matrix HNID
//! 18  u32     deprecated index HID
//! 22  ...     columns: u32 tag, u16 offset, u8 size, u8 existence bit
//! ```
//!
//! Rows are `group_ends[3]` bytes and never straddle a block of the row
//! matrix. Cell existence bits are numbered from the most significant bit
//! of the bitmap's first byte.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::trace;

use super::heap::{Heap, HeapBuilder, HeapClient};
use super::{bth, resolve_hnid, tags, Properties, PropertyTag, RawRecord, RecordContext};
use crate::error::{PffError, Result};
use crate::node_data::NodeData;

pub const TABLE_SIGNATURE: u8 = 0x7C;
const INFO_HEADER: usize = 22;
const COLUMN_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    pub tag:    PropertyTag,
    pub offset: u16,
    pub size:   u8,
    pub bit:    u8,
}

/// One decoded table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSet {
    pub row_id:     u32,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows:    Vec<RecordSet>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct TableInfo {
    columns:    Vec<Column>,
    group_ends: [u16; 4],
    row_index:  u32,
    rows:       u32,
}

fn parse_info(bytes: &[u8]) -> Result<TableInfo> {
    if bytes.len() < INFO_HEADER || bytes[0] != TABLE_SIGNATURE {
        return Err(PffError::malformed(format!("table info of {} bytes", bytes.len())));
    }
    let count = bytes[1] as usize;
    if INFO_HEADER + count * COLUMN_SIZE > bytes.len() {
        return Err(PffError::malformed(format!("table info lists {count} columns in {} bytes", bytes.len())));
    }
    let group_ends = [
        LittleEndian::read_u16(&bytes[2..4]),
        LittleEndian::read_u16(&bytes[4..6]),
        LittleEndian::read_u16(&bytes[6..8]),
        LittleEndian::read_u16(&bytes[8..10]),
    ];
    if group_ends.windows(2).any(|w| w[0] > w[1]) {
        return Err(PffError::malformed(format!("table row groups {group_ends:?} out of order")));
    }
    let bitmap_bytes = (group_ends[3] - group_ends[2]) as usize;
    let columns: Vec<Column> = (0..count)
        .map(|i| {
            let at = INFO_HEADER + i * COLUMN_SIZE;
            Column {
                tag:    PropertyTag::from_u32(LittleEndian::read_u32(&bytes[at..])),
                offset: LittleEndian::read_u16(&bytes[at + 4..]),
                size:   bytes[at + 6],
                bit:    bytes[at + 7],
            }
        })
        .collect();
    for c in &columns {
        if c.offset as usize + c.size as usize > group_ends[2] as usize || c.bit as usize >= bitmap_bytes * 8 {
            return Err(PffError::malformed(format!("table column {} lies outside the row", c.tag)));
        }
    }
    Ok(TableInfo {
        columns,
        group_ends,
        row_index: LittleEndian::read_u32(&bytes[10..14]),
        rows:      LittleEndian::read_u32(&bytes[14..18]),
    })
}

/// Decode the table context stored in `data`.
pub fn decode_table(data: &NodeData<'_>, ctx: &RecordContext<'_>) -> Result<Table> {
    if data.is_empty() {
        return Ok(Table::default());
    }
    let heap = Heap::parse(data, ctx.variant, ctx.encrypted)?;
    if heap.client() != HeapClient::TableContext {
        return Err(PffError::malformed(format!("heap client {:?} is not a table context", heap.client())));
    }
    let info = parse_info(heap.item(heap.user_root())?)?;
    let row_size = info.group_ends[3] as usize;

    // Row numbers in row-index order.
    let mut order = Vec::new();
    if info.row_index != 0 {
        let (header, records) = bth::read_records(&heap, info.row_index)?;
        if header.key_size != 4 || !matches!(header.entry_size, 2 | 4) {
            return Err(PffError::malformed(format!(
                "row index with {}-byte keys and {}-byte entries",
                header.key_size, header.entry_size
            )));
        }
        for r in records {
            let number = match r.data.len() {
                2 => LittleEndian::read_u16(r.data) as usize,
                _ => LittleEndian::read_u32(r.data) as usize,
            };
            order.push((number, LittleEndian::read_u32(r.key)));
        }
        order.sort_unstable();
    }

    let matrix: Vec<Vec<u8>> = match info.rows {
        0 => Vec::new(),
        hnid if super::heap::is_subnode_ref(hnid) => {
            let data = ctx.subnodes.subnode(hnid)?;
            data.blocks()?.iter().map(|b| b.data().to_vec()).collect()
        }
        hid => vec![heap.item(hid)?.to_vec()],
    };
    let rows_per_block = match (matrix.first(), row_size) {
        (_, 0) => 0,
        (Some(first), size) if matrix.len() > 1 => first.len() / size,
        _ => usize::MAX,
    };
    trace!(columns = info.columns.len(), rows = order.len(), row_size, "table context");

    let mut rows = Vec::with_capacity(order.len());
    for (number, row_id) in order {
        let (block, index) = match rows_per_block {
            0 => return Err(PffError::malformed("table row matrix block is narrower than one row")),
            usize::MAX => (0, number),
            per => (number / per, number % per),
        };
        let row = matrix
            .get(block)
            .and_then(|b| b.get(index * row_size..(index + 1) * row_size))
            .ok_or_else(|| PffError::malformed(format!("table row {number} ({row_id:#x}) outside the row matrix")))?;

        let bitmap = &row[info.group_ends[2] as usize..];
        let raw = info
            .columns
            .iter()
            .filter(|c| bitmap[c.bit as usize / 8] & (0x80 >> (c.bit % 8)) != 0)
            .map(|c| RawRecord { tag: c.tag, bytes: cell_bytes(&heap, c, row, ctx) })
            .collect();
        rows.push(RecordSet { row_id, properties: Properties::from_raw(raw, ctx.codepage) });
    }
    Ok(Table { columns: info.columns, rows })
}

fn cell_bytes(heap: &Heap, column: &Column, row: &[u8], ctx: &RecordContext<'_>) -> Result<Vec<u8>> {
    let cell = &row[column.offset as usize..column.offset as usize + column.size as usize];
    let ty = column.tag.kind().ok_or(PffError::UnknownPropertyType {
        property_id:   column.tag.id,
        property_type: column.tag.property_type,
    })?;
    if ty.is_inline_in_row() {
        return Ok(cell.to_vec());
    }
    if cell.len() != 4 {
        return Err(PffError::malformed(format!("column {} holds a {}-byte reference", column.tag, cell.len())));
    }
    resolve_hnid(heap, LittleEndian::read_u32(cell), ctx)
}

// ── Layout for writing ───────────────────────────────────────────────────────

/// Column placement for a set of tags. Used by the fixture writer.
#[derive(Debug, Clone)]
pub struct TableLayout {
    columns:    Vec<Column>,
    group_ends: [u16; 4],
}

fn cell_size(tag: PropertyTag) -> usize {
    match tag.kind() {
        Some(ty) if ty.is_inline_in_row() => ty.fixed_size().unwrap_or(0),
        _ => 4,
    }
}

impl TableLayout {
    /// The row id and row version columns are always present.
    pub fn new(tags_in: &[PropertyTag]) -> Self {
        let mut tags_all = vec![
            PropertyTag::new(tags::LTP_ROW_ID, 0x0003),
            PropertyTag::new(tags::LTP_ROW_VERSION, 0x0003),
        ];
        for t in tags_in {
            if !tags_all.contains(t) {
                tags_all.push(*t);
            }
        }

        let mut columns = Vec::with_capacity(tags_all.len());
        let mut offset = 0usize;
        let mut group_ends = [0u16; 4];
        // 8- and 4-byte cells share the first group; the row id stays at 0.
        let groups: [&[usize]; 3] = [&[4, 8], &[2], &[1, 0]];
        for (g, sizes) in groups.iter().enumerate() {
            let mut placed: Vec<&PropertyTag> = tags_all.iter().filter(|t| sizes.contains(&cell_size(**t))).collect();
            if g == 0 {
                placed.sort_by_key(|t| match t.id {
                    tags::LTP_ROW_ID => 0,
                    tags::LTP_ROW_VERSION => 1,
                    _ if cell_size(**t) == 8 => 2,
                    _ => 3,
                });
            }
            for t in placed {
                columns.push(Column { tag: *t, offset: offset as u16, size: cell_size(*t) as u8, bit: 0 });
                offset += cell_size(*t);
            }
            group_ends[g] = offset as u16;
        }
        for (bit, c) in columns.iter_mut().enumerate() {
            c.bit = bit as u8;
        }
        group_ends[3] = (offset + columns.len().div_ceil(8)) as u16;
        columns.sort_by_key(|c| c.tag.as_u32());
        Self { columns, group_ends }
    }

    pub fn row_size(&self) -> usize {
        self.group_ends[3] as usize
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Lay out one row; `cells` hold inline bytes or a 4-byte HNID.
    pub fn encode_row(&self, row_id: u32, cells: &[(PropertyTag, Vec<u8>)]) -> Vec<u8> {
        let mut row = vec![0u8; self.row_size()];
        let bitmap = self.group_ends[2] as usize;
        let mut put = |column: &Column, bytes: &[u8]| {
            let at = column.offset as usize;
            let n = bytes.len().min(column.size as usize);
            row[at..at + n].copy_from_slice(&bytes[..n]);
            row[bitmap + column.bit as usize / 8] |= 0x80 >> (column.bit % 8);
        };
        for c in &self.columns {
            if c.tag.id == tags::LTP_ROW_ID {
                put(c, &row_id.to_le_bytes());
            } else if c.tag.id == tags::LTP_ROW_VERSION {
                put(c, &0u32.to_le_bytes());
            } else if let Some((_, bytes)) = cells.iter().find(|(t, _)| *t == c.tag) {
                put(c, bytes);
            }
        }
        row
    }

    /// Allocate the row index and table info, and set the heap root.
    pub fn finish(&self, heap: &mut HeapBuilder, row_ids: &[u32], rows_hnid: u32, wide: bool) -> Result<()> {
        let mut index: Vec<(Vec<u8>, Vec<u8>)> = row_ids
            .iter()
            .enumerate()
            .map(|(n, id)| {
                let number = if wide { (n as u32).to_le_bytes().to_vec() } else { (n as u16).to_le_bytes().to_vec() };
                (id.to_le_bytes().to_vec(), number)
            })
            .collect();
        index.sort_by_key(|(k, _)| LittleEndian::read_u32(k));
        let index_hid = bth::build(heap, 4, if wide { 4 } else { 2 }, &index)?;

        let mut info = vec![0u8; INFO_HEADER + self.columns.len() * COLUMN_SIZE];
        info[0] = TABLE_SIGNATURE;
        info[1] = self.columns.len() as u8;
        for (i, end) in self.group_ends.iter().enumerate() {
            LittleEndian::write_u16(&mut info[2 + 2 * i..], *end);
        }
        LittleEndian::write_u32(&mut info[10..14], index_hid);
        LittleEndian::write_u32(&mut info[14..18], rows_hnid);
        for (i, c) in self.columns.iter().enumerate() {
            let at = INFO_HEADER + i * COLUMN_SIZE;
            LittleEndian::write_u32(&mut info[at..], c.tag.as_u32());
            LittleEndian::write_u16(&mut info[at + 4..], c.offset);
            info[at + 6] = c.size;
            info[at + 7] = c.bit;
        }
        let root = heap.allocate(&info)?;
        heap.set_user_root(root);
        Ok(())
    }
}
