//! Record decoding: typed properties out of node data.
//!
//! A node's data is a heap-on-node ([`heap`]). Its user root is either a
//! property context (a [`bth`] keyed by property id) or a table context
//! ([`table`]). Values larger than the four-byte slot live in a heap
//! allocation or, past [`heap::MAX_ALLOCATION`], in a sub-node of the owner.

pub mod bth;
pub mod codepage;
pub mod heap;
pub mod names;
pub mod table;
pub mod tags;
pub mod types;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::trace;

use crate::block::{BlockPipeline, BlockStore, RawBlock};
use crate::error::{ErrorKind, PffError, Result};
use crate::header::FormatVariant;
use crate::local_descriptors::SubnodeTree;
use crate::node_data::NodeData;

use heap::{is_subnode_ref, Heap, HeapClient};

pub use table::{Column, RecordSet, Table};
pub use types::{FileTime, PropertyTag, PropertyType, PropertyValue};

// ── Sub-node access ──────────────────────────────────────────────────────────

/// Resolves sub-node references found in HNIDs.
pub trait SubnodeSource {
    fn subnode(&self, id: u32) -> Result<NodeData<'_>>;
}

/// For records that cannot reference sub-nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSubnodes;

impl SubnodeSource for NoSubnodes {
    fn subnode(&self, id: u32) -> Result<NodeData<'_>> {
        Err(PffError::malformed(format!("sub-node {id:#x} referenced without a sub-node tree")))
    }
}

/// The sub-node tree of one node.
pub struct LocalSubnodes<'a> {
    pub store: &'a BlockStore,
    pub tree:  &'a SubnodeTree,
}

impl SubnodeSource for LocalSubnodes<'_> {
    fn subnode(&self, id: u32) -> Result<NodeData<'_>> {
        self.tree.data(self.store, id)
    }
}

/// Settings shared by every record decoded out of one node.
#[derive(Clone, Copy)]
pub struct RecordContext<'a> {
    pub variant:   FormatVariant,
    pub encrypted: bool,
    /// Default codepage for 8-bit strings.
    pub codepage:  u16,
    pub subnodes:  &'a dyn SubnodeSource,
}

impl<'a> RecordContext<'a> {
    pub fn new(variant: FormatVariant, encrypted: bool, codepage: u16, subnodes: &'a dyn SubnodeSource) -> Self {
        Self { variant, encrypted, codepage, subnodes }
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A property whose value bytes have been located but not yet typed.
#[derive(Debug)]
pub struct RawRecord {
    pub tag:   PropertyTag,
    pub bytes: Result<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyRecord {
    pub tag:   PropertyTag,
    pub value: PropertyValue,
}

impl PropertyRecord {
    /// Record whose tag type follows the value.
    pub fn new(id: u16, value: PropertyValue) -> Self {
        Self { tag: PropertyTag::new(id, value.property_type().as_u16()), value }
    }
}

/// A record that could not be decoded; its siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyIssue {
    pub tag:     PropertyTag,
    pub kind:    ErrorKind,
    pub message: String,
}

/// Decoded properties of one node or table row, in on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Properties {
    records: Vec<PropertyRecord>,
    issues:  Vec<PropertyIssue>,
}

impl Properties {
    /// Type every raw record. The record's own `MESSAGE_CODEPAGE`, when
    /// present, overrides `default_codepage` for 8-bit strings.
    pub fn from_raw(raw: Vec<RawRecord>, default_codepage: u16) -> Self {
        let codepage = raw
            .iter()
            .find(|r| r.tag == PropertyTag::new(tags::MESSAGE_CODEPAGE, 0x0003))
            .and_then(|r| r.bytes.as_ref().ok())
            .filter(|b| b.len() >= 4)
            .map(|b| LittleEndian::read_u32(b) as u16)
            .filter(|&cp| cp != 0)
            .unwrap_or(default_codepage);

        let mut out = Properties::default();
        for RawRecord { tag, bytes } in raw {
            let decoded = bytes.and_then(|b| {
                let ty = tag.kind().ok_or(PffError::UnknownPropertyType {
                    property_id:   tag.id,
                    property_type: tag.property_type,
                })?;
                PropertyValue::decode(ty, &b, codepage)
            });
            match decoded {
                Ok(value) => out.records.push(PropertyRecord { tag, value }),
                Err(e) => out.issues.push(PropertyIssue { tag, kind: e.kind(), message: e.to_string() }),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyRecord> {
        self.records.iter()
    }

    pub fn issues(&self) -> &[PropertyIssue] {
        &self.issues
    }

    /// First value with property id `id`, whatever its type.
    pub fn get(&self, id: u16) -> Option<&PropertyValue> {
        self.records.iter().find(|r| r.tag.id == id).map(|r| &r.value)
    }

    pub fn get_tag(&self, tag: PropertyTag) -> Option<&PropertyValue> {
        self.records.iter().find(|r| r.tag == tag).map(|r| &r.value)
    }

    pub fn string(&self, id: u16) -> Option<&str> {
        self.get(id).and_then(PropertyValue::as_str)
    }

    pub fn integer(&self, id: u16) -> Option<i64> {
        self.get(id).and_then(PropertyValue::as_i64)
    }

    pub fn time(&self, id: u16) -> Option<FileTime> {
        self.get(id).and_then(PropertyValue::as_time)
    }

    pub fn bytes(&self, id: u16) -> Option<&[u8]> {
        self.get(id).and_then(PropertyValue::as_bytes)
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = &'a PropertyRecord;
    type IntoIter = std::slice::Iter<'a, PropertyRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ── Property context ─────────────────────────────────────────────────────────

/// Bytes behind a HNID: a heap allocation or a whole sub-node.
pub(crate) fn resolve_hnid(heap: &Heap, hnid: u32, ctx: &RecordContext<'_>) -> Result<Vec<u8>> {
    if is_subnode_ref(hnid) {
        ctx.subnodes.subnode(hnid)?.read_all()
    } else {
        Ok(heap.item(hnid)?.to_vec())
    }
}

/// Locate every property of a property context without typing the values.
pub fn property_records(data: &NodeData<'_>, ctx: &RecordContext<'_>) -> Result<Vec<RawRecord>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let heap = Heap::parse(data, ctx.variant, ctx.encrypted)?;
    if heap.client() != HeapClient::PropertyContext {
        return Err(PffError::malformed(format!("heap client {:?} is not a property context", heap.client())));
    }
    if heap.user_root() == 0 {
        return Ok(Vec::new());
    }
    let (header, records) = bth::read_records(&heap, heap.user_root())?;
    if header.key_size != 2 || header.entry_size != 6 {
        return Err(PffError::malformed(format!(
            "property context tree with {}-byte keys and {}-byte entries",
            header.key_size, header.entry_size
        )));
    }
    trace!(records = records.len(), "property context");

    Ok(records
        .into_iter()
        .map(|r| {
            let tag = PropertyTag::new(LittleEndian::read_u16(r.key), LittleEndian::read_u16(&r.data[0..2]));
            let slot = LittleEndian::read_u32(&r.data[2..6]);
            let bytes = match tag.kind() {
                None => Err(PffError::UnknownPropertyType { property_id: tag.id, property_type: tag.property_type }),
                Some(ty) if ty.is_inline_in_context() => {
                    let size = ty.fixed_size().unwrap_or(0);
                    Ok(slot.to_le_bytes()[..size].to_vec())
                }
                Some(_) => resolve_hnid(&heap, slot, ctx),
            };
            RawRecord { tag, bytes }
        })
        .collect())
}

/// Decode the property context stored in `data`. An empty stream has no
/// properties.
pub fn decode_property_context(data: &NodeData<'_>, ctx: &RecordContext<'_>) -> Result<Properties> {
    Ok(Properties::from_raw(property_records(data, ctx)?, ctx.codepage))
}

/// Run a stored block through `pipeline` and decode it as a single-block
/// property context.
pub fn decode_block(raw: RawBlock, pipeline: &BlockPipeline, ctx: &RecordContext<'_>) -> Result<Properties> {
    let block = pipeline.decode(raw)?;
    decode_property_context(&NodeData::from_blocks(vec![block]), ctx)
}

/// Encode a property context into heap block payloads. Values too large
/// for the heap are handed to `spill`, which returns the sub-node id that
/// now holds them. Used by the fixture writer.
pub fn encode_property_context(
    variant: FormatVariant,
    records: &[PropertyRecord],
    mut spill: impl FnMut(Vec<u8>) -> Result<u32>,
) -> Result<Vec<Vec<u8>>> {
    let mut hb = heap::HeapBuilder::new(variant, HeapClient::PropertyContext);
    let mut sorted: Vec<&PropertyRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.tag.id);

    let mut entries = Vec::with_capacity(sorted.len());
    for r in sorted {
        let ty = r.value.property_type();
        let bytes = r.value.encode();
        let slot = if ty.is_inline_in_context() {
            let mut four = [0u8; 4];
            four[..bytes.len()].copy_from_slice(&bytes);
            u32::from_le_bytes(four)
        } else if bytes.len() > heap::MAX_ALLOCATION {
            spill(bytes)?
        } else if bytes.is_empty() {
            0
        } else {
            hb.allocate(&bytes)?
        };
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&ty.as_u16().to_le_bytes());
        data.extend_from_slice(&slot.to_le_bytes());
        entries.push((r.tag.id.to_le_bytes().to_vec(), data));
    }
    let root = bth::build(&mut hb, 2, 6, &entries)?;
    hb.set_user_root(root);
    Ok(hb.finish())
}


#[cfg(test)]
mod tests {
    use super::test_support::MemorySubnodes;
    use super::*;
    use crate::header::EncryptionType;

    fn rec(id: u16, value: PropertyValue) -> PropertyRecord {
        PropertyRecord { tag: PropertyTag::new(id, value.property_type().as_u16()), value }
    }

    fn sample() -> Vec<PropertyRecord> {
        vec![
            rec(tags::DISPLAY_NAME, PropertyValue::Unicode("Inbox".into())),
            rec(tags::CONTENT_COUNT, PropertyValue::Integer32(3)),
            rec(tags::SUBFOLDERS, PropertyValue::Boolean(false)),
            rec(tags::CREATION_TIME, PropertyValue::Time(FileTime(0x01D9_0000_0000_0000))),
            rec(tags::RECORD_KEY, PropertyValue::Binary(vec![0xAA; 16])),
        ]
    }

    #[test]
    fn property_context_round_trip() {
        for variant in [FormatVariant::Ansi, FormatVariant::Unicode, FormatVariant::Unicode4k] {
            let payloads = encode_property_context(variant, &sample(), |_| unreachable!()).unwrap();
            let data = heap::node_data_from(payloads);
            let ctx = RecordContext::new(variant, false, 1252, &NoSubnodes);
            let props = decode_property_context(&data, &ctx).unwrap();
            assert_eq!(props.len(), 5);
            assert!(props.issues().is_empty());
            assert_eq!(props.string(tags::DISPLAY_NAME), Some("Inbox"));
            assert_eq!(props.integer(tags::CONTENT_COUNT), Some(3));
            assert_eq!(props.get(tags::SUBFOLDERS), Some(&PropertyValue::Boolean(false)));
            assert_eq!(props.bytes(tags::RECORD_KEY), Some(&[0xAA; 16][..]));
            let ids: Vec<u16> = props.iter().map(|r| r.tag.id).collect();
            let mut sorted = ids.clone();
            sorted.sort();
            assert_eq!(ids, sorted);
        }
    }

    #[test]
    fn large_value_goes_to_subnode() {
        let body = "x".repeat(5000);
        let records = vec![rec(tags::BODY, PropertyValue::Unicode(body.clone()))];
        let mut subnodes = MemorySubnodes::default();
        let payloads = encode_property_context(FormatVariant::Unicode, &records, |bytes| {
            subnodes.0.insert(0x8025, bytes);
            Ok(0x8025)
        })
        .unwrap();
        let ctx = RecordContext::new(FormatVariant::Unicode, false, 1252, &subnodes);
        let props = decode_property_context(&heap::node_data_from(payloads), &ctx).unwrap();
        assert_eq!(props.string(tags::BODY), Some(body.as_str()));

        let ctx = RecordContext::new(FormatVariant::Unicode, false, 1252, &NoSubnodes);
        let props = decode_property_context(&heap::node_data_from(
            encode_property_context(FormatVariant::Unicode, &records, |_| Ok(0x8025)).unwrap(),
        ), &ctx)
        .unwrap();
        assert!(props.is_empty());
        assert_eq!(props.issues()[0].kind, ErrorKind::MalformedRecord);
    }

    #[test]
    fn unknown_type_is_isolated() {
        let mut hb = heap::HeapBuilder::new(FormatVariant::Unicode, HeapClient::PropertyContext);
        let entries = vec![
            (0x3001u16.to_le_bytes().to_vec(), [0x03u8, 0x00, 7, 0, 0, 0].to_vec()),
            (0x3002u16.to_le_bytes().to_vec(), [0x99u8, 0x00, 1, 0, 0, 0].to_vec()),
        ];
        let root = bth::build(&mut hb, 2, 6, &entries).unwrap();
        hb.set_user_root(root);
        let ctx = RecordContext::new(FormatVariant::Unicode, false, 1252, &NoSubnodes);
        let props = decode_property_context(&heap::node_data_from(hb.finish()), &ctx).unwrap();
        assert_eq!(props.integer(0x3001), Some(7));
        assert_eq!(props.issues().len(), 1);
        assert_eq!(props.issues()[0].kind, ErrorKind::UnknownPropertyType);
        assert_eq!(props.issues()[0].tag, PropertyTag::new(0x3002, 0x99));
    }

    #[test]
    fn message_codepage_overrides_default() {
        let records = vec![
            rec(tags::SUBJECT, PropertyValue::Binary(b"\xcf\xf0\xe8\xe2\xe5\xf2".to_vec())),
            rec(tags::MESSAGE_CODEPAGE, PropertyValue::Integer32(1251)),
        ];
        let mut payloads = encode_property_context(FormatVariant::Ansi, &records, |_| unreachable!()).unwrap();
        // Retag the binary subject as an 8-bit string in place.
        let needle = [0x37u8, 0x00, 0x02, 0x01];
        let pos = payloads[0].windows(4).position(|w| w == needle).unwrap();
        payloads[0][pos + 2] = 0x1E;
        payloads[0][pos + 3] = 0x00;

        let ctx = RecordContext::new(FormatVariant::Ansi, false, 1252, &NoSubnodes);
        let props = decode_property_context(&heap::node_data_from(payloads), &ctx).unwrap();
        assert_eq!(props.string(tags::SUBJECT), Some("Привет"));
    }

    #[test]
    fn empty_and_wrong_client() {
        let ctx = RecordContext::new(FormatVariant::Ansi, true, 1252, &NoSubnodes);
        assert!(decode_property_context(&NodeData::default(), &ctx).unwrap().is_empty());

        let tc = heap::HeapBuilder::new(FormatVariant::Ansi, HeapClient::TableContext).finish();
        assert_eq!(
            decode_property_context(&heap::node_data_from(tc), &ctx).unwrap_err().kind(),
            ErrorKind::MalformedRecord
        );
    }

    #[test]
    fn decode_block_runs_pipeline() {
        let variant = FormatVariant::Unicode;
        let pipeline = BlockPipeline::new(variant, EncryptionType::High, true);
        let payload = encode_property_context(variant, &sample(), |_| unreachable!()).unwrap().remove(0);
        let encoded = pipeline.encode(0x44, 0x400, &payload, false).unwrap();
        let mut file = vec![0u8; 0x400];
        file.extend(encoded);
        let reader = crate::io_stream::PffReader::from_bytes(file);
        let entry = crate::allocation::AllocationEntry { id: 0x44, offset: 0x400, size: payload.len() as u16, ref_count: 2 };
        let raw = pipeline.read_raw(&reader, &entry).unwrap();
        let ctx = RecordContext::new(variant, true, 1252, &NoSubnodes);
        let props = decode_block(raw, &pipeline, &ctx).unwrap();
        assert_eq!(props.string(tags::DISPLAY_NAME), Some("Inbox"));

        // The wrong key leaves no heap signature behind.
        let wrong = BlockPipeline::new(variant, EncryptionType::Compressible, true);
        let raw = wrong.read_raw(&reader, &entry).unwrap();
        assert_eq!(decode_block(raw, &wrong, &ctx).unwrap_err().kind(), ErrorKind::DecryptionError);
    }
}
