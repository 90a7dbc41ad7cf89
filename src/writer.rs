//! Container writer for fixtures and tests.
//!
//! [`ContainerBuilder`] collects folders, messages and raw nodes, then
//! [`build`](ContainerBuilder::build) lays out a complete container in one
//! pass:
//!
//! ```text
//! ┌────────┬──────────────────────────────┬──────────────────┬───────────────┐
//! │ header │ data blocks, arrays, sub-node│ descriptor pages │ offsets pages │
//! │        │ trees (block-aligned)        │ (page-aligned)   │               │
//! └────────┴──────────────────────────────┴──────────────────┴───────────────┘
//! ```
//!
//! ```
//! use pffkit::header::FormatVariant;
//! use pffkit::record::{tags, PropertyRecord, PropertyValue};
//! use pffkit::writer::{BuildOptions, ContainerBuilder, MessageSpec};
//!
//! let mut builder = ContainerBuilder::new(BuildOptions::new(FormatVariant::Unicode));
//! let inbox = builder.add_folder(builder.root(), vec![
//!     PropertyRecord::new(tags::DISPLAY_NAME, PropertyValue::Unicode("Inbox".into())),
//! ]);
//! builder.add_message(inbox, MessageSpec::new().property(tags::SUBJECT, PropertyValue::Unicode("hi".into())));
//! let built = builder.build()?;
//! assert_eq!(&built.bytes[0..4], b"!BDN");
//! # Ok::<(), pffkit::error::PffError>(())
//! ```
//!
//! Folders are linked through descriptor parents only; hierarchy and
//! contents tables are not written.

use std::io;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;
use uuid::Uuid;

use crate::allocation::AllocationEntry;
use crate::block::BlockPipeline;
use crate::btree::{encode_page, BranchEntry, DescriptorEntry, OffsetsEntry, PageEntries, PageLayout, PageType};
use crate::error::{PffError, Result};
use crate::header::{BlockRef, ContentType, EncryptionType, FormatVariant, Header};
use crate::index::{make_nid, NodeType, NID_MESSAGE_STORE, NID_NAME_TO_ID_MAP, NID_ROOT_FOLDER};
use crate::item::{ATTACHMENT_TABLE_ID, RECIPIENT_TABLE_ID};
use crate::local_descriptors::{encode_branch, encode_leaf, leaf_capacity, SubnodeEntry};
use crate::node_data::{array_capacity, encode_array};
use crate::record::heap::{HeapBuilder, HeapClient, MAX_ALLOCATION};
use crate::record::names::{encode_streams, PropertyName};
use crate::record::table::TableLayout;
use crate::record::{encode_property_context, tags, PropertyRecord, PropertyTag, PropertyValue};

/// Attachment columns copied into the attachment table.
const ATTACHMENT_COLUMNS: [u16; 3] = [tags::ATTACH_SIZE, tags::ATTACH_METHOD, tags::ATTACH_LONG_FILENAME];

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub content_type:     ContentType,
    pub variant:          FormatVariant,
    pub encryption:       EncryptionType,
    /// Deflate data blocks; only the 4K variant compresses.
    pub compress:         bool,
    /// Cap on entries per B-tree page, to force deeper trees.
    pub max_page_entries: Option<usize>,
}

impl BuildOptions {
    pub fn new(variant: FormatVariant) -> Self {
        Self {
            content_type:     ContentType::Pst,
            variant,
            encryption:       EncryptionType::None,
            compress:         false,
            max_page_entries: None,
        }
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionType) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn max_page_entries(mut self, entries: usize) -> Self {
        self.max_page_entries = Some(entries);
        self
    }
}

// ── Content ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSpec {
    pub properties:  Vec<PropertyRecord>,
    pub recipients:  Vec<Vec<PropertyRecord>>,
    pub attachments: Vec<AttachmentSpec>,
}

impl MessageSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, id: u16, value: PropertyValue) -> Self {
        self.properties.push(PropertyRecord::new(id, value));
        self
    }

    pub fn recipient(mut self, properties: Vec<PropertyRecord>) -> Self {
        self.recipients.push(properties);
        self
    }

    pub fn attachment(mut self, attachment: AttachmentSpec) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSpec {
    pub properties: Vec<PropertyRecord>,
    pub embedded:   Option<MessageSpec>,
}

impl AttachmentSpec {
    /// File attached by value.
    pub fn by_value(filename: &str, data: Vec<u8>) -> Self {
        Self::default()
            .property(tags::ATTACH_METHOD, PropertyValue::Integer32(tags::ATTACH_BY_VALUE))
            .property(tags::ATTACH_LONG_FILENAME, PropertyValue::Unicode(filename.to_owned()))
            .property(tags::ATTACH_SIZE, PropertyValue::Integer32(data.len() as i32))
            .property(tags::ATTACH_DATA, PropertyValue::Binary(data))
    }

    /// Message attached as an embedded message. The attach method and data
    /// reference are filled in when the container is built.
    pub fn embedded(message: MessageSpec) -> Self {
        Self { properties: Vec::new(), embedded: Some(message) }
    }

    pub fn property(mut self, id: u16, value: PropertyValue) -> Self {
        self.properties.push(PropertyRecord::new(id, value));
        self
    }
}

#[derive(Debug, Clone)]
enum NodeBody {
    Message(MessageSpec),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
struct NodeSpec {
    id:     u32,
    parent: u32,
    body:   NodeBody,
}

// ── Output ───────────────────────────────────────────────────────────────────

/// A written container plus where things ended up.
#[derive(Debug, Clone)]
pub struct BuiltContainer {
    pub bytes:            Vec<u8>,
    pub header:           Header,
    /// Every block, in id order.
    pub blocks:           Vec<AllocationEntry>,
    /// Every descriptor, in id order.
    pub descriptors:      Vec<DescriptorEntry>,
    /// Root page level of each table.
    pub descriptor_depth: u8,
    pub offsets_depth:    u8,
}

impl BuiltContainer {
    pub fn block(&self, id: u64) -> Option<&AllocationEntry> {
        self.blocks.iter().find(|b| b.id == id & !1)
    }

    pub fn descriptor(&self, id: u32) -> Option<&DescriptorEntry> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct ContainerBuilder {
    options:    BuildOptions,
    nodes:      Vec<NodeSpec>,
    next_index: u32,
}

impl ContainerBuilder {
    /// A builder holding only the root folder, with no properties.
    pub fn new(options: BuildOptions) -> Self {
        let root = NodeSpec {
            id:     NID_ROOT_FOLDER,
            parent: NID_ROOT_FOLDER,
            body:   NodeBody::Message(MessageSpec::default()),
        };
        Self { options, nodes: vec![root], next_index: 0x400 }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn root(&self) -> u32 {
        NID_ROOT_FOLDER
    }

    fn next_id(&mut self, node_type: NodeType) -> u32 {
        self.next_index += 1;
        make_nid(self.next_index, node_type)
    }

    fn push(&mut self, id: u32, parent: u32, body: NodeBody) -> u32 {
        self.nodes.retain(|n| n.id != id);
        self.nodes.push(NodeSpec { id, parent, body });
        id
    }

    pub fn set_root_properties(&mut self, properties: Vec<PropertyRecord>) {
        let spec = MessageSpec { properties, ..MessageSpec::default() };
        self.push(NID_ROOT_FOLDER, NID_ROOT_FOLDER, NodeBody::Message(spec));
    }

    pub fn add_message_store(&mut self, properties: Vec<PropertyRecord>) -> u32 {
        let spec = MessageSpec { properties, ..MessageSpec::default() };
        self.push(NID_MESSAGE_STORE, 0, NodeBody::Message(spec))
    }

    /// Named-property map; `names[i]` is given property id `0x8000 + i`.
    pub fn add_name_to_id_map(&mut self, names: &[(Uuid, PropertyName)]) -> u32 {
        let streams = encode_streams(names);
        let properties = vec![
            PropertyRecord::new(tags::NAMEID_STREAM_GUID, PropertyValue::Binary(streams.guids)),
            PropertyRecord::new(tags::NAMEID_STREAM_ENTRY, PropertyValue::Binary(streams.entries)),
            PropertyRecord::new(tags::NAMEID_STREAM_STRING, PropertyValue::Binary(streams.strings)),
        ];
        let spec = MessageSpec { properties, ..MessageSpec::default() };
        self.push(NID_NAME_TO_ID_MAP, 0, NodeBody::Message(spec))
    }

    pub fn add_folder(&mut self, parent: u32, properties: Vec<PropertyRecord>) -> u32 {
        let id = self.next_id(NodeType::Folder);
        let spec = MessageSpec { properties, ..MessageSpec::default() };
        self.push(id, parent, NodeBody::Message(spec))
    }

    pub fn add_message(&mut self, parent: u32, message: MessageSpec) -> u32 {
        let id = self.next_id(NodeType::Message);
        self.push(id, parent, NodeBody::Message(message))
    }

    /// Node whose data stream is `data` as given, with no sub-nodes.
    pub fn add_raw_node(&mut self, parent: u32, node_type: NodeType, data: Vec<u8>) -> u32 {
        let id = self.next_id(node_type);
        self.push(id, parent, NodeBody::Raw(data))
    }

    pub fn build(self) -> Result<BuiltContainer> {
        let options = self.options;
        let variant = options.variant;
        let mut em = Emitter::new(&options);

        let mut descriptors = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let (data_id, subnodes_id) = match &node.body {
                NodeBody::Message(message) => em.message(message)?,
                NodeBody::Raw(data) => (em.bytes(data)?, 0),
            };
            descriptors.push(DescriptorEntry { id: node.id, data_id, subnodes_id, parent: node.parent });
        }
        descriptors.sort_by_key(|d| d.id);

        let (descriptors_root, descriptor_depth) =
            em.btree(PageType::Descriptors, PageEntries::Descriptors(descriptors.clone()), options.max_page_entries);
        let blocks = em.blocks.clone();
        let offsets: Vec<OffsetsEntry> = blocks
            .iter()
            .map(|b| OffsetsEntry { id: b.id, offset: b.offset, size: b.size, ref_count: b.ref_count })
            .collect();
        let (offsets_root, offsets_depth) =
            em.btree(PageType::Offsets, PageEntries::Offsets(offsets), options.max_page_entries);

        let mut header = Header::new(options.content_type, variant, options.encryption);
        header.file_size = em.out.len() as u64;
        header.descriptors_root = descriptors_root;
        header.offsets_root = offsets_root;
        header.next_block_id = em.next_id;
        header.next_page_id = em.next_id;
        header.unique = self.nodes.len() as u32;
        em.out[..variant.header_size()].copy_from_slice(&header.encode());

        debug!(
            variant = ?variant,
            size = em.out.len(),
            blocks = blocks.len(),
            descriptors = descriptors.len(),
            "built container"
        );
        Ok(BuiltContainer {
            bytes: em.out,
            header,
            blocks,
            descriptors,
            descriptor_depth,
            offsets_depth,
        })
    }
}

// ── Emitter ──────────────────────────────────────────────────────────────────

/// Sub-nodes of one owner, collected while its content is written.
#[derive(Default)]
struct LocalTree {
    entries: Vec<SubnodeEntry>,
    next:    u32,
}

impl LocalTree {
    fn reserve(&mut self, node_type: NodeType) -> u32 {
        self.next += 1;
        make_nid(self.next, node_type)
    }

    fn insert(&mut self, id: u32, data_id: u64, subnodes_id: u64) {
        self.entries.push(SubnodeEntry { id, data_id, subnodes_id });
    }
}

struct Emitter {
    variant:  FormatVariant,
    pipeline: BlockPipeline,
    compress: bool,
    out:      Vec<u8>,
    blocks:   Vec<AllocationEntry>,
    next_id:  u64,
}

fn codec_failure(e: crate::codec::CodecError) -> PffError {
    PffError::Io(io::Error::new(io::ErrorKind::Other, e))
}

impl Emitter {
    fn new(options: &BuildOptions) -> Self {
        let variant = options.variant;
        let mut out = vec![0u8; variant.header_size()];
        out.resize(variant.header_size().next_multiple_of(variant.page_size()), 0);
        Self {
            variant,
            pipeline: BlockPipeline::new(variant, options.encryption, true),
            compress: options.compress,
            out,
            blocks: Vec::new(),
            next_id: 4,
        }
    }

    fn allocate_id(&mut self, internal: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 4;
        if internal { id | 2 } else { id }
    }

    fn pad_to(&mut self, align: usize) {
        let len = self.out.len().next_multiple_of(align);
        self.out.resize(len, 0);
    }

    fn block(&mut self, payload: &[u8], internal: bool) -> Result<u64> {
        let id = self.allocate_id(internal);
        self.pad_to(self.variant.block_alignment() as usize);
        let offset = self.out.len() as u64;
        let encoded = self
            .pipeline
            .encode(id, offset, payload, self.compress && !internal)
            .map_err(codec_failure)?;
        let trailer = self.variant.block_trailer_size();
        let size = LittleEndian::read_u16(&encoded[encoded.len() - trailer..]);
        self.out.extend_from_slice(&encoded);
        self.blocks.push(AllocationEntry { id, offset, size, ref_count: 2 });
        Ok(id)
    }

    /// Store a stream already split into blocks and return its data id: the
    /// block itself, or a data array over the blocks.
    fn stream(&mut self, parts: Vec<Vec<u8>>) -> Result<u64> {
        let ids = parts.iter().map(|p| self.block(p, false)).collect::<Result<Vec<_>>>()?;
        let total: usize = parts.iter().map(Vec::len).sum();
        match ids.len() {
            0 => Ok(0),
            1 => Ok(ids[0]),
            n if n <= array_capacity(self.variant) => {
                self.block(&encode_array(self.variant, 1, total as u32, &ids), true)
            }
            _ => {
                let cap = array_capacity(self.variant);
                let mut inner = Vec::new();
                for (chunk, sizes) in ids.chunks(cap).zip(parts.chunks(cap)) {
                    let sub_total: usize = sizes.iter().map(Vec::len).sum();
                    inner.push(self.block(&encode_array(self.variant, 1, sub_total as u32, chunk), true)?);
                }
                self.block(&encode_array(self.variant, 2, total as u32, &inner), true)
            }
        }
    }

    fn bytes(&mut self, data: &[u8]) -> Result<u64> {
        let parts = data.chunks(self.variant.max_block_data()).map(<[u8]>::to_vec).collect();
        self.stream(parts)
    }

    fn subnodes(&mut self, mut local: LocalTree) -> Result<u64> {
        if local.entries.is_empty() {
            return Ok(0);
        }
        local.entries.sort_by_key(|e| e.id);
        let cap = leaf_capacity(self.variant);
        if local.entries.len() <= cap {
            return self.block(&encode_leaf(self.variant, &local.entries), true);
        }
        let mut children = Vec::new();
        for chunk in local.entries.chunks(cap) {
            children.push((chunk[0].id, self.block(&encode_leaf(self.variant, chunk), true)?));
        }
        self.block(&encode_branch(self.variant, &children), true)
    }

    fn property_context(&mut self, records: &[PropertyRecord], local: &mut LocalTree) -> Result<u64> {
        let variant = self.variant;
        let heap = encode_property_context(variant, records, |bytes| {
            let id = local.reserve(NodeType::LocalTable);
            let data_id = self.bytes(&bytes)?;
            local.insert(id, data_id, 0);
            Ok(id)
        })?;
        self.stream(heap)
    }

    /// Message, folder or attachment body: property context plus sub-nodes.
    fn message(&mut self, message: &MessageSpec) -> Result<(u64, u64)> {
        let mut local = LocalTree::default();

        if !message.recipients.is_empty() {
            let rows: Vec<(u32, Vec<PropertyRecord>)> = message
                .recipients
                .iter()
                .enumerate()
                .map(|(i, r)| (i as u32 + 1, r.clone()))
                .collect();
            let (data_id, subnodes_id) = self.table(&rows)?;
            local.insert(RECIPIENT_TABLE_ID, data_id, subnodes_id);
        }

        if !message.attachments.is_empty() {
            let mut rows = Vec::with_capacity(message.attachments.len());
            for attachment in &message.attachments {
                let id = local.reserve(NodeType::Attachment);
                let (data_id, subnodes_id, properties) = self.attachment(attachment)?;
                local.insert(id, data_id, subnodes_id);
                let columns = properties.into_iter().filter(|p| ATTACHMENT_COLUMNS.contains(&p.tag.id)).collect();
                rows.push((id, columns));
            }
            let (data_id, subnodes_id) = self.table(&rows)?;
            local.insert(ATTACHMENT_TABLE_ID, data_id, subnodes_id);
        }

        let data_id = self.property_context(&message.properties, &mut local)?;
        Ok((data_id, self.subnodes(local)?))
    }

    fn attachment(&mut self, attachment: &AttachmentSpec) -> Result<(u64, u64, Vec<PropertyRecord>)> {
        let mut local = LocalTree::default();
        let mut properties = attachment.properties.clone();
        if let Some(embedded) = &attachment.embedded {
            let id = local.reserve(NodeType::Message);
            let (data_id, subnodes_id) = self.message(embedded)?;
            local.insert(id, data_id, subnodes_id);
            properties.retain(|p| p.tag.id != tags::ATTACH_METHOD && p.tag.id != tags::ATTACH_DATA);
            properties.push(PropertyRecord::new(
                tags::ATTACH_METHOD,
                PropertyValue::Integer32(tags::ATTACH_EMBEDDED_MESSAGE),
            ));
            properties.push(PropertyRecord::new(tags::ATTACH_DATA, PropertyValue::Object { id, size: 0 }));
        }
        let data_id = self.property_context(&properties, &mut local)?;
        Ok((data_id, self.subnodes(local)?, properties))
    }

    /// Table context over `rows` of `(row id, cells)`. Oversized cells and an
    /// oversized row matrix go to the table's own sub-nodes.
    fn table(&mut self, rows: &[(u32, Vec<PropertyRecord>)]) -> Result<(u64, u64)> {
        let variant = self.variant;
        let mut columns: Vec<PropertyTag> = Vec::new();
        for record in rows.iter().flat_map(|(_, r)| r) {
            if !columns.contains(&record.tag) {
                columns.push(record.tag);
            }
        }
        let layout = TableLayout::new(&columns);
        let mut heap = HeapBuilder::new(variant, HeapClient::TableContext);
        let mut local = LocalTree::default();

        let mut matrix = Vec::with_capacity(rows.len() * layout.row_size());
        for (row_id, records) in rows {
            let mut cells = Vec::with_capacity(records.len());
            for record in records {
                let bytes = record.value.encode();
                let cell = if record.value.property_type().is_inline_in_row() {
                    bytes
                } else if bytes.is_empty() {
                    vec![0; 4]
                } else if bytes.len() > MAX_ALLOCATION {
                    let id = local.reserve(NodeType::LocalTable);
                    let data_id = self.bytes(&bytes)?;
                    local.insert(id, data_id, 0);
                    id.to_le_bytes().to_vec()
                } else {
                    heap.allocate(&bytes)?.to_le_bytes().to_vec()
                };
                cells.push((record.tag, cell));
            }
            matrix.extend(layout.encode_row(*row_id, &cells));
        }

        let rows_hnid = if matrix.is_empty() {
            0
        } else if matrix.len() <= MAX_ALLOCATION {
            heap.allocate(&matrix)?
        } else {
            let per_block = (variant.max_block_data() / layout.row_size()).max(1) * layout.row_size();
            let data_id = self.stream(matrix.chunks(per_block).map(<[u8]>::to_vec).collect())?;
            let id = local.reserve(NodeType::LocalTable);
            local.insert(id, data_id, 0);
            id
        };
        let ids: Vec<u32> = rows.iter().map(|(id, _)| *id).collect();
        layout.finish(&mut heap, &ids, rows_hnid, variant.is_wide())?;

        let data_id = self.stream(heap.finish())?;
        Ok((data_id, self.subnodes(local)?))
    }

    // ── B-trees ──────────────────────────────────────────────────────────────

    fn page(&mut self, page_type: PageType, level: u8, entries: &PageEntries) -> BlockRef {
        let layout = PageLayout::new(self.variant);
        self.pad_to(layout.page_size());
        let page_ref = BlockRef { id: self.allocate_id(true), offset: self.out.len() as u64 };
        let page = encode_page(&layout, page_type, level, entries, page_ref);
        self.out.extend_from_slice(&page);
        page_ref
    }

    /// Write a tree over sorted leaf entries bottom-up; returns the root
    /// and its level.
    fn btree(&mut self, page_type: PageType, leaves: PageEntries, cap: Option<usize>) -> (BlockRef, u8) {
        let layout = PageLayout::new(self.variant);
        let fanout = |level: u8| {
            let max = layout.max_entries(layout.entry_size(page_type, level));
            cap.map_or(max, |c| c.clamp(2, max))
        };
        let mut level = 0u8;
        let mut current = chunked(&leaves, fanout(0));
        loop {
            let refs: Vec<BranchEntry> = current
                .iter()
                .map(|(key, entries)| BranchEntry { key: *key, child: self.page(page_type, level, entries) })
                .collect();
            if refs.len() == 1 {
                return (refs[0].child, level);
            }
            level += 1;
            current = chunked(&PageEntries::Branch(refs), fanout(level));
        }
    }
}

/// Split entries into pages of at most `n`, keyed by their first entry.
/// An empty table is a single empty leaf.
fn chunked(entries: &PageEntries, n: usize) -> Vec<(u64, PageEntries)> {
    fn pieces<T: Clone>(v: &[T], n: usize, key: impl Fn(&T) -> u64, wrap: impl Fn(Vec<T>) -> PageEntries) -> Vec<(u64, PageEntries)> {
        if v.is_empty() {
            return vec![(0, wrap(Vec::new()))];
        }
        v.chunks(n).map(|c| (key(&c[0]), wrap(c.to_vec()))).collect()
    }
    match entries {
        PageEntries::Branch(v)      => pieces(v, n, |e| e.key, PageEntries::Branch),
        PageEntries::Offsets(v)     => pieces(v, n, |e| e.id, PageEntries::Offsets),
        PageEntries::Descriptors(v) => pieces(v, n, |e| e.id as u64, PageEntries::Descriptors),
    }
}
