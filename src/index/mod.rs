//! Descriptors table: descriptor id → {data block, sub-node block, parent}.
//!
//! # Modes
//!
//! | Mode | Open cost | Lookup |
//! |------|-----------|--------|
//! | `Paged` | root page only | descend from the root through a bounded page memo |
//! | `Eager` | every page, plus a parent → children map | hash lookup |
//!
//! Both modes present the same operations and the same on-disk order.
//! In paged mode, full walks stream their pages and leave the memo alone;
//! only descents for [`DescriptorIndex::resolve`] populate it, and the
//! least recently used page is dropped once [`PAGE_MEMO_CAPACITY`] pages
//! are held.
//!
//! # Termination
//!
//! A descent requires each child page to sit exactly one level below its
//! parent, so it ends after at most `root level + 1` pages. Full walks
//! (children, orphans, eager load) additionally keep a visited set of page
//! offsets. Parent links are followed with a visited set of descriptor
//! ids; a repeat is reported as corruption.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, trace};

use crate::btree::{read_page, IndexPage, PageEntries, PageLayout, PageType};
use crate::config::IndexMode;
use crate::error::{ErrorKind, PffError, Result};
use crate::header::{BlockRef, Header};
use crate::io_stream::PffReader;

// ── Well-known descriptors ───────────────────────────────────────────────────

pub const NID_MESSAGE_STORE:   u32 = 0x21;
pub const NID_NAME_TO_ID_MAP:  u32 = 0x61;
pub const NID_ROOT_FOLDER:     u32 = 0x122;
pub const NID_SEARCH_MANAGEMENT_QUEUE: u32 = 0x1E1;

/// Pages kept by the paged-mode descent memo.
pub const PAGE_MEMO_CAPACITY: usize = 64;

/// Node type, the low five bits of a descriptor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeType {
    Internal,
    Folder,
    SearchFolder,
    Message,
    Attachment,
    SearchUpdateQueue,
    SearchCriteria,
    AssociatedMessage,
    ContentsTableIndex,
    ReceiveFolderTable,
    OutgoingQueueTable,
    HierarchyTable,
    ContentsTable,
    AssociatedContentsTable,
    SearchContentsTable,
    AttachmentTable,
    RecipientTable,
    SearchTableIndex,
    LocalTable,
    Other(u8),
}

impl NodeType {
    pub fn of(id: u32) -> Self {
        match (id & 0x1F) as u8 {
            0x01 => Self::Internal,
            0x02 => Self::Folder,
            0x03 => Self::SearchFolder,
            0x04 => Self::Message,
            0x05 => Self::Attachment,
            0x06 => Self::SearchUpdateQueue,
            0x07 => Self::SearchCriteria,
            0x08 => Self::AssociatedMessage,
            0x0A => Self::ContentsTableIndex,
            0x0B => Self::ReceiveFolderTable,
            0x0C => Self::OutgoingQueueTable,
            0x0D => Self::HierarchyTable,
            0x0E => Self::ContentsTable,
            0x0F => Self::AssociatedContentsTable,
            0x10 => Self::SearchContentsTable,
            0x11 => Self::AttachmentTable,
            0x12 => Self::RecipientTable,
            0x13 => Self::SearchTableIndex,
            0x1F => Self::LocalTable,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Internal                => 0x01,
            Self::Folder                  => 0x02,
            Self::SearchFolder            => 0x03,
            Self::Message                 => 0x04,
            Self::Attachment              => 0x05,
            Self::SearchUpdateQueue       => 0x06,
            Self::SearchCriteria          => 0x07,
            Self::AssociatedMessage       => 0x08,
            Self::ContentsTableIndex      => 0x0A,
            Self::ReceiveFolderTable      => 0x0B,
            Self::OutgoingQueueTable      => 0x0C,
            Self::HierarchyTable          => 0x0D,
            Self::ContentsTable           => 0x0E,
            Self::AssociatedContentsTable => 0x0F,
            Self::SearchContentsTable     => 0x10,
            Self::AttachmentTable         => 0x11,
            Self::RecipientTable          => 0x12,
            Self::SearchTableIndex        => 0x13,
            Self::LocalTable              => 0x1F,
            Self::Other(v)                => v,
        }
    }
}

/// Compose a descriptor id from an index and a node type.
pub fn make_nid(index: u32, node_type: NodeType) -> u32 {
    (index << 5) | node_type.as_u8() as u32
}

// ── Descriptor node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriptorNode {
    pub id:          u32,
    pub data_id:     u64,
    pub subnodes_id: u64,
    pub parent:      u32,
}

impl DescriptorNode {
    pub fn node_type(&self) -> NodeType {
        NodeType::of(self.id)
    }

    /// The root folder is its own parent.
    pub fn is_self_parented(&self) -> bool {
        self.parent == self.id
    }
}

impl From<crate::btree::DescriptorEntry> for DescriptorNode {
    fn from(e: crate::btree::DescriptorEntry) -> Self {
        Self { id: e.id, data_id: e.data_id, subnodes_id: e.subnodes_id, parent: e.parent }
    }
}

// ── Index ────────────────────────────────────────────────────────────────────

struct EagerTable {
    nodes:    Vec<DescriptorNode>,
    by_id:    HashMap<u32, usize>,
    children: HashMap<u32, Vec<usize>>,
}

/// Descent memo: page offset → (page, last use).
#[derive(Default)]
struct PageMemo {
    pages: HashMap<u64, (Arc<IndexPage>, u64)>,
    tick:  u64,
}

impl PageMemo {
    fn get(&mut self, offset: u64) -> Option<Arc<IndexPage>> {
        self.tick += 1;
        let tick = self.tick;
        self.pages.get_mut(&offset).map(|(page, used)| {
            *used = tick;
            page.clone()
        })
    }

    fn insert(&mut self, offset: u64, page: Arc<IndexPage>) {
        if self.pages.len() >= PAGE_MEMO_CAPACITY && !self.pages.contains_key(&offset) {
            let oldest = self.pages.iter().min_by_key(|(_, (_, used))| *used).map(|(&k, _)| k);
            if let Some(oldest) = oldest {
                self.pages.remove(&oldest);
            }
        }
        self.tick += 1;
        self.pages.insert(offset, (page, self.tick));
    }
}

pub struct DescriptorIndex {
    reader: PffReader,
    layout: PageLayout,
    root:   BlockRef,
    verify: bool,
    max_pages: usize,
    memo:   Mutex<PageMemo>,
    eager:  Option<EagerTable>,
}

impl DescriptorIndex {
    /// Validate the root page and, in eager mode, load the whole table.
    pub fn open(reader: PffReader, header: &Header, mode: IndexMode, verify: bool) -> Result<Self> {
        let layout = PageLayout::new(header.variant);
        let mut index = Self {
            reader,
            layout,
            root: header.descriptors_root,
            verify,
            max_pages: (header.file_size / layout.page_size() as u64).max(1) as usize,
            memo: Mutex::new(PageMemo::default()),
            eager: None,
        };
        let root = index.page(index.root, None, true)?;
        debug!(level = root.level(), entries = root.entries.len(), ?mode, "descriptors root page");

        if mode == IndexMode::Eager {
            let nodes = index.walk(None).collect::<Result<Vec<_>>>()?;
            let mut by_id = HashMap::with_capacity(nodes.len());
            let mut children: HashMap<u32, Vec<usize>> = HashMap::new();
            for (i, node) in nodes.iter().enumerate() {
                if by_id.insert(node.id, i).is_some() {
                    return Err(PffError::corrupt_table(
                        index.root.offset,
                        format!("descriptor {:#x} listed twice", node.id),
                    ));
                }
                if !node.is_self_parented() {
                    children.entry(node.parent).or_default().push(i);
                }
            }
            let table = EagerTable { nodes, by_id, children };
            check_parent_cycles(&table, index.root.offset)?;
            debug!(descriptors = table.nodes.len(), "loaded descriptors table");
            index.eager = Some(table);
            index.memo = Mutex::new(PageMemo::default());
        }
        Ok(index)
    }

    pub fn mode(&self) -> IndexMode {
        if self.eager.is_some() { IndexMode::Eager } else { IndexMode::Paged }
    }

    /// Number of pages currently memoised (paged mode).
    pub fn cached_pages(&self) -> usize {
        self.memo.lock().map(|m| m.pages.len()).unwrap_or(0)
    }

    /// Read a page, through the memo. `remember` adds a freshly read page.
    fn page(&self, page_ref: BlockRef, expected_level: Option<u8>, remember: bool) -> Result<Arc<IndexPage>> {
        let cached = self.memo.lock().ok().and_then(|mut m| m.get(page_ref.offset));
        let page = match cached {
            Some(page) => page,
            None => {
                let page = Arc::new(read_page(&self.reader, &self.layout, page_ref, PageType::Descriptors, self.verify)?);
                if remember {
                    if let Ok(mut memo) = self.memo.lock() {
                        memo.insert(page_ref.offset, page.clone());
                    }
                }
                page
            }
        };
        if let Some(level) = expected_level {
            if page.level() != level {
                return Err(PffError::corrupt_table(
                    page_ref.offset,
                    format!("page level {}, parent expects {level}", page.level()),
                ));
            }
        }
        Ok(page)
    }

    /// Look up one descriptor.
    pub fn resolve(&self, id: u32) -> Result<DescriptorNode> {
        if let Some(table) = &self.eager {
            return table
                .by_id
                .get(&id)
                .map(|&i| table.nodes[i])
                .ok_or_else(|| PffError::unknown_descriptor(id));
        }

        let mut page = self.page(self.root, None, true)?;
        loop {
            match &page.entries {
                PageEntries::Branch(entries) => {
                    let Some(entry) = entries.iter().take_while(|e| e.key <= id as u64).last() else {
                        return Err(PffError::unknown_descriptor(id));
                    };
                    trace!(id, child = entry.child.offset, "descend");
                    let next = page.level() - 1;
                    page = self.page(entry.child, Some(next), true)?;
                }
                PageEntries::Descriptors(entries) => {
                    return entries
                        .binary_search_by_key(&id, |e| e.id)
                        .map(|i| DescriptorNode::from(entries[i]))
                        .map_err(|_| PffError::unknown_descriptor(id));
                }
                PageEntries::Offsets(_) => {
                    return Err(PffError::corrupt_table(page.offset, "offsets entries in descriptors table"));
                }
            }
        }
    }

    /// Lazy, restartable sequence of the descriptors whose parent is `id`,
    /// in on-disk order. A self-parented descriptor is not its own child.
    pub fn children_of(&self, id: u32) -> Children<'_> {
        match &self.eager {
            Some(table) => Children {
                inner: ChildrenInner::Eager {
                    table,
                    list: table.children.get(&id).map(Vec::as_slice).unwrap_or(&[]),
                    pos:  0,
                },
            },
            None => Children { inner: ChildrenInner::Paged(self.walk(Some(id))) },
        }
    }

    /// Every descriptor in on-disk order.
    pub fn iter(&self) -> Walk<'_> {
        self.walk(None)
    }

    fn walk(&self, parent: Option<u32>) -> Walk<'_> {
        Walk {
            index:   self,
            parent,
            stack:   vec![(self.root, None)],
            leaf:    Vec::new(),
            pos:     0,
            visited: HashSet::new(),
            done:    false,
        }
    }

    /// Ancestors of `id`, nearest first, ending at a self-parented root or
    /// at the first parent that is absent from the table.
    pub fn lineage(&self, id: u32) -> Result<Vec<u32>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut node = self.resolve(id)?;
        seen.insert(node.id);
        while node.parent != 0 && !node.is_self_parented() {
            if !seen.insert(node.parent) {
                return Err(PffError::corrupt_table(
                    self.root.offset,
                    format!("descriptor parent cycle through {:#x}", node.parent),
                ));
            }
            chain.push(node.parent);
            node = match self.resolve(node.parent) {
                Ok(parent) => parent,
                Err(e) if e.kind() == ErrorKind::UnknownDescriptor => break,
                Err(e) => return Err(e),
            };
        }
        Ok(chain)
    }

    /// Descriptors whose parent is not in the table.
    pub fn orphans(&self) -> Result<Vec<DescriptorNode>> {
        let mut out = Vec::new();
        for node in self.iter() {
            let node = node?;
            if node.parent == 0 || node.is_self_parented() {
                continue;
            }
            match self.resolve(node.parent) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnknownDescriptor => out.push(node),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn check_parent_cycles(table: &EagerTable, offset: u64) -> Result<()> {
    // 0 = unvisited, 1 = on current chain, 2 = known to reach a root.
    let mut state = vec![0u8; table.nodes.len()];
    for start in 0..table.nodes.len() {
        let mut chain = Vec::new();
        let mut cur = start;
        loop {
            match state[cur] {
                2 => break,
                1 => {
                    return Err(PffError::corrupt_table(
                        offset,
                        format!("descriptor parent cycle through {:#x}", table.nodes[cur].id),
                    ))
                }
                _ => {}
            }
            state[cur] = 1;
            chain.push(cur);
            let node = table.nodes[cur];
            if node.parent == 0 || node.is_self_parented() {
                break;
            }
            match table.by_id.get(&node.parent) {
                Some(&next) => cur = next,
                None => break,
            }
        }
        for i in chain {
            state[i] = 2;
        }
    }
    Ok(())
}

// ── Iterators ────────────────────────────────────────────────────────────────

/// In-order walk over the leaf entries of the descriptors table,
/// optionally filtered by parent.
pub struct Walk<'a> {
    index:   &'a DescriptorIndex,
    parent:  Option<u32>,
    stack:   Vec<(BlockRef, Option<u8>)>,
    leaf:    Vec<DescriptorNode>,
    pos:     usize,
    visited: HashSet<u64>,
    done:    bool,
}

impl Walk<'_> {
    fn fail(&mut self, err: PffError) -> Option<Result<DescriptorNode>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<DescriptorNode>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Some(node) = self.leaf.get(self.pos).copied() {
                self.pos += 1;
                match self.parent {
                    Some(p) if node.parent != p || node.is_self_parented() => continue,
                    _ => return Some(Ok(node)),
                }
            }

            let Some((page_ref, level)) = self.stack.pop() else {
                self.done = true;
                break;
            };
            if !self.visited.insert(page_ref.offset) {
                return self.fail(PffError::corrupt_table(page_ref.offset, "descriptors table page revisited (cycle)"));
            }
            if self.visited.len() > self.index.max_pages {
                return self.fail(PffError::corrupt_table(
                    page_ref.offset,
                    format!("descriptors table exceeds {} pages", self.index.max_pages),
                ));
            }
            let page = match self.index.page(page_ref, level, false) {
                Ok(page) => page,
                Err(e) => return self.fail(e),
            };
            match &page.entries {
                PageEntries::Branch(entries) => {
                    let child_level = page.level() - 1;
                    self.stack.extend(entries.iter().rev().map(|e| (e.child, Some(child_level))));
                }
                PageEntries::Descriptors(entries) => {
                    self.leaf = entries.iter().copied().map(DescriptorNode::from).collect();
                    self.pos = 0;
                }
                PageEntries::Offsets(_) => {
                    return self.fail(PffError::corrupt_table(page.offset, "offsets entries in descriptors table"));
                }
            }
        }
        None
    }
}

enum ChildrenInner<'a> {
    Eager { table: &'a EagerTable, list: &'a [usize], pos: usize },
    Paged(Walk<'a>),
}

/// Children of one descriptor; see [`DescriptorIndex::children_of`].
pub struct Children<'a> {
    inner: ChildrenInner<'a>,
}

impl Iterator for Children<'_> {
    type Item = Result<DescriptorNode>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            ChildrenInner::Eager { table, list, pos } => {
                let i = *list.get(*pos)?;
                *pos += 1;
                Some(Ok(table.nodes[i]))
            }
            ChildrenInner::Paged(walk) => walk.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{encode_page, BranchEntry, DescriptorEntry};
    use crate::header::{ContentType, EncryptionType, FormatVariant};

    fn node(id: u32, parent: u32) -> DescriptorEntry {
        DescriptorEntry { id, data_id: 0, subnodes_id: 0, parent }
    }

    /// Two leaf pages under one branch page, laid out after a 0x400 gap.
    fn two_level(variant: FormatVariant, left: Vec<DescriptorEntry>, right: Vec<DescriptorEntry>) -> (PffReader, Header) {
        let layout = PageLayout::new(variant);
        let ps = layout.page_size() as u64;
        let base = 0x1000u64;
        let l = BlockRef { id: 0x101, offset: base };
        let r = BlockRef { id: 0x105, offset: base + ps };
        let root = BlockRef { id: 0x109, offset: base + 2 * ps };
        let branch = PageEntries::Branch(vec![
            BranchEntry { key: left[0].id as u64, child: l },
            BranchEntry { key: right[0].id as u64, child: r },
        ]);
        let mut file = vec![0u8; base as usize];
        file.extend(encode_page(&layout, PageType::Descriptors, 0, &PageEntries::Descriptors(left), l));
        file.extend(encode_page(&layout, PageType::Descriptors, 0, &PageEntries::Descriptors(right), r));
        file.extend(encode_page(&layout, PageType::Descriptors, 1, &branch, root));

        let mut header = Header::new(ContentType::Pst, variant, EncryptionType::None);
        header.file_size = file.len() as u64;
        header.descriptors_root = root;
        (PffReader::from_bytes(file), header)
    }

    fn sample(variant: FormatVariant) -> (PffReader, Header) {
        two_level(
            variant,
            vec![node(0x21, 0), node(0x122, 0x122), node(0x8022, 0x122)],
            vec![node(0x8042, 0x122), node(0x200004, 0x8022), node(0x200024, 0x122)],
        )
    }

    #[test]
    fn resolve_in_both_modes() {
        for variant in [FormatVariant::Ansi, FormatVariant::Unicode, FormatVariant::Unicode4k] {
            for mode in [IndexMode::Paged, IndexMode::Eager] {
                let (reader, header) = sample(variant);
                let index = DescriptorIndex::open(reader, &header, mode, true).unwrap();
                assert_eq!(index.mode(), mode);
                assert_eq!(index.resolve(0x200004).unwrap().parent, 0x8022);
                assert_eq!(index.resolve(0x21).unwrap().id, 0x21);
                let err = index.resolve(0x8062).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::UnknownDescriptor);
                assert_eq!(index.resolve(0x1).unwrap_err().kind(), ErrorKind::UnknownDescriptor);
            }
        }
    }

    #[test]
    fn children_in_disk_order_and_restartable() {
        for mode in [IndexMode::Paged, IndexMode::Eager] {
            let (reader, header) = sample(FormatVariant::Unicode);
            let index = DescriptorIndex::open(reader, &header, mode, true).unwrap();
            let ids = |i: &DescriptorIndex| -> Vec<u32> {
                i.children_of(NID_ROOT_FOLDER).map(|n| n.unwrap().id).collect()
            };
            assert_eq!(ids(&index), vec![0x8022, 0x8042, 0x200024]);
            assert_eq!(ids(&index), vec![0x8022, 0x8042, 0x200024]);
            for id in ids(&index) {
                assert_eq!(index.resolve(id).unwrap().parent, NID_ROOT_FOLDER);
            }
            assert_eq!(index.children_of(0x200004).count(), 0);
        }
    }

    #[test]
    fn paged_mode_reads_only_touched_pages() {
        let (reader, header) = sample(FormatVariant::Ansi);
        let index = DescriptorIndex::open(reader, &header, IndexMode::Paged, true).unwrap();
        assert_eq!(index.cached_pages(), 1);
        index.resolve(0x21).unwrap();
        assert_eq!(index.cached_pages(), 2);
    }

    #[test]
    fn walks_stream_and_memo_stays_bounded() {
        use crate::config::OpenOptions;
        use crate::container::Container;
        use crate::record::{tags, PropertyRecord, PropertyValue};
        use crate::writer::{BuildOptions, ContainerBuilder};

        let mut builder = ContainerBuilder::new(BuildOptions::new(FormatVariant::Unicode).max_page_entries(4));
        for i in 0..200 {
            builder.add_folder(
                builder.root(),
                vec![PropertyRecord::new(tags::DISPLAY_NAME, PropertyValue::Unicode(format!("f{i}")))],
            );
        }
        let built = builder.build().unwrap();
        assert!(built.descriptor_depth >= 3);
        let pst = Container::open_bytes(built.bytes, OpenOptions::default()).unwrap();
        let index = pst.descriptors();
        assert_eq!(index.cached_pages(), 1);

        let ids: Vec<u32> = index.children_of(NID_ROOT_FOLDER).map(|n| n.unwrap().id).collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(index.cached_pages(), 1);

        for &id in &ids {
            assert_eq!(index.resolve(id).unwrap().parent, NID_ROOT_FOLDER);
        }
        assert!(index.cached_pages() > 1);
        assert!(index.cached_pages() <= PAGE_MEMO_CAPACITY);

        assert_eq!(pst.open_root().unwrap().children().filter(|c| c.is_ok()).count(), 200);
        assert!(index.cached_pages() <= PAGE_MEMO_CAPACITY);
    }

    #[test]
    fn page_budget_is_not_a_cycle() {
        let (reader, mut header) = sample(FormatVariant::Unicode);
        header.file_size = 2 * PageLayout::new(FormatVariant::Unicode).page_size() as u64;
        let index = DescriptorIndex::open(reader, &header, IndexMode::Paged, true).unwrap();
        let err = index.iter().find_map(|n| n.err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::CorruptAllocationTable);
        assert!(err.to_string().contains("exceeds 2 pages"), "{err}");
        assert!(!err.to_string().contains("cycle"));
    }

    #[test]
    fn lineage_and_orphans() {
        let (reader, header) = two_level(
            FormatVariant::Unicode,
            vec![node(0x122, 0x122), node(0x8022, 0x122)],
            vec![node(0x8042, 0x8022), node(0x8062, 0xDEAD2)],
        );
        let index = DescriptorIndex::open(reader, &header, IndexMode::Paged, true).unwrap();
        assert_eq!(index.lineage(0x8042).unwrap(), vec![0x8022, 0x122]);
        let orphans = index.orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, 0x8062);
    }

    #[test]
    fn parent_cycle_detected() {
        let make = || two_level(
            FormatVariant::Ansi,
            vec![node(0x122, 0x122), node(0x8022, 0x8042)],
            vec![node(0x8042, 0x8022)],
        );
        let (reader, header) = make();
        let err = DescriptorIndex::open(reader, &header, IndexMode::Eager, true).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CorruptAllocationTable);

        let (reader, header) = make();
        let index = DescriptorIndex::open(reader, &header, IndexMode::Paged, true).unwrap();
        assert_eq!(index.lineage(0x8022).unwrap_err().kind(), ErrorKind::CorruptAllocationTable);
    }

    #[test]
    fn node_types() {
        assert_eq!(NodeType::of(NID_ROOT_FOLDER), NodeType::Folder);
        assert_eq!(NodeType::of(0x200004), NodeType::Message);
        assert_eq!(NodeType::of(0x671), NodeType::AttachmentTable);
        assert_eq!(make_nid(0x400, NodeType::Message), 0x8004);
        assert_eq!(NodeType::of(0x09), NodeType::Other(0x09));
    }
}
