//! Items: folders, messages, attachments and the other navigable nodes.
//!
//! An item is a node plus where it came from. Index-backed items carry a
//! descriptor; attachments and embedded messages are sub-nodes of their
//! owner and exist only through it.
//!
//! ```text
//! folder ──children──▶ descriptor children (sub-folders, messages)
//! message ─children──▶ descriptor children, then attachments (sub-node 0x671)
//! attachment ────────▶ embedded message, when attached by value as a message
//! ```
//!
//! Properties and the sub-node tree are decoded on first use and kept for
//! the lifetime of the item value.

mod kind;
mod message;

use std::sync::OnceLock;

use serde::Serialize;

use crate::config::IndexMode;
use crate::container::Container;
use crate::error::{PffError, Result};
use crate::header::EncryptionType;
use crate::index::{Children, DescriptorNode, NodeType};
use crate::local_descriptors::SubnodeTree;
use crate::node_data::NodeData;
use crate::record::heap::{HeapClient, HEAP_SIGNATURE};
use crate::record::table::decode_table;
use crate::record::{
    decode_property_context, tags, LocalSubnodes, Properties, PropertyValue, RecordContext, RecordSet, Table,
};

pub use kind::ItemType;

/// Sub-node holding a message's attachment table.
pub const ATTACHMENT_TABLE_ID: u32 = 0x671;
/// Sub-node holding a message's recipient table.
pub const RECIPIENT_TABLE_ID: u32 = 0x692;

// ── Node reference ───────────────────────────────────────────────────────────

/// The storage of one item, whether indexed or a sub-node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeRef {
    pub id:          u32,
    pub data_id:     u64,
    pub subnodes_id: u64,
    /// Owning item: parent descriptor, owning message or attachment.
    pub parent:      u32,
}

impl From<DescriptorNode> for NodeRef {
    fn from(n: DescriptorNode) -> Self {
        Self { id: n.id, data_id: n.data_id, subnodes_id: n.subnodes_id, parent: n.parent }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrigin {
    Descriptor,
    Attachment,
    EmbeddedMessage,
}

// ── Item ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Item<'c> {
    container: &'c Container,
    node:      NodeRef,
    origin:    ItemOrigin,
    subnodes:  OnceLock<SubnodeTree>,
    props:     OnceLock<Properties>,
}

impl std::fmt::Debug for Item<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item").field("node", &self.node).field("origin", &self.origin).finish()
    }
}

impl<'c> Item<'c> {
    pub(crate) fn from_descriptor(container: &'c Container, node: DescriptorNode) -> Self {
        Self::new(container, node.into(), ItemOrigin::Descriptor)
    }

    fn new(container: &'c Container, node: NodeRef, origin: ItemOrigin) -> Self {
        Self { container, node, origin, subnodes: OnceLock::new(), props: OnceLock::new() }
    }

    pub fn id(&self) -> u32 {
        self.node.id
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn origin(&self) -> ItemOrigin {
        self.origin
    }

    pub fn container(&self) -> &'c Container {
        self.container
    }

    /// Descriptor of an index-backed item.
    pub fn descriptor(&self) -> Option<DescriptorNode> {
        (self.origin == ItemOrigin::Descriptor).then_some(DescriptorNode {
            id:          self.node.id,
            data_id:     self.node.data_id,
            subnodes_id: self.node.subnodes_id,
            parent:      self.node.parent,
        })
    }

    fn wrap<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| e.in_item(self.node.id))
    }

    // ── Decoding ─────────────────────────────────────────────────────────────

    fn subnode_tree(&self) -> Result<&SubnodeTree> {
        if let Some(tree) = self.subnodes.get() {
            return Ok(tree);
        }
        let tree = SubnodeTree::load(self.container.store(), self.node.subnodes_id)?;
        Ok(self.subnodes.get_or_init(|| tree))
    }

    fn context<'a>(&self, subnodes: &'a LocalSubnodes<'a>) -> RecordContext<'a> {
        RecordContext::new(
            self.container.variant(),
            self.container.encryption() != EncryptionType::None,
            self.container.ascii_codepage(),
            subnodes,
        )
    }

    fn node_data(&self) -> Result<NodeData<'c>> {
        NodeData::load(self.container.store(), self.node.data_id)
    }

    /// All property records of the item. Decoding happens once; later
    /// calls return the same value.
    pub fn properties(&self) -> Result<&Properties> {
        if let Some(props) = self.props.get() {
            return Ok(props);
        }
        let decoded = self.wrap((|| {
            let tree = self.subnode_tree()?;
            let local = LocalSubnodes { store: self.container.store(), tree };
            let data = self.node_data()?;
            if is_table(&data)? {
                return Ok(Properties::default());
            }
            decode_property_context(&data, &self.context(&local))
        })())?;
        Ok(self.props.get_or_init(|| decoded))
    }

    pub fn property(&self, id: u16) -> Result<Option<&PropertyValue>> {
        Ok(self.properties()?.get(id))
    }

    /// Table stored in sub-node `id`, if the item has one. Cells that spill
    /// into sub-nodes are looked up in the table's own sub-node tree when it
    /// has one, otherwise in the item's.
    fn subnode_table(&self, id: u32) -> Result<Option<Table>> {
        let tree = self.subnode_tree()?;
        let Some(entry) = tree.get(id).copied() else {
            return Ok(None);
        };
        let store = self.container.store();
        let data = NodeData::load(store, entry.data_id)?;
        let own;
        let cells_tree = if entry.subnodes_id != 0 {
            own = SubnodeTree::load(store, entry.subnodes_id)?;
            &own
        } else {
            tree
        };
        let local = LocalSubnodes { store, tree: cells_tree };
        decode_table(&data, &self.context(&local)).map(Some)
    }

    /// Rows of a table item, or the item's own properties as a single set.
    pub fn record_sets(&self) -> Result<Vec<RecordSet>> {
        self.wrap((|| {
            let data = self.node_data()?;
            if is_table(&data)? {
                let tree = self.subnode_tree()?;
                let local = LocalSubnodes { store: self.container.store(), tree };
                return Ok(decode_table(&data, &self.context(&local))?.rows);
            }
            Ok(vec![RecordSet { row_id: self.node.id, properties: self.properties()?.clone() }])
        })())
    }

    /// Recipient rows of a message.
    pub fn recipients(&self) -> Result<Vec<RecordSet>> {
        self.wrap(self.subnode_table(RECIPIENT_TABLE_ID).map(|t| t.map(|t| t.rows).unwrap_or_default()))
    }

    // ── Classification ───────────────────────────────────────────────────────

    pub fn message_class(&self) -> Result<Option<&str>> {
        Ok(self.properties()?.string(tags::MESSAGE_CLASS))
    }

    pub fn display_name(&self) -> Result<Option<String>> {
        Ok(self.properties()?.string(tags::DISPLAY_NAME).map(str::to_owned))
    }

    pub fn item_type(&self) -> Result<ItemType> {
        match self.origin {
            ItemOrigin::Attachment => Ok(ItemType::Attachment),
            ItemOrigin::EmbeddedMessage => {
                Ok(self.message_class()?.map_or(ItemType::Undefined, ItemType::from_message_class))
            }
            ItemOrigin::Descriptor => {
                let class = match NodeType::of(self.node.id) {
                    NodeType::Message | NodeType::AssociatedMessage => self.message_class()?,
                    _ => None,
                };
                Ok(ItemType::for_descriptor(self.node.id, class))
            }
        }
    }

    // ── Children ─────────────────────────────────────────────────────────────

    /// Lazy children: descriptor children first, then attachments, or the
    /// embedded message of an attachment. Dropping the iterator stops the
    /// traversal; calling again restarts it.
    pub fn children(&self) -> ItemChildren<'c> {
        let stage = match self.origin {
            ItemOrigin::Descriptor => Stage::Descriptors(self.container.descriptors().children_of(self.node.id)),
            ItemOrigin::Attachment => Stage::Embedded,
            ItemOrigin::EmbeddedMessage => Stage::Attachments,
        };
        ItemChildren { owner: self.clone(), stage }
    }

    pub fn sub_folders(&self) -> Result<Vec<Item<'c>>> {
        self.children_where(|node| matches!(NodeType::of(node.id), NodeType::Folder | NodeType::SearchFolder))
    }

    pub fn sub_messages(&self) -> Result<Vec<Item<'c>>> {
        self.children_where(|node| matches!(NodeType::of(node.id), NodeType::Message | NodeType::AssociatedMessage))
    }

    fn children_where(&self, keep: impl Fn(&NodeRef) -> bool) -> Result<Vec<Item<'c>>> {
        if self.origin != ItemOrigin::Descriptor {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for node in self.container.descriptors().children_of(self.node.id) {
            let node = NodeRef::from(self.wrap(node)?);
            if keep(&node) {
                out.push(Item::new(self.container, node, ItemOrigin::Descriptor));
            }
        }
        Ok(out)
    }

    /// Attachments listed in the attachment table.
    pub fn attachments(&self) -> Result<Vec<Item<'c>>> {
        self.wrap(self.load_attachments())?.into_iter().collect()
    }

    fn load_attachments(&self) -> Result<Vec<Result<Item<'c>>>> {
        let Some(table) = self.subnode_table(ATTACHMENT_TABLE_ID)? else {
            return Ok(Vec::new());
        };
        let tree = self.subnode_tree()?;
        Ok(table
            .rows
            .iter()
            .map(|row| {
                let entry = tree.get(row.row_id).copied().ok_or_else(|| {
                    PffError::malformed(format!("attachment {:#x} has no sub-node", row.row_id)).in_item(self.node.id)
                })?;
                let node = NodeRef {
                    id:          entry.id,
                    data_id:     entry.data_id,
                    subnodes_id: entry.subnodes_id,
                    parent:      self.node.id,
                };
                Ok(Item::new(self.container, node, ItemOrigin::Attachment))
            })
            .collect())
    }

    /// Message carried by an attachment of method "embedded message".
    pub fn embedded_message(&self) -> Result<Option<Item<'c>>> {
        if self.origin != ItemOrigin::Attachment {
            return Ok(None);
        }
        self.wrap((|| {
            let props = self.properties()?;
            if props.integer(tags::ATTACH_METHOD) != Some(tags::ATTACH_EMBEDDED_MESSAGE as i64) {
                return Ok(None);
            }
            let Some(PropertyValue::Object { id, .. }) = props.get(tags::ATTACH_DATA) else {
                return Ok(None);
            };
            let entry = self
                .subnode_tree()?
                .get(*id)
                .copied()
                .ok_or_else(|| PffError::malformed(format!("embedded message {id:#x} has no sub-node")))?;
            let node = NodeRef {
                id:          entry.id,
                data_id:     entry.data_id,
                subnodes_id: entry.subnodes_id,
                parent:      self.node.id,
            };
            Ok(Some(Item::new(self.container, node, ItemOrigin::EmbeddedMessage)))
        })())
    }
}

fn is_table(data: &NodeData<'_>) -> Result<bool> {
    Ok(data.block(0)?.is_some_and(|b| {
        b.len() > 3 && b[2] == HEAP_SIGNATURE && HeapClient::from_byte(b[3]) == HeapClient::TableContext
    }))
}

// ── Children iterator ────────────────────────────────────────────────────────

enum Stage<'c> {
    Descriptors(Children<'c>),
    Attachments,
    Embedded,
    Pending(std::vec::IntoIter<Result<Item<'c>>>),
    Done,
}

/// See [`Item::children`].
pub struct ItemChildren<'c> {
    owner: Item<'c>,
    stage: Stage<'c>,
}

impl<'c> Iterator for ItemChildren<'c> {
    type Item = Result<Item<'c>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.stage {
                Stage::Descriptors(children) => match children.next() {
                    Some(Ok(node)) => {
                        let container = self.owner.container;
                        if container.descriptors().mode() == IndexMode::Paged {
                            if let Err(e) = container.descriptors().lineage(node.id) {
                                self.stage = Stage::Done;
                                return Some(Err(e.in_item(node.id)));
                            }
                        }
                        return Some(Ok(Item::from_descriptor(container, node)));
                    }
                    Some(Err(e)) => {
                        self.stage = Stage::Done;
                        return Some(Err(e.in_item(self.owner.node.id)));
                    }
                    None => self.stage = Stage::Attachments,
                },
                Stage::Attachments => match self.owner.wrap(self.owner.load_attachments()) {
                    Ok(list) => self.stage = Stage::Pending(list.into_iter()),
                    Err(e) => {
                        self.stage = Stage::Done;
                        return Some(Err(e));
                    }
                },
                Stage::Embedded => {
                    let found = self.owner.embedded_message();
                    self.stage = Stage::Done;
                    return found.transpose();
                }
                Stage::Pending(list) => match list.next() {
                    Some(item) => return Some(item),
                    None => self.stage = Stage::Done,
                },
                Stage::Done => return None,
            }
        }
    }
}
