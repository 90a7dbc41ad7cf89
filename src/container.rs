//! High-level [`Container`] API, the main embedding surface.
//!
//! ```no_run
//! use pffkit::config::OpenOptions;
//! use pffkit::container::Container;
//!
//! let pst = Container::open("mailbox.pst", OpenOptions::default())?;
//! let root = pst.open_root()?;
//! for folder in root.sub_folders()? {
//!     println!("{}", folder.display_name()?.unwrap_or_default());
//! }
//! pst.close()?;
//! # Ok::<(), pffkit::error::PffError>(())
//! ```
//!
//! Opening decodes the header, the whole offsets table and the root page
//! of the descriptors table. Nothing navigable exists until all three
//! validate; any failure drops the source before returning.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::allocation::{decode_allocation_tables, AllocationIndex};
use crate::block::{BlockPipeline, BlockStore};
use crate::cache::{BlockCache, CacheStats};
use crate::config::OpenOptions;
use crate::error::{ErrorKind, Result};
use crate::header::{ContentType, EncryptionType, FormatVariant, Header};
use crate::index::{DescriptorIndex, NID_MESSAGE_STORE, NID_NAME_TO_ID_MAP, NID_ROOT_FOLDER};
use crate::io_stream::{PffReader, SourceProbe};
use crate::item::Item;
use crate::record::names::{NameToIdMap, NamedProperty};

pub struct Container {
    reader:      PffReader,
    header:      Header,
    store:       BlockStore,
    descriptors: DescriptorIndex,
    options:     OpenOptions,
    names:       OnceLock<NameToIdMap>,
}

impl Container {
    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        options.access.check_supported()?;
        let reader = PffReader::from_path(path.as_ref())?;
        debug!(path = %path.as_ref().display(), size = reader.size(), "opening container");
        Self::from_reader(reader, options)
    }

    /// Open an in-memory container.
    pub fn open_bytes(bytes: impl Into<Arc<[u8]>>, options: OpenOptions) -> Result<Self> {
        options.access.check_supported()?;
        Self::from_reader(PffReader::from_bytes(bytes), options)
    }

    pub fn from_reader(reader: PffReader, options: OpenOptions) -> Result<Self> {
        let verify = options.verify_checksums;
        let header = Header::decode_with(&reader, verify)?;
        debug!(
            content = ?header.content_type,
            variant = ?header.variant,
            encryption = ?header.encryption,
            file_size = header.file_size,
            "header"
        );
        let allocation = decode_allocation_tables(&reader, &header, verify)?;
        let descriptors = DescriptorIndex::open(reader.clone(), &header, options.index_mode, verify)?;
        let pipeline = BlockPipeline::new(header.variant, header.encryption, verify);
        let store = BlockStore::new(reader.clone(), allocation, pipeline, BlockCache::new(options.cache));
        debug!(blocks = store.allocation().len(), mode = ?descriptors.mode(), "container open");
        Ok(Self { reader, header, store, descriptors, options, names: OnceLock::new() })
    }

    /// Release the container. Consuming `self` guarantees no item borrowed
    /// from it is still alive.
    pub fn close(self) -> Result<()> {
        debug!(size = self.reader.size(), "closing container");
        drop(self);
        Ok(())
    }

    /// Open, run `f`, close. The container is released on every path.
    pub fn with_open<P, T, F>(path: P, options: OpenOptions, f: F) -> Result<T>
    where
        P: AsRef<Path>,
        F: FnOnce(&Container) -> Result<T>,
    {
        let container = Self::open(path, options)?;
        let out = f(&container);
        container.close()?;
        out
    }

    // ── Navigation ───────────────────────────────────────────────────────────

    /// The root folder (descriptor 0x122).
    pub fn open_root(&self) -> Result<Item<'_>> {
        self.item(NID_ROOT_FOLDER)
    }

    /// The message store (descriptor 0x21).
    pub fn message_store(&self) -> Result<Item<'_>> {
        self.item(NID_MESSAGE_STORE)
    }

    pub fn item(&self, id: u32) -> Result<Item<'_>> {
        let node = self.descriptors.resolve(id).map_err(|e| e.in_item(id))?;
        Ok(Item::from_descriptor(self, node))
    }

    /// Named-property map (descriptor 0x61), decoded on first use. A
    /// container without one has an empty map.
    pub fn name_to_id_map(&self) -> Result<&NameToIdMap> {
        if let Some(map) = self.names.get() {
            return Ok(map);
        }
        let map = match self.item(NID_NAME_TO_ID_MAP) {
            Ok(item) => {
                NameToIdMap::from_properties(item.properties()?).map_err(|e| e.in_item(NID_NAME_TO_ID_MAP))?
            }
            Err(e) if e.kind() == ErrorKind::UnknownDescriptor => NameToIdMap::default(),
            Err(e) => return Err(e),
        };
        Ok(self.names.get_or_init(|| map))
    }

    /// GUID and name behind a property id of 0x8000 or above.
    pub fn named_property(&self, id: u16) -> Result<Option<&NamedProperty>> {
        Ok(self.name_to_id_map()?.get(id))
    }

    /// Items whose parent descriptor does not exist.
    pub fn orphan_items(&self) -> Result<Vec<Item<'_>>> {
        Ok(self
            .descriptors
            .orphans()?
            .into_iter()
            .map(|node| Item::from_descriptor(self, node))
            .collect())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn allocation(&self) -> &AllocationIndex {
        self.store.allocation()
    }

    pub fn descriptors(&self) -> &DescriptorIndex {
        &self.descriptors
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    pub fn content_type(&self) -> ContentType {
        self.header.content_type
    }

    pub fn variant(&self) -> FormatVariant {
        self.header.variant
    }

    pub fn encryption(&self) -> EncryptionType {
        self.header.encryption
    }

    pub fn ascii_codepage(&self) -> u16 {
        self.options.ascii_codepage
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.store.cache().stats()
    }

    /// Observer that reports when the underlying source is released.
    pub fn probe(&self) -> SourceProbe {
        self.reader.probe()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("content_type", &self.header.content_type)
            .field("variant", &self.header.variant)
            .field("encryption", &self.header.encryption)
            .field("size", &self.reader.size())
            .finish()
    }
}
