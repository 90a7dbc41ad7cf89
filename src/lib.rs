//! Read-only engine for the Personal Folder File format (PST, OST, PAB).
//!
//! Layers, bottom to top:
//!
//! | Module              | Concern                                          |
//! |---------------------|--------------------------------------------------|
//! | `io_stream`         | bounded random access over a file or buffer      |
//! | `header`            | container header, variant and encryption         |
//! | `btree`             | offsets/descriptors B-tree pages                 |
//! | `allocation`        | block id → file extent table                     |
//! | `block`, `codec`, `crypto` | trailer checks, decryption, decompression |
//! | `node_data`, `local_descriptors` | block arrays and sub-node trees     |
//! | `index`             | descriptor table and hierarchy                   |
//! | `record`            | heap, property/table contexts, name-to-id map    |
//! | `item`, `container` | navigable folder/message/attachment API          |
//!
//! `writer` builds containers from scratch and `integrity` sweeps an open
//! one for damage.

#![deny(unsafe_code)]

pub mod allocation;
pub mod block;
pub mod btree;
pub mod cache;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod handle;
pub mod header;
pub mod index;
pub mod integrity;
pub mod io_stream;
pub mod item;
pub mod local_descriptors;
pub mod node_data;
pub mod parallel;
pub mod record;
pub mod writer;

pub use config::{AccessFlags, CachePolicy, IndexMode, OpenOptions};
pub use container::Container;
pub use error::{ErrorKind, PffError, Result};
pub use handle::FileHandle;
pub use header::{ContentType, EncryptionType, FormatVariant, Header};
pub use index::NodeType;
pub use integrity::{scan, IntegrityQuality, IntegrityReport};
pub use item::{Item, ItemOrigin, ItemType};
pub use record::{Properties, PropertyRecord, PropertyTag, PropertyValue, RecordSet};
pub use writer::{AttachmentSpec, BuildOptions, BuiltContainer, ContainerBuilder, MessageSpec};
