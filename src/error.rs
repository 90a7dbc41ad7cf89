//! Error type shared by every layer of the engine.
//!
//! One enum covers the whole taxonomy. Lower layers construct variants
//! directly; the item navigator only ever wraps an existing error with the
//! descriptor it was resolving (`PffError::Item`), which leaves
//! [`PffError::kind`] unchanged.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PffError>;

/// Discriminant of a [`PffError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    InvalidSignature,
    UnsupportedVersion,
    CorruptHeader,
    CorruptAllocationTable,
    UnknownDescriptor,
    DecompressionError,
    DecryptionError,
    MalformedRecord,
    UnknownPropertyType,
    OutOfBounds,
    Io,
    InvalidHandleState,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PffError {
    /// The file magic or client magic is not a PFF signature.
    #[error("invalid signature: {details}")]
    InvalidSignature { details: String },

    /// The header data version is outside the supported set.
    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: u16 },

    /// Header checksums, sentinel or size fields disagree.
    #[error("corrupt header: {details}")]
    CorruptHeader { details: String },

    /// A B-tree page or entry of the offsets/descriptors tables is inconsistent.
    #[error("corrupt allocation table at offset {offset:#x}: {details}")]
    CorruptAllocationTable { offset: u64, details: String },

    #[error("unknown descriptor {id:#x}")]
    UnknownDescriptor { id: u64 },

    #[error("decompression failed for block {block:#x}: {details}")]
    Decompression { block: u64, details: String },

    #[error("decryption failed for block {block:#x}: {details}")]
    Decryption { block: u64, details: String },

    #[error("malformed record: {details}")]
    MalformedRecord { details: String },

    #[error("unknown property type {property_type:#06x} for property {property_id:#06x}")]
    UnknownPropertyType { property_id: u16, property_type: u16 },

    #[error("read of {length} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A lifecycle call arrived in the wrong handle state.
    #[error("cannot {operation} a handle that is {state}")]
    InvalidHandleState { operation: &'static str, state: &'static str },

    /// Error raised while resolving a specific item.
    #[error("item {descriptor:#x}: {source}")]
    Item {
        descriptor: u32,
        #[source]
        source: Box<PffError>,
    },
}

impl PffError {
    pub fn invalid_signature(details: impl Into<String>) -> Self {
        Self::InvalidSignature { details: details.into() }
    }

    pub fn corrupt_header(details: impl Into<String>) -> Self {
        Self::CorruptHeader { details: details.into() }
    }

    pub fn corrupt_table(offset: u64, details: impl Into<String>) -> Self {
        Self::CorruptAllocationTable { offset, details: details.into() }
    }

    pub fn unknown_descriptor(id: impl Into<u64>) -> Self {
        Self::UnknownDescriptor { id: id.into() }
    }

    pub fn decompression(block: u64, details: impl Into<String>) -> Self {
        Self::Decompression { block, details: details.into() }
    }

    pub fn decryption(block: u64, details: impl Into<String>) -> Self {
        Self::Decryption { block, details: details.into() }
    }

    pub fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedRecord { details: details.into() }
    }

    /// Attach the descriptor being resolved. An error that already carries
    /// item context keeps its innermost descriptor.
    pub fn in_item(self, descriptor: u32) -> Self {
        match self {
            Self::Item { .. } => self,
            other => Self::Item { descriptor, source: Box::new(other) },
        }
    }

    /// Descriptor attached by [`in_item`](Self::in_item), if any.
    pub fn descriptor(&self) -> Option<u32> {
        match self {
            Self::Item { descriptor, .. } => Some(*descriptor),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSignature { .. }       => ErrorKind::InvalidSignature,
            Self::UnsupportedVersion { .. }     => ErrorKind::UnsupportedVersion,
            Self::CorruptHeader { .. }          => ErrorKind::CorruptHeader,
            Self::CorruptAllocationTable { .. } => ErrorKind::CorruptAllocationTable,
            Self::UnknownDescriptor { .. }      => ErrorKind::UnknownDescriptor,
            Self::Decompression { .. }          => ErrorKind::DecompressionError,
            Self::Decryption { .. }             => ErrorKind::DecryptionError,
            Self::MalformedRecord { .. }        => ErrorKind::MalformedRecord,
            Self::UnknownPropertyType { .. }    => ErrorKind::UnknownPropertyType,
            Self::OutOfBounds { .. }            => ErrorKind::OutOfBounds,
            Self::Io(_)                         => ErrorKind::Io,
            Self::InvalidHandleState { .. }     => ErrorKind::InvalidHandleState,
            Self::Item { source, .. }           => source.kind(),
        }
    }

    /// Item-scoped errors: the caller may skip the item or property and
    /// keep traversing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedRecord
                | ErrorKind::UnknownPropertyType
                | ErrorKind::DecompressionError
                | ErrorKind::DecryptionError
                | ErrorKind::UnknownDescriptor
        )
    }
}
