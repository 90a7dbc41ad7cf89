//! Open-time configuration.
//!
//! ```
//! use pffkit::config::{CachePolicy, IndexMode, OpenOptions};
//!
//! let options = OpenOptions::default()
//!     .index_mode(IndexMode::Eager)
//!     .cache(CachePolicy::MaxEntries(256))
//!     .ascii_codepage(1251);
//! assert_eq!(options.ascii_codepage, 1251);
//! ```
//!
//! Options also load from JSON, which is how the `pffinfo` binary reads
//! `--config`.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PffError, Result};

// ── Access flags ─────────────────────────────────────────────────────────────

/// Requested access, as passed by a host binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessFlags(pub u8);

impl AccessFlags {
    pub const READ:  AccessFlags = AccessFlags(0x01);
    pub const WRITE: AccessFlags = AccessFlags(0x02);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Only read access is implemented.
    pub fn check_supported(self) -> Result<()> {
        if self.contains(Self::WRITE) {
            return Err(PffError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "write access is not supported",
            )));
        }
        if !self.contains(Self::READ) {
            return Err(PffError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "access flags must request read access",
            )));
        }
        Ok(())
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::READ
    }
}

impl fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { "r" } else { "-" };
        let w = if self.contains(Self::WRITE) { "w" } else { "-" };
        write!(f, "{r}{w}")
    }
}

// ── Index mode / cache ───────────────────────────────────────────────────────

/// How the descriptors table is materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Pages are read when a lookup first touches them.
    #[default]
    Paged,
    /// The whole table is read at open and parent links are checked.
    Eager,
}

/// Bound of the decoded block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    Disabled,
    MaxEntries(usize),
    MaxBytes(usize),
}

// ── OpenOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`Container::open`](crate::container::Container::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub access:           AccessFlags,
    pub index_mode:       IndexMode,
    pub cache:            CachePolicy,
    /// Windows codepage for 8-bit strings when the item does not name one.
    pub ascii_codepage:   u16,
    /// Reject header, page and block checksum mismatches instead of
    /// logging them.
    pub verify_checksums: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access:           AccessFlags::READ,
            index_mode:       IndexMode::Paged,
            cache:            CachePolicy::Disabled,
            ascii_codepage:   1252,
            verify_checksums: true,
        }
    }
}

impl OpenOptions {
    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn index_mode(mut self, mode: IndexMode) -> Self {
        self.index_mode = mode;
        self
    }

    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn ascii_codepage(mut self, codepage: u16) -> Self {
        self.ascii_codepage = codepage;
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PffError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
