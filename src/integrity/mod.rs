//! Whole-container integrity checks.
//!
//! [`scan`] reads every block listed in the offsets table and walks every
//! descriptor. Nothing found here aborts the scan: damage is recorded in
//! the [`IntegrityReport`]. Only the initial open can fail.

mod scanner;

use serde::Serialize;

pub use scanner::{scan, ProgressFn};

/// Verdict for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockHealth {
    Healthy,
    /// Stored bytes disagree with the trailer CRC.
    ChecksumMismatch { stored: u32, computed: u32 },
    /// Trailer names a different block.
    IdentifierMismatch { found: u64 },
    /// Trailer size disagrees with the offsets table.
    SizeMismatch { trailer: u16, table: u16 },
    /// Bytes could not be read or decoded.
    Unreadable { reason: String },
}

impl BlockHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, BlockHealth::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannedBlock {
    pub id:     u64,
    pub offset: u64,
    pub health: BlockHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorProblem {
    /// Data block id is not in the offsets table.
    MissingData,
    /// Local-descriptors block id is not in the offsets table.
    MissingSubnodes,
    /// Parent descriptor does not exist.
    Orphan,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptorIssue {
    pub id:      u32,
    pub problem: DescriptorProblem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityQuality {
    /// Every block and descriptor checks out.
    Intact,
    /// Some blocks or descriptors are damaged.
    Degraded,
    /// Fewer than half the blocks are healthy, or the descriptors table
    /// could not be walked.
    Damaged,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub total_blocks:      usize,
    pub healthy_blocks:    usize,
    /// Unhealthy blocks only.
    pub block_log:         Vec<ScannedBlock>,
    pub descriptors:       usize,
    pub descriptor_issues: Vec<DescriptorIssue>,
    /// Error that stopped the descriptor walk, if any.
    pub walk_error:        Option<String>,
    pub quality:           IntegrityQuality,
}

impl IntegrityReport {
    /// Percentage of healthy blocks (0.0–100.0).
    pub fn health_pct(&self) -> f64 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        self.healthy_blocks as f64 / self.total_blocks as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?}: {}/{} blocks healthy ({:.1}%), {} descriptor(s), {} descriptor issue(s)",
            self.quality,
            self.healthy_blocks,
            self.total_blocks,
            self.health_pct(),
            self.descriptors,
            self.descriptor_issues.len(),
        )
    }
}
