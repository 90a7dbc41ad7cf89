//! Block and descriptor sweep behind [`scan`].

use tracing::{debug, warn};

use crate::allocation::AllocationEntry;
use crate::block::{BlockPipeline, BlockTrailer, RawBlock};
use crate::checksum::weak_crc32;
use crate::container::Container;
use crate::io_stream::PffReader;

use super::{
    BlockHealth, DescriptorIssue, DescriptorProblem, IntegrityQuality, IntegrityReport, ScannedBlock,
};

/// Progress callback: `(items checked, items total)`, called after every
/// block and once after the descriptor walk.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

/// Check every block and descriptor of an open container.
///
/// Checksums are verified here even when the container was opened with
/// verification relaxed.
pub fn scan<F>(container: &Container, mut progress: Option<&mut F>) -> IntegrityReport
where
    F: FnMut(u64, u64),
{
    let store = container.store();
    let pipeline = BlockPipeline::new(container.variant(), container.encryption(), true);
    let allocation = container.allocation();
    let total = allocation.len() as u64;

    let mut block_log = Vec::new();
    let mut healthy_blocks = 0usize;
    for (n, entry) in allocation.entries().enumerate() {
        let health = check_block(store.reader(), &pipeline, entry);
        if health.is_healthy() {
            healthy_blocks += 1;
        } else {
            warn!(id = entry.id, offset = entry.offset, ?health, "damaged block");
            block_log.push(ScannedBlock { id: entry.id, offset: entry.offset, health });
        }
        if let Some(cb) = progress.as_deref_mut() {
            cb(n as u64 + 1, total);
        }
    }

    let mut descriptor_issues = Vec::new();
    let mut descriptors = 0usize;
    let mut walk_error = None;
    let present = |id: u64| id == 0 || allocation.lookup(id).is_some();
    for node in container.descriptors().iter() {
        match node {
            Ok(node) => {
                descriptors += 1;
                if !present(node.data_id) {
                    descriptor_issues.push(DescriptorIssue { id: node.id, problem: DescriptorProblem::MissingData });
                }
                if !present(node.subnodes_id) {
                    descriptor_issues.push(DescriptorIssue { id: node.id, problem: DescriptorProblem::MissingSubnodes });
                }
            }
            Err(e) => {
                walk_error = Some(e.to_string());
                break;
            }
        }
    }
    if walk_error.is_none() {
        match container.descriptors().orphans() {
            Ok(orphans) => descriptor_issues.extend(
                orphans.into_iter().map(|n| DescriptorIssue { id: n.id, problem: DescriptorProblem::Orphan }),
            ),
            Err(e) => walk_error = Some(e.to_string()),
        }
    }
    if let Some(cb) = progress.as_deref_mut() {
        cb(total, total);
    }

    let total_blocks = allocation.len();
    let quality = if walk_error.is_some() || healthy_blocks * 2 < total_blocks {
        IntegrityQuality::Damaged
    } else if healthy_blocks < total_blocks || !descriptor_issues.is_empty() {
        IntegrityQuality::Degraded
    } else {
        IntegrityQuality::Intact
    };

    let report = IntegrityReport {
        total_blocks,
        healthy_blocks,
        block_log,
        descriptors,
        descriptor_issues,
        walk_error,
        quality,
    };
    debug!(summary = %report.summary(), "integrity scan");
    report
}

fn check_block(reader: &PffReader, pipeline: &BlockPipeline, entry: &AllocationEntry) -> BlockHealth {
    let variant = pipeline.variant;
    let trailer_size = variant.block_trailer_size();
    let trailer_at = entry.offset + entry.footprint(variant) - trailer_size as u64;

    let stored = match reader.read_at(entry.offset, entry.size as usize) {
        Ok(bytes) => bytes,
        Err(e) => return BlockHealth::Unreadable { reason: e.to_string() },
    };
    let trailer = match reader.read_at(trailer_at, trailer_size) {
        Ok(bytes) => BlockTrailer::parse(variant, &bytes),
        Err(e) => return BlockHealth::Unreadable { reason: e.to_string() },
    };

    if trailer.size != entry.size {
        return BlockHealth::SizeMismatch { trailer: trailer.size, table: entry.size };
    }
    if (trailer.id & !1) != (entry.id & !1) {
        return BlockHealth::IdentifierMismatch { found: trailer.id };
    }
    let computed = weak_crc32(&stored);
    if computed != trailer.crc {
        return BlockHealth::ChecksumMismatch { stored: trailer.crc, computed };
    }
    match pipeline.decode(RawBlock { entry: *entry, trailer, stored }) {
        Ok(_) => BlockHealth::Healthy,
        Err(e) => BlockHealth::Unreadable { reason: e.to_string() },
    }
}
