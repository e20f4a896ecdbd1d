//! Immutable result of one visibility pass.

use crate::volume::BrickId;
use super::classify::{BrickFlags, Classification, ClassifyStats};

/// Per-brick visibility published by the updater.
///
/// Never mutated after publication; readers hold it through an `Arc`
/// and can keep using an older snapshot while a newer one is built.
#[derive(Clone, Debug)]
pub struct VisibilitySnapshot {
    /// Generation this snapshot was computed for
    pub generation: u64,
    /// Monotonic publication counter, distinguishes camera-only updates
    pub version: u64,
    pub timestep: u32,
    pub classification: Classification,
    pub stats: ClassifyStats,
    flags: Vec<BrickFlags>,
}

impl VisibilitySnapshot {
    pub fn new(
        generation: u64,
        version: u64,
        timestep: u32,
        classification: Classification,
        stats: ClassifyStats,
        flags: Vec<BrickFlags>,
    ) -> Self {
        Self { generation, version, timestep, classification, stats, flags }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Flags of a brick; unknown IDs read as default (nothing set).
    pub fn flags(&self, id: BrickId) -> BrickFlags {
        self.flags.get(id.index()).copied().unwrap_or_default()
    }

    pub fn all_flags(&self) -> &[BrickFlags] {
        &self.flags
    }

    pub fn is_needed(&self, id: BrickId) -> bool {
        self.flags(id).is_needed()
    }

    pub fn is_empty_brick(&self, id: BrickId) -> bool {
        !self.flags(id).contains_data()
    }

    pub fn all_descendants_empty(&self, id: BrickId) -> bool {
        self.flags(id).all_descendants_empty()
    }
}
