//! Contract for the multi-resolution dataset the streamer reads from.
//!
//! The on-disk container and its parsing live outside this crate; the
//! streamer only needs brick geometry per level, per-brick value ranges,
//! and raw payload fetches.

use serde::{Deserialize, Serialize};

use crate::core::types::{Result, UVec3, Vec3};

/// Identity of a brick: resolution level plus grid coordinate.
///
/// Level 0 is the finest level; the last level is the coarsest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BrickKey {
    pub level: u32,
    pub coord: UVec3,
}

impl BrickKey {
    pub fn new(level: u32, x: u32, y: u32, z: u32) -> Self {
        Self { level, coord: UVec3::new(x, y, z) }
    }
}

/// Closed value interval.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    /// Interval that absorbs anything merged into it
    pub const EMPTY: MinMax = MinMax { min: f64::INFINITY, max: f64::NEG_INFINITY };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Grow to include a value
    pub fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Grow to include another interval
    pub fn merge(&mut self, other: MinMax) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Whether the two closed intervals share at least one value
    pub fn overlaps(&self, other: MinMax) -> bool {
        self.min <= other.max && self.max >= other.min
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl Default for MinMax {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Voxel storage format of brick payloads and the pool texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoxelFormat {
    #[default]
    R8,
    R16,
    R32F,
}

impl VoxelFormat {
    pub fn bytes_per_voxel(self) -> usize {
        match self {
            VoxelFormat::R8 => 1,
            VoxelFormat::R16 => 2,
            VoxelFormat::R32F => 4,
        }
    }

    /// Largest representable scalar value, used to scale normalized values.
    pub fn value_max(self) -> f64 {
        match self {
            VoxelFormat::R8 => u8::MAX as f64,
            VoxelFormat::R16 => u16::MAX as f64,
            VoxelFormat::R32F => 1.0,
        }
    }
}

/// Multi-resolution bricked volume provider.
///
/// Implementations must be shareable with the visibility worker thread.
pub trait VolumeDataset: Send + Sync {
    /// Number of resolution levels (level 0 finest).
    fn level_count(&self) -> u32;

    /// Bricks per axis at a level.
    fn brick_count(&self, level: u32) -> UVec3;

    /// Voxels per axis at a level.
    fn domain_size(&self, level: u32) -> UVec3;

    /// Voxels of one brick including overlap; smaller at volume boundaries.
    fn brick_size(&self, key: BrickKey) -> UVec3;

    /// Largest brick size including overlap (the pool slot size).
    fn max_brick_size(&self) -> UVec3;

    /// Total overlap voxels per axis shared between neighbouring bricks.
    fn brick_overlap(&self) -> UVec3;

    /// Physical voxel aspect of the domain.
    fn scale(&self) -> Vec3;

    fn voxel_format(&self) -> VoxelFormat;

    fn timestep_count(&self) -> u32 {
        1
    }

    /// Scalar value range of one brick.
    fn scalar_range(&self, key: BrickKey, timestep: u32) -> MinMax;

    /// Gradient magnitude range of one brick. May be expensive.
    fn gradient_range(&self, key: BrickKey, timestep: u32) -> MinMax;

    /// Read the raw voxels of one brick into `out`, replacing its contents.
    fn fetch_brick(&self, key: BrickKey, timestep: u32, out: &mut Vec<u8>) -> Result<()>;

    /// Voxels per axis excluding overlap for interior bricks.
    fn max_inner_brick_size(&self) -> UVec3 {
        self.max_brick_size() - self.brick_overlap()
    }
}
