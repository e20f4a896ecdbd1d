//! Streamer configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::pool::storage::FilterMode;
use crate::volume::dataset::VoxelFormat;

/// Full streamer configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// GPU brick pool parameters.
    pub pool: PoolConfig,
    /// Progressive refinement parameters.
    pub planner: PlannerConfig,
}

impl StreamerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save as pretty-printed JSON, creating parent directories.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// GPU brick pool parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of the 3D pool texture in voxels.
    pub pool_size: [u32; 3],
    /// Voxel format of the pool texture.
    pub voxel_format: VoxelFormat,
    /// Sampling filter for the pool texture.
    pub filter: FilterMode,
    /// Fraction of dirty metadata texels above which the whole
    /// metadata texture is uploaded instead of single texels.
    pub metadata_full_upload_ratio: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: [512, 512, 256],
            voxel_format: VoxelFormat::R8,
            filter: FilterMode::Linear,
            metadata_full_upload_ratio: 0.125,
        }
    }
}

/// Progressive refinement parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum bricks handed to the renderer per frame.
    pub bricks_per_frame: usize,
    /// Frames to wait after a scene change before redundant revalidation stops.
    pub start_delay_frames: u32,
    /// Projected voxel size (pixels) at which a level is fine enough.
    pub lod_pixel_threshold: f32,
    /// Largest projected voxel size (pixels) acceptable for the first coarse level.
    pub coarse_voxel_pixels: f32,
    /// Skip progressive refinement and start at the finest required level.
    pub lod_disabled: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            bricks_per_frame: 64,
            start_delay_frames: 60,
            lod_pixel_threshold: 1.0,
            coarse_voxel_pixels: 32.0,
            lod_disabled: false,
        }
    }
}
