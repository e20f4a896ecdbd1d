//! Backing storage for the brick pool.
//!
//! `BrickPool` owns all slot bookkeeping and talks to the device only
//! through `BrickStorage`. `GpuBrickStorage` implements it over wgpu;
//! `HostBrickStorage` keeps everything in host memory for tests and
//! headless runs.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::core::types::{Result, UVec2, UVec3};
use crate::volume::VoxelFormat;

/// Highest number of resolution levels the pool uniforms can describe.
pub const MAX_LEVELS: usize = 32;

/// Sampling filter for the pool texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Texture size limits reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLimits {
    pub max_texture_dimension_3d: u32,
    pub max_texture_dimension_2d: u32,
}

impl Default for StorageLimits {
    /// wgpu's downlevel defaults
    fn default() -> Self {
        Self {
            max_texture_dimension_3d: 2048,
            max_texture_dimension_2d: 8192,
        }
    }
}

/// Everything needed to allocate the pool's device resources.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolDescriptor {
    /// Pool texture size in voxels
    pub pool_size: UVec3,
    pub format: VoxelFormat,
    /// Metadata texture size in texels
    pub metadata_size: UVec2,
    pub filter: FilterMode,
}

/// Uniform block the shading stage reads next to the pool textures.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PoolUniforms {
    /// Slots per axis, w = total slots
    pub pool_capacity: [u32; 4],
    /// Slot size in normalized pool coordinates
    pub slot_size: [f32; 4],
    /// Finest level domain size in voxels, w = level count
    pub volume_size: [u32; 4],
    /// Metadata texture width, filter mode, padding
    pub metadata: [u32; 4],
    /// Per level: brick counts xyz, w = first brick ID
    pub levels: [[u32; 4]; MAX_LEVELS],
    /// Per level: voxel size relative to the finest level xyz, w unused
    pub lod_factors: [[f32; 4]; MAX_LEVELS],
}

impl Default for PoolUniforms {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Device-side resources of a brick pool.
pub trait BrickStorage {
    fn limits(&self) -> StorageLimits;

    /// Create the pool and metadata textures. Called once, after validation.
    fn allocate(&mut self, desc: &PoolDescriptor) -> Result<()>;

    /// Write a brick's voxels at `origin` (voxels) in the pool texture.
    ///
    /// `data` is tightly packed, x fastest.
    fn write_brick(&mut self, origin: UVec3, size: UVec3, data: &[u8]) -> Result<()>;

    /// Write a rectangle of metadata texels.
    fn write_metadata(&mut self, origin: UVec2, extent: UVec2, texels: &[u32]) -> Result<()>;

    fn set_filter_mode(&mut self, filter: FilterMode);

    /// Make the textures available to the shading stage.
    fn bind(&mut self, uniforms: &PoolUniforms) -> Result<()>;

    fn unbind(&mut self);
}

/// Host-memory pool storage.
#[derive(Debug, Default)]
pub struct HostBrickStorage {
    limits: StorageLimits,
    desc: Option<PoolDescriptor>,
    voxels: Vec<u8>,
    metadata: Vec<u32>,
    uniforms: Option<PoolUniforms>,
    bound: bool,
    filter: FilterMode,
    brick_writes: u32,
    metadata_writes: u32,
    metadata_texels_written: u64,
}

impl HostBrickStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: StorageLimits) -> Self {
        Self { limits, ..Self::default() }
    }

    pub fn is_allocated(&self) -> bool {
        self.desc.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.filter
    }

    pub fn uniforms(&self) -> Option<&PoolUniforms> {
        self.uniforms.as_ref()
    }

    /// Number of `write_brick` calls
    pub fn brick_writes(&self) -> u32 {
        self.brick_writes
    }

    /// Number of `write_metadata` calls
    pub fn metadata_writes(&self) -> u32 {
        self.metadata_writes
    }

    pub fn metadata_texels_written(&self) -> u64 {
        self.metadata_texels_written
    }

    /// Raw bytes of one voxel in the pool texture.
    pub fn voxel(&self, pos: UVec3) -> Option<&[u8]> {
        let desc = self.desc.as_ref()?;
        if pos.cmpge(desc.pool_size).any() {
            return None;
        }
        let bpp = desc.format.bytes_per_voxel();
        let index = (pos.x + pos.y * desc.pool_size.x + pos.z * desc.pool_size.x * desc.pool_size.y) as usize;
        self.voxels.get(index * bpp..(index + 1) * bpp)
    }

    pub fn metadata_texel(&self, pos: UVec2) -> Option<u32> {
        let desc = self.desc.as_ref()?;
        if pos.cmpge(desc.metadata_size).any() {
            return None;
        }
        self.metadata.get((pos.x + pos.y * desc.metadata_size.x) as usize).copied()
    }

    fn descriptor(&self) -> Result<&PoolDescriptor> {
        self.desc
            .as_ref()
            .ok_or_else(|| crate::core::Error::Gpu("pool storage not allocated".into()))
    }
}

impl BrickStorage for HostBrickStorage {
    fn limits(&self) -> StorageLimits {
        self.limits
    }

    fn allocate(&mut self, desc: &PoolDescriptor) -> Result<()> {
        let voxel_count = desc.pool_size.x as usize * desc.pool_size.y as usize * desc.pool_size.z as usize;
        self.voxels = vec![0; voxel_count * desc.format.bytes_per_voxel()];
        self.metadata = vec![0; (desc.metadata_size.x * desc.metadata_size.y) as usize];
        self.filter = desc.filter;
        self.desc = Some(*desc);
        Ok(())
    }

    fn write_brick(&mut self, origin: UVec3, size: UVec3, data: &[u8]) -> Result<()> {
        let desc = *self.descriptor()?;
        if (origin + size).cmpgt(desc.pool_size).any() {
            return Err(crate::core::Error::Gpu(format!(
                "brick write {}+{} outside pool {}", origin, size, desc.pool_size
            )));
        }
        let bpp = desc.format.bytes_per_voxel();
        let row = size.x as usize * bpp;
        for z in 0..size.z {
            for y in 0..size.y {
                let src = (y + z * size.y) as usize * row;
                let dst_voxel = origin.x
                    + (origin.y + y) * desc.pool_size.x
                    + (origin.z + z) * desc.pool_size.x * desc.pool_size.y;
                let dst = dst_voxel as usize * bpp;
                self.voxels[dst..dst + row].copy_from_slice(&data[src..src + row]);
            }
        }
        self.brick_writes += 1;
        Ok(())
    }

    fn write_metadata(&mut self, origin: UVec2, extent: UVec2, texels: &[u32]) -> Result<()> {
        let desc = *self.descriptor()?;
        if (origin + extent).cmpgt(desc.metadata_size).any() {
            return Err(crate::core::Error::Gpu(format!(
                "metadata write {}+{} outside texture {}", origin, extent, desc.metadata_size
            )));
        }
        for y in 0..extent.y {
            let src = (y * extent.x) as usize;
            let dst = (origin.x + (origin.y + y) * desc.metadata_size.x) as usize;
            self.metadata[dst..dst + extent.x as usize]
                .copy_from_slice(&texels[src..src + extent.x as usize]);
        }
        self.metadata_writes += 1;
        self.metadata_texels_written += (extent.x * extent.y) as u64;
        Ok(())
    }

    fn set_filter_mode(&mut self, filter: FilterMode) {
        self.filter = filter;
    }

    fn bind(&mut self, uniforms: &PoolUniforms) -> Result<()> {
        self.descriptor()?;
        self.uniforms = Some(*uniforms);
        self.bound = true;
        Ok(())
    }

    fn unbind(&mut self) {
        self.bound = false;
    }
}
