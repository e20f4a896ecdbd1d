//! Brick identity and geometry.
//!
//! Maps (level, grid coordinate) to a dense integer ID through a per-level
//! offset table, and grid coordinates to normalized world-space extents.
//! The whole volume is centered at the origin and its longest axis spans
//! one unit, scaled by the dataset's voxel aspect.
//!
//! Bricking is regular: every interior brick holds `inner_brick_size`
//! voxels plus overlap, and each coarser level halves the domain, so a
//! brick at level L spatially covers the 2x2x2 bricks below it at L-1.

use crate::core::error::Error;
use crate::core::types::{Result, UVec3, Vec3};
use crate::math::Aabb;
use super::dataset::{BrickKey, VolumeDataset};

/// Dense brick identifier, stable for the lifetime of a loaded dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrickId(pub u32);

impl BrickId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Size and placement of one brick in normalized world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrickExtent {
    /// Voxels including overlap
    pub voxel_size: UVec3,
    pub center: Vec3,
    pub half_extent: Vec3,
}

impl BrickExtent {
    pub fn aabb(&self) -> Aabb {
        Aabb::from_center_half_extent(self.center, self.half_extent)
    }
}

/// Geometry of one resolution level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelLayout {
    pub domain_size: UVec3,
    pub brick_count: UVec3,
}

impl LevelLayout {
    pub fn bricks(&self) -> u32 {
        self.brick_count.x * self.brick_count.y * self.brick_count.z
    }
}

/// Bijection between brick keys and dense IDs, plus brick geometry.
#[derive(Clone, Debug)]
pub struct BrickIndex {
    levels: Vec<LevelLayout>,
    /// Sum of brick counts of all finer levels, indexed by level
    level_offsets: Vec<u32>,
    total_bricks: u32,
    inner_brick_size: UVec3,
    overlap: UVec3,
    scale: Vec3,
}

impl BrickIndex {
    pub fn new(levels: Vec<LevelLayout>, inner_brick_size: UVec3, overlap: UVec3, scale: Vec3) -> Self {
        let mut level_offsets = Vec::with_capacity(levels.len());
        let mut total_bricks = 0u32;
        for level in &levels {
            level_offsets.push(total_bricks);
            total_bricks += level.bricks();
        }

        Self {
            levels,
            level_offsets,
            total_bricks,
            inner_brick_size,
            overlap,
            scale,
        }
    }

    /// Index of a provider's bricking, rejected unless every level halves
    /// the one below and the provider's brick sizes agree with the index.
    pub fn from_dataset(dataset: &dyn VolumeDataset) -> Result<Self> {
        let levels = (0..dataset.level_count())
            .map(|level| LevelLayout {
                domain_size: dataset.domain_size(level),
                brick_count: dataset.brick_count(level),
            })
            .collect();
        let index = Self::new(
            levels,
            dataset.max_inner_brick_size(),
            dataset.brick_overlap(),
            dataset.scale(),
        );
        index.validate()?;

        for level in 0..index.level_count() {
            let last = index.levels[level as usize].brick_count - UVec3::ONE;
            for coord in [UVec3::ZERO, last] {
                let key = BrickKey { level, coord };
                let expected = index.brick_voxel_size(key)?;
                let reported = dataset.brick_size(key);
                if reported != expected {
                    return Err(Error::BrickSizeMismatch { level, coord, reported, expected });
                }
            }
        }
        Ok(index)
    }

    /// Check the regular 2x2x2 hierarchy: each level's domain is the one
    /// below halved (rounding up) and brick counts cover the domain exactly.
    pub fn validate(&self) -> Result<()> {
        let inconsistent = |level: u32, reason: String| Error::InconsistentLayout { level, reason };

        if self.levels.is_empty() {
            return Err(inconsistent(0, "no levels".into()));
        }
        if self.inner_brick_size.cmpeq(UVec3::ZERO).any() {
            return Err(inconsistent(0, format!("inner brick size {} is empty", self.inner_brick_size)));
        }

        let mut finer: Option<UVec3> = None;
        for (level, layout) in self.levels.iter().enumerate() {
            let level = level as u32;
            if let Some(finer) = finer {
                let halved = ((finer + UVec3::ONE) / 2).max(UVec3::ONE);
                if layout.domain_size != halved {
                    return Err(inconsistent(
                        level,
                        format!("domain {} is not {} halved ({})", layout.domain_size, finer, halved),
                    ));
                }
            } else if layout.domain_size.cmpeq(UVec3::ZERO).any() {
                return Err(inconsistent(level, format!("domain {} is empty", layout.domain_size)));
            }

            let covering = ((layout.domain_size + self.inner_brick_size - UVec3::ONE) / self.inner_brick_size)
                .max(UVec3::ONE);
            if layout.brick_count != covering {
                return Err(inconsistent(
                    level,
                    format!("{} bricks for domain {}, expected {}", layout.brick_count, layout.domain_size, covering),
                ));
            }
            finer = Some(layout.domain_size);
        }
        Ok(())
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Index of the coarsest level
    pub fn coarsest_level(&self) -> u32 {
        self.level_count().saturating_sub(1)
    }

    pub fn total_brick_count(&self) -> u32 {
        self.total_bricks
    }

    pub fn level_offsets(&self) -> &[u32] {
        &self.level_offsets
    }

    pub fn overlap(&self) -> UVec3 {
        self.overlap
    }

    /// Largest brick including overlap, i.e. the pool slot size.
    pub fn max_brick_size(&self) -> UVec3 {
        self.inner_brick_size + self.overlap
    }

    pub fn layout(&self, level: u32) -> Result<&LevelLayout> {
        self.levels.get(level as usize).ok_or(Error::InvalidLevel(level))
    }

    pub fn brick_count(&self, level: u32) -> Result<UVec3> {
        Ok(self.layout(level)?.brick_count)
    }

    pub fn domain_size(&self, level: u32) -> Result<UVec3> {
        Ok(self.layout(level)?.domain_size)
    }

    fn check(&self, key: BrickKey) -> Result<&LevelLayout> {
        let layout = self.layout(key.level)?;
        if key.coord.cmpge(layout.brick_count).any() {
            return Err(Error::InvalidBrickCoordinate { level: key.level, coord: key.coord });
        }
        Ok(layout)
    }

    pub fn to_id(&self, key: BrickKey) -> Result<BrickId> {
        let count = self.check(key)?.brick_count;
        let local = key.coord.x + key.coord.y * count.x + key.coord.z * count.x * count.y;
        Ok(BrickId(self.level_offsets[key.level as usize] + local))
    }

    pub fn from_id(&self, id: BrickId) -> Result<BrickKey> {
        if id.0 >= self.total_bricks {
            return Err(Error::InvalidBrickId(id.0));
        }
        // Offsets are ascending; the owning level is the last one starting at or before id
        let level = self.level_offsets.partition_point(|&offset| offset <= id.0) - 1;
        let count = self.levels[level].brick_count;
        let local = id.0 - self.level_offsets[level];
        let coord = UVec3::new(
            local % count.x,
            (local / count.x) % count.y,
            local / (count.x * count.y),
        );
        Ok(BrickKey { level: level as u32, coord })
    }

    /// Voxels of a brick including overlap, clipped at the volume boundary.
    pub fn brick_voxel_size(&self, key: BrickKey) -> Result<UVec3> {
        let layout = self.check(key)?;
        let start = key.coord * self.inner_brick_size;
        let inner = self.inner_brick_size.min(layout.domain_size - start);
        Ok(inner + self.overlap)
    }

    /// Normalized world-space size of the whole domain at a level.
    pub fn domain_extent(&self, level: u32) -> Result<Vec3> {
        let domain = self.domain_size(level)?;
        Ok(domain.as_vec3() / domain.max_element() as f32 * self.scale)
    }

    /// World-space size of a single voxel at a level (largest axis).
    pub fn voxel_world_size(&self, level: u32) -> Result<f32> {
        let domain = self.domain_size(level)?;
        Ok((self.scale / domain.max_element() as f32).max_element())
    }

    pub fn brick_extent(&self, key: BrickKey) -> Result<BrickExtent> {
        let voxel_size = self.brick_voxel_size(key)?;
        let domain = self.domain_size(key.level)?;
        let voxel_world = self.scale / domain.max_element() as f32;

        let corner = (key.coord * self.inner_brick_size).as_vec3() * voxel_world;
        let extension = (voxel_size - self.overlap).as_vec3() * voxel_world;
        let center = corner + extension * 0.5 - self.domain_extent(key.level)? * 0.5;

        Ok(BrickExtent {
            voxel_size,
            center,
            half_extent: extension * 0.5,
        })
    }

    /// Texture-coordinate bounds that trim the overlap shared with
    /// neighbours: interior faces are inset by half the overlap width,
    /// boundary faces by half a voxel.
    pub fn texcoord_bounds(&self, key: BrickKey) -> Result<(Vec3, Vec3)> {
        let voxel_size = self.brick_voxel_size(key)?.as_vec3();
        let last = self.brick_count(key.level)? - UVec3::ONE;
        let half_overlap = self.overlap.as_vec3() * 0.5;

        let mut min = Vec3::ZERO;
        let mut max = Vec3::ZERO;
        for axis in 0..3 {
            let voxels = voxel_size[axis];
            min[axis] = if key.coord[axis] == 0 {
                0.5 / voxels
            } else {
                half_overlap[axis] / voxels
            };
            max[axis] = if key.coord[axis] == last[axis] {
                1.0 - 0.5 / voxels
            } else {
                1.0 - half_overlap[axis] / voxels
            };
        }
        Ok((min, max))
    }

    /// All keys of a level in z, y, x order.
    pub fn level_keys(&self, level: u32) -> Result<impl Iterator<Item = BrickKey> + use<>> {
        let count = self.brick_count(level)?;
        Ok((0..count.z).flat_map(move |z| {
            (0..count.y).flat_map(move |y| {
                (0..count.x).map(move |x| BrickKey::new(level, x, y, z))
            })
        }))
    }

    /// Bricks of the next finer level covered by `key`.
    pub fn children(&self, key: BrickKey) -> Result<Vec<BrickKey>> {
        self.check(key)?;
        if key.level == 0 {
            return Ok(Vec::new());
        }
        let finer = key.level - 1;
        let count = self.brick_count(finer)?;
        let start = key.coord * 2;
        let end = (start + UVec3::splat(2)).min(count);

        let mut children = Vec::with_capacity(8);
        for z in start.z..end.z {
            for y in start.y..end.y {
                for x in start.x..end.x {
                    children.push(BrickKey::new(finer, x, y, z));
                }
            }
        }
        Ok(children)
    }

    /// Brick of the next coarser level covering `key`.
    pub fn parent(&self, key: BrickKey) -> Result<Option<BrickKey>> {
        self.check(key)?;
        if key.level + 1 >= self.level_count() {
            return Ok(None);
        }
        let parent = BrickKey { level: key.level + 1, coord: key.coord / 2 };
        Ok(self.check(parent).ok().map(|_| parent))
    }
}
