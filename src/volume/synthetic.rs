//! Procedural multi-resolution volume.
//!
//! Stands in for an on-disk dataset in tests, benches and the headless
//! simulation. Every level samples the same normalized field, so coarse
//! levels are consistent with the finer ones they summarize.

use noise::{NoiseFn, Perlin};

use crate::core::types::{Result, UVec3, Vec3};
use super::brick_index::LevelLayout;
use super::dataset::{BrickKey, MinMax, VolumeDataset, VoxelFormat};

/// Scalar field sampled over the unit cube, values in [0, 1]
#[derive(Clone, Copy, Debug)]
pub enum VolumeField {
    Constant(f32),
    /// 1 at the center falling to 0 at the faces
    Radial,
    Noise { seed: u32, frequency: f64 },
}

pub struct SyntheticVolume {
    levels: Vec<LevelLayout>,
    inner_brick_size: UVec3,
    overlap: u32,
    scale: Vec3,
    timesteps: u32,
    field: VolumeField,
    perlin: Perlin,
}

impl SyntheticVolume {
    /// Build all levels down to a single brick.
    ///
    /// `overlap` is the total ghost width per axis, split evenly between
    /// both faces of a brick.
    pub fn new(domain_size: UVec3, inner_brick_size: UVec3, overlap: u32, field: VolumeField) -> Self {
        let mut levels = Vec::new();
        let mut domain = domain_size.max(UVec3::ONE);
        loop {
            let brick_count = ((domain + inner_brick_size - UVec3::ONE) / inner_brick_size).max(UVec3::ONE);
            levels.push(LevelLayout { domain_size: domain, brick_count });
            if brick_count == UVec3::ONE {
                break;
            }
            domain = ((domain + UVec3::ONE) / 2).max(UVec3::ONE);
        }

        let seed = match field {
            VolumeField::Noise { seed, .. } => seed,
            _ => 0,
        };

        Self {
            levels,
            inner_brick_size,
            overlap,
            scale: Vec3::ONE,
            timesteps: 1,
            field,
            perlin: Perlin::new(seed),
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_timesteps(mut self, timesteps: u32) -> Self {
        self.timesteps = timesteps.max(1);
        self
    }

    fn sample(&self, p: Vec3, timestep: u32) -> f32 {
        let value = match self.field {
            VolumeField::Constant(v) => v,
            VolumeField::Radial => {
                let d = (p - Vec3::splat(0.5)).length() * 2.0;
                1.0 - d.min(1.0) + timestep as f32 * 0.05
            }
            VolumeField::Noise { frequency, .. } => {
                let n = self.perlin.get([
                    p.x as f64 * frequency,
                    p.y as f64 * frequency,
                    p.z as f64 * frequency + timestep as f64 * 0.37,
                ]);
                ((n + 1.0) * 0.5) as f32
            }
        };
        value.clamp(0.0, 1.0)
    }

    /// Voxels of a brick including ghost layers, x fastest.
    fn generate(&self, key: BrickKey, timestep: u32, out: &mut Vec<u8>) {
        let layout = self.levels[key.level as usize];
        let size = self.brick_size(key);
        let ghost = (self.overlap / 2) as i64;
        let origin = (key.coord * self.inner_brick_size).as_i64vec3() - glam::I64Vec3::splat(ghost);
        let max = layout.domain_size.as_i64vec3() - glam::I64Vec3::ONE;
        let domain = layout.domain_size.as_vec3();

        out.clear();
        out.reserve((size.x * size.y * size.z) as usize);
        for z in 0..size.z as i64 {
            for y in 0..size.y as i64 {
                for x in 0..size.x as i64 {
                    let voxel = (origin + glam::I64Vec3::new(x, y, z)).clamp(glam::I64Vec3::ZERO, max);
                    let p = (voxel.as_vec3() + Vec3::splat(0.5)) / domain;
                    out.push((self.sample(p, timestep) * 255.0).round() as u8);
                }
            }
        }
    }
}

impl VolumeDataset for SyntheticVolume {
    fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    fn brick_count(&self, level: u32) -> UVec3 {
        self.levels[level as usize].brick_count
    }

    fn domain_size(&self, level: u32) -> UVec3 {
        self.levels[level as usize].domain_size
    }

    fn brick_size(&self, key: BrickKey) -> UVec3 {
        let domain = self.levels[key.level as usize].domain_size;
        let start = key.coord * self.inner_brick_size;
        self.inner_brick_size.min(domain - start) + UVec3::splat(self.overlap)
    }

    fn max_brick_size(&self) -> UVec3 {
        self.inner_brick_size + UVec3::splat(self.overlap)
    }

    fn brick_overlap(&self) -> UVec3 {
        UVec3::splat(self.overlap)
    }

    fn scale(&self) -> Vec3 {
        self.scale
    }

    fn voxel_format(&self) -> VoxelFormat {
        VoxelFormat::R8
    }

    fn timestep_count(&self) -> u32 {
        self.timesteps
    }

    fn scalar_range(&self, key: BrickKey, timestep: u32) -> MinMax {
        let mut voxels = Vec::new();
        self.generate(key, timestep, &mut voxels);
        let mut range = MinMax::EMPTY;
        for &v in &voxels {
            range.include(v as f64);
        }
        range
    }

    fn gradient_range(&self, key: BrickKey, timestep: u32) -> MinMax {
        let mut voxels = Vec::new();
        self.generate(key, timestep, &mut voxels);
        let size = self.brick_size(key);
        let at = |x: u32, y: u32, z: u32| voxels[(x + y * size.x + z * size.x * size.y) as usize] as f64;

        let mut range = MinMax::EMPTY;
        for z in 0..size.z {
            for y in 0..size.y {
                for x in 0..size.x {
                    let gx = at((x + 1).min(size.x - 1), y, z) - at(x.saturating_sub(1), y, z);
                    let gy = at(x, (y + 1).min(size.y - 1), z) - at(x, y.saturating_sub(1), z);
                    let gz = at(x, y, (z + 1).min(size.z - 1)) - at(x, y, z.saturating_sub(1));
                    range.include((gx * gx + gy * gy + gz * gz).sqrt() * 0.5);
                }
            }
        }
        range
    }

    fn fetch_brick(&self, key: BrickKey, timestep: u32, out: &mut Vec<u8>) -> Result<()> {
        if key.level >= self.level_count() || key.coord.cmpge(self.brick_count(key.level)).any() {
            return Err(crate::core::Error::InvalidBrickCoordinate { level: key.level, coord: key.coord });
        }
        if timestep >= self.timesteps {
            return Err(crate::core::Error::Dataset(format!(
                "timestep {} out of {}", timestep, self.timesteps
            )));
        }
        self.generate(key, timestep, out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_pyramid() {
        let volume = SyntheticVolume::new(UVec3::splat(64), UVec3::splat(16), 2, VolumeField::Radial);
        assert_eq!(volume.level_count(), 3);
        assert_eq!(volume.brick_count(0), UVec3::splat(4));
        assert_eq!(volume.brick_count(1), UVec3::splat(2));
        assert_eq!(volume.brick_count(2), UVec3::ONE);
        assert_eq!(volume.domain_size(2), UVec3::splat(16));
    }

    #[test]
    fn test_fetch_matches_brick_size() {
        let volume = SyntheticVolume::new(UVec3::new(40, 32, 32), UVec3::splat(32), 2, VolumeField::Radial);
        let key = BrickKey::new(0, 1, 0, 0);
        let mut voxels = Vec::new();
        volume.fetch_brick(key, 0, &mut voxels).unwrap();
        let size = volume.brick_size(key);
        assert_eq!(size, UVec3::new(10, 34, 34));
        assert_eq!(voxels.len(), (size.x * size.y * size.z) as usize);
    }

    #[test]
    fn test_constant_field_ranges() {
        let volume = SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Constant(0.2));
        let key = BrickKey::new(0, 1, 1, 1);
        let range = volume.scalar_range(key, 0);
        assert_eq!(range, MinMax::new(51.0, 51.0));
        assert_eq!(volume.gradient_range(key, 0), MinMax::new(0.0, 0.0));
    }

    #[test]
    fn test_radial_has_gradient() {
        let volume = SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Radial);
        let range = volume.gradient_range(BrickKey::new(0, 0, 0, 0), 0);
        assert!(range.max > 0.0);
    }

    #[test]
    fn test_fetch_rejects_bad_input() {
        let volume = SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Radial);
        let mut voxels = Vec::new();
        assert!(volume.fetch_brick(BrickKey::new(0, 2, 0, 0), 0, &mut voxels).is_err());
        assert!(volume.fetch_brick(BrickKey::new(0, 0, 0, 0), 3, &mut voxels).is_err());
    }
}
