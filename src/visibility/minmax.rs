//! Per-brick value ranges for the active timestep.
//!
//! Scalar and gradient tables lag independently: each remembers the
//! timestep it was built for and is rebuilt only when first read after
//! the active timestep changed. The gradient table is not allocated
//! until a gradient-based classification asks for it.

use rayon::prelude::*;

use crate::core::types::Result;
use crate::volume::{BrickId, BrickIndex, MinMax, VolumeDataset};

/// Cached scalar and gradient-magnitude ranges, indexed by brick ID.
#[derive(Debug, Default)]
pub struct MinMaxAccelerator {
    scalar: Vec<MinMax>,
    gradient: Vec<MinMax>,
    /// Timestep the scalar table was built for
    scalar_timestep: Option<u32>,
    /// Timestep the gradient table was built for
    gradient_timestep: Option<u32>,
    timestep: u32,
    builds: u32,
}

impl MinMaxAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the active timestep. Tables are rebuilt lazily on next access.
    pub fn set_timestep(&mut self, timestep: u32) {
        self.timestep = timestep;
    }

    pub fn timestep(&self) -> u32 {
        self.timestep
    }

    /// Drop both tables, e.g. after the dataset changed.
    pub fn reset(&mut self) {
        self.scalar.clear();
        self.gradient = Vec::new();
        self.scalar_timestep = None;
        self.gradient_timestep = None;
    }

    /// Number of table rebuilds so far.
    pub fn build_count(&self) -> u32 {
        self.builds
    }

    pub fn has_gradient_table(&self) -> bool {
        self.gradient_timestep.is_some()
    }

    /// Build the scalar table if it is missing or stale. Returns true if rebuilt.
    pub fn ensure_scalar(&mut self, dataset: &dyn VolumeDataset, index: &BrickIndex) -> Result<bool> {
        if self.scalar_timestep == Some(self.timestep) {
            return Ok(false);
        }
        let timestep = self.timestep;
        self.scalar = build_table(index, |key| dataset.scalar_range(key, timestep))?;
        self.scalar_timestep = Some(timestep);
        self.builds += 1;
        log::debug!("Built scalar min-max table for timestep {} ({} bricks)", timestep, self.scalar.len());
        Ok(true)
    }

    /// Build the gradient table if it is missing or stale. Returns true if rebuilt.
    pub fn ensure_gradient(&mut self, dataset: &dyn VolumeDataset, index: &BrickIndex) -> Result<bool> {
        if self.gradient_timestep == Some(self.timestep) {
            return Ok(false);
        }
        let timestep = self.timestep;
        self.gradient = build_table(index, |key| dataset.gradient_range(key, timestep))?;
        self.gradient_timestep = Some(timestep);
        self.builds += 1;
        log::debug!("Built gradient min-max table for timestep {} ({} bricks)", timestep, self.gradient.len());
        Ok(true)
    }

    pub fn scalar_range(&mut self, dataset: &dyn VolumeDataset, index: &BrickIndex, id: BrickId) -> Result<MinMax> {
        self.ensure_scalar(dataset, index)?;
        self.scalar
            .get(id.index())
            .copied()
            .ok_or(crate::core::Error::InvalidBrickId(id.0))
    }

    pub fn gradient_range(&mut self, dataset: &dyn VolumeDataset, index: &BrickIndex, id: BrickId) -> Result<MinMax> {
        self.ensure_gradient(dataset, index)?;
        self.gradient
            .get(id.index())
            .copied()
            .ok_or(crate::core::Error::InvalidBrickId(id.0))
    }

    /// Scalar table as last built; empty before the first build.
    pub fn scalar_table(&self) -> &[MinMax] {
        &self.scalar
    }

    /// Gradient table as last built; empty before the first build.
    pub fn gradient_table(&self) -> &[MinMax] {
        &self.gradient
    }
}

fn build_table<F>(index: &BrickIndex, range: F) -> Result<Vec<MinMax>>
where
    F: Fn(crate::volume::BrickKey) -> MinMax + Sync,
{
    (0..index.total_brick_count())
        .into_par_iter()
        .map(|id| index.from_id(BrickId(id)).map(&range))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UVec3;
    use crate::volume::{SyntheticVolume, VolumeField};

    fn volume() -> SyntheticVolume {
        SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Radial).with_timesteps(2)
    }

    #[test]
    fn test_scalar_built_once_per_timestep() {
        let volume = volume();
        let index = BrickIndex::from_dataset(&volume).unwrap();
        let mut acc = MinMaxAccelerator::new();

        let first = acc.scalar_range(&volume, &index, BrickId(0)).unwrap();
        acc.scalar_range(&volume, &index, BrickId(3)).unwrap();
        assert_eq!(acc.build_count(), 1);
        assert_eq!(acc.scalar_table().len(), index.total_brick_count() as usize);

        acc.set_timestep(0);
        acc.scalar_range(&volume, &index, BrickId(0)).unwrap();
        assert_eq!(acc.build_count(), 1);

        acc.set_timestep(1);
        let second = acc.scalar_range(&volume, &index, BrickId(0)).unwrap();
        assert_eq!(acc.build_count(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn test_gradient_is_lazy() {
        let volume = volume();
        let index = BrickIndex::from_dataset(&volume).unwrap();
        let mut acc = MinMaxAccelerator::new();

        acc.ensure_scalar(&volume, &index).unwrap();
        assert!(!acc.has_gradient_table());
        assert!(acc.gradient_table().is_empty());

        acc.gradient_range(&volume, &index, BrickId(1)).unwrap();
        assert!(acc.has_gradient_table());
        assert_eq!(acc.build_count(), 2);

        // Scalar and gradient lag independently
        acc.set_timestep(1);
        acc.ensure_gradient(&volume, &index).unwrap();
        assert_eq!(acc.build_count(), 3);
        acc.ensure_scalar(&volume, &index).unwrap();
        assert_eq!(acc.build_count(), 4);
    }

    #[test]
    fn test_out_of_range_id() {
        let volume = volume();
        let index = BrickIndex::from_dataset(&volume).unwrap();
        let mut acc = MinMaxAccelerator::new();
        let total = index.total_brick_count();
        assert!(acc.scalar_range(&volume, &index, BrickId(total)).is_err());
    }
}
