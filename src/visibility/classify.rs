//! Brick classification against the view and the active transfer function.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::math::Frustum;
use crate::volume::{BrickId, BrickIndex, MinMax, VolumeDataset};
use super::minmax::MinMaxAccelerator;

/// Value region the active render mode can make visible.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Classification {
    /// Non-zero range of a 1D transfer function
    ValueInterval(MinMax),
    /// Non-zero region of a 2D (value x gradient magnitude) transfer function
    ValueGradientRegion { value: MinMax, gradient: MinMax },
    /// Isosurface at a single value
    IsoThreshold(f64),
}

impl Classification {
    pub fn needs_gradient(&self) -> bool {
        matches!(self, Classification::ValueGradientRegion { .. })
    }

    /// Whether two classifications belong to the same render mode.
    pub fn same_mode(&self, other: &Classification) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Could a brick with these ranges contain anything visible?
    ///
    /// A missing gradient range is treated as unbounded.
    pub fn admits(&self, scalar: MinMax, gradient: Option<MinMax>) -> bool {
        match *self {
            Classification::ValueInterval(range) => scalar.overlaps(range),
            Classification::ValueGradientRegion { value, gradient: region } => {
                scalar.overlaps(value) && gradient.is_none_or(|g| g.overlaps(region))
            }
            Classification::IsoThreshold(isovalue) => scalar.contains(isovalue),
        }
    }
}

/// Per-brick classification bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BrickFlags(u8);

impl BrickFlags {
    pub const CONTAINS_DATA: u8 = 1 << 0;
    pub const CHILD_EMPTY: u8 = 1 << 1;
    pub const IN_FRUSTUM: u8 = 1 << 2;

    pub fn new(contains_data: bool, all_descendants_empty: bool, in_frustum: bool) -> Self {
        let mut bits = 0;
        if contains_data {
            bits |= Self::CONTAINS_DATA;
        }
        if all_descendants_empty {
            bits |= Self::CHILD_EMPTY;
        }
        if in_frustum {
            bits |= Self::IN_FRUSTUM;
        }
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// The brick's own range intersects the active classification
    pub fn contains_data(self) -> bool {
        self.0 & Self::CONTAINS_DATA != 0
    }

    /// No finest-level brick below this one contains visible data
    pub fn all_descendants_empty(self) -> bool {
        self.0 & Self::CHILD_EMPTY != 0
    }

    pub fn in_frustum(self) -> bool {
        self.0 & Self::IN_FRUSTUM != 0
    }

    /// Inside the view and not skippable as empty space
    pub fn is_needed(self) -> bool {
        self.in_frustum() && !self.all_descendants_empty()
    }

    fn set_all_descendants_empty(&mut self, empty: bool) {
        if empty {
            self.0 |= Self::CHILD_EMPTY;
        } else {
            self.0 &= !Self::CHILD_EMPTY;
        }
    }
}

/// Summary of one classification pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub bricks: u32,
    pub with_data: u32,
    pub all_descendants_empty: u32,
    pub culled: u32,
}

/// Classifies every brick at every level.
pub struct VisibilityEvaluator {
    dataset: Arc<dyn VolumeDataset>,
    index: Arc<BrickIndex>,
    minmax: MinMaxAccelerator,
}

impl VisibilityEvaluator {
    pub fn new(dataset: Arc<dyn VolumeDataset>, index: Arc<BrickIndex>) -> Self {
        Self {
            dataset,
            index,
            minmax: MinMaxAccelerator::new(),
        }
    }

    pub fn index(&self) -> &Arc<BrickIndex> {
        &self.index
    }

    pub fn set_timestep(&mut self, timestep: u32) {
        self.minmax.set_timestep(timestep);
    }

    pub fn timestep(&self) -> u32 {
        self.minmax.timestep()
    }

    pub fn minmax(&self) -> &MinMaxAccelerator {
        &self.minmax
    }

    /// Value test for a single brick.
    pub fn contains_data(&mut self, id: BrickId, classification: &Classification) -> Result<bool> {
        let scalar = self.minmax.scalar_range(self.dataset.as_ref(), &self.index, id)?;
        let gradient = if classification.needs_gradient() {
            Some(self.minmax.gradient_range(self.dataset.as_ref(), &self.index, id)?)
        } else {
            None
        };
        Ok(classification.admits(scalar, gradient))
    }

    pub fn classify(&mut self, frustum: Option<&Frustum>, classification: &Classification) -> Result<Vec<BrickFlags>> {
        let mut flags = Vec::new();
        self.classify_into(frustum, classification, &mut flags)?;
        Ok(flags)
    }

    /// Classify all bricks into `out`, indexed by brick ID.
    ///
    /// Value and frustum tests run per brick; emptiness is then bubbled
    /// from the finest level upward so a coarse brick is marked
    /// all-descendants-empty only when every finer brick it covers is.
    /// Without a frustum every brick counts as inside the view.
    pub fn classify_into(
        &mut self,
        frustum: Option<&Frustum>,
        classification: &Classification,
        out: &mut Vec<BrickFlags>,
    ) -> Result<ClassifyStats> {
        self.minmax.ensure_scalar(self.dataset.as_ref(), &self.index)?;
        if classification.needs_gradient() {
            self.minmax.ensure_gradient(self.dataset.as_ref(), &self.index)?;
        }

        let index = self.index.as_ref();
        let scalar = self.minmax.scalar_table();
        let gradient = self.minmax.gradient_table();
        let total = index.total_brick_count();

        let tested: Vec<BrickFlags> = (0..total)
            .into_par_iter()
            .map(|id| -> Result<BrickFlags> {
                let key = index.from_id(BrickId(id))?;
                let contains = classification.admits(
                    scalar[id as usize],
                    gradient.get(id as usize).copied().filter(|_| classification.needs_gradient()),
                );
                let in_frustum = match frustum {
                    Some(frustum) => frustum.intersects_aabb(&index.brick_extent(key)?.aabb()),
                    None => true,
                };
                Ok(BrickFlags::new(contains, key.level == 0 && !contains, in_frustum))
            })
            .collect::<Result<_>>()?;
        *out = tested;

        for level in 1..index.level_count() {
            for key in index.level_keys(level)? {
                let mut empty = true;
                for child in index.children(key)? {
                    if !out[index.to_id(child)?.index()].all_descendants_empty() {
                        empty = false;
                        break;
                    }
                }
                out[index.to_id(key)?.index()].set_all_descendants_empty(empty);
            }
        }

        let mut stats = ClassifyStats { bricks: total, ..Default::default() };
        for flags in out.iter() {
            stats.with_data += flags.contains_data() as u32;
            stats.all_descendants_empty += flags.all_descendants_empty() as u32;
            stats.culled += (!flags.in_frustum()) as u32;
        }
        log::debug!(
            "Classified {} bricks: {} with data, {} empty subtrees, {} outside view",
            stats.bricks, stats.with_data, stats.all_descendants_empty, stats.culled
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::Camera;
    use crate::core::types::{UVec3, Vec3};
    use crate::volume::{BrickKey, SyntheticVolume, VolumeField};

    fn evaluator(field: VolumeField) -> VisibilityEvaluator {
        // 2x2x2 finest bricks under a single coarse brick
        let volume = Arc::new(SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, field));
        let index = Arc::new(BrickIndex::from_dataset(volume.as_ref()).unwrap());
        VisibilityEvaluator::new(volume, index)
    }

    #[test]
    fn test_admits_by_mode() {
        let range = MinMax::new(10.0, 20.0);
        assert!(Classification::ValueInterval(MinMax::new(15.0, 30.0)).admits(range, None));
        assert!(!Classification::ValueInterval(MinMax::new(21.0, 30.0)).admits(range, None));
        assert!(Classification::IsoThreshold(10.0).admits(range, None));
        assert!(!Classification::IsoThreshold(25.0).admits(range, None));

        let region = Classification::ValueGradientRegion {
            value: MinMax::new(0.0, 15.0),
            gradient: MinMax::new(5.0, 6.0),
        };
        assert!(region.admits(range, Some(MinMax::new(0.0, 5.5))));
        assert!(!region.admits(range, Some(MinMax::new(7.0, 9.0))));
    }

    #[test]
    fn test_all_below_isovalue_is_empty() {
        // Constant 0.2 -> 51 everywhere, isovalue well above
        let mut evaluator = evaluator(VolumeField::Constant(0.2));
        let index = evaluator.index().clone();
        assert_eq!(index.brick_count(0).unwrap(), UVec3::splat(2));
        assert_eq!(index.level_count(), 2);

        let flags = evaluator.classify(None, &Classification::IsoThreshold(128.0)).unwrap();
        for key in index.level_keys(0).unwrap() {
            let f = flags[index.to_id(key).unwrap().index()];
            assert!(!f.contains_data());
            assert!(f.all_descendants_empty());
        }
        let root = flags[index.to_id(BrickKey::new(1, 0, 0, 0)).unwrap().index()];
        assert!(root.all_descendants_empty());
        assert!(!root.is_needed());
    }

    #[test]
    fn test_one_visible_child_keeps_parent() {
        // 8x8x8 finest bricks; values >= 200 only within ~14 voxels of the center,
        // so only finest bricks 3 and 4 along each axis hold data.
        let volume = Arc::new(SyntheticVolume::new(UVec3::splat(128), UVec3::splat(16), 2, VolumeField::Radial));
        let index = Arc::new(BrickIndex::from_dataset(volume.as_ref()).unwrap());
        let mut evaluator = VisibilityEvaluator::new(volume, index.clone());
        let flags = evaluator
            .classify(None, &Classification::ValueInterval(MinMax::new(200.0, 255.0)))
            .unwrap();
        let at = |level, x, y, z| flags[index.to_id(BrickKey::new(level, x, y, z)).unwrap().index()];

        assert!(at(0, 3, 3, 3).contains_data());
        assert!(at(0, 0, 0, 0).all_descendants_empty());

        // Parent of finest 2..3 holds one visible child
        assert!(!at(1, 1, 1, 1).all_descendants_empty());
        assert!(at(1, 1, 1, 1).is_needed());
        // Parent of finest 0..1 holds none
        assert!(at(1, 0, 0, 0).all_descendants_empty());
        assert!(!at(1, 0, 0, 0).is_needed());

        let root = at(index.coarsest_level(), 0, 0, 0);
        assert!(!root.all_descendants_empty());
    }

    #[test]
    fn test_frustum_is_multiplicative() {
        let mut evaluator = evaluator(VolumeField::Constant(0.5));
        let index = evaluator.index().clone();
        // Looking at the +x half of the volume from the side, narrow view
        let mut camera = Camera::look_at(Vec3::new(0.25, 0.0, 1.5), Vec3::new(0.25, 0.0, 0.0), Vec3::Y);
        camera.fov_y = 10.0_f32.to_radians();
        let frustum = camera.frustum();

        let flags = evaluator
            .classify(Some(&frustum), &Classification::ValueInterval(MinMax::new(0.0, 255.0)))
            .unwrap();

        let left = flags[index.to_id(BrickKey::new(0, 0, 0, 0)).unwrap().index()];
        let right = flags[index.to_id(BrickKey::new(0, 1, 0, 0)).unwrap().index()];
        assert!(left.contains_data() && right.contains_data());
        assert!(!left.in_frustum());
        assert!(!left.is_needed());
        assert!(right.is_needed());
    }

    #[test]
    fn test_gradient_mode_builds_gradient_table() {
        let mut evaluator = evaluator(VolumeField::Constant(0.5));
        let region = Classification::ValueGradientRegion {
            value: MinMax::new(0.0, 255.0),
            gradient: MinMax::new(10.0, 100.0),
        };
        let stats = {
            let mut out = Vec::new();
            evaluator.classify_into(None, &region, &mut out).unwrap()
        };
        // A constant field has zero gradient everywhere
        assert_eq!(stats.with_data, 0);
        assert!(evaluator.minmax().has_gradient_table());
    }
}
