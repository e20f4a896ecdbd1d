//! Screen-space level selection
//!
//! A level is fine enough once one of its voxels projects to at least
//! `lod_pixel_threshold` pixels; anything finer would be sub-pixel. The
//! first refinement pass starts at the coarsest level whose voxels are
//! still no larger than `coarse_voxel_pixels` on screen.

use crate::core::camera::Camera;
use crate::core::config::PlannerConfig;
use crate::core::types::Result;
use crate::volume::BrickIndex;

/// Levels chosen for one refinement sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSelection {
    /// Finest level worth rendering from this view
    pub finest: u32,
    /// Level the first coarse pass renders
    pub start: u32,
}

/// Distance from the eye to the nearest point of the volume's bounding sphere,
/// clamped to the near plane.
pub fn volume_distance(index: &BrickIndex, camera: &Camera) -> Result<f32> {
    let half_diagonal = index.domain_extent(0)?.length() * 0.5;
    Ok((camera.position.length() - half_diagonal).max(camera.near))
}

/// Size in pixels of one voxel of `level` at `distance`.
///
/// # Arguments
/// * `viewport_height` - Render target height in pixels
pub fn projected_voxel_pixels(
    index: &BrickIndex,
    level: u32,
    camera: &Camera,
    distance: f32,
    viewport_height: u32,
) -> Result<f32> {
    let voxel = index.voxel_world_size(level)?;
    Ok(voxel * viewport_height as f32 / (2.0 * distance * (camera.fov_y * 0.5).tan()))
}

/// Pick the finest required level and the level to start refining from.
pub fn select_levels(
    index: &BrickIndex,
    camera: &Camera,
    viewport_height: u32,
    config: &PlannerConfig,
) -> Result<LevelSelection> {
    let distance = volume_distance(index, camera)?;
    let coarsest = index.coarsest_level();

    let mut finest = coarsest;
    for level in 0..=coarsest {
        if projected_voxel_pixels(index, level, camera, distance, viewport_height)? >= config.lod_pixel_threshold {
            finest = level;
            break;
        }
    }

    if config.lod_disabled {
        return Ok(LevelSelection { finest, start: finest });
    }

    let mut start = finest;
    for level in (finest..=coarsest).rev() {
        if projected_voxel_pixels(index, level, camera, distance, viewport_height)? <= config.coarse_voxel_pixels {
            start = level;
            break;
        }
    }
    Ok(LevelSelection { finest, start })
}
