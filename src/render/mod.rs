//! Per-frame brick selection for progressive volume rendering

pub mod lod;
pub mod planner;

pub use lod::{LevelSelection, projected_voxel_pixels, select_levels, volume_distance};
pub use planner::{Brick, FramePlan, FramePlanner, PlannerState, build_frame_brick_list};
