//! Multi-resolution volume data: dataset contract and brick addressing

pub mod dataset;
pub mod brick_index;
pub mod synthetic;

pub use dataset::{BrickKey, MinMax, VolumeDataset, VoxelFormat};
pub use brick_index::{BrickExtent, BrickId, BrickIndex, LevelLayout};
pub use synthetic::{SyntheticVolume, VolumeField};
