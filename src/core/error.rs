//! Error types for volstream

use glam::UVec3;
use thiserror::Error;

/// Main error type for the streaming core
#[derive(Debug, Error)]
pub enum Error {
    #[error("pool capacity {requested} exceeds the limit of {limit}")]
    PoolCapacity { requested: u32, limit: u32 },

    #[error("pool of {pool} voxels cannot hold a single brick of {brick}")]
    PoolTooSmall { pool: UVec3, brick: UVec3 },

    #[error("metadata texture {width}x{height} exceeds the device limit of {limit}")]
    MetadataCapacity { width: u32, height: u32, limit: u32 },

    #[error("{levels} resolution levels exceed the supported {limit}")]
    LevelCapacity { levels: u32, limit: u32 },

    #[error("brick of {brick} voxels does not fit a pool slot of {slot}")]
    BrickExceedsSlot { brick: UVec3, slot: UVec3 },

    #[error("brick payload has {actual} bytes, expected {expected}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("brick coordinate {coord} is outside level {level}")]
    InvalidBrickCoordinate { level: u32, coord: UVec3 },

    #[error("brick id {0} is out of range")]
    InvalidBrickId(u32),

    #[error("level {0} does not exist")]
    InvalidLevel(u32),

    #[error("level {level} has an inconsistent layout: {reason}")]
    InconsistentLayout { level: u32, reason: String },

    #[error("brick {coord} at level {level} reports {reported} voxels, expected {expected}")]
    BrickSizeMismatch { level: u32, coord: UVec3, reported: UVec3, expected: UVec3 },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}
