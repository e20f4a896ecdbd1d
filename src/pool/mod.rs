//! GPU-resident brick cache

pub mod storage;
pub mod gpu;
pub mod metadata;
pub mod shader;
pub mod brick_pool;

pub use storage::{BrickStorage, FilterMode, HostBrickStorage, PoolDescriptor, PoolUniforms, StorageLimits};
pub use gpu::GpuBrickStorage;
pub use metadata::{MetadataFlush, MetadataTexel, MetadataTexture};
pub use shader::ShaderBindings;
pub use brick_pool::{BrickPool, PoolBinding, PoolSlot, PoolStats, SlotState, UploadBatch, UploadOutcome};
