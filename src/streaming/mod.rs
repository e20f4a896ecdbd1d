//! Per-frame streaming orchestration

pub mod manager;

pub use manager::{FrameReport, StreamingStats, VolumeStreamer};
