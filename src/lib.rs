//! Volstream - out-of-core brick streaming for interactive volume rendering
//!
//! Decides per frame which bricks of which resolution level are needed,
//! keeps a bounded GPU cache of brick payloads, and maintains the
//! empty-space metadata the shading stage uses to skip invisible bricks.

pub mod core;
pub mod math;
pub mod volume;
pub mod visibility;
pub mod pool;
pub mod render;
pub mod streaming;
