//! Empty-space classification and its background updater

pub mod minmax;
pub mod classify;
pub mod snapshot;
pub mod updater;

pub use minmax::MinMaxAccelerator;
pub use classify::{BrickFlags, Classification, ClassifyStats, VisibilityEvaluator};
pub use snapshot::VisibilitySnapshot;
pub use updater::{AsyncVisibilityUpdater, VisibilityJob};
