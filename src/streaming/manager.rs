//! Volume Streamer - Coordinates the brick streaming components
//!
//! Ties the frame planner, the brick pool, the background visibility
//! updater and the dataset together. Everything here runs on the render
//! thread; the only concurrent work is the updater's classification.

use std::sync::Arc;
use std::time::Duration;

use crate::core::camera::Camera;
use crate::core::config::{PoolConfig, StreamerConfig};
use crate::core::error::Error;
use crate::core::types::{Result, UVec2};
use crate::pool::{BrickPool, BrickStorage, PoolBinding};
use crate::render::{Brick, FramePlanner, PlannerState};
use crate::visibility::{AsyncVisibilityUpdater, Classification, VisibilityEvaluator};
use crate::volume::{BrickId, BrickIndex, VolumeDataset};

/// Running totals since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingStats {
    pub frames: u64,
    pub bricks_planned: u64,
    pub uploads: u64,
    pub hits: u64,
    /// Bricks that found no free slot and were not drawn
    pub deferred: u64,
    pub snapshots_applied: u64,
    pub levels_completed: u64,
    pub redraws: u64,
}

/// What one frame produced.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub frame: u64,
    pub state: PlannerState,
    pub level: Option<u32>,
    /// Resident bricks to draw, front to back, with their pool slot
    pub bricks: Vec<(Brick, u32)>,
    pub uploaded: u32,
    pub hits: u32,
    pub deferred: Vec<BrickId>,
    pub level_complete: bool,
    pub remaining: usize,
    /// Version of the visibility snapshot in effect
    pub visibility_version: Option<u64>,
}

/// Streaming manager for one dataset and one render target
pub struct VolumeStreamer<S: BrickStorage> {
    dataset: Arc<dyn VolumeDataset>,
    index: Arc<BrickIndex>,
    pool: BrickPool<S>,
    updater: AsyncVisibilityUpdater,
    planner: FramePlanner,
    /// Payload buffer reused by every fetch
    scratch: Vec<u8>,
    camera: Option<Camera>,
    timestep: u32,
    stats: StreamingStats,
}

impl<S: BrickStorage> VolumeStreamer<S> {
    /// Create the pool, start the visibility worker and seed the pool
    /// with the coarsest brick.
    pub fn new(
        dataset: Arc<dyn VolumeDataset>,
        storage: S,
        config: &StreamerConfig,
        classification: Classification,
        viewport: UVec2,
    ) -> Result<Self> {
        let index = Arc::new(BrickIndex::from_dataset(dataset.as_ref())?);

        let format = dataset.voxel_format();
        if config.pool.voxel_format != format {
            log::warn!(
                "Pool format {:?} does not match the dataset, using {:?}",
                config.pool.voxel_format,
                format
            );
        }
        let pool_config = PoolConfig {
            voxel_format: format,
            ..config.pool.clone()
        };
        let mut pool = BrickPool::new(storage, index.clone(), &pool_config)?;

        // A batch larger than the pool could never be resident at once
        let mut planner_config = config.planner.clone();
        let capacity = pool.capacity() as usize;
        if planner_config.bricks_per_frame > capacity {
            log::warn!(
                "Reducing bricks per frame from {} to the pool capacity of {}",
                planner_config.bricks_per_frame,
                capacity
            );
            planner_config.bricks_per_frame = capacity;
        }
        let planner = FramePlanner::new(index.clone(), planner_config, viewport);

        let evaluator = VisibilityEvaluator::new(dataset.clone(), index.clone());
        let updater = AsyncVisibilityUpdater::spawn(evaluator, classification, 0)?;
        updater.request(None)?;

        pool.upload_first_brick(|key, out| dataset.fetch_brick(key, 0, out))?;

        log::info!(
            "VolumeStreamer: {} levels, {} bricks, pool of {} slots",
            index.level_count(),
            index.total_brick_count(),
            pool.capacity()
        );

        Ok(Self {
            dataset,
            index,
            pool,
            updater,
            planner,
            scratch: Vec::new(),
            camera: None,
            timestep: 0,
            stats: StreamingStats::default(),
        })
    }

    /// Run one frame: pick up visibility, plan, upload misses, flush metadata.
    pub fn frame(&mut self, camera: &Camera) -> Result<FrameReport> {
        self.stats.frames += 1;

        let camera_changed = self.camera.as_ref() != Some(camera);
        if camera_changed {
            self.camera = Some(*camera);
            self.planner.invalidate();
            self.updater.request(Some(camera.frustum()))?;
        }

        if let Some(snapshot) = self.updater.poll() {
            self.pool.apply_visibility(snapshot);
            self.stats.snapshots_applied += 1;
        }

        if !camera_changed {
            let was_revalidating = self.planner.is_revalidating();
            if self.planner.check_for_redraw(camera)? {
                self.stats.redraws += 1;
            }
            if was_revalidating && !self.planner.is_revalidating() {
                // Camera came to rest; classify once more for the final view
                self.updater.request(Some(camera.frustum()))?;
            }
        }

        let visibility = self.pool.visibility().cloned();
        let plan = self.planner.plan_frame(camera, visibility.as_deref())?;

        let ids: Vec<BrickId> = plan.bricks.iter().map(|b| b.id).collect();
        self.pool.set_protected(ids.iter().copied());
        let dataset = &self.dataset;
        let timestep = self.timestep;
        let batch = self
            .pool
            .upload_bricks(&ids, &mut self.scratch, |key, out| dataset.fetch_brick(key, timestep, out))?;
        self.pool.flush_metadata()?;

        let mut bricks = Vec::with_capacity(plan.bricks.len());
        let mut deferred = Vec::new();
        for brick in plan.bricks {
            match self.pool.slot_of(brick.id) {
                Some(slot) => bricks.push((brick, slot)),
                None => deferred.push(brick.id),
            }
        }

        self.stats.bricks_planned += bricks.len() as u64 + deferred.len() as u64;
        self.stats.uploads += batch.uploaded as u64;
        self.stats.hits += batch.hits as u64;
        self.stats.deferred += deferred.len() as u64;
        if plan.level_complete {
            self.stats.levels_completed += 1;
        }

        Ok(FrameReport {
            frame: self.stats.frames,
            state: self.planner.state(),
            level: plan.level,
            bricks,
            uploaded: batch.uploaded,
            hits: batch.hits,
            deferred,
            level_complete: plan.level_complete,
            remaining: plan.remaining,
            visibility_version: visibility.map(|s| s.version),
        })
    }

    /// Block until a visibility snapshot of the current generation is applied.
    ///
    /// For startup and tests only; frames never wait on the worker.
    pub fn wait_for_visibility(&mut self, timeout: Duration) -> bool {
        match self.updater.wait_for_snapshot(timeout) {
            Some(snapshot) => {
                self.pool.apply_visibility(snapshot);
                self.stats.snapshots_applied += 1;
                true
            }
            None => false,
        }
    }

    /// Update the active transfer function.
    ///
    /// Only a change within the active mode counts; a function of another
    /// mode is ignored until `set_render_mode` switches to it. Returns true
    /// when the frame was invalidated.
    pub fn set_classification(&mut self, classification: Classification) -> Result<bool> {
        let current = *self.updater.classification();
        if !classification.same_mode(&current) {
            log::debug!("Ignoring transfer function change for an inactive render mode");
            return Ok(false);
        }
        if classification == current {
            return Ok(false);
        }
        self.apply_classification(classification)?;
        Ok(true)
    }

    /// Switch render mode, and with it the classification.
    pub fn set_render_mode(&mut self, classification: Classification) -> Result<()> {
        if classification != *self.updater.classification() {
            self.apply_classification(classification)?;
        }
        Ok(())
    }

    fn apply_classification(&mut self, classification: Classification) -> Result<()> {
        self.updater.set_classification(classification);
        self.pool.clear_visibility();
        self.planner.invalidate();
        self.request_visibility()
    }

    /// Switch timestep. Resident payloads belong to the old timestep and are
    /// all dropped.
    pub fn set_timestep(&mut self, timestep: u32) -> Result<()> {
        let count = self.dataset.timestep_count();
        if timestep >= count {
            return Err(Error::Dataset(format!("timestep {} out of range (0..{})", timestep, count)));
        }
        if timestep == self.timestep {
            return Ok(());
        }
        self.timestep = timestep;
        self.updater.set_timestep(timestep);
        let evicted = self.pool.evict_all();
        self.pool.clear_visibility();
        self.planner.invalidate();
        log::info!("Timestep {}: dropped {} resident bricks", timestep, evicted);

        let dataset = &self.dataset;
        self.pool.upload_first_brick(|key, out| dataset.fetch_brick(key, timestep, out))?;
        self.request_visibility()
    }

    /// Returns true if the size changed and the frame was invalidated.
    pub fn set_viewport(&mut self, viewport: UVec2) -> bool {
        self.planner.set_viewport(viewport)
    }

    fn request_visibility(&self) -> Result<()> {
        self.updater.request(self.camera.as_ref().map(|c| c.frustum()))
    }

    /// Bind the pool for the shading stage.
    pub fn enable(&mut self) -> Result<PoolBinding<'_, S>> {
        self.pool.enable()
    }

    pub fn classification(&self) -> &Classification {
        self.updater.classification()
    }

    pub fn timestep(&self) -> u32 {
        self.timestep
    }

    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    pub fn dataset(&self) -> &Arc<dyn VolumeDataset> {
        &self.dataset
    }

    pub fn index(&self) -> &Arc<BrickIndex> {
        &self.index
    }

    pub fn pool(&self) -> &BrickPool<S> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BrickPool<S> {
        &mut self.pool
    }

    pub fn planner(&self) -> &FramePlanner {
        &self.planner
    }

    pub fn updater(&self) -> &AsyncVisibilityUpdater {
        &self.updater
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PlannerConfig;
    use crate::core::types::{UVec3, Vec3};
    use crate::pool::HostBrickStorage;
    use crate::volume::{BrickKey, MinMax, SyntheticVolume, VolumeField};

    const WAIT: Duration = Duration::from_secs(10);

    /// 64^3 radial volume in 16^3 bricks: 64 + 8 + 1 bricks, 32 slots of 18^3
    fn streamer(bricks_per_frame: usize) -> VolumeStreamer<HostBrickStorage> {
        let volume = SyntheticVolume::new(UVec3::splat(64), UVec3::splat(16), 2, VolumeField::Radial).with_timesteps(2);
        let config = StreamerConfig {
            pool: PoolConfig {
                pool_size: [72, 72, 36],
                ..Default::default()
            },
            planner: PlannerConfig {
                bricks_per_frame,
                start_delay_frames: 2,
                ..Default::default()
            },
        };
        VolumeStreamer::new(
            Arc::new(volume),
            HostBrickStorage::new(),
            &config,
            Classification::ValueInterval(MinMax::new(100.0, 255.0)),
            UVec2::new(1024, 1024),
        )
        .unwrap()
    }

    fn camera() -> Camera {
        Camera::look_at(Vec3::new(0.3, 0.4, 1.5), Vec3::ZERO, Vec3::Y)
    }

    fn run_until_settled(streamer: &mut VolumeStreamer<HostBrickStorage>, camera: &Camera) -> Vec<FrameReport> {
        let mut reports = Vec::new();
        for _ in 0..500 {
            let report = streamer.frame(camera).unwrap();
            let settled = report.state == PlannerState::Settled;
            reports.push(report);
            if settled {
                break;
            }
        }
        reports
    }

    #[test]
    fn test_first_brick_resident_after_construction() {
        let streamer = streamer(8);
        assert_eq!(streamer.pool().capacity(), 32);
        let coarsest = streamer.index().to_id(BrickKey::new(2, 0, 0, 0)).unwrap();
        assert!(streamer.pool().is_resident(coarsest));
        assert_eq!(streamer.pool().resident_count(), 1);
    }

    #[test]
    fn test_frames_refine_to_settled() {
        let mut streamer = streamer(8);
        assert!(streamer.wait_for_visibility(WAIT));
        let camera = camera();
        let reports = run_until_settled(&mut streamer, &camera);

        assert_eq!(streamer.planner().state(), PlannerState::Settled);
        assert!(reports.iter().all(|r| r.bricks.len() <= 8));
        assert!(reports.iter().all(|r| r.deferred.is_empty()));
        // Levels are visited coarse to fine
        let levels: Vec<u32> = reports.iter().filter_map(|r| r.level).collect();
        assert!(levels.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(levels.last(), Some(&0));

        let stats = streamer.stats();
        assert!(stats.uploads > 0);
        assert!(streamer.pool().storage().metadata_writes() > 0);
        assert!(streamer.pool().resident_count() <= streamer.pool().capacity());
    }

    #[test]
    fn test_drawn_bricks_are_resident_and_contain_data() {
        let mut streamer = streamer(8);
        assert!(streamer.wait_for_visibility(WAIT));
        let camera = camera();
        let report = streamer.frame(&camera).unwrap();
        let snapshot = streamer.pool().visibility().cloned().unwrap();
        for (brick, slot) in &report.bricks {
            assert_eq!(streamer.pool().slot_of(brick.id), Some(*slot));
            assert!(snapshot.flags(brick.id).contains_data());
        }
    }

    #[test]
    fn test_still_camera_does_not_restart() {
        let mut streamer = streamer(64);
        let camera = camera();
        run_until_settled(&mut streamer, &camera);
        for _ in 0..5 {
            let report = streamer.frame(&camera).unwrap();
            assert!(report.bricks.is_empty());
            assert_eq!(report.state, PlannerState::Settled);
        }
        assert!(!streamer.planner().is_revalidating());

        let moved = Camera::look_at(Vec3::new(-0.3, 0.4, 1.5), Vec3::ZERO, Vec3::Y);
        let report = streamer.frame(&moved).unwrap();
        assert!(matches!(report.state, PlannerState::RefiningLevel(_) | PlannerState::Settled));
        assert!(!report.bricks.is_empty());
    }

    #[test]
    fn test_classification_change_in_active_mode_invalidates() {
        let mut streamer = streamer(64);
        let camera = camera();
        run_until_settled(&mut streamer, &camera);

        let changed = Classification::ValueInterval(MinMax::new(200.0, 255.0));
        assert!(streamer.set_classification(changed).unwrap());
        assert_eq!(streamer.planner().state(), PlannerState::CoarseLevelActive);
        assert!(streamer.pool().visibility().is_none());
        assert!(!streamer.set_classification(changed).unwrap());

        // Isovalue edits while in interval mode change nothing
        assert!(!streamer.set_classification(Classification::IsoThreshold(50.0)).unwrap());
        assert_eq!(streamer.classification(), &changed);

        streamer.set_render_mode(Classification::IsoThreshold(50.0)).unwrap();
        assert_eq!(streamer.classification(), &Classification::IsoThreshold(50.0));
    }

    #[test]
    fn test_timestep_change_drops_payloads() {
        let mut streamer = streamer(64);
        let camera = camera();
        run_until_settled(&mut streamer, &camera);
        assert!(streamer.pool().resident_count() > 1);

        streamer.set_timestep(1).unwrap();
        assert_eq!(streamer.timestep(), 1);
        assert_eq!(streamer.pool().resident_count(), 1);
        assert_eq!(streamer.planner().state(), PlannerState::CoarseLevelActive);
        assert!(streamer.set_timestep(2).is_err());
    }

    #[test]
    fn test_viewport_change_invalidates() {
        let mut streamer = streamer(64);
        let camera = camera();
        run_until_settled(&mut streamer, &camera);
        assert!(!streamer.set_viewport(UVec2::new(1024, 1024)));
        assert!(streamer.set_viewport(UVec2::new(640, 480)));
        assert_eq!(streamer.planner().state(), PlannerState::CoarseLevelActive);
    }

    #[test]
    fn test_budget_clamped_to_pool() {
        let streamer = streamer(1000);
        assert_eq!(streamer.planner().config().bricks_per_frame, 32);
    }

    #[test]
    fn test_enable_binds_pool() {
        let mut streamer = streamer(8);
        {
            let binding = streamer.enable().unwrap();
            assert!(binding.storage().is_bound());
        }
        assert!(!streamer.pool().storage().is_bound());
    }
}
