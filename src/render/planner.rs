//! Progressive refinement of one render target.
//!
//! After any change the planner restarts at a coarse level, hands out the
//! bricks of that level front to back in per-frame batches, then moves one
//! level finer until the finest required level is done:
//!
//! ```text
//! Settled -> CoarseLevelActive -> RefiningLevel(start) -> ... -> RefiningLevel(finest) -> Settled
//! ```
//!
//! A level's work-list survives across frames until consumed, which is
//! what bounds per-frame cost.

use std::sync::Arc;

use crate::core::camera::Camera;
use crate::core::config::PlannerConfig;
use crate::core::types::{Result, UVec2, Vec3};
use crate::math::Frustum;
use crate::visibility::VisibilitySnapshot;
use crate::volume::{BrickExtent, BrickId, BrickIndex, BrickKey};
use super::lod::{self, LevelSelection};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannerState {
    /// Nothing left to do for the current view
    Settled,
    /// Just invalidated; the start level is chosen on the next frame
    CoarseLevelActive,
    /// Consuming the work-list of a level
    RefiningLevel(u32),
}

/// One brick ready to draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Brick {
    pub id: BrickId,
    pub key: BrickKey,
    pub extent: BrickExtent,
    /// Texture-coordinate bounds trimming the overlap
    pub texcoord_min: Vec3,
    pub texcoord_max: Vec3,
    /// Eye distance to the brick center
    pub distance: f32,
}

/// Work handed out for one frame.
#[derive(Clone, Debug, Default)]
pub struct FramePlan {
    pub level: Option<u32>,
    pub bricks: Vec<Brick>,
    /// Bricks of the level still waiting after this batch
    pub remaining: usize,
    /// This batch finished a level
    pub level_complete: bool,
}

/// Front-to-back list of the visible bricks of one level.
///
/// Bricks outside the frustum are dropped, as are bricks the visibility
/// snapshot marks as holding nothing visible. Without a snapshot no value
/// culling is done.
pub fn build_frame_brick_list(
    index: &BrickIndex,
    level: u32,
    camera: &Camera,
    frustum: &Frustum,
    visibility: Option<&VisibilitySnapshot>,
) -> Result<Vec<Brick>> {
    let mut bricks = Vec::with_capacity(index.layout(level)?.bricks() as usize);
    for key in index.level_keys(level)? {
        let id = index.to_id(key)?;
        if let Some(snapshot) = visibility {
            let flags = snapshot.flags(id);
            if !flags.contains_data() || flags.all_descendants_empty() {
                continue;
            }
        }
        let extent = index.brick_extent(key)?;
        if !frustum.intersects_aabb(&extent.aabb()) {
            continue;
        }
        let (texcoord_min, texcoord_max) = index.texcoord_bounds(key)?;
        bricks.push(Brick {
            id,
            key,
            extent,
            texcoord_min,
            texcoord_max,
            distance: camera.distance_to(extent.center),
        });
    }
    // Stable, so equal distances keep enumeration order
    bricks.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(bricks)
}

pub struct FramePlanner {
    config: PlannerConfig,
    index: Arc<BrickIndex>,
    state: PlannerState,
    selection: Option<LevelSelection>,
    /// Level the current work-list was built for
    list_level: Option<u32>,
    work_list: Vec<Brick>,
    cursor: usize,
    /// Finest required level has been handed out since the last invalidation
    done: bool,
    check_counter: u32,
    viewport: UVec2,
    /// Level the last refinement sequence settled at
    settled_level: Option<u32>,
}

impl FramePlanner {
    pub fn new(index: Arc<BrickIndex>, config: PlannerConfig, viewport: UVec2) -> Self {
        let check_counter = config.start_delay_frames;
        Self {
            config,
            index,
            state: PlannerState::CoarseLevelActive,
            selection: None,
            list_level: None,
            work_list: Vec::new(),
            cursor: 0,
            done: false,
            check_counter,
            viewport: viewport.max(UVec2::ONE),
            settled_level: None,
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state == PlannerState::Settled
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn viewport(&self) -> UVec2 {
        self.viewport
    }

    /// Levels of the current refinement sequence, once chosen.
    pub fn selection(&self) -> Option<LevelSelection> {
        self.selection
    }

    pub fn current_level(&self) -> Option<u32> {
        match self.state {
            PlannerState::RefiningLevel(level) => Some(level),
            PlannerState::Settled => self.settled_level,
            PlannerState::CoarseLevelActive => None,
        }
    }

    /// Bricks of the current work-list not yet handed out.
    pub fn pending(&self) -> &[Brick] {
        &self.work_list[self.cursor.min(self.work_list.len())..]
    }

    /// Whether the render target shows the finest required level.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Frames left before revalidation stops.
    pub fn check_counter(&self) -> u32 {
        self.check_counter
    }

    pub fn is_revalidating(&self) -> bool {
        self.check_counter > 0
    }

    /// Restart refinement from a coarse level.
    pub fn invalidate(&mut self) {
        self.state = PlannerState::CoarseLevelActive;
        self.selection = None;
        self.list_level = None;
        self.work_list.clear();
        self.cursor = 0;
        self.done = false;
        self.check_counter = self.config.start_delay_frames;
    }

    /// Returns true if the size changed, which invalidates the frame.
    pub fn set_viewport(&mut self, viewport: UVec2) -> bool {
        let viewport = viewport.max(UVec2::ONE);
        if viewport == self.viewport {
            return false;
        }
        self.viewport = viewport;
        self.invalidate();
        true
    }

    pub fn set_bricks_per_frame(&mut self, bricks: usize) {
        self.config.bricks_per_frame = bricks;
    }

    /// Advance the debounce by one frame.
    ///
    /// While the counter runs nothing else happens. Once it has decayed, a
    /// complete redraw is scheduled if the view settled coarser than the
    /// level it now requires. Returns true when a redraw was scheduled.
    pub fn check_for_redraw(&mut self, camera: &Camera) -> Result<bool> {
        if self.check_counter > 0 {
            self.check_counter -= 1;
            return Ok(false);
        }
        let Some(settled) = self.settled_level.filter(|_| self.is_settled()) else {
            return Ok(false);
        };
        let required = lod::select_levels(&self.index, camera, self.viewport.y, &self.config)?;
        if required.finest < settled {
            log::debug!("Settled at level {} but level {} is required, redrawing", settled, required.finest);
            self.invalidate();
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand out the next batch of bricks.
    pub fn plan_frame(&mut self, camera: &Camera, visibility: Option<&VisibilitySnapshot>) -> Result<FramePlan> {
        if self.state == PlannerState::CoarseLevelActive {
            let selection = lod::select_levels(&self.index, camera, self.viewport.y, &self.config)?;
            log::debug!("Refinement from level {} to {}", selection.start, selection.finest);
            self.selection = Some(selection);
            self.state = PlannerState::RefiningLevel(selection.start);
        }

        let frustum = camera.frustum();
        loop {
            let PlannerState::RefiningLevel(level) = self.state else {
                return Ok(FramePlan::default());
            };

            if self.list_level != Some(level) {
                self.work_list = build_frame_brick_list(&self.index, level, camera, &frustum, visibility)?;
                self.cursor = 0;
                self.list_level = Some(level);
                log::debug!("Level {} work-list: {} bricks", level, self.work_list.len());
            }

            if self.cursor >= self.work_list.len() {
                // Empty level; move on without spending a frame on it
                self.finish_level(level);
                continue;
            }

            let end = (self.cursor + self.config.bricks_per_frame.max(1)).min(self.work_list.len());
            let bricks = self.work_list[self.cursor..end].to_vec();
            self.cursor = end;
            let remaining = self.work_list.len() - end;
            let level_complete = remaining == 0;
            if level_complete {
                self.finish_level(level);
            }
            return Ok(FramePlan {
                level: Some(level),
                bricks,
                remaining,
                level_complete,
            });
        }
    }

    fn finish_level(&mut self, level: u32) {
        let finest = self.selection.map(|s| s.finest).unwrap_or(0);
        if level <= finest {
            log::info!("Refinement settled at level {}", level);
            self.state = PlannerState::Settled;
            self.settled_level = Some(level);
            self.done = true;
        } else {
            self.state = PlannerState::RefiningLevel(level - 1);
        }
    }
}
