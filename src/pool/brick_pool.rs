//! Brick Pool - fixed-capacity GPU cache of brick payloads
//!
//! The pool texture is split into a 3D grid of equally sized slots, one
//! brick per slot. A reverse index maps brick IDs to slots so residency
//! checks are O(1). When the pool is full a victim is chosen in order:
//! 1. slots that were never used or whose brick was evicted
//! 2. resident bricks the current visibility snapshot no longer needs
//! 3. everything else
//!
//! and within a class by oldest creation tick, then lowest slot index.
//! Bricks in the protected set (being drawn this subframe) are never
//! evicted.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::config::PoolConfig;
use crate::core::error::Error;
use crate::core::types::{Result, UVec2, UVec3};
use crate::visibility::VisibilitySnapshot;
use crate::volume::{BrickId, BrickIndex, BrickKey, VoxelFormat};
use super::metadata::{MetadataFlush, MetadataTexture, MAX_SLOTS};
use super::shader::{self, ShaderBindings};
use super::storage::{BrickStorage, FilterMode, PoolDescriptor, PoolUniforms, MAX_LEVELS};

/// Reverse index sentinel for bricks without a slot
pub const NOT_RESIDENT: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Never held a brick
    Unused,
    Resident(BrickId),
    /// Held a brick that was explicitly evicted
    Evicted,
}

/// One physical location in the pool texture.
#[derive(Clone, Copy, Debug)]
pub struct PoolSlot {
    pub state: SlotState,
    /// Upload tick of the current contents, refreshed on cache hits
    pub created: u64,
}

impl Default for PoolSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Unused,
            created: 0,
        }
    }
}

/// Result of an upload request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Already resident, recency refreshed
    Hit { slot: u32 },
    Uploaded { slot: u32, evicted: Option<BrickId> },
    /// Every slot is protected; retry next frame
    PoolExhausted,
}

impl UploadOutcome {
    pub fn is_resident(&self) -> bool {
        !matches!(self, UploadOutcome::PoolExhausted)
    }
}

/// Counters for one batch of uploads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadBatch {
    pub uploaded: u32,
    pub hits: u32,
    pub exhausted: u32,
}

/// Lifetime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub uploads: u64,
    pub hits: u64,
    pub evictions: u64,
    pub exhausted: u64,
}

/// Brick pool managing device storage with creation-time eviction.
pub struct BrickPool<S: BrickStorage> {
    storage: S,
    index: Arc<BrickIndex>,
    format: VoxelFormat,
    filter: FilterMode,
    /// Slot size in voxels (largest brick including overlap)
    slot_size: UVec3,
    /// Slots per axis
    slot_grid: UVec3,
    slots: Vec<PoolSlot>,
    /// Brick ID -> slot index or NOT_RESIDENT
    brick_to_slot: Vec<u32>,
    resident: u32,
    protected: HashSet<BrickId>,
    visibility: Option<Arc<VisibilitySnapshot>>,
    visibility_updated: bool,
    metadata: MetadataTexture,
    full_upload_ratio: f32,
    tick: u64,
    stats: PoolStats,
}

impl<S: BrickStorage> BrickPool<S> {
    /// Validate the requested layout against the device and allocate.
    ///
    /// Nothing is allocated when validation fails.
    pub fn new(mut storage: S, index: Arc<BrickIndex>, config: &PoolConfig) -> Result<Self> {
        let limits = storage.limits();
        let requested = UVec3::from_array(config.pool_size);
        if requested.max_element() > limits.max_texture_dimension_3d {
            return Err(Error::PoolCapacity {
                requested: requested.max_element(),
                limit: limits.max_texture_dimension_3d,
            });
        }

        let slot_size = index.max_brick_size();
        let slot_grid = requested / slot_size;
        if slot_grid.cmpeq(UVec3::ZERO).any() {
            return Err(Error::PoolTooSmall { pool: requested, brick: slot_size });
        }
        let capacity = slot_grid.x as u64 * slot_grid.y as u64 * slot_grid.z as u64;
        if capacity > MAX_SLOTS as u64 {
            return Err(Error::PoolCapacity {
                requested: capacity.min(u32::MAX as u64) as u32,
                limit: MAX_SLOTS,
            });
        }
        if index.level_count() as usize > MAX_LEVELS {
            return Err(Error::LevelCapacity {
                levels: index.level_count(),
                limit: MAX_LEVELS as u32,
            });
        }

        let lods = (0..index.total_brick_count()).map(|id| {
            index.from_id(BrickId(id)).map(|key| key.level).unwrap_or_default()
        });
        let metadata = MetadataTexture::new(lods);
        let meta_size = metadata.size();
        if meta_size.max_element() > limits.max_texture_dimension_2d {
            return Err(Error::MetadataCapacity {
                width: meta_size.x,
                height: meta_size.y,
                limit: limits.max_texture_dimension_2d,
            });
        }

        let pool_size = slot_grid * slot_size;
        storage.allocate(&PoolDescriptor {
            pool_size,
            format: config.voxel_format,
            metadata_size: meta_size,
            filter: config.filter,
        })?;

        log::info!(
            "Created brick pool: {} slots ({}x{}x{}) of {} voxels, {:.1}MB, metadata {}x{}",
            capacity,
            slot_grid.x,
            slot_grid.y,
            slot_grid.z,
            slot_size,
            (pool_size.as_u64vec3().element_product() as usize * config.voxel_format.bytes_per_voxel()) as f64
                / (1024.0 * 1024.0),
            meta_size.x,
            meta_size.y
        );

        Ok(Self {
            storage,
            format: config.voxel_format,
            filter: config.filter,
            slot_size,
            slot_grid,
            slots: vec![PoolSlot::default(); capacity as usize],
            brick_to_slot: vec![NOT_RESIDENT; index.total_brick_count() as usize],
            resident: 0,
            protected: HashSet::new(),
            visibility: None,
            visibility_updated: false,
            metadata,
            full_upload_ratio: config.metadata_full_upload_ratio,
            tick: 0,
            stats: PoolStats::default(),
            index,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn resident_count(&self) -> u32 {
        self.resident
    }

    pub fn slot_size(&self) -> UVec3 {
        self.slot_size
    }

    pub fn slot_grid(&self) -> UVec3 {
        self.slot_grid
    }

    pub fn slots(&self) -> &[PoolSlot] {
        &self.slots
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn index(&self) -> &Arc<BrickIndex> {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataTexture {
        &self.metadata
    }

    /// Voxel origin of a slot in the pool texture.
    pub fn slot_origin(&self, slot: u32) -> UVec3 {
        let grid = self.slot_grid;
        UVec3::new(slot % grid.x, (slot / grid.x) % grid.y, slot / (grid.x * grid.y)) * self.slot_size
    }

    pub fn is_resident(&self, id: BrickId) -> bool {
        self.slot_of(id).is_some()
    }

    pub fn slot_of(&self, id: BrickId) -> Option<u32> {
        match self.brick_to_slot.get(id.index()) {
            Some(&slot) if slot != NOT_RESIDENT => Some(slot),
            _ => None,
        }
    }

    /// Refresh a resident brick's creation tick. Returns false if not resident.
    pub fn touch(&mut self, id: BrickId) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        self.tick += 1;
        self.slots[slot as usize].created = self.tick;
        true
    }

    /// Replace the protected set with the bricks drawn this subframe.
    pub fn set_protected(&mut self, ids: impl IntoIterator<Item = BrickId>) {
        self.protected.clear();
        self.protected.extend(ids);
    }

    pub fn protect(&mut self, id: BrickId) {
        self.protected.insert(id);
    }

    pub fn is_protected(&self, id: BrickId) -> bool {
        self.protected.contains(&id)
    }

    /// Start a subframe with nothing protected.
    pub fn begin_subframe(&mut self) {
        self.protected.clear();
    }

    /// Make a brick resident.
    ///
    /// A resident brick is a cache hit and only refreshes recency. The
    /// payload must be exactly the brick's voxels including overlap.
    pub fn request_upload(&mut self, id: BrickId, payload: &[u8]) -> Result<UploadOutcome> {
        let key = self.index.from_id(id)?;
        if let Some(slot) = self.slot_of(id) {
            self.touch(id);
            self.stats.hits += 1;
            return Ok(UploadOutcome::Hit { slot });
        }

        let size = self.index.brick_voxel_size(key)?;
        if size.cmpgt(self.slot_size).any() {
            return Err(Error::BrickExceedsSlot { brick: size, slot: self.slot_size });
        }
        let expected = size.x as usize * size.y as usize * size.z as usize * self.format.bytes_per_voxel();
        if payload.len() != expected {
            return Err(Error::PayloadSize { expected, actual: payload.len() });
        }

        let Some(slot) = self.select_victim() else {
            self.stats.exhausted += 1;
            log::debug!("Pool exhausted, brick {} deferred", id.0);
            return Ok(UploadOutcome::PoolExhausted);
        };

        let evicted = match self.slots[slot as usize].state {
            SlotState::Resident(old) => {
                self.release(slot, old);
                log::trace!("Evicted brick {} from slot {}", old.0, slot);
                Some(old)
            }
            _ => None,
        };

        self.storage.write_brick(self.slot_origin(slot), size, payload)?;

        self.tick += 1;
        self.slots[slot as usize] = PoolSlot {
            state: SlotState::Resident(id),
            created: self.tick,
        };
        self.brick_to_slot[id.index()] = slot;
        self.resident += 1;
        let texel = self.metadata.get(id).with_slot(Some(slot));
        self.metadata.set(id, texel);
        self.stats.uploads += 1;
        log::trace!("Uploaded brick {} ({:?}) to slot {}", id.0, key, slot);

        Ok(UploadOutcome::Uploaded { slot, evicted })
    }

    /// Drop a brick from the pool. Returns false if it was not resident.
    pub fn evict(&mut self, id: BrickId) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        self.release(slot, id);
        true
    }

    /// Drop every resident brick, e.g. when payloads of another timestep
    /// are needed. Returns the number evicted.
    pub fn evict_all(&mut self) -> u32 {
        let resident: Vec<(u32, BrickId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| match s.state {
                SlotState::Resident(id) => Some((slot as u32, id)),
                _ => None,
            })
            .collect();
        for &(slot, id) in &resident {
            self.release(slot, id);
        }
        self.protected.clear();
        resident.len() as u32
    }

    fn release(&mut self, slot: u32, id: BrickId) {
        self.slots[slot as usize].state = SlotState::Evicted;
        self.brick_to_slot[id.index()] = NOT_RESIDENT;
        self.resident -= 1;
        let texel = self.metadata.get(id).with_slot(None);
        self.metadata.set(id, texel);
        self.stats.evictions += 1;
    }

    /// Eviction class of a slot; lower is evicted first.
    fn victim_class(&self, slot: &PoolSlot) -> Option<u8> {
        match slot.state {
            SlotState::Unused | SlotState::Evicted => Some(0),
            SlotState::Resident(id) if self.protected.contains(&id) => None,
            SlotState::Resident(id) => match &self.visibility {
                Some(snapshot) if !snapshot.is_needed(id) => Some(1),
                _ => Some(2),
            },
        }
    }

    fn select_victim(&self) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| self.victim_class(slot).map(|class| (class, slot.created, i as u32)))
            .min()
            .map(|(_, _, i)| i)
    }

    /// Seed the pool with the single coarsest brick.
    pub fn upload_first_brick<F>(&mut self, mut fetch: F) -> Result<UploadOutcome>
    where
        F: FnMut(BrickKey, &mut Vec<u8>) -> Result<()>,
    {
        let key = BrickKey::new(self.index.coarsest_level(), 0, 0, 0);
        let id = self.index.to_id(key)?;
        if let Some(slot) = self.slot_of(id) {
            return Ok(UploadOutcome::Hit { slot });
        }
        let mut payload = Vec::new();
        fetch(key, &mut payload)?;
        self.request_upload(id, &payload)
    }

    /// Make a list of bricks resident, fetching only misses.
    ///
    /// `scratch` is reused across fetches.
    pub fn upload_bricks<F>(&mut self, ids: &[BrickId], scratch: &mut Vec<u8>, mut fetch: F) -> Result<UploadBatch>
    where
        F: FnMut(BrickKey, &mut Vec<u8>) -> Result<()>,
    {
        let mut batch = UploadBatch::default();
        for &id in ids {
            if self.touch(id) {
                self.stats.hits += 1;
                batch.hits += 1;
                continue;
            }
            fetch(self.index.from_id(id)?, scratch)?;
            match self.request_upload(id, scratch)? {
                UploadOutcome::Hit { .. } => batch.hits += 1,
                UploadOutcome::Uploaded { .. } => batch.uploaded += 1,
                UploadOutcome::PoolExhausted => batch.exhausted += 1,
            }
        }
        if batch.uploaded > 0 || batch.exhausted > 0 {
            log::debug!(
                "Brick upload: {} new, {} hits, {} deferred, {}/{} resident",
                batch.uploaded,
                batch.hits,
                batch.exhausted,
                self.resident,
                self.capacity()
            );
        }
        Ok(batch)
    }

    /// Merge a published visibility snapshot into the metadata texture.
    ///
    /// Emptiness bits come from the snapshot; residency always comes from
    /// the pool. Resident bricks the snapshot marks as not needed become
    /// preferred eviction victims.
    pub fn apply_visibility(&mut self, snapshot: Arc<VisibilitySnapshot>) {
        let mut unneeded = 0u32;
        for (id, flags) in snapshot.all_flags().iter().enumerate() {
            let id = BrickId(id as u32);
            let texel = self
                .metadata
                .get(id)
                .with_emptiness(!flags.contains_data(), flags.all_descendants_empty());
            self.metadata.set(id, texel);
            if self.is_resident(id) && !flags.is_needed() {
                unneeded += 1;
            }
        }
        log::debug!(
            "Applied visibility v{} (generation {}): {} dirty texels, {} resident bricks not needed",
            snapshot.version,
            snapshot.generation,
            self.metadata.dirty_count(),
            unneeded
        );
        self.visibility = Some(snapshot);
        self.visibility_updated = true;
    }

    /// Whether the metadata includes emptiness for the whole hierarchy.
    pub fn is_visibility_updated(&self) -> bool {
        self.visibility_updated
    }

    /// Forget visibility, e.g. after the classification changed.
    pub fn clear_visibility(&mut self) {
        self.visibility = None;
        self.visibility_updated = false;
    }

    pub fn visibility(&self) -> Option<&Arc<VisibilitySnapshot>> {
        self.visibility.as_ref()
    }

    pub fn upload_metadata_texel(&mut self, id: BrickId) -> Result<()> {
        self.metadata.upload_texel(&mut self.storage, id)
    }

    pub fn upload_metadata_texture(&mut self) -> Result<()> {
        self.metadata.upload_all(&mut self.storage)
    }

    /// Push metadata changes, texel by texel or as a whole.
    pub fn flush_metadata(&mut self) -> Result<MetadataFlush> {
        self.metadata.flush(&mut self.storage, self.full_upload_ratio)
    }

    pub fn uniforms(&self) -> PoolUniforms {
        let mut uniforms = PoolUniforms::default();
        let pool_size = (self.slot_grid * self.slot_size).as_vec3();
        let finest = self.index.domain_size(0).unwrap_or(UVec3::ONE);
        uniforms.pool_capacity = [self.slot_grid.x, self.slot_grid.y, self.slot_grid.z, self.capacity()];
        uniforms.slot_size = (self.slot_size.as_vec3() / pool_size).extend(0.0).to_array();
        uniforms.volume_size = [finest.x, finest.y, finest.z, self.index.level_count()];
        uniforms.metadata = [self.metadata.size().x, self.filter as u32, 0, 0];

        let offsets = self.index.level_offsets();
        for level in 0..self.index.level_count().min(MAX_LEVELS as u32) {
            let (Ok(count), Ok(domain)) = (self.index.brick_count(level), self.index.domain_size(level)) else {
                continue;
            };
            uniforms.levels[level as usize] = [count.x, count.y, count.z, offsets[level as usize]];
            uniforms.lod_factors[level as usize] = (finest.as_vec3() / domain.as_vec3()).extend(0.0).to_array();
        }
        uniforms
    }

    /// Bind the pool for the shading stage until the guard drops.
    ///
    /// Pending metadata is flushed first. The guard borrows the pool, so
    /// no uploads can happen while it is bound.
    pub fn enable(&mut self) -> Result<PoolBinding<'_, S>> {
        self.flush_metadata()?;
        let uniforms = self.uniforms();
        self.storage.bind(&uniforms)?;
        Ok(PoolBinding { storage: &mut self.storage })
    }

    pub fn set_filter_mode(&mut self, filter: FilterMode) {
        self.filter = filter;
        self.storage.set_filter_mode(filter);
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.filter
    }

    /// Host memory held for bookkeeping, in bytes.
    pub fn cpu_size(&self) -> u64 {
        (self.slots.len() * std::mem::size_of::<PoolSlot>()
            + self.brick_to_slot.len() * std::mem::size_of::<u32>()
            + self.metadata.len() * std::mem::size_of::<u32>()) as u64
    }

    /// Device memory of the pool and metadata textures plus uniforms, in bytes.
    pub fn gpu_size(&self) -> u64 {
        let pool = (self.slot_grid * self.slot_size).as_u64vec3().element_product()
            * self.format.bytes_per_voxel() as u64;
        let meta = self.metadata.size().as_u64vec2().element_product() * std::mem::size_of::<u32>() as u64;
        pool + meta + std::mem::size_of::<PoolUniforms>() as u64
    }

    pub fn get_shader_fragment(&self, bindings: ShaderBindings) -> String {
        shader::pool_fragment(bindings)
    }

    /// Position of a brick's texel in the metadata texture.
    pub fn metadata_position(&self, id: BrickId) -> UVec2 {
        self.metadata.position(id)
    }
}

/// Scoped binding of the pool; unbinds on drop.
pub struct PoolBinding<'a, S: BrickStorage> {
    storage: &'a mut S,
}

impl<S: BrickStorage> PoolBinding<'_, S> {
    pub fn storage(&self) -> &S {
        &*self.storage
    }
}

impl<S: BrickStorage> Drop for PoolBinding<'_, S> {
    fn drop(&mut self) {
        self.storage.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::storage::{HostBrickStorage, StorageLimits};
    use crate::visibility::{BrickFlags, Classification, ClassifyStats};
    use crate::volume::LevelLayout;
    use crate::core::types::Vec3;

    /// Level 0: 4x2x1 bricks, level 1: 2x1x1, level 2: 1 brick; 8^3 voxel bricks
    fn index() -> Arc<BrickIndex> {
        let levels = vec![
            LevelLayout { domain_size: UVec3::new(32, 16, 8), brick_count: UVec3::new(4, 2, 1) },
            LevelLayout { domain_size: UVec3::new(16, 8, 4), brick_count: UVec3::new(2, 1, 1) },
            LevelLayout { domain_size: UVec3::new(8, 4, 2), brick_count: UVec3::new(1, 1, 1) },
        ];
        Arc::new(BrickIndex::new(levels, UVec3::splat(8), UVec3::ZERO, Vec3::ONE))
    }

    fn config(pool_size: [u32; 3]) -> PoolConfig {
        PoolConfig {
            pool_size,
            metadata_full_upload_ratio: 0.25,
            ..Default::default()
        }
    }

    /// Pool of 4 slots (2x2x1 grid of 8^3 slots)
    fn pool() -> BrickPool<HostBrickStorage> {
        BrickPool::new(HostBrickStorage::new(), index(), &config([16, 16, 8])).unwrap()
    }

    fn payload(pool: &BrickPool<HostBrickStorage>, id: BrickId) -> Vec<u8> {
        let key = pool.index().from_id(id).unwrap();
        let size = pool.index().brick_voxel_size(key).unwrap();
        vec![id.0 as u8 + 1; (size.x * size.y * size.z) as usize]
    }

    fn upload(pool: &mut BrickPool<HostBrickStorage>, id: u32) -> UploadOutcome {
        let data = payload(pool, BrickId(id));
        pool.request_upload(BrickId(id), &data).unwrap()
    }

    fn snapshot(index: &BrickIndex, needed: &[u32]) -> Arc<VisibilitySnapshot> {
        let flags = (0..index.total_brick_count())
            .map(|id| BrickFlags::new(true, false, needed.contains(&id)))
            .collect();
        Arc::new(VisibilitySnapshot::new(
            0,
            1,
            0,
            Classification::IsoThreshold(0.5),
            ClassifyStats::default(),
            flags,
        ))
    }

    #[test]
    fn test_layout() {
        let pool = pool();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.slot_grid(), UVec3::new(2, 2, 1));
        assert_eq!(pool.slot_origin(0), UVec3::ZERO);
        assert_eq!(pool.slot_origin(1), UVec3::new(8, 0, 0));
        assert_eq!(pool.slot_origin(3), UVec3::new(8, 8, 0));
        assert!(pool.storage().is_allocated());
    }

    #[test]
    fn test_resident_after_upload() {
        let mut pool = pool();
        let index = pool.index().clone();
        let key = BrickKey::new(0, 3, 1, 0);
        let id = index.to_id(key).unwrap();
        assert!(!pool.is_resident(id));

        let outcome = upload(&mut pool, id.0);
        assert!(matches!(outcome, UploadOutcome::Uploaded { evicted: None, .. }));
        assert!(pool.is_resident(index.to_id(index.from_id(id).unwrap()).unwrap()));

        let slot = pool.slot_of(id).unwrap();
        let texel = pool.metadata().get(id);
        assert_eq!(texel.slot(), Some(slot));
        assert_eq!(pool.storage().voxel(pool.slot_origin(slot)), Some(&[id.0 as u8 + 1][..]));
    }

    #[test]
    fn test_upload_is_idempotent() {
        let mut pool = pool();
        let first = upload(&mut pool, 2);
        let second = upload(&mut pool, 2);
        let UploadOutcome::Uploaded { slot, .. } = first else {
            panic!("expected upload, got {:?}", first);
        };
        assert_eq!(second, UploadOutcome::Hit { slot });
        assert_eq!(pool.resident_count(), 1);
        assert_eq!(pool.storage().brick_writes(), 1);
        let used = pool.slots().iter().filter(|s| matches!(s.state, SlotState::Resident(_))).count();
        assert_eq!(used, 1);
    }

    #[test]
    fn test_five_uploads_into_four_slots() {
        let mut pool = pool();
        for id in 0..4 {
            upload(&mut pool, id);
        }
        assert_eq!(pool.resident_count(), 4);

        let outcome = upload(&mut pool, 4);
        assert_eq!(outcome, UploadOutcome::Uploaded { slot: 0, evicted: Some(BrickId(0)) });
        assert_eq!(pool.resident_count(), 4);
        assert!(!pool.is_resident(BrickId(0)));
        for id in 1..5 {
            assert!(pool.is_resident(BrickId(id)));
        }
        assert_eq!(pool.metadata().get(BrickId(0)).slot(), None);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[test]
    fn test_cache_hit_refreshes_recency() {
        let mut pool = pool();
        for id in 0..4 {
            upload(&mut pool, id);
        }
        // Brick 0 is used again, so brick 1 becomes the oldest
        upload(&mut pool, 0);
        let outcome = upload(&mut pool, 4);
        assert_eq!(outcome, UploadOutcome::Uploaded { slot: 1, evicted: Some(BrickId(1)) });
    }

    #[test]
    fn test_protected_never_evicted() {
        let mut pool = pool();
        for id in 0..4 {
            upload(&mut pool, id);
        }
        pool.set_protected([BrickId(0), BrickId(1)]);
        assert_eq!(
            upload(&mut pool, 4),
            UploadOutcome::Uploaded { slot: 2, evicted: Some(BrickId(2)) }
        );
        assert_eq!(
            upload(&mut pool, 5),
            UploadOutcome::Uploaded { slot: 3, evicted: Some(BrickId(3)) }
        );

        pool.set_protected((0..6).map(BrickId));
        assert_eq!(upload(&mut pool, 6), UploadOutcome::PoolExhausted);
        assert!(pool.is_resident(BrickId(0)));
        assert!(pool.is_resident(BrickId(1)));
        assert!(!pool.is_resident(BrickId(6)));

        pool.begin_subframe();
        assert!(upload(&mut pool, 6).is_resident());
    }

    #[test]
    fn test_unneeded_bricks_evicted_first() {
        let mut pool = pool();
        for id in 0..4 {
            upload(&mut pool, id);
        }
        let index = pool.index().clone();
        // Only brick 3 dropped out of view; it goes before the older bricks
        pool.apply_visibility(snapshot(&index, &[0, 1, 2, 4]));
        assert_eq!(
            upload(&mut pool, 4),
            UploadOutcome::Uploaded { slot: 3, evicted: Some(BrickId(3)) }
        );
        assert!(pool.is_visibility_updated());
    }

    #[test]
    fn test_evicted_slot_reused_first() {
        let mut pool = pool();
        for id in 0..4 {
            upload(&mut pool, id);
        }
        assert!(pool.evict(BrickId(2)));
        assert!(!pool.evict(BrickId(2)));
        assert_eq!(pool.slots()[2].state, SlotState::Evicted);
        assert_eq!(
            upload(&mut pool, 5),
            UploadOutcome::Uploaded { slot: 2, evicted: None }
        );
    }

    #[test]
    fn test_evict_all() {
        let mut pool = pool();
        for id in 0..3 {
            upload(&mut pool, id);
        }
        pool.protect(BrickId(0));
        assert_eq!(pool.evict_all(), 3);
        assert_eq!(pool.resident_count(), 0);
        assert!(!pool.is_protected(BrickId(0)));
        assert!((0..3).all(|id| !pool.metadata().get(BrickId(id)).is_resident()));
    }

    #[test]
    fn test_bad_uploads_rejected() {
        let mut pool = pool();
        assert!(matches!(
            pool.request_upload(BrickId(0), &[0; 7]),
            Err(Error::PayloadSize { expected: 512, actual: 7 })
        ));
        assert!(matches!(
            pool.request_upload(BrickId(99), &[]),
            Err(Error::InvalidBrickId(99))
        ));
        assert_eq!(pool.resident_count(), 0);
    }

    #[test]
    fn test_capacity_errors_at_construction() {
        let limits = StorageLimits { max_texture_dimension_3d: 64, max_texture_dimension_2d: 2 };

        let storage = HostBrickStorage::with_limits(limits);
        let result = BrickPool::new(storage, index(), &config([128, 8, 8]));
        assert!(matches!(result, Err(Error::PoolCapacity { requested: 128, limit: 64 })));

        let storage = HostBrickStorage::with_limits(limits);
        let result = BrickPool::new(storage, index(), &config([4, 8, 8]));
        assert!(matches!(result, Err(Error::PoolTooSmall { .. })));

        // 11 bricks need a 4x3 metadata texture
        let storage = HostBrickStorage::with_limits(limits);
        let result = BrickPool::new(storage, index(), &config([16, 16, 8]));
        assert!(matches!(result, Err(Error::MetadataCapacity { width: 4, height: 3, limit: 2 })));
    }

    #[test]
    fn test_enable_guard_unbinds() {
        let mut pool = pool();
        upload(&mut pool, 0);
        {
            let binding = pool.enable().unwrap();
            assert!(binding.storage().is_bound());
            let uniforms = binding.storage().uniforms().unwrap();
            assert_eq!(uniforms.pool_capacity, [2, 2, 1, 4]);
            assert_eq!(uniforms.levels[1], [2, 1, 1, 8]);
            assert_eq!(uniforms.volume_size, [32, 16, 8, 3]);
        }
        assert!(!pool.storage().is_bound());
        // Metadata was flushed on enable
        assert_eq!(pool.metadata().dirty_count(), 0);
    }

    #[test]
    fn test_enable_failure_leaves_unbound() {
        fn bind_and_bail(pool: &mut BrickPool<HostBrickStorage>) -> Result<()> {
            let _binding = pool.enable()?;
            Err(Error::Worker("early return".into()))
        }
        let mut pool = pool();
        assert!(bind_and_bail(&mut pool).is_err());
        assert!(!pool.storage().is_bound());
    }

    #[test]
    fn test_incremental_metadata_after_upload() {
        let mut pool = pool();
        assert_eq!(pool.flush_metadata().unwrap(), MetadataFlush::Full);
        upload(&mut pool, 5);
        assert_eq!(pool.flush_metadata().unwrap(), MetadataFlush::Texels(1));

        let id = BrickId(5);
        let pos = pool.metadata_position(id);
        assert_eq!(pool.storage().metadata_texel(pos), Some(pool.metadata().get(id).0));

        pool.upload_metadata_texel(id).unwrap();
        pool.upload_metadata_texture().unwrap();
        assert_eq!(pool.flush_metadata().unwrap(), MetadataFlush::Clean);
    }

    #[test]
    fn test_apply_visibility_sets_emptiness() {
        let mut pool = pool();
        let index = pool.index().clone();
        let flags = (0..index.total_brick_count())
            .map(|id| BrickFlags::new(id != 3, id == 3, true))
            .collect();
        let snapshot = Arc::new(VisibilitySnapshot::new(
            0, 1, 0, Classification::IsoThreshold(0.5), ClassifyStats::default(), flags,
        ));
        pool.apply_visibility(snapshot);
        assert!(pool.metadata().get(BrickId(3)).is_empty());
        assert!(pool.metadata().get(BrickId(3)).all_descendants_empty());
        assert!(!pool.metadata().get(BrickId(2)).is_empty());
        // LOD survives the merge
        assert_eq!(pool.metadata().get(BrickId(10)).lod(), 2);
    }

    #[test]
    fn test_first_brick_and_batch() {
        let mut pool = pool();
        let index = pool.index().clone();
        let fetch = |key: BrickKey, out: &mut Vec<u8>| -> Result<()> {
            let size = index.brick_voxel_size(key)?;
            out.clear();
            out.resize((size.x * size.y * size.z) as usize, key.level as u8);
            Ok(())
        };

        let first = pool.upload_first_brick(fetch).unwrap();
        assert!(first.is_resident());
        assert!(pool.is_resident(BrickId(10)));

        let mut scratch = Vec::new();
        let batch = pool
            .upload_bricks(&[BrickId(10), BrickId(8), BrickId(9)], &mut scratch, fetch)
            .unwrap();
        assert_eq!(batch, UploadBatch { uploaded: 2, hits: 1, exhausted: 0 });
        assert_eq!(pool.resident_count(), 3);
    }

    #[test]
    fn test_sizes() {
        let mut pool = pool();
        assert_eq!(pool.gpu_size(), 16 * 16 * 8 + 4 * 3 * 4 + std::mem::size_of::<PoolUniforms>() as u64);
        assert!(pool.cpu_size() > 0);
        pool.set_filter_mode(FilterMode::Nearest);
        assert_eq!(pool.storage().filter_mode(), FilterMode::Nearest);
        assert_eq!(pool.uniforms().metadata[1], FilterMode::Nearest as u32);
    }
}
