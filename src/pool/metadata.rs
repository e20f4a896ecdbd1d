//! Per-brick metadata texture for empty-space skipping.
//!
//! One 32-bit texel per brick ID:
//!
//! | bits   | meaning                         |
//! |--------|---------------------------------|
//! | 31     | resident                        |
//! | 30     | brick holds nothing visible     |
//! | 29     | all descendants hold nothing    |
//! | 24..29 | LOD index                       |
//! | 0..24  | pool slot (valid when resident) |
//!
//! Texel `id` lives at `(id % width, id / width)` of a near-square 2D texture.

use crate::core::types::{Result, UVec2};
use crate::volume::BrickId;
use super::storage::BrickStorage;

pub const RESIDENT_BIT: u32 = 1 << 31;
pub const EMPTY_BIT: u32 = 1 << 30;
pub const CHILD_EMPTY_BIT: u32 = 1 << 29;
pub const LOD_SHIFT: u32 = 24;
pub const LOD_MASK: u32 = 0x1f;
pub const SLOT_MASK: u32 = (1 << LOD_SHIFT) - 1;
/// Slots addressable by the texel's slot field
pub const MAX_SLOTS: u32 = 1 << LOD_SHIFT;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MetadataTexel(pub u32);

impl MetadataTexel {
    pub fn new(lod: u32) -> Self {
        Self((lod & LOD_MASK) << LOD_SHIFT)
    }

    pub fn is_resident(self) -> bool {
        self.0 & RESIDENT_BIT != 0
    }

    pub fn slot(self) -> Option<u32> {
        self.is_resident().then_some(self.0 & SLOT_MASK)
    }

    pub fn is_empty(self) -> bool {
        self.0 & EMPTY_BIT != 0
    }

    pub fn all_descendants_empty(self) -> bool {
        self.0 & CHILD_EMPTY_BIT != 0
    }

    pub fn lod(self) -> u32 {
        (self.0 >> LOD_SHIFT) & LOD_MASK
    }

    pub fn with_slot(self, slot: Option<u32>) -> Self {
        let bits = self.0 & !(RESIDENT_BIT | SLOT_MASK);
        match slot {
            Some(slot) => Self(bits | RESIDENT_BIT | (slot & SLOT_MASK)),
            None => Self(bits),
        }
    }

    pub fn with_emptiness(self, empty: bool, all_descendants_empty: bool) -> Self {
        let mut bits = self.0 & !(EMPTY_BIT | CHILD_EMPTY_BIT);
        if empty {
            bits |= EMPTY_BIT;
        }
        if all_descendants_empty {
            bits |= CHILD_EMPTY_BIT;
        }
        Self(bits)
    }
}

/// Width and height of the metadata texture for `bricks` texels.
pub fn texture_size(bricks: u32) -> UVec2 {
    let bricks = bricks.max(1);
    let width = (bricks as f64).sqrt().ceil() as u32;
    UVec2::new(width, bricks.div_ceil(width))
}

/// How the last flush reached the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataFlush {
    Clean,
    Texels(u32),
    Full,
}

/// Host copy of the metadata texture with dirty tracking.
#[derive(Debug)]
pub struct MetadataTexture {
    texels: Vec<MetadataTexel>,
    size: UVec2,
    dirty: Vec<u32>,
    dirty_mask: Vec<bool>,
    full_dirty: bool,
}

impl MetadataTexture {
    /// One texel per brick, tagged with the brick's level.
    pub fn new(lods: impl IntoIterator<Item = u32>) -> Self {
        let texels: Vec<MetadataTexel> = lods.into_iter().map(MetadataTexel::new).collect();
        let size = texture_size(texels.len() as u32);
        let dirty_mask = vec![false; texels.len()];
        Self {
            texels,
            size,
            dirty: Vec::new(),
            dirty_mask,
            full_dirty: true,
        }
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.texels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    pub fn position(&self, id: BrickId) -> UVec2 {
        UVec2::new(id.0 % self.size.x, id.0 / self.size.x)
    }

    pub fn get(&self, id: BrickId) -> MetadataTexel {
        self.texels.get(id.index()).copied().unwrap_or_default()
    }

    /// Store a texel; returns true if it changed.
    pub fn set(&mut self, id: BrickId, texel: MetadataTexel) -> bool {
        let Some(slot) = self.texels.get_mut(id.index()) else {
            return false;
        };
        if *slot == texel {
            return false;
        }
        *slot = texel;
        if !self.dirty_mask[id.index()] {
            self.dirty_mask[id.index()] = true;
            self.dirty.push(id.0);
        }
        true
    }

    pub fn dirty_count(&self) -> usize {
        if self.full_dirty { self.texels.len() } else { self.dirty.len() }
    }

    /// Force the next flush to upload the whole texture.
    pub fn mark_all_dirty(&mut self) {
        self.full_dirty = true;
    }

    /// Upload one texel immediately.
    pub fn upload_texel<S: BrickStorage>(&mut self, storage: &mut S, id: BrickId) -> Result<()> {
        let texel = self
            .texels
            .get(id.index())
            .copied()
            .ok_or(crate::core::Error::InvalidBrickId(id.0))?;
        storage.write_metadata(self.position(id), UVec2::ONE, &[texel.0])?;
        if self.dirty_mask[id.index()] {
            self.dirty_mask[id.index()] = false;
            self.dirty.retain(|&dirty| dirty != id.0);
        }
        Ok(())
    }

    /// Upload the whole texture, padding the last row.
    pub fn upload_all<S: BrickStorage>(&mut self, storage: &mut S) -> Result<()> {
        let mut texels: Vec<u32> = self.texels.iter().map(|t| t.0).collect();
        texels.resize((self.size.x * self.size.y) as usize, 0);
        storage.write_metadata(UVec2::ZERO, self.size, &texels)?;
        self.clear_dirty();
        Ok(())
    }

    /// Push pending changes, as single texels or as a full upload when
    /// more than `full_ratio` of all texels changed.
    pub fn flush<S: BrickStorage>(&mut self, storage: &mut S, full_ratio: f32) -> Result<MetadataFlush> {
        if !self.full_dirty && self.dirty.is_empty() {
            return Ok(MetadataFlush::Clean);
        }
        if self.full_dirty || self.dirty.len() as f32 > full_ratio * self.texels.len() as f32 {
            self.upload_all(storage)?;
            return Ok(MetadataFlush::Full);
        }

        let count = self.dirty.len() as u32;
        for &id in &self.dirty {
            let pos = UVec2::new(id % self.size.x, id / self.size.x);
            storage.write_metadata(pos, UVec2::ONE, &[self.texels[id as usize].0])?;
        }
        self.clear_dirty();
        Ok(MetadataFlush::Texels(count))
    }

    fn clear_dirty(&mut self) {
        for &id in &self.dirty {
            self.dirty_mask[id as usize] = false;
        }
        self.dirty.clear();
        self.full_dirty = false;
    }
}
