//! WGSL declarations and helpers for sampling the brick pool.

use super::metadata::{CHILD_EMPTY_BIT, EMPTY_BIT, LOD_MASK, LOD_SHIFT, RESIDENT_BIT, SLOT_MASK};
use super::storage::MAX_LEVELS;

/// Bind group slots the shading stage assigned to the pool resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderBindings {
    pub group: u32,
    pub uniforms: u32,
    pub pool_texture: u32,
    pub pool_sampler: u32,
    pub metadata_texture: u32,
}

impl Default for ShaderBindings {
    fn default() -> Self {
        Self {
            group: 0,
            uniforms: 0,
            pool_texture: 1,
            pool_sampler: 2,
            metadata_texture: 3,
        }
    }
}

/// Generate the WGSL the shading stage prepends to its own code.
///
/// Declares the pool uniforms, the pool and metadata textures, and
/// functions to look up a brick's metadata and sample inside its slot.
pub fn pool_fragment(bindings: ShaderBindings) -> String {
    let mut src = String::new();
    let g = bindings.group;

    src.push_str(&format!(
        "const BRICK_RESIDENT: u32 = {:#x}u;
const BRICK_EMPTY: u32 = {:#x}u;
const BRICK_CHILD_EMPTY: u32 = {:#x}u;
const BRICK_LOD_SHIFT: u32 = {}u;
const BRICK_LOD_MASK: u32 = {:#x}u;
const BRICK_SLOT_MASK: u32 = {:#x}u;
const POOL_MAX_LEVELS: u32 = {}u;

",
        RESIDENT_BIT, EMPTY_BIT, CHILD_EMPTY_BIT, LOD_SHIFT, LOD_MASK, SLOT_MASK, MAX_LEVELS
    ));

    src.push_str(&format!(
        r#"struct PoolUniforms {{
    pool_capacity: vec4<u32>,
    slot_size: vec4<f32>,
    volume_size: vec4<u32>,
    metadata: vec4<u32>,
    levels: array<vec4<u32>, {max_levels}>,
    lod_factors: array<vec4<f32>, {max_levels}>,
}}

@group({g}) @binding({uniforms}) var<uniform> pool: PoolUniforms;
@group({g}) @binding({texture}) var pool_texture: texture_3d<f32>;
@group({g}) @binding({sampler}) var pool_sampler: sampler;
@group({g}) @binding({metadata}) var brick_metadata: texture_2d<u32>;

fn brick_id(level: u32, coord: vec3<u32>) -> u32 {{
    let info = pool.levels[level];
    return info.w + coord.x + coord.y * info.x + coord.z * info.x * info.y;
}}

fn brick_texel(id: u32) -> u32 {{
    let width = pool.metadata.x;
    return textureLoad(brick_metadata, vec2<i32>(i32(id % width), i32(id / width)), 0).r;
}}

fn brick_is_resident(texel: u32) -> bool {{
    return (texel & BRICK_RESIDENT) != 0u;
}}

fn brick_is_empty(texel: u32) -> bool {{
    return (texel & BRICK_EMPTY) != 0u;
}}

fn brick_subtree_empty(texel: u32) -> bool {{
    return (texel & BRICK_CHILD_EMPTY) != 0u;
}}

fn brick_lod(texel: u32) -> u32 {{
    return (texel >> BRICK_LOD_SHIFT) & BRICK_LOD_MASK;
}}

fn slot_origin(texel: u32) -> vec3<f32> {{
    let slot = texel & BRICK_SLOT_MASK;
    let grid = pool.pool_capacity.xyz;
    let cell = vec3<u32>(slot % grid.x, (slot / grid.x) % grid.y, slot / (grid.x * grid.y));
    return vec3<f32>(cell) * pool.slot_size.xyz;
}}

// uvw is the position inside the brick in [0, 1], already inset to trim overlap
fn sample_brick(texel: u32, uvw: vec3<f32>, brick_extent: vec3<f32>) -> f32 {{
    let pos = slot_origin(texel) + uvw * brick_extent;
    return textureSampleLevel(pool_texture, pool_sampler, pos, 0.0).r;
}}
"#,
        max_levels = MAX_LEVELS,
        g = g,
        uniforms = bindings.uniforms,
        texture = bindings.pool_texture,
        sampler = bindings.pool_sampler,
        metadata = bindings.metadata_texture,
    ));
    src
}
