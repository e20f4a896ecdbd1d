//! wgpu-backed pool storage

use crate::core::error::Error;
use crate::core::types::{Result, UVec2, UVec3};
use crate::volume::VoxelFormat;
use super::shader::ShaderBindings;
use super::storage::{BrickStorage, FilterMode, PoolDescriptor, PoolUniforms, StorageLimits};

/// Create a device without a surface, for offscreen streaming.
pub async fn request_headless_device() -> Result<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

    let adapter_limits = adapter.limits();
    let optional = adapter.features() & wgpu::Features::TEXTURE_FORMAT_16BIT_NORM;

    let device_desc = wgpu::DeviceDescriptor {
        label: Some("volstream_device"),
        required_features: optional,
        required_limits: wgpu::Limits {
            max_texture_dimension_3d: adapter_limits.max_texture_dimension_3d,
            max_texture_dimension_2d: adapter_limits.max_texture_dimension_2d,
            ..Default::default()
        },
        memory_hints: wgpu::MemoryHints::Performance,
        experimental_features: Default::default(),
        trace: Default::default(),
    };

    let (device, queue) = adapter
        .request_device(&device_desc)
        .await
        .map_err(|e| Error::Gpu(e.to_string()))?;

    log::info!(
        "GPU texture limits: 3D {} voxels, 2D {} texels",
        adapter_limits.max_texture_dimension_3d,
        adapter_limits.max_texture_dimension_2d
    );
    Ok((device, queue))
}

fn texture_format(format: VoxelFormat) -> wgpu::TextureFormat {
    match format {
        VoxelFormat::R8 => wgpu::TextureFormat::R8Unorm,
        VoxelFormat::R16 => wgpu::TextureFormat::R16Unorm,
        VoxelFormat::R32F => wgpu::TextureFormat::R32Float,
    }
}

/// Textures created by `allocate`.
struct PoolTextures {
    desc: PoolDescriptor,
    pool: wgpu::Texture,
    pool_view: wgpu::TextureView,
    metadata: wgpu::Texture,
    metadata_view: wgpu::TextureView,
    layout: wgpu::BindGroupLayout,
}

/// Pool texture, metadata texture and uniforms on a wgpu device.
pub struct GpuBrickStorage {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bindings: ShaderBindings,
    uniform_buffer: wgpu::Buffer,
    textures: Option<PoolTextures>,
    sampler: wgpu::Sampler,
    filter: FilterMode,
    bind_group: Option<wgpu::BindGroup>,
    bound: bool,
}

impl GpuBrickStorage {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, bindings: ShaderBindings) -> Self {
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pool_uniforms"),
            size: std::mem::size_of::<PoolUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let filter = FilterMode::default();
        let sampler = Self::create_sampler(device, filter);

        Self {
            device: device.clone(),
            queue: queue.clone(),
            bindings,
            uniform_buffer,
            textures: None,
            sampler,
            filter,
            bind_group: None,
            bound: false,
        }
    }

    fn create_sampler(device: &wgpu::Device, filter: FilterMode) -> wgpu::Sampler {
        let filter = match filter {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        };
        device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("pool_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        })
    }

    /// Layout of the pool bind group, once allocated.
    pub fn bind_group_layout(&self) -> Option<&wgpu::BindGroupLayout> {
        self.textures.as_ref().map(|t| &t.layout)
    }

    /// Bind group for the shading stage; present while bound.
    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        if self.bound { self.bind_group.as_ref() } else { None }
    }

    pub fn pool_texture(&self) -> Option<&wgpu::Texture> {
        self.textures.as_ref().map(|t| &t.pool)
    }

    pub fn metadata_texture(&self) -> Option<&wgpu::Texture> {
        self.textures.as_ref().map(|t| &t.metadata)
    }

    fn textures(&self) -> Result<&PoolTextures> {
        self.textures
            .as_ref()
            .ok_or_else(|| Error::Gpu("pool storage not allocated".into()))
    }

    fn create_layout(&self, filterable: bool) -> wgpu::BindGroupLayout {
        let b = self.bindings;
        self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pool_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: b.uniforms,
                    visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: b.pool_texture,
                    visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: b.pool_sampler,
                    visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(if filterable {
                        wgpu::SamplerBindingType::Filtering
                    } else {
                        wgpu::SamplerBindingType::NonFiltering
                    }),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: b.metadata_texture,
                    visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Uint,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        })
    }
}

impl BrickStorage for GpuBrickStorage {
    fn limits(&self) -> StorageLimits {
        let limits = self.device.limits();
        StorageLimits {
            max_texture_dimension_3d: limits.max_texture_dimension_3d,
            max_texture_dimension_2d: limits.max_texture_dimension_2d,
        }
    }

    fn allocate(&mut self, desc: &PoolDescriptor) -> Result<()> {
        if desc.format == VoxelFormat::R16
            && !self.device.features().contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM)
        {
            return Err(Error::Gpu("16-bit normalized textures are not supported by this device".into()));
        }
        // 32-bit float textures are not filterable without an extra feature
        let filterable = desc.format != VoxelFormat::R32F;
        if !filterable && self.filter == FilterMode::Linear {
            self.filter = FilterMode::Nearest;
            self.sampler = Self::create_sampler(&self.device, self.filter);
        }

        let pool = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("brick_pool"),
            size: wgpu::Extent3d {
                width: desc.pool_size.x,
                height: desc.pool_size.y,
                depth_or_array_layers: desc.pool_size.z,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: texture_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let metadata = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("brick_metadata"),
            size: wgpu::Extent3d {
                width: desc.metadata_size.x,
                height: desc.metadata_size.y,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let pool_view = pool.create_view(&wgpu::TextureViewDescriptor::default());
        let metadata_view = metadata.create_view(&wgpu::TextureViewDescriptor::default());
        let layout = self.create_layout(filterable);

        self.textures = Some(PoolTextures {
            desc: *desc,
            pool,
            pool_view,
            metadata,
            metadata_view,
            layout,
        });
        self.bind_group = None;
        if filterable {
            self.set_filter_mode(desc.filter);
        }
        Ok(())
    }

    fn write_brick(&mut self, origin: UVec3, size: UVec3, data: &[u8]) -> Result<()> {
        let textures = self.textures()?;
        let bpp = textures.desc.format.bytes_per_voxel() as u32;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &textures.pool,
                mip_level: 0,
                origin: wgpu::Origin3d { x: origin.x, y: origin.y, z: origin.z },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.x * bpp),
                rows_per_image: Some(size.y),
            },
            wgpu::Extent3d {
                width: size.x,
                height: size.y,
                depth_or_array_layers: size.z,
            },
        );
        Ok(())
    }

    fn write_metadata(&mut self, origin: UVec2, extent: UVec2, texels: &[u32]) -> Result<()> {
        let textures = self.textures()?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &textures.metadata,
                mip_level: 0,
                origin: wgpu::Origin3d { x: origin.x, y: origin.y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(extent.x * 4),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: extent.x,
                height: extent.y,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn set_filter_mode(&mut self, filter: FilterMode) {
        let filterable = self.textures.as_ref().is_none_or(|t| t.desc.format != VoxelFormat::R32F);
        let filter = if filterable { filter } else { FilterMode::Nearest };
        if filter != self.filter {
            self.filter = filter;
            self.sampler = Self::create_sampler(&self.device, filter);
            self.bind_group = None;
        }
    }

    fn bind(&mut self, uniforms: &PoolUniforms) -> Result<()> {
        self.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(uniforms));
        if self.bind_group.is_none() {
            let textures = self.textures()?;
            let b = self.bindings;
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pool_bind_group"),
                layout: &textures.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: b.uniforms,
                        resource: self.uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: b.pool_texture,
                        resource: wgpu::BindingResource::TextureView(&textures.pool_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: b.pool_sampler,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: b.metadata_texture,
                        resource: wgpu::BindingResource::TextureView(&textures.metadata_view),
                    },
                ],
            });
            self.bind_group = Some(bind_group);
        }
        self.bound = true;
        Ok(())
    }

    fn unbind(&mut self) {
        self.bound = false;
    }
}
