//! Headless wgpu device.
//!
//! Every program gets its own pipeline and uniform buffer; every texture is an
//! `Rgba8Unorm` image usable both as a color attachment and as a sampled
//! binding. There is no surface: results leave the device through
//! [`read_pixels`](GpuDevice::read_pixels).

use std::collections::HashMap;

use futures::channel::oneshot;
use image::RgbaImage;
use log::{debug, info};
use wgpu::util::DeviceExt;

use crate::error::ResourceError;
use crate::gpu::device::GpuDevice;
use crate::gpu::program::FragmentSource;

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct Program {
    label: String,
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    texture_count: usize,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// [`GpuDevice`] backed by a real adapter.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    programs: HashMap<u64, Program>,
    textures: HashMap<u64, GpuTexture>,
}

impl WgpuDevice {
    /// Request the default adapter without a compatible surface.
    pub fn new() -> Result<Self, ResourceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| ResourceError::DeviceUnavailable(e.to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("hotgraph device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| ResourceError::DeviceUnavailable(e.to_string()))?;

        info!("using adapter {}", adapter.get_info().name);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("quad sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            sampler,
            programs: HashMap::new(),
            textures: HashMap::new(),
        })
    }

    fn texture(&self, id: u64) -> Result<&GpuTexture, ResourceError> {
        self.textures
            .get(&id)
            .ok_or(ResourceError::UnknownHandle { kind: "texture", id })
    }

    fn build_program(&self, program: &FragmentSource) -> Program {
        let device = &self.device;
        let source = program.module_source();

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(program.label()),
            size: (16 * (1 + program.uniforms.len())) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ];
        for index in 0..program.textures.len() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: index as u32 + 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program.label()),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.label()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.label()),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Program {
            label: program.label().to_string(),
            pipeline,
            layout,
            uniform_buffer,
            texture_count: program.textures.len(),
        }
    }

    fn pass<'e>(
        encoder: &'e mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        load: wgpu::LoadOp<wgpu::Color>,
    ) -> wgpu::RenderPass<'e> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn compile_program(&mut self, id: u64, program: &FragmentSource) -> Result<(), ResourceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let built = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.build_program(program)
        }));
        let scope_error = pollster::block_on(self.device.pop_error_scope());

        let compile_error = |message: String| ResourceError::Compile {
            label: program.label().to_string(),
            message,
        };
        match (built, scope_error) {
            (Ok(built), None) => {
                debug!("compiled program '{}' as #{id}", program.label());
                self.programs.insert(id, built);
                Ok(())
            }
            (_, Some(error)) => Err(compile_error(error.to_string())),
            (Err(_), None) => Err(compile_error("pipeline creation panicked".to_string())),
        }
    }

    fn create_texture(
        &mut self,
        id: u64,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
    ) -> Result<(), ResourceError> {
        if width == 0 || height == 0 {
            return Err(ResourceError::Allocation(format!(
                "texture size {width}x{height} is empty"
            )));
        }
        let descriptor = wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        };
        let texture = match pixels {
            Some(data) => self.device.create_texture_with_data(
                &self.queue,
                &descriptor,
                wgpu::util::TextureDataOrder::LayerMajor,
                data,
            ),
            None => self.device.create_texture(&descriptor),
        };
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                width,
                height,
            },
        );
        Ok(())
    }

    fn clear(&mut self, target: u64, color: [f32; 4]) -> Result<(), ResourceError> {
        let target = self.texture(target)?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let [r, g, b, a] = color.map(f64::from);
            Self::pass(
                &mut encoder,
                &target.view,
                wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw_quad(
        &mut self,
        target: u64,
        program: u64,
        slots: &[[f32; 4]],
        textures: &[u64],
    ) -> Result<(), ResourceError> {
        let prog = self
            .programs
            .get(&program)
            .ok_or(ResourceError::UnknownHandle {
                kind: "program",
                id: program,
            })?;
        if textures.len() != prog.texture_count {
            return Err(ResourceError::MissingTexture {
                program: prog.label.clone(),
                name: format!("#{}", textures.len()),
            });
        }
        let target = self.texture(target)?;

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: prog.uniform_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        for (index, id) in textures.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: index as u32 + 2,
                resource: wgpu::BindingResource::TextureView(&self.texture(*id)?.view),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&prog.label),
            layout: &prog.layout,
            entries: &entries,
        });

        self.queue
            .write_buffer(&prog.uniform_buffer, 0, bytemuck::cast_slice(slots));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = Self::pass(&mut encoder, &target.view, wgpu::LoadOp::Load);
            pass.set_pipeline(&prog.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self, id: u64) -> Result<RgbaImage, ResourceError> {
        let source = self.texture(id)?;
        let (width, height) = (source.width, source.height);
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| ResourceError::Allocation(e.to_string()))?;
        pollster::block_on(rx)
            .map_err(|_| ResourceError::Allocation("readback was cancelled".to_string()))?
            .map_err(|e| ResourceError::Allocation(e.to_string()))?;

        let mut bytes = Vec::with_capacity((unpadded * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded as usize) {
                bytes.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        buffer.unmap();

        RgbaImage::from_raw(width, height, bytes)
            .ok_or_else(|| ResourceError::Allocation(format!("texture #{id} has a bad size")))
    }

    fn release_program(&mut self, id: u64) {
        self.programs.remove(&id);
    }

    fn release_texture(&mut self, id: u64) {
        if let Some(texture) = self.textures.remove(&id) {
            texture.texture.destroy();
        }
    }
}
