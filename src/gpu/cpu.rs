//! CPU reference device.
//!
//! Executes each program's [`FragmentKernel`](crate::gpu::FragmentKernel) once
//! per texel. Slow, exact and deterministic, which makes it the device used by
//! tests and by hosts without a GPU adapter.

use std::collections::HashMap;

use glam::{Vec2, Vec4};
use image::RgbaImage;

use crate::error::ResourceError;
use crate::gpu::device::GpuDevice;
use crate::gpu::program::{Fragment, FragmentSource, TexelView};

struct CpuTexture {
    width: u32,
    height: u32,
    texels: Vec<Vec4>,
}

/// Software implementation of [`GpuDevice`].
#[derive(Default)]
pub struct CpuDevice {
    programs: HashMap<u64, FragmentSource>,
    textures: HashMap<u64, CpuTexture>,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn texture(&self, id: u64) -> Result<&CpuTexture, ResourceError> {
        self.textures
            .get(&id)
            .ok_or(ResourceError::UnknownHandle { kind: "texture", id })
    }
}

impl GpuDevice for CpuDevice {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn compile_program(&mut self, id: u64, program: &FragmentSource) -> Result<(), ResourceError> {
        if !program.has_kernel() {
            return Err(ResourceError::Compile {
                label: program.label().to_string(),
                message: "program has no CPU kernel".to_string(),
            });
        }
        self.programs.insert(id, program.clone());
        Ok(())
    }

    fn create_texture(
        &mut self,
        id: u64,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
    ) -> Result<(), ResourceError> {
        let len = width as usize * height as usize;
        let texels = match pixels {
            Some(bytes) if bytes.len() == len * 4 => bytes
                .chunks_exact(4)
                .map(|px| {
                    Vec4::new(px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32) / 255.0
                })
                .collect(),
            Some(bytes) => {
                return Err(ResourceError::Allocation(format!(
                    "{width}x{height} texture needs {} bytes, got {}",
                    len * 4,
                    bytes.len()
                )));
            }
            None => vec![Vec4::ZERO; len],
        };
        self.textures.insert(
            id,
            CpuTexture {
                width,
                height,
                texels,
            },
        );
        Ok(())
    }

    fn clear(&mut self, target: u64, color: [f32; 4]) -> Result<(), ResourceError> {
        let texture = self
            .textures
            .get_mut(&target)
            .ok_or(ResourceError::UnknownHandle {
                kind: "texture",
                id: target,
            })?;
        texture.texels.fill(Vec4::from_array(color));
        Ok(())
    }

    fn draw_quad(
        &mut self,
        target: u64,
        program: u64,
        slots: &[[f32; 4]],
        textures: &[u64],
    ) -> Result<(), ResourceError> {
        let source = self
            .programs
            .get(&program)
            .ok_or(ResourceError::UnknownHandle {
                kind: "program",
                id: program,
            })?;
        let Some(kernel) = source.kernel.as_ref() else {
            return Err(ResourceError::Compile {
                label: source.label().to_string(),
                message: "program has no CPU kernel".to_string(),
            });
        };

        let views = textures
            .iter()
            .map(|id| {
                self.texture(*id).map(|tex| TexelView {
                    width: tex.width,
                    height: tex.height,
                    texels: &tex.texels,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (width, height) = {
            let tex = self.texture(target)?;
            (tex.width, tex.height)
        };
        let header = slots.first().copied().unwrap_or([0.0; 4]);
        let uniforms = slots.get(1..).unwrap_or(&[]);

        let mut out = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let fragment = Fragment {
                    uv: Vec2::new(
                        (x as f32 + 0.5) / width as f32,
                        (y as f32 + 0.5) / height as f32,
                    ),
                    resolution: Vec2::new(width as f32, height as f32),
                    time: header[2],
                    program: source,
                    slots: uniforms,
                    textures: &views,
                };
                out.push(kernel(&fragment).clamp(Vec4::ZERO, Vec4::ONE));
            }
        }

        if let Some(tex) = self.textures.get_mut(&target) {
            tex.texels = out;
        }
        Ok(())
    }

    fn read_pixels(&mut self, id: u64) -> Result<RgbaImage, ResourceError> {
        let tex = self.texture(id)?;
        let bytes = tex
            .texels
            .iter()
            .flat_map(|texel| {
                texel
                    .to_array()
                    .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
            })
            .collect();
        RgbaImage::from_raw(tex.width, tex.height, bytes)
            .ok_or_else(|| ResourceError::Allocation(format!("texture #{id} has a bad size")))
    }

    fn release_program(&mut self, id: u64) {
        self.programs.remove(&id);
    }

    fn release_texture(&mut self, id: u64) {
        self.textures.remove(&id);
    }
}
