//! The backend seam under the resource manager.
//!
//! A [`GpuDevice`] executes already-validated work. Ownership, bind spans,
//! stale handles and uniform resolution are the manager's job; a device only
//! sees raw ids it was told to create.

use image::RgbaImage;

use crate::error::ResourceError;
use crate::gpu::FragmentSource;

/// Which device implementation to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    /// Deterministic CPU reference device. Runs program kernels, not WGSL.
    #[default]
    Cpu,
    /// Headless wgpu device on the first available adapter.
    Wgpu,
}

/// A backend that owns the actual GPU objects.
pub trait GpuDevice {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Compile `program` and keep it under `id`.
    fn compile_program(&mut self, id: u64, program: &FragmentSource) -> Result<(), ResourceError>;

    /// Allocate a `width` x `height` RGBA texture under `id`, optionally
    /// initialised from tightly packed RGBA8 `pixels`.
    fn create_texture(
        &mut self,
        id: u64,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
    ) -> Result<(), ResourceError>;

    /// Fill texture `target` with `color` (normalized RGBA).
    fn clear(&mut self, target: u64, color: [f32; 4]) -> Result<(), ResourceError>;

    /// Draw the full-screen triangle into `target`.
    ///
    /// `slots` starts with the frame header followed by one slot per declared
    /// uniform; `textures` lists texture ids in declaration order.
    fn draw_quad(
        &mut self,
        target: u64,
        program: u64,
        slots: &[[f32; 4]],
        textures: &[u64],
    ) -> Result<(), ResourceError>;

    /// Read texture `id` back as RGBA8.
    fn read_pixels(&mut self, id: u64) -> Result<RgbaImage, ResourceError>;

    fn release_program(&mut self, id: u64);

    fn release_texture(&mut self, id: u64);
}

/// Create a device of the requested kind.
pub fn create_device(kind: DeviceKind) -> Result<Box<dyn GpuDevice>, ResourceError> {
    match kind {
        DeviceKind::Cpu => Ok(Box::new(super::cpu::CpuDevice::new())),
        DeviceKind::Wgpu => Ok(Box::new(super::wgpu_device::WgpuDevice::new()?)),
    }
}
