//! GPU resource facade.
//!
//! Nodes never touch a device directly. They receive a [`NodeGpu`], a view of
//! the shared [`ResourceManager`] bound to the node instance's owner tag, and
//! everything they allocate through it is released in one
//! [`release_all`](Gpu::release_all) call when the instance is disposed.
//!
//! # Example
//!
//! ```ignore
//! let program = gpu.create_shader_program(Some(&FragmentSource::new("tint", TINT_WGSL)
//!     .uniform("tint", UniformKind::Vec4)
//!     .texture("image")))?;
//! let target = gpu.create_render_target()?;
//! target.set_size(image.width, image.height)?;
//!
//! let bound = target.bind()?;
//! bound.draw_quad(program, &Uniforms::new().color("tint", tint).texture("image", image))?;
//! bound.unbind();
//!
//! out.set(Some(target.texture()?));
//! ```

mod assets;
mod cpu;
mod device;
mod manager;
mod program;
mod wgpu_device;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use image::RgbaImage;

use crate::error::ResourceError;
use crate::port::{ImageRef, Rgba};

pub use assets::AssetResolver;
pub use cpu::CpuDevice;
pub use device::{DeviceKind, GpuDevice, create_device};
pub use manager::ResourceManager;
pub use program::{
    FRAME_UNIFORM, Fragment, FragmentKernel, FragmentSource, TexelView, UniformKind, UniformValue,
    Uniforms,
};
pub use wgpu_device::WgpuDevice;

/// Owner tag of one node instantiation. A reload issues a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// A texture handle. Equality is identity: a resize yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId {
    pub(crate) id: u64,
    pub(crate) owner: InstanceId,
}

impl TextureId {
    pub fn owner(&self) -> InstanceId {
        self.owner
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "texture#{}", self.id)
    }
}

/// A compiled shader program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    pub(crate) id: u64,
    pub(crate) owner: InstanceId,
}

/// A render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub(crate) id: u64,
    pub(crate) owner: InstanceId,
}

/// Shared handle to the engine's resource manager.
#[derive(Clone)]
pub struct Gpu {
    inner: Rc<RefCell<ResourceManager>>,
}

impl Gpu {
    pub fn new(manager: ResourceManager) -> Self {
        Self {
            inner: Rc::new(RefCell::new(manager)),
        }
    }

    /// A facade that allocates on behalf of `owner`.
    pub(crate) fn scoped(&self, owner: InstanceId) -> NodeGpu {
        NodeGpu {
            gpu: self.clone(),
            owner,
        }
    }

    pub(crate) fn allocate_owner(&self) -> InstanceId {
        self.inner.borrow_mut().allocate_owner()
    }

    pub fn device_name(&self) -> &'static str {
        self.inner.borrow().device_name()
    }

    /// Release every handle owned by `owner` and retire the tag.
    pub fn release_all(&self, owner: InstanceId) -> usize {
        self.inner.borrow_mut().release_all(owner)
    }

    pub(crate) fn force_unbind(&self) -> Option<u64> {
        self.inner.borrow_mut().force_unbind()
    }

    pub(crate) fn set_time(&self, time: f32) {
        self.inner.borrow_mut().set_time(time);
    }

    pub fn read_pixels(&self, texture: TextureId) -> Result<RgbaImage, ResourceError> {
        self.inner.borrow_mut().read_pixels(texture)
    }

    pub fn live_handles(&self, owner: InstanceId) -> usize {
        self.inner.borrow().live_handles(owner)
    }

    pub fn is_retired(&self, owner: InstanceId) -> bool {
        self.inner.borrow().is_retired(owner)
    }
}

impl fmt::Debug for Gpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpu")
            .field("device", &self.device_name())
            .finish()
    }
}

/// Result of [`NodeGpu::create_texture_from_url_async`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadedTexture {
    pub texture: ImageRef,
    pub natural_width: u32,
    pub natural_height: u32,
}

/// The GPU facade handed to one node instance.
#[derive(Clone)]
pub struct NodeGpu {
    gpu: Gpu,
    owner: InstanceId,
}

impl NodeGpu {
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Seconds since the engine started, as of the current tick.
    pub fn time(&self) -> f32 {
        self.gpu.inner.borrow().time()
    }

    /// Compile a fragment program. `None` yields the pass-through program
    /// sampling texture `image`.
    pub fn create_shader_program(
        &self,
        source: Option<&FragmentSource>,
    ) -> Result<ProgramId, ResourceError> {
        self.gpu.inner.borrow_mut().create_program(self.owner, source)
    }

    pub fn create_render_target(&self) -> Result<RenderTarget, ResourceError> {
        let id = self.gpu.inner.borrow_mut().create_target(self.owner)?;
        Ok(RenderTarget {
            gpu: self.gpu.clone(),
            id,
        })
    }

    /// Decode the image at `url` off-thread and upload it.
    ///
    /// `url` is an asset path or a `file://` URL from
    /// [`url_for_asset`](Self::url_for_asset). If the instance is disposed
    /// before decoding finishes the upload is refused.
    pub fn create_texture_from_url_async(
        &self,
        url: &str,
    ) -> LocalBoxFuture<'static, Result<LoadedTexture, ResourceError>> {
        let path = self.gpu.inner.borrow().assets().resolve(url);
        let this = self.clone();
        async move {
            let decoded = assets::decode_in_background(path?)
                .await
                .map_err(|_| ResourceError::Allocation("decoder thread exited".to_string()))??;
            let texture = this
                .gpu
                .inner
                .borrow_mut()
                .upload_texture(this.owner, &decoded)?;
            Ok(LoadedTexture {
                texture,
                natural_width: decoded.width(),
                natural_height: decoded.height(),
            })
        }
        .boxed_local()
    }

    /// Resolve an asset path under the configured root to a loadable URL.
    pub fn url_for_asset(&self, path: &str) -> Result<String, ResourceError> {
        self.gpu.inner.borrow().assets().url_for(path)
    }

    /// Release a texture this instance loaded.
    pub fn release_texture(&self, texture: TextureId) -> Result<(), ResourceError> {
        if texture.owner != self.owner {
            return Err(ResourceError::UnknownHandle {
                kind: "texture",
                id: texture.id,
            });
        }
        self.gpu.inner.borrow_mut().release_texture(texture)
    }

    pub fn read_pixels(&self, texture: TextureId) -> Result<RgbaImage, ResourceError> {
        self.gpu.read_pixels(texture)
    }
}

impl fmt::Debug for NodeGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGpu").field("owner", &self.owner).finish()
    }
}

/// An off-screen color target a node renders into.
///
/// Created at the engine's default size; call [`set_size`](Self::set_size)
/// before drawing when the output should match an input.
#[derive(Clone)]
pub struct RenderTarget {
    gpu: Gpu,
    id: TargetId,
}

impl RenderTarget {
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Resize the target. A changed size invalidates textures fetched earlier.
    pub fn set_size(&self, width: u32, height: u32) -> Result<(), ResourceError> {
        self.gpu
            .inner
            .borrow_mut()
            .set_target_size(self.id, width, height)
    }

    /// The target's current texture, valid until the next resize.
    pub fn texture(&self) -> Result<ImageRef, ResourceError> {
        self.gpu.inner.borrow().target_texture(self.id)
    }

    /// Open a bind span. Fails while any other target is bound.
    pub fn bind(&self) -> Result<BoundTarget, ResourceError> {
        let token = self.gpu.inner.borrow_mut().bind(self.id)?;
        Ok(BoundTarget {
            gpu: self.gpu.clone(),
            target: self.id,
            token,
        })
    }
}

impl fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RenderTarget").field(&self.id.id).finish()
    }
}

/// A render target inside its bind span. Dropping it unbinds.
pub struct BoundTarget {
    gpu: Gpu,
    target: TargetId,
    token: u64,
}

impl BoundTarget {
    pub fn clear(&self, color: Rgba) -> Result<(), ResourceError> {
        self.gpu
            .inner
            .borrow_mut()
            .clear(self.token, self.target, color.normalized())
    }

    /// Draw the full-screen quad with `program`.
    pub fn draw_quad(&self, program: ProgramId, uniforms: &Uniforms) -> Result<(), ResourceError> {
        self.gpu
            .inner
            .borrow_mut()
            .draw_quad(self.token, self.target, program, uniforms)
    }

    /// End the bind span.
    pub fn unbind(self) {}
}

impl Drop for BoundTarget {
    fn drop(&mut self) {
        if let Ok(mut manager) = self.gpu.inner.try_borrow_mut() {
            manager.unbind(self.token);
        }
    }
}
