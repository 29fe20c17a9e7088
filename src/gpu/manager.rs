//! Ownership bookkeeping in front of a [`GpuDevice`].
//!
//! The manager issues every handle, records which node instance owns it, and
//! validates each use before anything reaches the device. Ids are never
//! reused, so a handle that outlived its resource can always be told apart
//! from a live one.

use std::collections::{HashMap, HashSet};

use image::RgbaImage;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::error::ResourceError;
use crate::gpu::assets::AssetResolver;
use crate::gpu::device::GpuDevice;
use crate::gpu::program::{FragmentSource, UniformKind, UniformValue, Uniforms};
use crate::gpu::{InstanceId, ProgramId, TargetId, TextureId};
use crate::port::ImageRef;

/// Replaced render target textures remembered for diagnostics.
const STALE_LIMIT: usize = 256;

struct ProgramEntry {
    owner: InstanceId,
    source: FragmentSource,
}

struct TargetEntry {
    owner: InstanceId,
    width: u32,
    height: u32,
    texture: u64,
}

struct TextureEntry {
    owner: InstanceId,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    target: u64,
    token: u64,
}

/// Owner-tagged registry of programs, render targets and textures.
pub struct ResourceManager {
    device: Box<dyn GpuDevice>,
    assets: AssetResolver,
    default_size: (u32, u32),
    next_id: u64,
    next_owner: u64,
    programs: HashMap<u64, ProgramEntry>,
    targets: HashMap<u64, TargetEntry>,
    textures: HashMap<u64, TextureEntry>,
    /// Texture ids replaced by a render target resize, oldest first.
    stale: IndexMap<u64, InstanceId>,
    /// Owners issued and not yet released.
    live: HashSet<InstanceId>,
    bound: Option<Binding>,
    time: f32,
}

impl ResourceManager {
    pub fn new(device: Box<dyn GpuDevice>, assets: AssetResolver, default_size: (u32, u32)) -> Self {
        Self {
            device,
            assets,
            default_size,
            next_id: 1,
            next_owner: 1,
            programs: HashMap::new(),
            targets: HashMap::new(),
            textures: HashMap::new(),
            stale: IndexMap::new(),
            live: HashSet::new(),
            bound: None,
            time: 0.0,
        }
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }

    pub fn assets(&self) -> &AssetResolver {
        &self.assets
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub(crate) fn set_time(&mut self, time: f32) {
        self.time = time;
    }

    /// Issue a fresh owner tag for a new node instance.
    pub(crate) fn allocate_owner(&mut self) -> InstanceId {
        let owner = InstanceId(self.next_owner);
        self.next_owner += 1;
        self.live.insert(owner);
        owner
    }

    /// Whether `owner` was issued and has since been released.
    pub fn is_retired(&self, owner: InstanceId) -> bool {
        (1..self.next_owner).contains(&owner.0) && !self.live.contains(&owner)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_owner_alive(&self, owner: InstanceId) -> Result<(), ResourceError> {
        if self.is_retired(owner) {
            warn!("instance {owner} is disposed; refusing new allocation");
            return Err(ResourceError::OwnerDisposed {
                kind: "instance",
                id: owner.0,
            });
        }
        Ok(())
    }

    /// Classify a handle that is no longer (or never was) registered.
    fn rejected(&self, kind: &'static str, id: u64, owner: InstanceId) -> ResourceError {
        let error = if kind == "texture" && self.stale.contains_key(&id) {
            ResourceError::StaleTexture(id)
        } else if self.is_retired(owner) {
            ResourceError::OwnerDisposed { kind, id }
        } else {
            ResourceError::UnknownHandle { kind, id }
        };
        warn!("rejected {kind} handle #{id}: {error}");
        error
    }

    fn program(&self, handle: ProgramId) -> Result<&ProgramEntry, ResourceError> {
        match self.programs.get(&handle.id) {
            Some(entry) if entry.owner == handle.owner => Ok(entry),
            _ => Err(self.rejected("program", handle.id, handle.owner)),
        }
    }

    fn target(&self, handle: TargetId) -> Result<&TargetEntry, ResourceError> {
        match self.targets.get(&handle.id) {
            Some(entry) if entry.owner == handle.owner => Ok(entry),
            _ => Err(self.rejected("render target", handle.id, handle.owner)),
        }
    }

    fn texture(&self, handle: TextureId) -> Result<&TextureEntry, ResourceError> {
        match self.textures.get(&handle.id) {
            Some(entry) if entry.owner == handle.owner => Ok(entry),
            _ => Err(self.rejected("texture", handle.id, handle.owner)),
        }
    }

    /// Compile `source`, or the pass-through program when `None`.
    pub fn create_program(
        &mut self,
        owner: InstanceId,
        source: Option<&FragmentSource>,
    ) -> Result<ProgramId, ResourceError> {
        self.check_owner_alive(owner)?;
        let source = source.cloned().unwrap_or_else(FragmentSource::pass_through);
        source.validate().map_err(|message| ResourceError::Compile {
            label: source.label().to_string(),
            message,
        })?;
        let id = self.next_id();
        self.device.compile_program(id, &source)?;
        debug!("program #{id} '{}' owned by {owner}", source.label());
        self.programs.insert(id, ProgramEntry { owner, source });
        Ok(ProgramId { id, owner })
    }

    pub fn create_target(&mut self, owner: InstanceId) -> Result<TargetId, ResourceError> {
        self.check_owner_alive(owner)?;
        let (width, height) = self.default_size;
        let texture = self.allocate_texture(owner, width, height, None)?;
        let id = self.next_id();
        self.targets.insert(
            id,
            TargetEntry {
                owner,
                width,
                height,
                texture,
            },
        );
        Ok(TargetId { id, owner })
    }

    fn allocate_texture(
        &mut self,
        owner: InstanceId,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
    ) -> Result<u64, ResourceError> {
        let id = self.next_id();
        self.device.create_texture(id, width, height, pixels)?;
        self.textures.insert(
            id,
            TextureEntry {
                owner,
                width,
                height,
            },
        );
        Ok(id)
    }

    /// Resize a render target. A new size replaces the backing texture and
    /// makes every previously fetched texture handle for it stale.
    pub fn set_target_size(
        &mut self,
        handle: TargetId,
        width: u32,
        height: u32,
    ) -> Result<(), ResourceError> {
        let entry = self.target(handle)?;
        if (entry.width, entry.height) == (width, height) {
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(ResourceError::Allocation(format!(
                "render target size {width}x{height} is empty"
            )));
        }
        if let Some(binding) = self.bound
            && binding.target == handle.id
        {
            return Err(ResourceError::AlreadyBound {
                bound: binding.target,
                requested: handle.id,
            });
        }
        let old = entry.texture;
        let texture = self.allocate_texture(handle.owner, width, height, None)?;
        self.textures.remove(&old);
        self.device.release_texture(old);
        self.stale.insert(old, handle.owner);
        if self.stale.len() > STALE_LIMIT {
            self.stale.shift_remove_index(0);
        }
        if let Some(entry) = self.targets.get_mut(&handle.id) {
            entry.width = width;
            entry.height = height;
            entry.texture = texture;
        }
        debug!("render target #{} resized to {width}x{height}", handle.id);
        Ok(())
    }

    /// The target's current texture.
    pub fn target_texture(&self, handle: TargetId) -> Result<ImageRef, ResourceError> {
        let entry = self.target(handle)?;
        Ok(ImageRef {
            texture: TextureId {
                id: entry.texture,
                owner: handle.owner,
            },
            width: entry.width,
            height: entry.height,
        })
    }

    /// Start a bind span. Returns the token that ends it.
    pub(crate) fn bind(&mut self, handle: TargetId) -> Result<u64, ResourceError> {
        self.target(handle)?;
        if let Some(binding) = self.bound {
            warn!(
                "render target #{} requested while #{} is bound",
                handle.id, binding.target
            );
            return Err(ResourceError::AlreadyBound {
                bound: binding.target,
                requested: handle.id,
            });
        }
        let token = self.next_id();
        self.bound = Some(Binding {
            target: handle.id,
            token,
        });
        Ok(token)
    }

    /// End the bind span started with `token`. Returns false if that span was
    /// already ended (by an earlier unbind or a forced release).
    pub(crate) fn unbind(&mut self, token: u64) -> bool {
        match self.bound {
            Some(binding) if binding.token == token => {
                self.bound = None;
                true
            }
            _ => false,
        }
    }

    /// End whatever bind span is open. Returns the target that was bound.
    pub(crate) fn force_unbind(&mut self) -> Option<u64> {
        self.bound.take().map(|binding| binding.target)
    }

    fn bound_entry(&self, token: u64, handle: TargetId) -> Result<&TargetEntry, ResourceError> {
        let entry = self.target(handle)?;
        match self.bound {
            Some(binding) if binding.token == token && binding.target == handle.id => Ok(entry),
            _ => Err(ResourceError::NotBound(handle.id)),
        }
    }

    pub(crate) fn clear(
        &mut self,
        token: u64,
        handle: TargetId,
        color: [f32; 4],
    ) -> Result<(), ResourceError> {
        let texture = self.bound_entry(token, handle)?.texture;
        self.device.clear(texture, color)
    }

    pub(crate) fn draw_quad(
        &mut self,
        token: u64,
        handle: TargetId,
        program: ProgramId,
        uniforms: &Uniforms,
    ) -> Result<(), ResourceError> {
        let target = self.bound_entry(token, handle)?;
        let target_texture = target.texture;
        let header = [target.width as f32, target.height as f32, self.time, 0.0];
        let source = &self.program(program)?.source;

        let mut slots = vec![[0.0f32; 4]; source.uniforms.len() + 1];
        slots[0] = header;
        let mut textures: Vec<Option<u64>> = vec![None; source.textures.len()];

        let unknown = |name: &str| ResourceError::UnknownUniform {
            program: source.label().to_string(),
            name: name.to_string(),
        };
        for (name, value) in &uniforms.values {
            match value {
                UniformValue::Texture(image) => {
                    let index = source.texture_slot(name).ok_or_else(|| unknown(name))?;
                    self.texture(image.texture)?;
                    if image.texture.id == target_texture {
                        warn!("program '{}' samples its own target", source.label());
                        return Err(ResourceError::FeedbackLoop(handle.id));
                    }
                    textures[index] = Some(image.texture.id);
                }
                scalar => {
                    let (index, kind) = source.uniform_slot(name).ok_or_else(|| unknown(name))?;
                    slots[index + 1] = pack(*scalar, kind).ok_or_else(|| {
                        ResourceError::UniformMismatch {
                            program: source.label().to_string(),
                            name: name.clone(),
                            expected: kind,
                            found: scalar.type_name(),
                        }
                    })?;
                }
            }
        }

        let textures = textures
            .into_iter()
            .zip(&source.textures)
            .map(|(id, name)| {
                id.ok_or_else(|| ResourceError::MissingTexture {
                    program: source.label().to_string(),
                    name: name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.device
            .draw_quad(target_texture, program.id, &slots, &textures)
    }

    /// Upload decoded pixels as a texture owned by `owner`.
    pub(crate) fn upload_texture(
        &mut self,
        owner: InstanceId,
        image: &RgbaImage,
    ) -> Result<ImageRef, ResourceError> {
        self.check_owner_alive(owner)?;
        let (width, height) = image.dimensions();
        let id = self.allocate_texture(owner, width, height, Some(image.as_raw()))?;
        Ok(ImageRef {
            texture: TextureId { id, owner },
            width,
            height,
        })
    }

    /// Release a texture that was loaded from an asset. Render target
    /// textures are released with their target.
    pub fn release_texture(&mut self, handle: TextureId) -> Result<(), ResourceError> {
        self.texture(handle)?;
        if self.targets.values().any(|t| t.texture == handle.id) {
            return Err(ResourceError::UnknownHandle {
                kind: "loaded texture",
                id: handle.id,
            });
        }
        self.textures.remove(&handle.id);
        self.device.release_texture(handle.id);
        Ok(())
    }

    /// Read any live texture back as RGBA8. Reading is not owner-scoped.
    pub fn read_pixels(&mut self, handle: TextureId) -> Result<RgbaImage, ResourceError> {
        self.texture(handle)?;
        self.device.read_pixels(handle.id)
    }

    /// Release everything `owner` allocated and retire the tag.
    ///
    /// Returns the number of handles released.
    pub fn release_all(&mut self, owner: InstanceId) -> usize {
        let mut released = 0;

        let programs: Vec<u64> = ids_owned_by(&self.programs, owner, |e| e.owner);
        for id in programs {
            self.programs.remove(&id);
            self.device.release_program(id);
            released += 1;
        }

        let targets: Vec<u64> = ids_owned_by(&self.targets, owner, |e| e.owner);
        for id in targets {
            self.targets.remove(&id);
            if self.bound.is_some_and(|b| b.target == id) {
                warn!("render target #{id} released while bound");
                self.bound = None;
            }
            released += 1;
        }

        let textures: Vec<u64> = ids_owned_by(&self.textures, owner, |e| e.owner);
        for id in textures {
            self.textures.remove(&id);
            self.device.release_texture(id);
            released += 1;
        }

        self.stale.retain(|_, stale_owner| *stale_owner != owner);
        self.live.remove(&owner);
        debug!("released {released} handles of {owner}");
        released
    }

    /// Number of live handles owned by `owner`.
    pub fn live_handles(&self, owner: InstanceId) -> usize {
        self.programs.values().filter(|e| e.owner == owner).count()
            + self.targets.values().filter(|e| e.owner == owner).count()
            + self.textures.values().filter(|e| e.owner == owner).count()
    }
}

fn ids_owned_by<E>(
    map: &HashMap<u64, E>,
    owner: InstanceId,
    owner_of: impl Fn(&E) -> InstanceId,
) -> Vec<u64> {
    let mut ids: Vec<u64> = map
        .iter()
        .filter(|(_, entry)| owner_of(entry) == owner)
        .map(|(id, _)| *id)
        .collect();
    ids.sort_unstable();
    ids
}

/// Lay out a scalar uniform in its vec4 slot. `None` when the value does not
/// have the declared type.
fn pack(value: UniformValue, kind: UniformKind) -> Option<[f32; 4]> {
    match (value, kind) {
        (UniformValue::Float(x), UniformKind::Float) => Some([x, 0.0, 0.0, 0.0]),
        (UniformValue::Vec2([x, y]), UniformKind::Vec2) => Some([x, y, 0.0, 0.0]),
        (UniformValue::Vec4(v), UniformKind::Vec4) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::cpu::CpuDevice;

    fn manager() -> ResourceManager {
        ResourceManager::new(
            Box::new(CpuDevice::new()),
            AssetResolver::new("/assets"),
            (4, 4),
        )
    }

    fn solid() -> FragmentSource {
        FragmentSource::new("solid", "")
            .uniform("color", UniformKind::Vec4)
            .kernel(|f| f.vec4("color"))
    }

    #[test]
    fn resize_makes_old_texture_stale() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let before = gpu.target_texture(target).unwrap();

        gpu.set_target_size(target, 4, 4).unwrap();
        assert_eq!(gpu.target_texture(target).unwrap(), before);

        gpu.set_target_size(target, 8, 2).unwrap();
        let after = gpu.target_texture(target).unwrap();
        assert_ne!(after.texture, before.texture);
        assert_eq!((after.width, after.height), (8, 2));
        assert_eq!(
            gpu.read_pixels(before.texture).unwrap_err(),
            ResourceError::StaleTexture(before.texture.id)
        );
    }

    #[test]
    fn only_one_bind_span_at_a_time() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let a = gpu.create_target(owner).unwrap();
        let b = gpu.create_target(owner).unwrap();

        let token = gpu.bind(a).unwrap();
        assert!(matches!(gpu.bind(b), Err(ResourceError::AlreadyBound { .. })));
        assert!(gpu.unbind(token));
        assert!(!gpu.unbind(token));
        assert!(gpu.bind(b).is_ok());
    }

    #[test]
    fn draws_validate_uniform_names_and_textures() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let program = gpu.create_program(owner, Some(&solid())).unwrap();
        let pass = gpu.create_program(owner, None).unwrap();
        let token = gpu.bind(target).unwrap();

        let err = gpu
            .draw_quad(token, target, program, &Uniforms::new().float("nope", 1.0))
            .unwrap_err();
        assert!(matches!(err, ResourceError::UnknownUniform { .. }));

        let err = gpu
            .draw_quad(token, target, pass, &Uniforms::new())
            .unwrap_err();
        assert!(matches!(err, ResourceError::MissingTexture { .. }));

        let own = gpu.target_texture(target).unwrap();
        let err = gpu
            .draw_quad(token, target, pass, &Uniforms::new().texture("image", own))
            .unwrap_err();
        assert_eq!(err, ResourceError::FeedbackLoop(target.id));

        gpu.draw_quad(
            token,
            target,
            program,
            &Uniforms::new().vec4("color", [0.0, 1.0, 0.0, 1.0]),
        )
        .unwrap();
        gpu.unbind(token);
        let pixels = gpu.read_pixels(own.texture).unwrap();
        assert_eq!(pixels.get_pixel(3, 3).0, [0, 255, 0, 255]);
    }

    #[test]
    fn uniform_values_must_match_their_declared_type() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let program = gpu.create_program(owner, Some(&solid())).unwrap();
        let token = gpu.bind(target).unwrap();

        let err = gpu
            .draw_quad(token, target, program, &Uniforms::new().float("color", 1.0))
            .unwrap_err();
        assert_eq!(
            err,
            ResourceError::UniformMismatch {
                program: "solid".to_string(),
                name: "color".to_string(),
                expected: UniformKind::Vec4,
                found: "float",
            }
        );
        assert!(matches!(
            gpu.draw_quad(token, target, program, &Uniforms::new().vec2("color", [1.0, 0.0])),
            Err(ResourceError::UniformMismatch { .. })
        ));
    }

    #[test]
    fn omitted_scalars_read_as_zero() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let program = gpu.create_program(owner, Some(&solid())).unwrap();
        let token = gpu.bind(target).unwrap();
        gpu.clear(token, target, [1.0, 1.0, 1.0, 1.0]).unwrap();
        gpu.draw_quad(token, target, program, &Uniforms::new()).unwrap();
        gpu.unbind(token);

        let image = gpu.target_texture(target).unwrap();
        assert_eq!(gpu.read_pixels(image.texture).unwrap().get_pixel(0, 0).0, [0; 4]);
    }

    #[test]
    fn draw_outside_bind_span_is_rejected() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let token = gpu.bind(target).unwrap();
        gpu.force_unbind();
        assert_eq!(
            gpu.clear(token, target, [0.0; 4]),
            Err(ResourceError::NotBound(target.id))
        );
    }

    #[test]
    fn release_all_retires_owner() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let other = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        gpu.create_program(owner, None).unwrap();
        gpu.create_target(other).unwrap();
        let image = gpu.target_texture(target).unwrap();

        assert_eq!(gpu.live_handles(owner), 3);
        assert_eq!(gpu.release_all(owner), 3);
        assert_eq!(gpu.live_handles(owner), 0);
        assert_eq!(gpu.live_handles(other), 2);

        assert!(matches!(
            gpu.bind(target),
            Err(ResourceError::OwnerDisposed { .. })
        ));
        assert!(matches!(
            gpu.read_pixels(image.texture),
            Err(ResourceError::OwnerDisposed { .. })
        ));
        assert!(gpu.create_target(owner).is_err());
    }

    #[test]
    fn resize_history_is_bounded() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let mut last = gpu.target_texture(target).unwrap();
        for width in 1..=(STALE_LIMIT as u32 + 10) {
            last = gpu.target_texture(target).unwrap();
            gpu.set_target_size(target, width, 1).unwrap();
        }
        assert_eq!(gpu.stale.len(), STALE_LIMIT);
        assert_eq!(
            gpu.read_pixels(last.texture).unwrap_err(),
            ResourceError::StaleTexture(last.texture.id)
        );
    }

    #[test]
    fn released_owners_leave_no_bookkeeping() {
        let mut gpu = manager();
        for _ in 0..100 {
            let owner = gpu.allocate_owner();
            let target = gpu.create_target(owner).unwrap();
            gpu.set_target_size(target, 2, 2).unwrap();
            gpu.release_all(owner);
            assert!(gpu.is_retired(owner));
        }
        let owner = gpu.allocate_owner();
        assert!(!gpu.is_retired(owner));
        assert_eq!(gpu.live.len(), 1);
        assert!(gpu.stale.is_empty());
    }

    #[test]
    fn handles_are_checked_against_their_owner() {
        let mut gpu = manager();
        let owner = gpu.allocate_owner();
        let intruder = gpu.allocate_owner();
        let target = gpu.create_target(owner).unwrap();
        let forged = TargetId {
            id: target.id,
            owner: intruder,
        };
        assert!(matches!(
            gpu.bind(forged),
            Err(ResourceError::UnknownHandle { .. })
        ));
    }
}
