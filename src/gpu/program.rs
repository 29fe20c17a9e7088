//! Fragment programs and their uniform maps.
//!
//! Every program is a fragment stage drawn over an implicit full-screen
//! triangle. The engine generates the vertex stage and a WGSL prelude from the
//! declared uniforms and textures, so node code only writes the `fs` entry
//! point.
//!
//! # Prelude
//!
//! For a program declaring `.uniform("tint", UniformKind::Vec4)` and
//! `.texture("image")` the fragment source is compiled after:
//!
//! ```wgsl
//! struct Uniforms {
//!     frame: vec4f,   // resolution.xy, time, 0
//!     tint: vec4f,
//! }
//! @group(0) @binding(0) var<uniform> u: Uniforms;
//! @group(0) @binding(1) var quad_sampler: sampler;
//! @group(0) @binding(2) var image: texture_2d<f32>;
//!
//! struct QuadOut {
//!     @builtin(position) position: vec4f,
//!     @location(0) uv: vec2f,
//! }
//! ```
//!
//! Every uniform occupies one `vec4f` slot; a `Float` lives in `.x`, a `Vec2`
//! in `.xy`. The fragment entry point must be
//! `@fragment fn fs(in: QuadOut) -> @location(0) vec4f`.
//!
//! # CPU kernels
//!
//! The CPU reference device cannot run WGSL. A program that should also run
//! there carries a [`FragmentKernel`], a Rust closure computing the same color
//! from a [`Fragment`].

use std::fmt;
use std::rc::Rc;

use glam::{Vec2, Vec4};

use crate::port::{ImageRef, Rgba};

/// Name reserved for the per-draw frame header uniform.
pub const FRAME_UNIFORM: &str = "frame";

/// Type of a declared scalar uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Vec2,
    Vec4,
}

/// CPU implementation of a fragment stage.
pub type FragmentKernel = Rc<dyn Fn(&Fragment<'_>) -> Vec4>;

/// Source and interface of a fragment program.
#[derive(Clone)]
pub struct FragmentSource {
    pub(crate) label: String,
    pub(crate) wgsl: String,
    pub(crate) uniforms: Vec<(String, UniformKind)>,
    pub(crate) textures: Vec<String>,
    pub(crate) kernel: Option<FragmentKernel>,
}

impl FragmentSource {
    /// Create a program from the WGSL body containing the `fs` entry point.
    pub fn new(label: impl Into<String>, wgsl: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            wgsl: wgsl.into(),
            uniforms: Vec::new(),
            textures: Vec::new(),
            kernel: None,
        }
    }

    /// Declare a scalar uniform.
    pub fn uniform(mut self, name: impl Into<String>, kind: UniformKind) -> Self {
        self.uniforms.push((name.into(), kind));
        self
    }

    /// Declare a sampled texture.
    pub fn texture(mut self, name: impl Into<String>) -> Self {
        self.textures.push(name.into());
        self
    }

    /// Attach the CPU implementation used by the reference device.
    pub fn kernel(mut self, kernel: impl Fn(&Fragment<'_>) -> Vec4 + 'static) -> Self {
        self.kernel = Some(Rc::new(kernel));
        self
    }

    /// The program used when a node asks for one without source: it copies
    /// texture `image` to the bound target.
    pub fn pass_through() -> Self {
        Self::new(
            "pass-through",
            r#"
@fragment
fn fs(in: QuadOut) -> @location(0) vec4f {
    return textureSample(image, quad_sampler, in.uv);
}
"#,
        )
        .texture("image")
        .kernel(|frag| frag.sample("image", frag.uv))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn wgsl(&self) -> &str {
        &self.wgsl
    }

    pub fn has_kernel(&self) -> bool {
        self.kernel.is_some()
    }

    /// Names must be plain WGSL identifiers and unique across uniforms and textures.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut seen: Vec<&str> = Vec::new();
        let names = self
            .uniforms
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(self.textures.iter().map(String::as_str));
        for name in names {
            if !is_identifier(name) {
                return Err(format!("'{name}' is not a valid identifier"));
            }
            if matches!(name, FRAME_UNIFORM | "u" | "quad_sampler" | "QuadOut") {
                return Err(format!("'{name}' is reserved"));
            }
            if seen.contains(&name) {
                return Err(format!("'{name}' is declared twice"));
            }
            seen.push(name);
        }
        Ok(())
    }

    /// Full WGSL module: prelude, vertex stage, then the node's fragment body.
    pub(crate) fn module_source(&self) -> String {
        let mut out = String::from("struct Uniforms {\n    frame: vec4f,\n");
        for (name, _) in &self.uniforms {
            out.push_str(&format!("    {name}: vec4f,\n"));
        }
        out.push_str("}\n\n@group(0) @binding(0) var<uniform> u: Uniforms;\n");
        out.push_str("@group(0) @binding(1) var quad_sampler: sampler;\n");
        for (index, name) in self.textures.iter().enumerate() {
            out.push_str(&format!(
                "@group(0) @binding({}) var {name}: texture_2d<f32>;\n",
                index + 2
            ));
        }
        out.push_str(QUAD_VERTEX_STAGE);
        out.push_str(&self.wgsl);
        out
    }

    pub(crate) fn uniform_slot(&self, name: &str) -> Option<(usize, UniformKind)> {
        self.uniforms
            .iter()
            .position(|(n, _)| n == name)
            .map(|index| (index, self.uniforms[index].1))
    }

    pub(crate) fn texture_slot(&self, name: &str) -> Option<usize> {
        self.textures.iter().position(|n| n == name)
    }
}

impl fmt::Debug for FragmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentSource")
            .field("label", &self.label)
            .field("uniforms", &self.uniforms)
            .field("textures", &self.textures)
            .field("kernel", &self.kernel.is_some())
            .finish()
    }
}

const QUAD_VERTEX_STAGE: &str = r#"
struct QuadOut {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
}

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> QuadOut {
    let x = f32(i32(vi & 1u) * 4 - 1);
    let y = f32(i32(vi >> 1u) * 4 - 1);
    var out: QuadOut;
    out.position = vec4f(x, y, 0.0, 1.0);
    out.uv = vec2f((x + 1.0) * 0.5, (1.0 - y) * 0.5);
    return out;
}
"#;

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A value in a draw's uniform map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec4([f32; 4]),
    Texture(ImageRef),
}

impl UniformValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            UniformValue::Float(_) => "float",
            UniformValue::Vec2(_) => "vec2",
            UniformValue::Vec4(_) => "vec4",
            UniformValue::Texture(_) => "texture",
        }
    }
}

/// Named uniforms for one [`draw_quad`](crate::BoundTarget::draw_quad) call.
#[derive(Debug, Clone, Default)]
pub struct Uniforms {
    pub(crate) values: Vec<(String, UniformValue)>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: UniformValue) -> Self {
        let name = name.into();
        self.values.retain(|(n, _)| *n != name);
        self.values.push((name, value));
        self
    }

    pub fn float(self, name: impl Into<String>, value: f32) -> Self {
        self.set(name, UniformValue::Float(value))
    }

    pub fn vec2(self, name: impl Into<String>, value: [f32; 2]) -> Self {
        self.set(name, UniformValue::Vec2(value))
    }

    pub fn vec4(self, name: impl Into<String>, value: [f32; 4]) -> Self {
        self.set(name, UniformValue::Vec4(value))
    }

    /// A color uniform, normalized to `0..=1`.
    pub fn color(self, name: impl Into<String>, value: Rgba) -> Self {
        self.vec4(name, value.normalized())
    }

    pub fn texture(self, name: impl Into<String>, image: ImageRef) -> Self {
        self.set(name, UniformValue::Texture(image))
    }
}

/// A read-only view of a texture handed to CPU kernels.
#[derive(Debug, Clone, Copy)]
pub struct TexelView<'a> {
    pub width: u32,
    pub height: u32,
    pub texels: &'a [Vec4],
}

impl TexelView<'_> {
    /// Nearest-neighbour sample with clamp-to-edge addressing.
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        if self.width == 0 || self.height == 0 {
            return Vec4::ZERO;
        }
        let x = ((uv.x * self.width as f32).floor() as i64).clamp(0, self.width as i64 - 1);
        let y = ((uv.y * self.height as f32).floor() as i64).clamp(0, self.height as i64 - 1);
        self.texels[(y as u32 * self.width + x as u32) as usize]
    }
}

/// Inputs of one CPU kernel invocation.
pub struct Fragment<'a> {
    /// Texel center in `0..1`, origin at the top-left.
    pub uv: Vec2,
    pub resolution: Vec2,
    pub time: f32,
    pub(crate) program: &'a FragmentSource,
    pub(crate) slots: &'a [[f32; 4]],
    pub(crate) textures: &'a [TexelView<'a>],
}

impl Fragment<'_> {
    pub fn vec4(&self, name: &str) -> Vec4 {
        self.program
            .uniform_slot(name)
            .and_then(|(index, _)| self.slots.get(index))
            .map(|slot| Vec4::from_array(*slot))
            .unwrap_or(Vec4::ZERO)
    }

    pub fn vec2(&self, name: &str) -> Vec2 {
        self.vec4(name).truncate().truncate()
    }

    pub fn float(&self, name: &str) -> f32 {
        self.vec4(name).x
    }

    /// Sample a declared texture; undeclared names read as transparent black.
    pub fn sample(&self, name: &str, uv: Vec2) -> Vec4 {
        self.program
            .texture_slot(name)
            .and_then(|index| self.textures.get(index))
            .map(|view| view.sample(uv))
            .unwrap_or(Vec4::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_binds_textures_after_sampler() {
        let source = FragmentSource::new("t", "// body")
            .uniform("amount", UniformKind::Float)
            .texture("image")
            .texture("mask");
        let module = source.module_source();
        assert!(module.contains("amount: vec4f"));
        assert!(module.contains("@binding(2) var image"));
        assert!(module.contains("@binding(3) var mask"));
        assert!(module.ends_with("// body"));
    }

    #[test]
    fn validation_rejects_reserved_and_duplicate_names() {
        assert!(FragmentSource::new("t", "").uniform("frame", UniformKind::Vec4).validate().is_err());
        assert!(FragmentSource::new("t", "").uniform("a", UniformKind::Float).texture("a").validate().is_err());
        assert!(FragmentSource::new("t", "").uniform("1x", UniformKind::Float).validate().is_err());
        assert!(FragmentSource::pass_through().validate().is_ok());
    }

    #[test]
    fn uniforms_replace_by_name() {
        let uniforms = Uniforms::new().float("a", 1.0).float("a", 2.0);
        assert_eq!(uniforms.values, vec![("a".to_string(), UniformValue::Float(2.0))]);
    }
}
