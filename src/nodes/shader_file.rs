//! Nodes defined by a WGSL file.
//!
//! The file holds the fragment body (see [`FragmentSource`] for the prelude it
//! is compiled after) plus directive comments declaring its interface:
//!
//! ```wgsl
//! //! uniform gain: float
//! //! uniform tint: color
//! //! texture image
//!
//! @fragment
//! fn fs(in: QuadOut) -> @location(0) vec4f {
//!     return textureSample(image, quad_sampler, in.uv) * u.tint * u.gain.x;
//! }
//! ```
//!
//! Each `texture` becomes an image input, each `float` uniform a number input
//! and each `color` (or `vec4`) uniform a color input. The node has one image
//! output, `image`, sized like its first texture input.
//!
//! The definition is file-backed, so editing the file reloads every node built
//! from it. WGSL cannot run on the CPU device; there these nodes fail to start.

use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::error::NodeError;
use crate::gpu::{FragmentSource, ProgramId, RenderTarget, UniformKind, Uniforms};
use crate::node::{
    Context, DefinitionSource, NodeDefinition, NodeLogic, NodeScope, Render, RenderContext,
};
use crate::port::{Constraints, In, Out, Rgba, kinds};

/// Build a definition named `name` from the WGSL file at `path`.
pub fn definition(name: impl Into<String>, path: impl Into<PathBuf>) -> NodeDefinition {
    let name = name.into();
    let path = path.into();
    let label = name.clone();
    let file = path.clone();
    NodeDefinition::new(name, move |scope| {
        let wgsl = fs::read_to_string(&file)
            .map_err(|e| NodeError::Build(format!("reading {}: {e}", file.display())))?;
        let source = parse(&label, &wgsl)?;
        ShaderFile::build(scope, source)
    })
    .with_category("shader")
    .with_description(format!("Fragment shader from {}", path.display()))
    .with_source(DefinitionSource::File(path))
}

/// Read the directive comments of a shader file into a program interface.
pub fn parse(label: &str, wgsl: &str) -> Result<FragmentSource, NodeError> {
    let mut source = FragmentSource::new(label, wgsl);
    for (number, line) in wgsl.lines().enumerate() {
        let Some(directive) = line.trim().strip_prefix("//!") else {
            continue;
        };
        let bad = |what: &str| NodeError::Build(format!("line {}: {what}", number + 1));
        let mut words = directive.split_whitespace();
        match words.next() {
            Some("texture") => {
                let name = words.next().ok_or_else(|| bad("texture needs a name"))?;
                source = source.texture(name);
            }
            Some("uniform") => {
                let rest: String = words.collect::<Vec<_>>().join(" ");
                let (name, kind) = rest
                    .split_once(':')
                    .ok_or_else(|| bad("expected `uniform <name>: <type>`"))?;
                let kind = match kind.trim() {
                    "float" | "f32" => UniformKind::Float,
                    "color" | "vec4" | "vec4f" => UniformKind::Vec4,
                    other => return Err(bad(&format!("no port kind for uniform type '{other}'"))),
                };
                source = source.uniform(name.trim(), kind);
            }
            _ => {}
        }
    }
    source
        .validate()
        .map_err(|e| NodeError::Build(format!("{label}: {e}")))?;
    Ok(source)
}

enum Parameter {
    Float(String, In<kinds::Number>),
    Color(String, In<kinds::Color>),
}

struct ShaderFile {
    source: FragmentSource,
    textures: Vec<(String, In<kinds::Image>)>,
    parameters: Vec<Parameter>,
    image: Out<kinds::Image>,
    program: Option<ProgramId>,
    target: Option<RenderTarget>,
}

impl ShaderFile {
    fn build(
        scope: &mut NodeScope<'_>,
        source: FragmentSource,
    ) -> Result<Box<dyn NodeLogic>, NodeError> {
        let mut textures = Vec::new();
        for name in &source.textures {
            textures.push((name.clone(), scope.image_in(name)?));
        }
        let mut parameters = Vec::new();
        for (name, kind) in &source.uniforms {
            parameters.push(match kind {
                UniformKind::Vec4 => Parameter::Color(name.clone(), scope.color_in(name, Rgba::WHITE)?),
                _ => Parameter::Float(
                    name.clone(),
                    scope.number_in(name, 0.0, Constraints::new())?,
                ),
            });
        }
        let image = scope.image_out("image")?;
        debug!(
            "shader '{}': {} textures, {} parameters",
            source.label,
            textures.len(),
            parameters.len()
        );
        Ok(Box::new(ShaderFile {
            source,
            textures,
            parameters,
            image,
            program: None,
            target: None,
        }))
    }

    fn draw(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), NodeError> {
        let (Some(program), Some(target)) = (self.program, &self.target) else {
            return Err(NodeError::runtime("shader program not compiled"));
        };

        let mut uniforms = Uniforms::new();
        let mut size = None;
        for (name, port) in &self.textures {
            let Some(texture) = ctx.get(*port) else {
                ctx.set(self.image, None);
                return Ok(());
            };
            if size.is_none() {
                size = Some((texture.width, texture.height));
            }
            uniforms = uniforms.texture(name.as_str(), texture);
        }
        for parameter in &self.parameters {
            uniforms = match parameter {
                Parameter::Float(name, port) => uniforms.float(name.as_str(), ctx.get(*port) as f32),
                Parameter::Color(name, port) => uniforms.color(name.as_str(), ctx.get(*port)),
            };
        }

        if let Some((width, height)) = size {
            target.set_size(width, height)?;
        }
        let bound = target.bind()?;
        bound.draw_quad(program, &uniforms)?;
        bound.unbind();

        ctx.set(self.image, Some(target.texture()?));
        Ok(())
    }
}

impl NodeLogic for ShaderFile {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), NodeError> {
        self.program = Some(ctx.gpu().create_shader_program(Some(&self.source))?);
        self.target = Some(ctx.gpu().create_render_target()?);
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
        self.draw(ctx).into()
    }
}
