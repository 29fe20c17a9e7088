//! Single-input image filters.
//!
//! A filter draws its input into a render target of the input's size with one
//! fragment program. With no input it draws nothing and its output is absent.

use glam::Vec4;

use crate::error::NodeError;
use crate::gpu::{FragmentSource, ProgramId, RenderTarget, UniformKind, Uniforms};
use crate::node::{NodeDefinition, NodeLogic, NodeScope, Render, RenderContext};
use crate::port::{Constraints, In, Out, kinds};

pub const PASS_THROUGH: &str = "pass_through";
pub const INVERT: &str = "invert";

const INVERT_WGSL: &str = r#"
@fragment
fn fs(in: QuadOut) -> @location(0) vec4f {
    let color = textureSample(image, quad_sampler, in.uv);
    let inverted = vec4f(1.0 - color.rgb, color.a);
    return mix(color, inverted, u.amount.x);
}
"#;

pub fn pass_through() -> NodeDefinition {
    NodeDefinition::new(PASS_THROUGH, |scope| {
        Filter::build(scope, FragmentSource::pass_through(), false)
    })
    .with_category("filter")
    .with_description("Copies its input image")
}

pub fn invert() -> NodeDefinition {
    NodeDefinition::new(INVERT, |scope| Filter::build(scope, invert_source(), true))
        .with_category("filter")
        .with_description("Inverts the RGB channels, blended by `amount`")
}

fn invert_source() -> FragmentSource {
    FragmentSource::new("invert", INVERT_WGSL)
        .uniform("amount", UniformKind::Float)
        .texture("image")
        .kernel(|frag| {
            let color = frag.sample("image", frag.uv);
            let inverted = Vec4::new(1.0 - color.x, 1.0 - color.y, 1.0 - color.z, color.w);
            color.lerp(inverted, frag.float("amount"))
        })
}

struct Filter {
    image: In<kinds::Image>,
    amount: Option<In<kinds::Number>>,
    output: Out<kinds::Image>,
    program: ProgramId,
    target: RenderTarget,
}

impl Filter {
    fn build(
        scope: &mut NodeScope<'_>,
        source: FragmentSource,
        with_amount: bool,
    ) -> Result<Box<dyn NodeLogic>, NodeError> {
        let image = scope.image_in("image")?;
        let amount = if with_amount {
            Some(scope.number_in("amount", 1.0, Constraints::new().min(0.0).max(1.0))?)
        } else {
            None
        };
        Ok(Box::new(Filter {
            image,
            amount,
            output: scope.image_out("image")?,
            program: scope.gpu().create_shader_program(Some(&source))?,
            target: scope.gpu().create_render_target()?,
        }))
    }

    fn draw(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), NodeError> {
        let Some(input) = ctx.get(self.image) else {
            ctx.set(self.output, None);
            return Ok(());
        };
        self.target.set_size(input.width, input.height)?;

        let mut uniforms = Uniforms::new().texture("image", input);
        if let Some(amount) = self.amount {
            uniforms = uniforms.float("amount", ctx.get(amount) as f32);
        }
        let bound = self.target.bind()?;
        bound.draw_quad(self.program, &uniforms)?;
        bound.unbind();

        ctx.set(self.output, Some(self.target.texture()?));
        Ok(())
    }
}

impl NodeLogic for Filter {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
        self.draw(ctx).into()
    }
}
