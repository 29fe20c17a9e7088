use crate::error::NodeError;
use crate::gpu::RenderTarget;
use crate::node::{NodeDefinition, NodeLogic, NodeScope, Render, RenderContext};
use crate::port::{Constraints, In, Out, Rgba, kinds};

pub const NAME: &str = "solid_color";

/// Largest edge a generated image may have.
const MAX_EDGE: f64 = 8192.0;

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NAME, build)
        .with_category("generate")
        .with_description("Fills an image of the given size with one color")
}

struct SolidColor {
    color: In<kinds::Color>,
    width: In<kinds::Number>,
    height: In<kinds::Number>,
    image: Out<kinds::Image>,
    target: RenderTarget,
}

fn build(scope: &mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> {
    let size = Constraints::new().min(1.0).max(MAX_EDGE).step(1.0);
    Ok(Box::new(SolidColor {
        color: scope.color_in("color", Rgba::WHITE)?,
        width: scope.number_in("width", 256.0, size.clone())?,
        height: scope.number_in("height", 256.0, size)?,
        image: scope.image_out("image")?,
        target: scope.gpu().create_render_target()?,
    }))
}

impl SolidColor {
    fn draw(&mut self, ctx: &mut RenderContext<'_>) -> Result<(), NodeError> {
        let width = ctx.get(self.width).round() as u32;
        let height = ctx.get(self.height).round() as u32;
        self.target.set_size(width, height)?;

        let bound = self.target.bind()?;
        bound.clear(ctx.get(self.color))?;
        bound.unbind();

        ctx.set(self.image, Some(self.target.texture()?));
        Ok(())
    }
}

impl NodeLogic for SolidColor {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
        self.draw(ctx).into()
    }
}
