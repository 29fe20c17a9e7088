use log::info;

use crate::error::NodeError;
use crate::gpu::AssetResolver;
use crate::node::{NodeDefinition, NodeLogic, NodeScope, Render, RenderContext};
use crate::port::{In, PortId, PortValue, kinds};

pub const NAME: &str = "output";

/// Signal emitted after `save` wrote a file. Carries the written path.
pub const SAVED_SIGNAL: &str = "output_saved";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NAME, build)
        .with_category("output")
        .with_description("Terminal node; `save` writes the current image as a PNG")
}

/// Terminal node. The host reads its `image` input with
/// [`Engine::read_image`](crate::Engine::read_image).
struct Output {
    image: In<kinds::Image>,
    path: In<kinds::File>,
    save: In<kinds::Trigger>,
    assets: AssetResolver,
}

fn build(scope: &mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> {
    Ok(Box::new(Output {
        image: scope.image_in("image")?,
        path: scope.file_in("path", ".png")?,
        save: scope.trigger_button_in("save")?,
        assets: scope.assets().clone(),
    }))
}

impl Output {
    fn save(&self, ctx: &mut RenderContext<'_>) -> Result<(), NodeError> {
        let Some(image) = ctx.get(self.image) else {
            return Err(NodeError::runtime("nothing to save: no image connected"));
        };
        let Some(path) = ctx.get(self.path) else {
            return Err(NodeError::runtime("nothing to save to: no path set"));
        };
        let path = self.assets.resolve(&path)?;
        let pixels = ctx.gpu().read_pixels(image.texture)?;
        pixels
            .save(&path)
            .map_err(|e| NodeError::runtime(format!("writing {}: {e}", path.display())))?;

        info!("saved {}x{} image to {}", pixels.width(), pixels.height(), path.display());
        ctx.emit(
            SAVED_SIGNAL,
            PortValue::File(Some(path.display().to_string())),
        );
        Ok(())
    }
}

impl NodeLogic for Output {
    fn render(&mut self, _ctx: &mut RenderContext<'_>) -> Render {
        Render::ok()
    }

    fn on_trigger(&mut self, port: PortId, ctx: &mut RenderContext<'_>) -> Result<(), NodeError> {
        if port == self.save.id() {
            self.save(ctx)?;
        }
        Ok(())
    }
}
