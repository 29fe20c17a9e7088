use crate::error::NodeError;
use crate::node::{Context, NodeDefinition, NodeLogic, NodeScope, Render, RenderContext};
use crate::port::{In, Out, PortId, PortValue, kinds};

pub const NAME: &str = "diagnostics";

/// Signal carrying the requested visibility of the host's diagnostics overlay.
pub const OVERLAY_SIGNAL: &str = "diagnostics_overlay";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NAME, build)
        .with_category("utility")
        .with_description("Asks the host to show or hide its diagnostics overlay")
}

struct Diagnostics {
    overlay: In<kinds::Toggle>,
    visible: Out<kinds::Toggle>,
}

fn build(scope: &mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> {
    Ok(Box::new(Diagnostics {
        overlay: scope.toggle_in("overlay", false)?,
        visible: scope.toggle_out("visible")?,
    }))
}

impl Diagnostics {
    fn announce(&self, ctx: &mut Context<'_>) {
        let visible = ctx.get(self.overlay);
        ctx.emit(OVERLAY_SIGNAL, PortValue::Toggle(visible));
    }
}

impl NodeLogic for Diagnostics {
    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), NodeError> {
        self.announce(ctx);
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
        let visible = ctx.get(self.overlay);
        ctx.set(self.visible, visible);
        Render::ok()
    }

    fn on_change(&mut self, port: PortId, ctx: &mut Context<'_>) -> Result<(), NodeError> {
        if port == self.overlay.id() {
            self.announce(ctx);
        }
        Ok(())
    }
}
