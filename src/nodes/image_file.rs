use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, warn};

use crate::error::NodeError;
use crate::gpu::TextureId;
use crate::node::{NodeDefinition, NodeLogic, NodeScope, Outputs, Render, RenderContext};
use crate::port::{In, Out, kinds};

pub const NAME: &str = "image_file";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NAME, build)
        .with_category("input")
        .with_description("Loads an image from the asset directory")
}

/// Loads the file named by its `file` input.
///
/// Decoding happens off-thread, so `render` returns a pending future whenever
/// the path changes. Until it resolves, downstream nodes keep reading the
/// previous image.
struct ImageFile {
    file: In<kinds::File>,
    image: Out<kinds::Image>,
    width: Out<kinds::Number>,
    height: Out<kinds::Number>,
    /// Path of the image currently published, set once its load succeeds.
    shown: Rc<RefCell<Option<String>>>,
    current: Rc<Cell<Option<TextureId>>>,
}

fn build(scope: &mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> {
    Ok(Box::new(ImageFile {
        file: scope.file_in("file", "image/*")?,
        image: scope.image_out("image")?,
        width: scope.number_out("width")?,
        height: scope.number_out("height")?,
        shown: Rc::new(RefCell::new(None)),
        current: Rc::new(Cell::new(None)),
    }))
}

impl NodeLogic for ImageFile {
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
        let path = ctx.get(self.file);
        if path == *self.shown.borrow() {
            return Render::ok();
        }

        let Some(path) = path else {
            self.shown.replace(None);
            if let Some(old) = self.current.take()
                && let Err(e) = ctx.gpu().release_texture(old)
            {
                warn!("releasing {old} failed: {e}");
            }
            ctx.set(self.image, None);
            ctx.set(self.width, 0.0);
            ctx.set(self.height, 0.0);
            return Render::ok();
        };

        debug!("node {} loading {path}", ctx.node());
        let load = ctx.gpu().create_texture_from_url_async(&path);
        let gpu = ctx.gpu().clone();
        let current = Rc::clone(&self.current);
        let shown = Rc::clone(&self.shown);
        let (image, width, height) = (self.image, self.width, self.height);
        Render::pending(async move {
            let loaded = load.await?;
            if let Some(old) = current.replace(Some(loaded.texture.texture))
                && let Err(e) = gpu.release_texture(old)
            {
                warn!("releasing {old} failed: {e}");
            }
            shown.replace(Some(path));
            Ok::<_, NodeError>(
                Outputs::new()
                    .set(image, Some(loaded.texture))
                    .set(width, f64::from(loaded.natural_width))
                    .set(height, f64::from(loaded.natural_height)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;
    use crate::gpu::{AssetResolver, CpuDevice, Gpu, ResourceManager};
    use crate::node::{Context, NodeId};
    use crate::port::PortValue;

    #[test]
    fn failed_loads_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetResolver::new(dir.path());
        let gpu = Gpu::new(ResourceManager::new(
            Box::new(CpuDevice::new()),
            assets.clone(),
            (1, 1),
        ));
        let node = gpu.scoped(gpu.allocate_owner());
        let mut scope = NodeScope::new(NodeId(1), node.clone(), assets, &[]);
        let mut logic = build(&mut scope).unwrap();
        let mut ports = scope.into_ports();
        ports[0].value = PortValue::File(Some("later.png".to_string()));
        let mut events = EventQueue::new();

        let Render::Pending(load) = logic.render(&mut RenderContext::new(Context::new(
            NodeId(1),
            &ports,
            &node,
            &mut events,
            0,
        ))) else {
            panic!("a new path should start a load");
        };
        assert!(pollster::block_on(load).is_err());

        image::RgbaImage::new(2, 2)
            .save(dir.path().join("later.png"))
            .unwrap();
        let Render::Pending(load) = logic.render(&mut RenderContext::new(Context::new(
            NodeId(1),
            &ports,
            &node,
            &mut events,
            1,
        ))) else {
            panic!("the failed path should load again");
        };
        let outputs = pollster::block_on(load).unwrap();
        assert_eq!(outputs.len(), 3);
    }
}
