//! # hotgraph
//!
//! **A hot-reloadable node graph that renders GPU images once per frame.**
//!
//! Nodes are small programs with typed input and output ports. Wire them into
//! an acyclic graph, tick the engine, and every node renders in dependency
//! order, reading its inputs and publishing its outputs. Node definitions can
//! be swapped while the graph runs; edges and port values survive.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hotgraph::*;
//!
//! fn main() -> Result<()> {
//!     let mut engine = Engine::new(EngineConfig::from_env())?;
//!     nodes::register_builtins(&mut engine);
//!
//!     let color = engine.add_node("solid_color")?;
//!     let output = engine.add_node("output")?;
//!     engine.connect(engine.output(color, "image")?, engine.input(output, "image")?)?;
//!     engine.set_input(
//!         engine.input(color, "color")?,
//!         PortValue::Color(Rgba::new(255.0, 128.0, 0.0, 1.0)),
//!     )?;
//!
//!     engine.tick();
//!     let image = engine.read_image(engine.input(output, "image")?)?;
//!     assert!(image.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Writing nodes
//!
//! A [`NodeDefinition`] is a name plus a construction closure. The closure
//! receives a [`NodeScope`], declares ports, allocates GPU resources through
//! [`NodeScope::gpu`] and returns the node's [`NodeLogic`]:
//!
//! ```no_run
//! use hotgraph::*;
//!
//! struct Brightness {
//!     input: In<kinds::Number>,
//!     output: Out<kinds::Number>,
//! }
//!
//! impl NodeLogic for Brightness {
//!     fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
//!         let value = ctx.get(self.input);
//!         ctx.set(self.output, value * 2.0);
//!         Render::ok()
//!     }
//! }
//!
//! let definition = NodeDefinition::new("brightness", |scope| {
//!     Ok(Box::new(Brightness {
//!         input: scope.number_in("value", 0.5, Constraints::new().min(0.0))?,
//!         output: scope.number_out("value")?,
//!     }))
//! });
//! ```
//!
//! `render` may also return [`Render::pending`] with a future; the node is
//! then skipped until the future resolves and downstream nodes keep reading
//! its previous outputs.
//!
//! ## Failure model
//!
//! A node that errors or panics moves to [`NodeState::Error`] and keeps its
//! last outputs; everything else keeps rendering. Failures are reported as
//! [`EngineEvent`]s and through the `log` facade.

mod config;
mod engine;
mod error;
mod events;
mod gpu;
mod graph;
mod loader;
mod node;
pub mod nodes;
mod port;
mod scheduler;

pub use config::{ASSET_ROOT_ENV, EngineConfig};
pub use engine::Engine;
pub use error::{EngineError, GraphError, NodeError, ResourceError, Result};
pub use events::{EngineEvent, ErrorPhase, EventError, EventQueue, EventSink, NullEventSink};
pub use gpu::{
    AssetResolver, BoundTarget, CpuDevice, DeviceKind, FRAME_UNIFORM, Fragment, FragmentKernel,
    FragmentSource, Gpu, GpuDevice, InstanceId, LoadedTexture, NodeGpu, ProgramId, RenderTarget,
    ResourceManager, TargetId, TexelView, TextureId, UniformKind, UniformValue, Uniforms,
    WgpuDevice, create_device,
};
pub use graph::{Edge, Graph};
pub use loader::{Loader, SourceWatcher};
pub use node::{
    Context, DefinitionSource, Node, NodeDefinition, NodeFactory, NodeId, NodeLogic, NodeScope,
    NodeState, Outputs, Render, RenderContext,
};
pub use port::{
    Constraints, Direction, ImageRef, In, Out, Port, PortData, PortId, PortKind, PortValue, Rgba,
    kinds,
};
pub use scheduler::{Frame, Scheduler, topological_order};

// Re-export for convenience
pub use glam::{Vec2, Vec4};
pub use image::RgbaImage;
