//! The host-facing engine.
//!
//! [`Engine`] ties the graph, scheduler, loader and resource manager together
//! and is the only type a host needs. All node code runs inside engine calls
//! on the caller's thread; nothing is spawned except image decoders.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = Engine::new(EngineConfig::from_env())?;
//! nodes::register_builtins(&mut engine);
//!
//! let color = engine.add_node("solid_color")?;
//! let output = engine.add_node("output")?;
//! engine.connect(engine.output(color, "image")?, engine.input(output, "image")?)?;
//! engine.set_input(engine.input(color, "color")?, PortValue::Color(Rgba::new(255.0, 0.0, 0.0, 1.0)))?;
//!
//! loop {
//!     let frame = engine.tick();
//!     for event in engine.drain_events() {
//!         // forward to the UI
//!     }
//! }
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::task::Poll;
use std::time::Instant;

use image::RgbaImage;
use log::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, GraphError, NodeError, Result, panic_message};
use crate::events::{EngineEvent, ErrorPhase, EventQueue, EventSink};
use crate::gpu::{AssetResolver, Gpu, GpuDevice, ResourceManager, create_device};
use crate::graph::Graph;
use crate::loader::{Built, Loader};
use crate::node::{
    Context, Node, NodeDefinition, NodeId, NodeLogic, NodeState, Outputs, Render, RenderContext,
};
use crate::port::{Direction, PortId, PortKind, PortValue};
use crate::scheduler::{Frame, PendingRender, Scheduler, poll_render};

/// A running node graph.
pub struct Engine {
    config: EngineConfig,
    gpu: Gpu,
    assets: AssetResolver,
    graph: Graph,
    scheduler: Scheduler,
    loader: Loader,
    events: EventQueue,
    started_at: Instant,
}

impl Engine {
    /// Create an engine on the device selected by `config.device`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let device = create_device(config.device)?;
        Ok(Self::with_device(config, device))
    }

    /// Create an engine on an explicit device.
    pub fn with_device(config: EngineConfig, device: Box<dyn GpuDevice>) -> Self {
        let assets = AssetResolver::new(&config.asset_root);
        info!(
            "engine on {} device, assets under {}",
            device.name(),
            assets.root().display()
        );
        let gpu = Gpu::new(ResourceManager::new(
            device,
            assets.clone(),
            config.default_target_size,
        ));
        Self {
            config,
            gpu,
            assets,
            graph: Graph::new(),
            scheduler: Scheduler::new(),
            loader: Loader::new(),
            events: EventQueue::new(),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node(id)
    }

    pub fn node_state(&self, id: NodeId) -> Option<NodeState> {
        self.graph.node(id).map(Node::state)
    }

    /// Register a definition. Replacing an existing one hot-reloads every
    /// node built from it; their ids are returned.
    pub fn register(&mut self, definition: NodeDefinition) -> Vec<NodeId> {
        let name = definition.name().to_string();
        if self.loader.register(definition) {
            self.reload_definition(&name)
        } else {
            Vec::new()
        }
    }

    /// Instantiate the definition registered as `definition`.
    ///
    /// The node is added even if construction or `start()` fails; it then
    /// sits in [`NodeState::Error`] until reloaded.
    pub fn add_node(&mut self, definition: &str) -> Result<NodeId> {
        let definition = self
            .loader
            .definition(definition)
            .ok_or_else(|| EngineError::UnknownDefinition(definition.to_string()))?;
        let id = self.graph.allocate_id();
        let built = Loader::build(&definition, id, &self.gpu, self.assets.clone(), &[]);
        self.graph
            .insert(Node::new(id, definition, built.instance, built.ports));
        self.start_node(id, built.logic);
        Ok(id)
    }

    /// Dispose a node and drop every edge touching it.
    ///
    /// A pending render of the node keeps running; its result is discarded.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if self.graph.node(id).is_none() {
            return Err(GraphError::UnknownNode(id).into());
        }
        self.scheduler.orphan(id);
        self.scheduler.forget(id);
        self.dispose_instance(id);
        let (mut node, changed) = self.graph.remove_node(id)?;
        node.state = NodeState::Disposed;
        info!("node {id} '{}' removed", node.definition.name());
        self.events.push(EngineEvent::NodeDisposed { node: id });
        for input in changed {
            self.notify_change(input);
        }
        Ok(())
    }

    /// Look up an input port by name.
    pub fn input(&self, node: NodeId, name: &str) -> Result<PortId> {
        self.port_named(node, name, Direction::Input)
    }

    /// Look up an output port by name.
    pub fn output(&self, node: NodeId, name: &str) -> Result<PortId> {
        self.port_named(node, name, Direction::Output)
    }

    fn port_named(&self, node: NodeId, name: &str, direction: Direction) -> Result<PortId> {
        let n = self.graph.node(node).ok_or(GraphError::UnknownNode(node))?;
        n.port_named(name, direction)
            .map(|p| p.id())
            .ok_or_else(|| EngineError::NoSuchPort {
                node,
                name: name.to_string(),
                direction,
            })
    }

    /// Current value of any port.
    pub fn value(&self, port: PortId) -> Result<PortValue> {
        Ok(self.graph.port(port)?.value().clone())
    }

    /// Read back the image held by an image port, if any.
    pub fn read_image(&self, port: PortId) -> Result<Option<RgbaImage>> {
        match self.graph.port(port)?.value() {
            PortValue::Image(Some(image)) => Ok(Some(self.gpu.read_pixels(image.texture)?)),
            PortValue::Image(None) => Ok(None),
            other => Err(GraphError::configuration(
                port,
                format!("{} port holds no image", other.kind()),
            )
            .into()),
        }
    }

    /// Wire `source` into `target`, replacing any edge already into `target`.
    pub fn connect(&mut self, source: impl Into<PortId>, target: impl Into<PortId>) -> Result<()> {
        let target = target.into();
        let connected = self.graph.connect(source.into(), target)?;
        if connected.changed {
            self.notify_change(target);
        }
        Ok(())
    }

    /// Remove the edge into `target`. Returns whether there was one.
    pub fn disconnect(&mut self, target: impl Into<PortId>) -> Result<bool> {
        let target = target.into();
        let detached = self.graph.disconnect(target)?;
        if detached.is_some_and(|d| d.changed) {
            self.notify_change(target);
        }
        Ok(detached.is_some())
    }

    /// Remove the edge `source -> target`. Returns whether it existed.
    pub fn disconnect_edge(
        &mut self,
        source: impl Into<PortId>,
        target: impl Into<PortId>,
    ) -> Result<bool> {
        let target = target.into();
        let detached = self.graph.disconnect_edge(source.into(), target)?;
        if detached.is_some_and(|d| d.changed) {
            self.notify_change(target);
        }
        Ok(detached.is_some())
    }

    /// Assign the value of an unconnected input from the host, e.g. a path
    /// chosen in a file dialog.
    pub fn set_input(&mut self, port: impl Into<PortId>, value: PortValue) -> Result<()> {
        let port = port.into();
        if self.graph.set_local(port, value)? {
            self.notify_change(port);
        }
        Ok(())
    }

    /// Activate a trigger input. Outputs staged by the handler are committed
    /// when it returns. A failing handler moves the node to
    /// [`NodeState::Error`] and its error is also returned.
    pub fn trigger(&mut self, port: impl Into<PortId>) -> Result<()> {
        let port = port.into();
        let p = self.graph.port(port)?;
        if !p.is_input() || p.kind() != PortKind::TriggerButton {
            return Err(GraphError::configuration(port, "not a trigger input").into());
        }
        let state = self.graph.node(port.node).map(Node::state);
        if !state.is_some_and(NodeState::is_schedulable) {
            return Err(GraphError::configuration(
                port,
                format!("node {} is not running", port.node),
            )
            .into());
        }

        let outcome = self.with_logic(port.node, |logic, ctx| {
            let mut rctx = RenderContext::new(ctx);
            let result = catch_unwind(AssertUnwindSafe(|| logic.on_trigger(port, &mut rctx)));
            (result, rctx.into_staged())
        });
        let Some((result, staged)) = outcome else {
            return Ok(());
        };
        let result = match result {
            Ok(result) => result.map(|()| staged),
            Err(payload) => Err(NodeError::Runtime(panic_message(payload))),
        };
        match result.and_then(|outputs| self.commit(port.node, outputs)) {
            Ok(()) => {
                self.recover(port.node);
                Ok(())
            }
            Err(error) => {
                self.fail(port.node, ErrorPhase::Render, error.clone());
                Err(EngineError::Node {
                    node: port.node,
                    error,
                })
            }
        }
    }

    /// Re-instantiate a node from the currently registered version of its
    /// definition. Deferred while the node's render is pending.
    pub fn reload(&mut self, id: NodeId) -> Result<()> {
        let node = self.graph.node(id).ok_or(GraphError::UnknownNode(id))?;
        let definition = self
            .loader
            .definition(node.definition.name())
            .unwrap_or_else(|| Rc::clone(&node.definition));
        self.reload_with(id, definition)
    }

    /// Re-instantiate a node from the definition it was built with.
    pub fn restart(&mut self, id: NodeId) -> Result<()> {
        let node = self.graph.node(id).ok_or(GraphError::UnknownNode(id))?;
        let definition = Rc::clone(&node.definition);
        self.reload_with(id, definition)
    }

    /// Deliver events to `sink` as they happen. With a sink registered,
    /// [`drain_events`](Self::drain_events) returns nothing.
    pub fn add_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    /// Take every event emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain()
    }

    /// Run one frame at the wall-clock time since the engine was created.
    pub fn tick(&mut self) -> Frame {
        let time = self.started_at.elapsed().as_secs_f64();
        self.tick_at(time)
    }

    /// Run one frame at an explicit time in seconds.
    pub fn tick_at(&mut self, time: f64) -> Frame {
        let index = self.scheduler.next_frame();
        self.gpu.set_time(time as f32);
        let mut frame = Frame {
            index,
            time,
            ..Frame::default()
        };

        self.scheduler.poll_orphans();
        self.poll_pending(&mut frame);

        for id in self.scheduler.take_ready_reloads() {
            if let Err(e) = self.reload(id) {
                warn!("deferred reload of {id} failed: {e}");
            }
        }
        if self.config.watch_sources {
            for name in self.loader.changed_sources() {
                info!("source of '{name}' changed");
                self.reload_definition(&name);
            }
        }

        let order = self.scheduler.order(&self.graph).to_vec();
        for &id in &order {
            if self.scheduler.is_pending(id) {
                frame.skipped_pending.push(id);
                continue;
            }
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let due = match node.state {
                NodeState::Running => true,
                NodeState::Error(ErrorPhase::Render) => node.has_dirty_input(),
                _ => false,
            };
            if due {
                self.render_node(id, &mut frame);
            }
        }
        frame.order = order;

        trace!(
            "frame {index}: rendered {}, pending {}, resolved {}",
            frame.rendered.len(),
            frame.skipped_pending.len(),
            frame.resolved.len()
        );
        frame
    }

    fn poll_pending(&mut self, frame: &mut Frame) {
        for id in self.scheduler.pending_nodes() {
            let Some((instance, result)) = self.scheduler.poll_pending(id) else {
                continue;
            };
            self.release_leaked_bind(id);
            if self.graph.node(id).map(Node::instance) != Some(instance) {
                debug!("discarding render of replaced instance {instance}");
                continue;
            }
            frame.resolved.push(id);
            if !self.finish(id, result) {
                frame.failed.push(id);
            }
        }
    }

    fn render_node(&mut self, id: NodeId, frame: &mut Frame) {
        let Some(instance) = self.graph.node(id).map(Node::instance) else {
            return;
        };
        let outcome = self.with_logic(id, |logic, ctx| {
            let mut rctx = RenderContext::new(ctx);
            let result = catch_unwind(AssertUnwindSafe(|| logic.render(&mut rctx)));
            (result, rctx.into_staged())
        });
        let Some((result, mut staged)) = outcome else {
            return;
        };
        if let Some(node) = self.graph.node_mut(id) {
            node.clear_dirty();
        }
        frame.rendered.push(id);

        let result = match result {
            Err(payload) => Err(NodeError::Runtime(panic_message(payload))),
            Ok(Render::Done(result)) => result.map(|()| staged),
            Ok(Render::Pending(mut future)) => {
                let polled = poll_render(&mut future);
                self.release_leaked_bind(id);
                match polled {
                    Poll::Ready(result) => result.map(|later| {
                        staged.merge(later);
                        staged
                    }),
                    Poll::Pending => {
                        trace!("render of {id} pending");
                        self.scheduler.insert_pending(
                            id,
                            PendingRender {
                                instance,
                                staged,
                                future,
                            },
                        );
                        return;
                    }
                }
            }
        };
        if !self.finish(id, result) {
            frame.failed.push(id);
        }
    }

    /// Commit a completed render or trigger. Returns whether it succeeded.
    fn finish(&mut self, id: NodeId, result: std::result::Result<Outputs, NodeError>) -> bool {
        let committed = result.and_then(|outputs| self.commit(id, outputs));
        match committed {
            Ok(()) => {
                self.recover(id);
                true
            }
            Err(error) => {
                self.fail(id, ErrorPhase::Render, error);
                false
            }
        }
    }

    fn recover(&mut self, id: NodeId) {
        if let Some(node) = self.graph.node_mut(id)
            && node.state == NodeState::Error(ErrorPhase::Render)
        {
            node.state = NodeState::Running;
            node.last_error = None;
            info!("node {id} '{}' recovered", node.definition.name());
            self.events.push(EngineEvent::NodeRecovered { node: id });
        }
    }

    /// Store staged outputs and propagate the changed ones. All-or-nothing:
    /// every value is validated before any is stored.
    fn commit(&mut self, id: NodeId, outputs: Outputs) -> std::result::Result<(), NodeError> {
        for (port, value) in outputs.iter() {
            self.graph.check_output(id, port, value)?;
        }
        let mut changed = Vec::new();
        for (port, value) in outputs.into_vec() {
            changed.extend(self.graph.set_output(port, value)?);
        }
        for input in changed {
            self.notify_change(input);
        }
        Ok(())
    }

    /// Run `on_change` for an input whose value changed.
    fn notify_change(&mut self, input: PortId) {
        let schedulable = self
            .graph
            .node(input.node)
            .is_some_and(|n| n.state.is_schedulable());
        if !schedulable {
            return;
        }
        let outcome = self.with_logic(input.node, |logic, mut ctx| {
            catch_unwind(AssertUnwindSafe(|| logic.on_change(input, &mut ctx)))
        });
        let error = match outcome {
            Some(Ok(Ok(()))) | None => return,
            Some(Ok(Err(error))) => error,
            Some(Err(payload)) => NodeError::Runtime(panic_message(payload)),
        };
        self.fail(input.node, ErrorPhase::Render, error);
    }

    /// Call into a node's logic with a context for it.
    ///
    /// The logic is taken out of the node for the duration of the call, and
    /// any bind span it leaves open is closed afterwards.
    fn with_logic<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut dyn NodeLogic, Context<'_>) -> R,
    ) -> Option<R> {
        let frame = self.scheduler.frame_index();
        let mut logic = self.graph.node_mut(id)?.logic.take()?;
        let result = match self.graph.node(id) {
            Some(node) => {
                let gpu = self.gpu.scoped(node.instance);
                let ctx = Context::new(id, &node.ports, &gpu, &mut self.events, frame);
                Some(f(&mut *logic, ctx))
            }
            None => None,
        };
        self.release_leaked_bind(id);
        if let Some(node) = self.graph.node_mut(id) {
            node.logic = Some(logic);
        }
        result
    }

    fn release_leaked_bind(&mut self, id: NodeId) {
        if let Some(target) = self.gpu.force_unbind() {
            warn!("node {id} left render target #{target} bound; unbinding");
        }
    }

    fn start_node(
        &mut self,
        id: NodeId,
        logic: std::result::Result<Box<dyn NodeLogic>, NodeError>,
    ) {
        let logic = match logic {
            Ok(logic) => logic,
            Err(error) => {
                self.fail(id, ErrorPhase::Start, error);
                return;
            }
        };
        let Some(node) = self.graph.node_mut(id) else {
            return;
        };
        node.state = NodeState::Starting;
        node.logic = Some(logic);

        let outcome = self.with_logic(id, |logic, mut ctx| {
            catch_unwind(AssertUnwindSafe(|| logic.start(&mut ctx)))
        });
        let result = match outcome {
            Some(Ok(result)) => result,
            Some(Err(payload)) => Err(NodeError::Runtime(panic_message(payload))),
            None => return,
        };
        match result {
            Ok(()) => {
                let Some(node) = self.graph.node_mut(id) else {
                    return;
                };
                node.state = NodeState::Running;
                node.last_error = None;
                let definition = node.definition.name().to_string();
                info!("node {id} '{definition}' started as {}", node.instance);
                self.events
                    .push(EngineEvent::NodeStarted { node: id, definition });
            }
            Err(error) => self.fail(id, ErrorPhase::Start, error),
        }
    }

    fn fail(&mut self, id: NodeId, phase: ErrorPhase, error: NodeError) {
        let Some(node) = self.graph.node_mut(id) else {
            return;
        };
        error!(
            "node {id} '{}' failed during {phase:?}: {error}",
            node.definition.name()
        );
        // a start failure is not downgraded by later hook failures
        if node.state != NodeState::Error(ErrorPhase::Start) {
            node.state = NodeState::Error(phase);
        }
        node.last_error = Some(error.clone());
        self.events.push(EngineEvent::NodeFailed {
            node: id,
            phase,
            error,
        });
    }

    /// Run `stop()` and release everything the current instance owns.
    fn dispose_instance(&mut self, id: NodeId) {
        let Some(node) = self.graph.node(id) else {
            return;
        };
        if node.state == NodeState::Disposed {
            return;
        }
        let instance = node.instance;
        let stopped = self.with_logic(id, |logic, mut ctx| {
            catch_unwind(AssertUnwindSafe(|| logic.stop(&mut ctx)))
        });
        if let Some(Err(payload)) = stopped {
            warn!("stop() of {id} panicked: {}", panic_message(payload));
        }
        if let Some(node) = self.graph.node_mut(id) {
            node.logic = None;
            node.state = NodeState::Unloaded;
        }
        let released = self.gpu.release_all(instance);
        debug!("disposed {instance} of {id}, released {released} handles");
    }

    fn reload_with(&mut self, id: NodeId, definition: Rc<NodeDefinition>) -> Result<()> {
        if self.scheduler.is_pending(id) {
            info!("reload of {id} deferred until its render resolves");
            self.scheduler.defer_reload(id);
            return Ok(());
        }
        let Some(node) = self.graph.node(id) else {
            return Err(GraphError::UnknownNode(id).into());
        };
        let old_instance = node.instance;
        let prior = node.ports.clone();

        self.dispose_instance(id);
        let Built {
            instance,
            ports,
            logic,
        } = Loader::build(&definition, id, &self.gpu, self.assets.clone(), &prior);
        // a failed build keeps the prior ports and their edges for the next reload
        let mut changed = if logic.is_ok() {
            self.graph.replace_ports(id, ports)?
        } else {
            self.gpu.release_all(instance);
            Vec::new()
        };

        let name = definition.name().to_string();
        let mut stale = Vec::new();
        if let Some(node) = self.graph.node_mut(id) {
            node.definition = definition;
            node.instance = instance;
            node.last_error = None;
            stale = node
                .outputs()
                .filter(|p| {
                    matches!(p.value(), PortValue::Image(Some(image)) if image.texture.owner() == old_instance)
                })
                .map(|p| p.id())
                .collect();
        }
        // outputs still pointing at released textures become absent
        for port in stale {
            changed.extend(self.graph.set_output(port, PortValue::Image(None))?);
        }

        info!("node {id} reloaded from '{name}' ({old_instance} -> {instance})");
        self.events.push(EngineEvent::NodeReloaded {
            node: id,
            definition: name,
        });
        for input in changed {
            self.notify_change(input);
        }
        self.start_node(id, logic);
        Ok(())
    }

    fn reload_definition(&mut self, name: &str) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|n| n.definition.name() == name)
            .map(Node::id)
            .collect();
        for &id in &ids {
            if let Err(e) = self.reload(id) {
                warn!("reload of {id} failed: {e}");
            }
        }
        ids
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let ids: Vec<NodeId> = self.graph.node_ids().collect();
        for id in ids {
            self.scheduler.orphan(id);
            self.dispose_instance(id);
            if let Some(node) = self.graph.node_mut(id) {
                node.state = NodeState::Disposed;
            }
        }
        debug!("engine dropped with {} orphaned renders", self.scheduler.orphan_count());
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::time::{Duration, SystemTime};

    use futures::channel::oneshot;

    use super::*;
    use crate::error::ResourceError;
    use crate::gpu::{CpuDevice, RenderTarget};
    use crate::node::NodeScope;
    use crate::nodes::{self, OVERLAY_SIGNAL, SAVED_SIGNAL, shader_file};
    use crate::port::{Constraints, In, Out, Rgba, kinds};

    fn engine_at(root: &std::path::Path) -> Engine {
        let config = EngineConfig::new()
            .asset_root(root)
            .default_target_size(4, 4);
        let mut engine = Engine::with_device(config, Box::new(CpuDevice::new()));
        nodes::register_builtins(&mut engine);
        engine
    }

    fn engine() -> Engine {
        engine_at(&std::env::temp_dir())
    }

    fn red(engine: &mut Engine, width: f64, height: f64) -> NodeId {
        let node = engine.add_node("solid_color").unwrap();
        engine
            .set_input(
                engine.input(node, "color").unwrap(),
                PortValue::Color(Rgba::new(255.0, 0.0, 0.0, 1.0)),
            )
            .unwrap();
        engine
            .set_input(engine.input(node, "width").unwrap(), PortValue::Number(width))
            .unwrap();
        engine
            .set_input(engine.input(node, "height").unwrap(), PortValue::Number(height))
            .unwrap();
        node
    }

    fn link(engine: &mut Engine, from: NodeId, to: NodeId) {
        let source = engine.output(from, "image").unwrap();
        let target = engine.input(to, "image").unwrap();
        engine.connect(source, target).unwrap();
    }

    /// Mirrors its number input and counts `on_change` calls.
    struct Probe {
        input: In<kinds::Number>,
        output: Out<kinds::Number>,
        changes: Rc<Cell<u32>>,
    }

    impl NodeLogic for Probe {
        fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
            let value = ctx.get(self.input);
            ctx.set(self.output, value);
            Render::ok()
        }

        fn on_change(
            &mut self,
            _port: PortId,
            _ctx: &mut Context<'_>,
        ) -> std::result::Result<(), NodeError> {
            self.changes.set(self.changes.get() + 1);
            Ok(())
        }
    }

    fn probe(name: &str, changes: Rc<Cell<u32>>) -> NodeDefinition {
        NodeDefinition::new(name, move |scope| {
            Ok(Box::new(Probe {
                input: scope.number_in("value", 0.0, Constraints::new())?,
                output: scope.number_out("value")?,
                changes: Rc::clone(&changes),
            }))
        })
    }

    #[test]
    fn red_chain_renders_in_one_tick() {
        let mut engine = engine();
        let color = red(&mut engine, 100.0, 50.0);
        let pass = engine.add_node("pass_through").unwrap();
        let output = engine.add_node("output").unwrap();
        link(&mut engine, color, pass);
        link(&mut engine, pass, output);

        let frame = engine.tick_at(0.0);
        assert_eq!(frame.order, vec![color, pass, output]);
        assert!(frame.failed.is_empty());

        let image = engine
            .read_image(engine.input(output, "image").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(image.dimensions(), (100, 50));
        assert!(image.pixels().all(|p| p.0 == [255, 0, 0, 255]));
    }

    #[test]
    fn invert_without_input_draws_nothing() {
        let mut engine = engine();
        let invert = engine.add_node("invert").unwrap();
        let frame = engine.tick_at(0.0);
        assert_eq!(frame.rendered, vec![invert]);
        assert!(frame.failed.is_empty());
        let out = engine.output(invert, "image").unwrap();
        assert_eq!(engine.value(out).unwrap(), PortValue::Image(None));
    }

    #[test]
    fn invert_flips_rgb() {
        let mut engine = engine();
        let color = red(&mut engine, 2.0, 2.0);
        let invert = engine.add_node("invert").unwrap();
        link(&mut engine, color, invert);
        engine.tick_at(0.0);

        let image = engine
            .read_image(engine.output(invert, "image").unwrap())
            .unwrap()
            .unwrap();
        assert!(image.pixels().all(|p| p.0 == [0, 255, 255, 255]));
    }

    #[test]
    fn second_edge_replaces_the_first() {
        let mut engine = engine();
        let a = red(&mut engine, 2.0, 2.0);
        let b = red(&mut engine, 3.0, 3.0);
        let pass = engine.add_node("pass_through").unwrap();
        link(&mut engine, a, pass);
        link(&mut engine, b, pass);

        let input = engine.input(pass, "image").unwrap();
        let a_out = engine.output(a, "image").unwrap();
        assert_eq!(engine.graph().source_of(input), engine.output(b, "image").ok());
        assert!(!engine.graph().port(a_out).unwrap().downstream().any(|p| p == input));
        assert_eq!(engine.graph().edge_count(), 1);
    }

    #[test]
    fn cycles_and_mismatches_leave_edges_alone() {
        let mut engine = engine();
        let first = engine.add_node("pass_through").unwrap();
        let second = engine.add_node("pass_through").unwrap();
        let diagnostics = engine.add_node("diagnostics").unwrap();
        link(&mut engine, first, second);

        let cycle = engine.connect(
            engine.output(second, "image").unwrap(),
            engine.input(first, "image").unwrap(),
        );
        assert!(matches!(cycle, Err(EngineError::Graph(GraphError::Cycle { .. }))));

        let mismatch = engine.connect(
            engine.output(diagnostics, "visible").unwrap(),
            engine.input(first, "image").unwrap(),
        );
        assert!(matches!(
            mismatch,
            Err(EngineError::Graph(GraphError::TypeMismatch { .. }))
        ));
        assert_eq!(engine.graph().edge_count(), 1);
    }

    #[test]
    fn equal_values_do_not_fire_on_change() {
        let mut engine = engine();
        let upstream_changes = Rc::new(Cell::new(0));
        let downstream_changes = Rc::new(Cell::new(0));
        engine.register(probe("source", Rc::clone(&upstream_changes)));
        engine.register(probe("sink", Rc::clone(&downstream_changes)));
        let source = engine.add_node("source").unwrap();
        let sink = engine.add_node("sink").unwrap();
        engine
            .connect(
                engine.output(source, "value").unwrap(),
                engine.input(sink, "value").unwrap(),
            )
            .unwrap();

        let input = engine.input(source, "value").unwrap();
        engine.set_input(input, PortValue::Number(3.0)).unwrap();
        engine.set_input(input, PortValue::Number(3.0)).unwrap();
        assert_eq!(upstream_changes.get(), 1);

        engine.tick_at(0.0);
        engine.tick_at(1.0);
        assert_eq!(downstream_changes.get(), 1);
        let sink_value = engine.value(engine.output(sink, "value").unwrap()).unwrap();
        assert_eq!(sink_value, PortValue::Number(3.0));
    }

    struct Flaky {
        fail: In<kinds::Toggle>,
        output: Out<kinds::Number>,
    }

    impl NodeLogic for Flaky {
        fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render {
            if ctx.get(self.fail) {
                return Render::Done(Err(NodeError::runtime("asked to fail")));
            }
            let frame = ctx.frame() as f64;
            ctx.set(self.output, frame);
            Render::ok()
        }
    }

    fn flaky() -> NodeDefinition {
        NodeDefinition::new("flaky", |scope| {
            Ok(Box::new(Flaky {
                fail: scope.toggle_in("fail", false)?,
                output: scope.number_out("frame")?,
            }))
        })
    }

    #[test]
    fn failed_nodes_keep_outputs_until_recovered() {
        let mut engine = engine();
        engine.register(flaky());
        let node = engine.add_node("flaky").unwrap();
        let fail = engine.input(node, "fail").unwrap();
        let out = engine.output(node, "frame").unwrap();

        engine.tick_at(0.0);
        assert_eq!(engine.value(out).unwrap(), PortValue::Number(1.0));

        engine.set_input(fail, PortValue::Toggle(true)).unwrap();
        let frame = engine.tick_at(1.0);
        assert_eq!(frame.failed, vec![node]);
        assert_eq!(engine.node_state(node), Some(NodeState::Error(ErrorPhase::Render)));
        assert_eq!(engine.value(out).unwrap(), PortValue::Number(1.0));

        let frame = engine.tick_at(2.0);
        assert!(frame.rendered.is_empty());
        assert_eq!(engine.value(out).unwrap(), PortValue::Number(1.0));

        engine.drain_events();
        engine.set_input(fail, PortValue::Toggle(false)).unwrap();
        engine.tick_at(3.0);
        assert_eq!(engine.node_state(node), Some(NodeState::Running));
        assert_eq!(engine.value(out).unwrap(), PortValue::Number(4.0));
        assert!(
            engine
                .drain_events()
                .contains(&EngineEvent::NodeRecovered { node })
        );
    }

    #[test]
    fn removed_nodes_release_their_textures() {
        let mut engine = engine();
        let color = red(&mut engine, 2.0, 2.0);
        let pass = engine.add_node("pass_through").unwrap();
        link(&mut engine, color, pass);
        engine.tick_at(0.0);

        let PortValue::Image(Some(image)) = engine.value(engine.output(color, "image").unwrap()).unwrap()
        else {
            panic!("solid color produced no image");
        };
        let instance = engine.node(color).unwrap().instance();
        let input = engine.input(pass, "image").unwrap();
        engine.remove_node(color).unwrap();

        assert!(engine.gpu().is_retired(instance));
        assert_eq!(engine.gpu().live_handles(instance), 0);
        assert!(matches!(
            engine.gpu().read_pixels(image.texture),
            Err(ResourceError::OwnerDisposed { .. })
        ));
        assert_eq!(engine.value(input).unwrap(), PortValue::Image(None));
        assert_eq!(engine.graph().edge_count(), 0);
        assert!(
            engine
                .drain_events()
                .contains(&EngineEvent::NodeDisposed { node: color })
        );
        assert!(matches!(
            engine.remove_node(color),
            Err(EngineError::Graph(GraphError::UnknownNode(_)))
        ));
    }

    /// Resolves each render with the next value sent by the test.
    struct Slow {
        output: Out<kinds::Number>,
        queue: Rc<RefCell<Vec<oneshot::Receiver<f64>>>>,
    }

    impl NodeLogic for Slow {
        fn render(&mut self, _ctx: &mut RenderContext<'_>) -> Render {
            let next = self.queue.borrow_mut().pop();
            let Some(rx) = next else {
                return Render::ok();
            };
            let output = self.output;
            Render::pending(async move {
                let value = rx
                    .await
                    .map_err(|_| NodeError::AsyncFailure("sender dropped".to_string()))?;
                Ok::<_, NodeError>(Outputs::new().set(output, value))
            })
        }
    }

    fn slow(queue: Rc<RefCell<Vec<oneshot::Receiver<f64>>>>) -> NodeDefinition {
        NodeDefinition::new("slow", move |scope| {
            Ok(Box::new(Slow {
                output: scope.number_out("value")?,
                queue: Rc::clone(&queue),
            }))
        })
    }

    #[test]
    fn pending_renders_are_skipped_and_reloads_deferred() {
        let mut engine = engine();
        let (tx, rx) = oneshot::channel();
        engine.register(slow(Rc::new(RefCell::new(vec![rx]))));
        engine.register(probe("probe", Rc::new(Cell::new(0))));
        let node = engine.add_node("slow").unwrap();
        let reader = engine.add_node("probe").unwrap();
        engine
            .connect(
                engine.output(node, "value").unwrap(),
                engine.input(reader, "value").unwrap(),
            )
            .unwrap();

        let frame = engine.tick_at(0.0);
        assert_eq!(frame.rendered, vec![node, reader]);
        assert!(engine.scheduler().is_pending(node));

        let frame = engine.tick_at(1.0);
        assert_eq!(frame.skipped_pending, vec![node]);
        assert_eq!(frame.rendered, vec![reader]);
        let read = engine.output(reader, "value").unwrap();
        assert_eq!(engine.value(read).unwrap(), PortValue::Number(0.0));

        let before = engine.node(node).unwrap().instance();
        engine.reload(node).unwrap();
        assert_eq!(engine.node(node).unwrap().instance(), before);
        assert!(
            !engine
                .drain_events()
                .iter()
                .any(|e| matches!(e, EngineEvent::NodeReloaded { .. }))
        );

        tx.send(7.0).unwrap();
        let frame = engine.tick_at(2.0);
        assert_eq!(frame.resolved, vec![node]);
        assert_eq!(engine.value(read).unwrap(), PortValue::Number(7.0));
        assert_ne!(engine.node(node).unwrap().instance(), before);
        assert!(engine.drain_events().contains(&EngineEvent::NodeReloaded {
            node,
            definition: "slow".to_string()
        }));
    }

    #[test]
    fn renders_of_removed_nodes_are_discarded() {
        let mut engine = engine();
        let (tx, rx) = oneshot::channel();
        engine.register(slow(Rc::new(RefCell::new(vec![rx]))));
        let node = engine.add_node("slow").unwrap();
        engine.tick_at(0.0);

        engine.remove_node(node).unwrap();
        assert_eq!(engine.scheduler().orphan_count(), 1);
        assert_eq!(engine.scheduler().pending_count(), 0);

        tx.send(1.0).unwrap();
        let frame = engine.tick_at(1.0);
        assert_eq!(engine.scheduler().orphan_count(), 0);
        assert!(frame.resolved.is_empty());
    }

    struct Bomb;

    impl NodeLogic for Bomb {
        fn render(&mut self, _ctx: &mut RenderContext<'_>) -> Render {
            panic!("kaboom")
        }
    }

    #[test]
    fn panics_fail_only_the_panicking_node() {
        let mut engine = engine();
        engine.register(NodeDefinition::new("bomb", |_| Ok(Box::new(Bomb))));
        let bomb = engine.add_node("bomb").unwrap();
        let color = red(&mut engine, 2.0, 2.0);

        let frame = engine.tick_at(0.0);
        assert_eq!(frame.failed, vec![bomb]);
        assert!(frame.rendered.contains(&color));
        assert!(matches!(
            engine.node(bomb).unwrap().last_error(),
            Some(NodeError::Runtime(message)) if message.contains("kaboom")
        ));
        let image = engine.output(color, "image").unwrap();
        assert!(matches!(engine.value(image).unwrap(), PortValue::Image(Some(_))));
    }

    struct Leaky {
        target: RenderTarget,
    }

    impl NodeLogic for Leaky {
        fn render(&mut self, _ctx: &mut RenderContext<'_>) -> Render {
            match self.target.bind() {
                Ok(bound) => {
                    std::mem::forget(bound);
                    Render::ok()
                }
                Err(e) => Render::Done(Err(e.into())),
            }
        }
    }

    #[test]
    fn leaked_binds_are_closed_after_each_node() {
        let mut engine = engine();
        engine.register(NodeDefinition::new("leaky", |scope: &mut NodeScope<'_>| {
            Ok(Box::new(Leaky {
                target: scope.gpu().create_render_target()?,
            }))
        }));
        let leaky = engine.add_node("leaky").unwrap();
        let color = red(&mut engine, 2.0, 2.0);

        for time in 0..2 {
            let frame = engine.tick_at(f64::from(time));
            assert_eq!(frame.rendered, vec![leaky, color]);
            assert!(frame.failed.is_empty());
        }
    }

    #[test]
    fn build_failures_add_an_errored_node() {
        let mut engine = engine();
        engine.register(NodeDefinition::new("broken", |_| {
            Err(NodeError::Build("missing asset".to_string()))
        }));
        let node = engine.add_node("broken").unwrap();
        assert_eq!(engine.node_state(node), Some(NodeState::Error(ErrorPhase::Start)));
        assert!(engine.drain_events().iter().any(|e| matches!(
            e,
            EngineEvent::NodeFailed { phase: ErrorPhase::Start, .. }
        )));
        assert!(engine.tick_at(0.0).rendered.is_empty());
        assert!(matches!(
            engine.add_node("nope"),
            Err(EngineError::UnknownDefinition(_))
        ));
    }

    #[test]
    fn reload_keeps_edges_and_drops_stale_images() {
        let mut engine = engine();
        let color = red(&mut engine, 2.0, 2.0);
        let pass = engine.add_node("pass_through").unwrap();
        link(&mut engine, color, pass);
        engine.tick_at(0.0);

        let out = engine.output(color, "image").unwrap();
        let input = engine.input(pass, "image").unwrap();
        engine.reload(color).unwrap();
        assert_eq!(engine.graph().source_of(input), Some(out));
        assert_eq!(engine.value(out).unwrap(), PortValue::Image(None));
        assert_eq!(engine.value(input).unwrap(), PortValue::Image(None));

        engine.tick_at(1.0);
        let image = engine
            .read_image(engine.output(pass, "image").unwrap())
            .unwrap()
            .unwrap();
        assert!(image.pixels().all(|p| p.0 == [255, 0, 0, 255]));
    }

    #[test]
    fn trigger_saves_the_output_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_at(dir.path());
        let color = red(&mut engine, 3.0, 2.0);
        let output = engine.add_node("output").unwrap();
        link(&mut engine, color, output);

        let save = engine.input(output, "save").unwrap();
        let failed = engine.trigger(save);
        assert!(matches!(failed, Err(EngineError::Node { .. })));
        assert_eq!(
            engine.node_state(output),
            Some(NodeState::Error(ErrorPhase::Render))
        );

        engine.tick_at(0.0);
        assert_eq!(engine.node_state(output), Some(NodeState::Running));
        engine
            .set_input(
                engine.input(output, "path").unwrap(),
                PortValue::File(Some("shot.png".to_string())),
            )
            .unwrap();
        engine.drain_events();
        engine.trigger(save).unwrap();

        let saved = image::open(dir.path().join("shot.png")).unwrap().to_rgba8();
        assert_eq!(saved.dimensions(), (3, 2));
        let events = engine.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Signal { name, .. } if name == SAVED_SIGNAL
        )));
        assert!(engine.trigger(engine.input(output, "path").unwrap()).is_err());
    }

    #[test]
    fn diagnostics_toggle_signals_the_host() {
        let mut engine = engine();
        let node = engine.add_node("diagnostics").unwrap();
        let overlay = engine.input(node, "overlay").unwrap();
        engine.set_input(overlay, PortValue::Toggle(true)).unwrap();

        let signals: Vec<PortValue> = engine
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Signal { name, value, .. } if name == OVERLAY_SIGNAL => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(
            signals,
            vec![PortValue::Toggle(false), PortValue::Toggle(true)]
        );
    }

    #[test]
    fn image_files_load_asynchronously() {
        let dir = tempfile::tempdir().unwrap();
        let mut picture = RgbaImage::new(3, 2);
        picture.put_pixel(2, 1, image::Rgba([10, 20, 30, 255]));
        picture.save(dir.path().join("pic.png")).unwrap();

        let mut engine = engine_at(dir.path());
        let node = engine.add_node("image_file").unwrap();
        engine
            .set_input(
                engine.input(node, "file").unwrap(),
                PortValue::File(Some("pic.png".to_string())),
            )
            .unwrap();

        let width = engine.output(node, "width").unwrap();
        for time in 0..500 {
            engine.tick_at(f64::from(time));
            if engine.value(width).unwrap() == PortValue::Number(3.0) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.value(width).unwrap(), PortValue::Number(3.0));
        let loaded = engine
            .read_image(engine.output(node, "image").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.get_pixel(2, 1).0, [10, 20, 30, 255]);
    }

    #[test]
    fn image_paths_outside_the_root_fail_the_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_at(dir.path());
        let node = engine.add_node("image_file").unwrap();
        engine
            .set_input(
                engine.input(node, "file").unwrap(),
                PortValue::File(Some("../escape.png".to_string())),
            )
            .unwrap();

        let frame = engine.tick_at(0.0);
        assert_eq!(frame.failed, vec![node]);
        assert!(matches!(
            engine.node(node).unwrap().last_error(),
            Some(NodeError::Resource(ResourceError::AssetOutsideRoot(_)))
        ));
    }

    #[test]
    fn edited_shader_files_reload_their_nodes() {
        const BODY: &str = "@fragment\nfn fs(in: QuadOut) -> @location(0) vec4f {\n    return textureSample(image, quad_sampler, in.uv);\n}\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.wgsl");
        fs::write(&path, format!("//! texture image\n{BODY}")).unwrap();

        let mut engine = engine_at(dir.path());
        engine.register(shader_file::definition("copy", &path));
        let node = engine.add_node("copy").unwrap();
        // WGSL has no CPU kernel
        assert_eq!(engine.node_state(node), Some(NodeState::Error(ErrorPhase::Start)));
        assert!(matches!(
            engine.node(node).unwrap().last_error(),
            Some(NodeError::Resource(ResourceError::Compile { .. }))
        ));
        assert!(engine.input(node, "gain").is_err());

        fs::write(&path, format!("//! texture image\n//! uniform gain: float\n{BODY}")).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        engine.drain_events();
        engine.tick_at(0.0);

        assert!(engine.drain_events().contains(&EngineEvent::NodeReloaded {
            node,
            definition: "copy".to_string()
        }));
        assert!(engine.input(node, "gain").is_ok());
        assert!(engine.input(node, "image").is_ok());
    }

    fn touch(path: &std::path::Path, seconds: u64) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn broken_shader_edits_keep_the_wiring() {
        const BODY: &str = "@fragment\nfn fs(in: QuadOut) -> @location(0) vec4f {\n    return textureSample(image, quad_sampler, in.uv);\n}\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.wgsl");
        let good = format!("//! texture image\n{BODY}");
        fs::write(&path, &good).unwrap();

        let mut engine = engine_at(dir.path());
        engine.register(shader_file::definition("copy", &path));
        let color = red(&mut engine, 2.0, 2.0);
        let node = engine.add_node("copy").unwrap();
        let output = engine.add_node("output").unwrap();
        link(&mut engine, color, node);
        link(&mut engine, node, output);
        let input = engine.input(node, "image").unwrap();
        let out = engine.output(node, "image").unwrap();

        fs::write(&path, format!("//! uniform offset: vec2\n{BODY}")).unwrap();
        touch(&path, 5);
        engine.tick_at(0.0);
        assert_eq!(engine.node_state(node), Some(NodeState::Error(ErrorPhase::Start)));
        assert!(matches!(
            engine.node(node).unwrap().last_error(),
            Some(NodeError::Build(_))
        ));
        assert_eq!(engine.graph().source_of(input), engine.output(color, "image").ok());
        assert_eq!(engine.graph().edge_count(), 2);

        fs::write(&path, &good).unwrap();
        touch(&path, 10);
        engine.tick_at(1.0);
        assert_eq!(engine.input(node, "image").unwrap(), input);
        assert_eq!(engine.output(node, "image").unwrap(), out);
        assert_eq!(engine.graph().source_of(input), engine.output(color, "image").ok());
        assert_eq!(
            engine.graph().source_of(engine.input(output, "image").unwrap()),
            Some(out)
        );
    }
}
