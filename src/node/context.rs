use std::ops::{Deref, DerefMut};

use crate::error::GraphError;
use crate::events::{EngineEvent, EventQueue};
use crate::gpu::NodeGpu;
use crate::node::NodeId;
use crate::port::{In, Out, Port, PortData, PortId, PortValue};

/// What a hook can see and do outside of writing outputs.
pub struct Context<'a> {
    pub(crate) node: NodeId,
    pub(crate) ports: &'a [Port],
    pub(crate) gpu: &'a NodeGpu,
    pub(crate) events: &'a mut EventQueue,
    pub(crate) frame: u64,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        node: NodeId,
        ports: &'a [Port],
        gpu: &'a NodeGpu,
        events: &'a mut EventQueue,
        frame: u64,
    ) -> Self {
        Self {
            node,
            ports,
            gpu,
            events,
            frame,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The node-scoped GPU facade.
    pub fn gpu(&self) -> &NodeGpu {
        self.gpu
    }

    /// Seconds since the engine started.
    pub fn time(&self) -> f32 {
        self.gpu.time()
    }

    /// Index of the current frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.iter().find(|p| p.id == id)
    }

    /// Current value of an input. Image inputs read `None` until something
    /// arrives.
    pub fn get<K: PortData>(&self, port: In<K>) -> K::Value {
        match self.port(port.id()) {
            Some(p) => K::read(&p.value),
            None => K::read(&K::KIND.empty_value()),
        }
    }

    /// Last committed value of one of this node's outputs.
    pub fn output<K: PortData>(&self, port: Out<K>) -> K::Value {
        match self.port(port.id()) {
            Some(p) => K::read(&p.value),
            None => K::read(&K::KIND.empty_value()),
        }
    }

    /// Untyped access to any of this node's ports.
    pub fn value(&self, port: PortId) -> Option<&PortValue> {
        self.port(port).map(|p| &p.value)
    }

    /// Whether the input changed since the previous render.
    pub fn is_dirty<K>(&self, port: In<K>) -> bool {
        self.port(port.id()).is_some_and(|p| p.dirty)
    }

    /// Emit a named domain event for the host.
    pub fn emit(&mut self, name: impl Into<String>, value: PortValue) {
        self.events.push(EngineEvent::Signal {
            node: self.node,
            name: name.into(),
            value,
        });
    }
}

/// Output values staged by one render or trigger invocation.
///
/// Setting the same port twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs {
    values: Vec<(PortId, PortValue)>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert) for typed handles.
    pub fn set<K: PortData>(mut self, port: Out<K>, value: K::Value) -> Self {
        self.insert(port.id(), K::write(value));
        self
    }

    pub fn insert(&mut self, port: PortId, value: PortValue) {
        self.values.retain(|(id, _)| *id != port);
        self.values.push((port, value));
    }

    /// Apply `later` on top of `self`.
    pub fn merge(&mut self, later: Outputs) {
        for (port, value) in later.values {
            self.insert(port, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortId, &PortValue)> {
        self.values.iter().map(|(id, value)| (*id, value))
    }

    pub(crate) fn into_vec(self) -> Vec<(PortId, PortValue)> {
        self.values
    }
}

/// Context of `render()` and `on_trigger()`: a [`Context`] that can also
/// stage output values.
pub struct RenderContext<'a> {
    ctx: Context<'a>,
    staged: Outputs,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(ctx: Context<'a>) -> Self {
        Self {
            ctx,
            staged: Outputs::new(),
        }
    }

    /// Stage an output value. It becomes visible when the hook completes.
    pub fn set<K: PortData>(&mut self, port: Out<K>, value: K::Value) {
        self.staged.insert(port.id(), K::write(value));
    }

    /// Stage a value on an output identified at runtime.
    pub fn set_value(&mut self, port: PortId, value: PortValue) -> Result<(), GraphError> {
        let Some(target) = self.ctx.port(port) else {
            return Err(GraphError::UnknownPort(port));
        };
        if target.is_input() {
            return Err(GraphError::configuration(port, "inputs cannot be set by node code"));
        }
        if value.kind() != target.kind {
            return Err(GraphError::configuration(
                port,
                format!("{} value on {} output", value.kind(), target.kind),
            ));
        }
        self.staged.insert(port, value);
        Ok(())
    }

    /// Values staged so far.
    pub fn staged(&self) -> &Outputs {
        &self.staged
    }

    pub(crate) fn into_staged(self) -> Outputs {
        self.staged
    }
}

impl<'a> Deref for RenderContext<'a> {
    type Target = Context<'a>;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for RenderContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
