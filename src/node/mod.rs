//! Node instances and the contract node code implements.
//!
//! A node is one instantiation of a [`NodeDefinition`]. Its construction
//! closure declares ports on a [`NodeScope`] and returns the [`NodeLogic`]
//! driving it; the engine then owns the lifecycle:
//!
//! ```text
//! Unloaded -> Starting -> Running <-> Error(Render)
//!                 |                        |
//!                 +-> Error(Start)         |
//!                                          v
//!               (any state) ---------> Disposed
//! ```
//!
//! `Disposed` is terminal. A reload disposes the current instance and builds a
//! new one under the same [`NodeId`].

mod context;
mod definition;
mod scope;

use std::fmt;
use std::rc::Rc;

use crate::error::NodeError;
use crate::events::ErrorPhase;
use crate::gpu::InstanceId;
use crate::port::{Direction, Port, PortId};

pub use context::{Context, Outputs, RenderContext};
pub use definition::{DefinitionSource, NodeDefinition, NodeFactory, NodeLogic, Render};
pub use scope::NodeScope;

/// Identifies a node for its whole life in a graph, across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unloaded,
    Starting,
    Running,
    Error(ErrorPhase),
    Disposed,
}

impl NodeState {
    /// Whether the scheduler may invoke `render()`.
    pub fn is_schedulable(self) -> bool {
        matches!(self, NodeState::Running | NodeState::Error(ErrorPhase::Render))
    }
}

/// A node in the graph.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) definition: Rc<NodeDefinition>,
    pub(crate) instance: InstanceId,
    pub(crate) ports: Vec<Port>,
    pub(crate) state: NodeState,
    pub(crate) logic: Option<Box<dyn NodeLogic>>,
    pub(crate) last_error: Option<NodeError>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        definition: Rc<NodeDefinition>,
        instance: InstanceId,
        ports: Vec<Port>,
    ) -> Self {
        Self {
            id,
            definition,
            instance,
            ports,
            state: NodeState::Unloaded,
            logic: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }

    /// Owner tag of the current instantiation.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The error that put the node into [`NodeState::Error`], if any.
    pub fn last_error(&self) -> Option<&NodeError> {
        self.last_error.as_ref()
    }

    /// Ports in declaration order.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.iter().find(|p| p.id == id)
    }

    pub(crate) fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.id == id)
    }

    /// Look a port up by name and direction.
    pub fn port_named(&self, name: &str, direction: Direction) -> Option<&Port> {
        self.ports
            .iter()
            .find(|p| p.name == name && p.direction == direction)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| !p.is_input())
    }

    pub(crate) fn has_dirty_input(&self) -> bool {
        self.inputs().any(|p| p.dirty)
    }

    pub(crate) fn clear_dirty(&mut self) {
        for port in &mut self.ports {
            port.dirty = false;
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("definition", &self.definition.name())
            .field("instance", &self.instance)
            .field("state", &self.state)
            .field("ports", &self.ports.len())
            .finish()
    }
}
