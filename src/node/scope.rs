use crate::error::GraphError;
use crate::gpu::{AssetResolver, NodeGpu};
use crate::node::NodeId;
use crate::port::{
    Constraints, Direction, In, Out, Port, PortData, PortId, PortKind, PortValue, Rgba, kinds,
};

/// The construction scope handed to a definition's factory.
///
/// Port factories declare the node's interface. Declaration order is the
/// port order. When the scope is building a reload, a declaration matching a
/// previous port by name, direction and kind takes over that port's slot,
/// value and connections.
pub struct NodeScope<'a> {
    node: NodeId,
    gpu: NodeGpu,
    assets: AssetResolver,
    prior: &'a [Port],
    ports: Vec<Port>,
    next_slot: u32,
}

impl<'a> NodeScope<'a> {
    pub(crate) fn new(node: NodeId, gpu: NodeGpu, assets: AssetResolver, prior: &'a [Port]) -> Self {
        let next_slot = prior.iter().map(|p| p.id.slot + 1).max().unwrap_or(0);
        Self {
            node,
            gpu,
            assets,
            prior,
            ports: Vec::new(),
            next_slot,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The GPU facade of the instance being built. Allocations made here are
    /// owned by the instance like those made in `start()`.
    pub fn gpu(&self) -> &NodeGpu {
        &self.gpu
    }

    pub fn assets(&self) -> &AssetResolver {
        &self.assets
    }

    /// Declare a port of any kind.
    pub fn declare(
        &mut self,
        name: &str,
        kind: PortKind,
        direction: Direction,
        default: PortValue,
        constraints: Constraints,
    ) -> Result<PortId, GraphError> {
        if let Some(existing) = self
            .ports
            .iter()
            .find(|p| p.name == name && p.direction == direction)
        {
            if existing.kind == kind {
                return Ok(existing.id);
            }
            return Err(GraphError::configuration(
                existing.id,
                format!(
                    "'{name}' is already declared as {}, not {kind}",
                    existing.kind
                ),
            ));
        }
        if default.kind() != kind {
            return Err(GraphError::configuration(
                PortId {
                    node: self.node,
                    slot: self.next_slot,
                },
                format!("default for '{name}' is {}, expected {kind}", default.kind()),
            ));
        }

        let port = match self
            .prior
            .iter()
            .find(|p| p.name == name && p.direction == direction && p.kind == kind)
        {
            Some(prior) => {
                let mut port = prior.clone();
                port.default = constraints.apply(default);
                port.constraints = constraints;
                if port.is_input() && port.upstream.is_none() {
                    port.value = port.constraints.apply(port.unconnected_value());
                }
                port
            }
            None => {
                let id = PortId {
                    node: self.node,
                    slot: self.next_slot,
                };
                self.next_slot += 1;
                Port::new(id, name, kind, direction, default, constraints)
            }
        };
        let id = port.id;
        self.ports.push(port);
        Ok(id)
    }

    fn input<K: PortData>(
        &mut self,
        name: &str,
        default: PortValue,
        constraints: Constraints,
    ) -> Result<In<K>, GraphError> {
        self.declare(name, K::KIND, Direction::Input, default, constraints)
            .map(In::new)
    }

    fn output<K: PortData>(&mut self, name: &str) -> Result<Out<K>, GraphError> {
        self.declare(
            name,
            K::KIND,
            Direction::Output,
            K::KIND.empty_value(),
            Constraints::new(),
        )
        .map(Out::new)
    }

    pub fn image_in(&mut self, name: &str) -> Result<In<kinds::Image>, GraphError> {
        self.input(name, PortValue::Image(None), Constraints::new())
    }

    pub fn image_out(&mut self, name: &str) -> Result<Out<kinds::Image>, GraphError> {
        self.output(name)
    }

    /// A number input clamped to the constraints' `min`/`max`.
    pub fn number_in(
        &mut self,
        name: &str,
        default: f64,
        constraints: Constraints,
    ) -> Result<In<kinds::Number>, GraphError> {
        self.input(name, PortValue::Number(default), constraints)
    }

    pub fn number_out(&mut self, name: &str) -> Result<Out<kinds::Number>, GraphError> {
        self.output(name)
    }

    /// A color input. The default may use 0–255 or 0–1 RGB.
    pub fn color_in(
        &mut self,
        name: &str,
        default: impl Into<Rgba>,
    ) -> Result<In<kinds::Color>, GraphError> {
        self.input(name, PortValue::Color(default.into()), Constraints::new())
    }

    pub fn color_out(&mut self, name: &str) -> Result<Out<kinds::Color>, GraphError> {
        self.output(name)
    }

    pub fn toggle_in(&mut self, name: &str, default: bool) -> Result<In<kinds::Toggle>, GraphError> {
        self.input(name, PortValue::Toggle(default), Constraints::new())
    }

    pub fn toggle_out(&mut self, name: &str) -> Result<Out<kinds::Toggle>, GraphError> {
        self.output(name)
    }

    /// A file input. `file_type` is a hint for the host's picker.
    pub fn file_in(&mut self, name: &str, file_type: &str) -> Result<In<kinds::File>, GraphError> {
        self.input(
            name,
            PortValue::File(None),
            Constraints::new().file_type(file_type),
        )
    }

    /// A momentary button. Activated with [`Engine::trigger`](crate::Engine::trigger).
    pub fn trigger_button_in(&mut self, name: &str) -> Result<In<kinds::Trigger>, GraphError> {
        self.input(name, PortValue::Trigger, Constraints::new())
    }

    pub(crate) fn into_ports(self) -> Vec<Port> {
        self.ports
    }
}
