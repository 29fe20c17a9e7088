//! Nodes plus directed port-to-port edges.
//!
//! The graph owns every [`Node`] and keeps three views of the wiring in sync:
//! the edge map (target input to source output), each input's `upstream`, and
//! each output's ordered `downstream` set. Mutations validate first and only
//! then touch state, so a failed call leaves the graph exactly as it was.
//!
//! Every topology change bumps [`revision`](Graph::revision); the scheduler
//! uses it to decide when its cached order is out of date.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::debug;

use crate::error::GraphError;
use crate::node::{Node, NodeId};
use crate::port::{Direction, Port, PortId, PortKind, PortValue};

/// A directed connection from an output to an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: PortId,
    pub target: PortId,
}

/// Outcome of a successful [`Graph::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Connected {
    /// The source the target input was previously wired to.
    pub replaced: Option<PortId>,
    /// Whether the target input's value changed.
    pub changed: bool,
}

/// An edge that was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Detached {
    pub source: PortId,
    pub changed: bool,
}

/// The node graph.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: IndexMap<NodeId, Node>,
    /// target input -> source output
    edges: IndexMap<PortId, PortId>,
    revision: u64,
    next_node: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topology revision. Changes whenever nodes, ports or edges change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Position of `id` in insertion order.
    pub fn insertion_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get_index_of(&id)
    }

    /// Edges in connection order.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges.iter().map(|(target, source)| Edge {
            source: *source,
            target: *target,
        })
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// The output feeding `target`, if any.
    pub fn source_of(&self, target: PortId) -> Option<PortId> {
        self.edges.get(&target).copied()
    }

    pub fn port(&self, id: PortId) -> Result<&Port, GraphError> {
        self.nodes
            .get(&id.node)
            .ok_or(GraphError::UnknownNode(id.node))?
            .port(id)
            .ok_or(GraphError::UnknownPort(id))
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut Port, GraphError> {
        self.nodes
            .get_mut(&id.node)
            .ok_or(GraphError::UnknownNode(id.node))?
            .port_mut(id)
            .ok_or(GraphError::UnknownPort(id))
    }

    pub(crate) fn allocate_id(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }

    pub(crate) fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
        self.revision += 1;
    }

    /// Whether any path of edges leads from `from` to `to`. A node reaches
    /// itself.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for output in node.outputs() {
                    stack.extend(output.downstream.iter().map(|input| input.node));
                }
            }
        }
        false
    }

    /// Wire `source` (an output) into `target` (an input).
    ///
    /// An existing edge into `target` is replaced in the same operation.
    pub(crate) fn connect(&mut self, source: PortId, target: PortId) -> Result<Connected, GraphError> {
        let from = self.port(source)?;
        let to = self.port(target)?;
        if from.direction != Direction::Output {
            return Err(GraphError::configuration(source, "edges must start at an output"));
        }
        if to.direction != Direction::Input {
            return Err(GraphError::configuration(target, "edges must end at an input"));
        }
        if !from.kind.converts_to(to.kind) {
            return Err(GraphError::TypeMismatch {
                from: source,
                to: target,
                from_kind: from.kind,
                to_kind: to.kind,
            });
        }
        if self.reaches(target.node, source.node) {
            return Err(GraphError::Cycle {
                from: source,
                to: target,
            });
        }
        if to.upstream == Some(source) {
            return Ok(Connected {
                replaced: None,
                changed: false,
            });
        }

        let value = to
            .constraints
            .apply(from.value.convert_to(to.kind).unwrap_or_else(|| to.kind.empty_value()));
        let replaced = to.upstream;
        if let Some(old) = replaced {
            self.port_mut(old)?.downstream.shift_remove(&target);
        }
        self.port_mut(source)?.downstream.insert(target);
        self.edges.insert(target, source);

        let input = self.port_mut(target)?;
        input.upstream = Some(source);
        let changed = input.replace_value(value);
        input.dirty |= changed;

        self.revision += 1;
        debug!("connected {source} -> {target}");
        Ok(Connected { replaced, changed })
    }

    /// Remove the edge into `target`. The input reverts to its local or
    /// default value.
    pub(crate) fn disconnect(&mut self, target: PortId) -> Result<Option<Detached>, GraphError> {
        let Some(source) = self.port(target)?.upstream else {
            return Ok(None);
        };
        if let Ok(output) = self.port_mut(source) {
            output.downstream.shift_remove(&target);
        }
        self.edges.shift_remove(&target);

        let input = self.port_mut(target)?;
        input.upstream = None;
        let fallback = input.unconnected_value();
        let changed = input.replace_value(fallback);
        input.dirty |= changed;

        self.revision += 1;
        debug!("disconnected {source} -> {target}");
        Ok(Some(Detached { source, changed }))
    }

    /// Remove the edge `source -> target` if it exists.
    pub(crate) fn disconnect_edge(
        &mut self,
        source: PortId,
        target: PortId,
    ) -> Result<Option<Detached>, GraphError> {
        self.port(source)?;
        if self.port(target)?.upstream != Some(source) {
            return Ok(None);
        }
        self.disconnect(target)
    }

    /// Remove a node and every edge touching it. Returns the node and the
    /// inputs of other nodes whose value changed as a result.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Result<(Node, Vec<PortId>), GraphError> {
        let ports: Vec<PortId> = self
            .nodes
            .get(&id)
            .ok_or(GraphError::UnknownNode(id))?
            .ports
            .iter()
            .map(|p| p.id)
            .collect();
        let mut changed = Vec::new();
        for port in ports {
            changed.extend(self.detach_port(port)?);
        }
        changed.retain(|p| p.node != id);
        let node = self
            .nodes
            .shift_remove(&id)
            .ok_or(GraphError::UnknownNode(id))?;
        self.revision += 1;
        Ok((node, changed))
    }

    /// Drop every edge touching `port`. Returns the inputs whose value changed.
    fn detach_port(&mut self, port: PortId) -> Result<Vec<PortId>, GraphError> {
        let p = self.port(port)?;
        if p.is_input() {
            let changed = self.disconnect(port)?;
            return Ok(changed.filter(|d| d.changed).map(|_| port).into_iter().collect());
        }
        let targets: Vec<PortId> = p.downstream.iter().copied().collect();
        let mut changed = Vec::new();
        for target in targets {
            if let Some(detached) = self.disconnect(target)?
                && detached.changed
            {
                changed.push(target);
            }
        }
        Ok(changed)
    }

    /// Swap in the ports of a reloaded instance. Ports that no longer exist
    /// lose their edges; returns the inputs elsewhere whose value changed.
    pub(crate) fn replace_ports(
        &mut self,
        id: NodeId,
        ports: Vec<Port>,
    ) -> Result<Vec<PortId>, GraphError> {
        let kept: HashSet<PortId> = ports.iter().map(|p| p.id).collect();
        let dropped: Vec<PortId> = self
            .nodes
            .get(&id)
            .ok_or(GraphError::UnknownNode(id))?
            .ports
            .iter()
            .map(|p| p.id)
            .filter(|p| !kept.contains(p))
            .collect();

        let mut changed = Vec::new();
        for port in dropped {
            changed.extend(self.detach_port(port)?);
        }
        changed.retain(|p| p.node != id);

        if let Some(node) = self.nodes.get_mut(&id) {
            node.ports = ports;
        }
        self.revision += 1;
        Ok(changed)
    }

    /// Commit `value` to an output and push it downstream.
    ///
    /// Returns the downstream inputs whose value changed. An equal value is
    /// not a change and reaches nobody.
    pub(crate) fn set_output(
        &mut self,
        port: PortId,
        value: PortValue,
    ) -> Result<Vec<PortId>, GraphError> {
        let output = self.port_mut(port)?;
        if output.is_input() {
            return Err(GraphError::configuration(port, "inputs cannot be set by node code"));
        }
        if value.kind() != output.kind {
            return Err(GraphError::configuration(
                port,
                format!("{} value on {} output", value.kind(), output.kind),
            ));
        }
        if !output.replace_value(value.clone()) {
            return Ok(Vec::new());
        }
        let targets: Vec<PortId> = output.downstream.iter().copied().collect();

        let mut changed = Vec::new();
        for target in targets {
            let input = self.port_mut(target)?;
            let converted = input.constraints.apply(
                value
                    .convert_to(input.kind)
                    .unwrap_or_else(|| input.kind.empty_value()),
            );
            if input.replace_value(converted) {
                input.dirty = true;
                changed.push(target);
            }
        }
        Ok(changed)
    }

    /// Check that `value` could be committed to `port` by node `owner`.
    pub(crate) fn check_output(
        &self,
        owner: NodeId,
        port: PortId,
        value: &PortValue,
    ) -> Result<(), GraphError> {
        if port.node != owner {
            return Err(GraphError::configuration(port, "outputs belong to their own node"));
        }
        let output = self.port(port)?;
        if output.is_input() {
            return Err(GraphError::configuration(port, "inputs cannot be set by node code"));
        }
        if value.kind() != output.kind {
            return Err(GraphError::configuration(
                port,
                format!("{} value on {} output", value.kind(), output.kind),
            ));
        }
        Ok(())
    }

    /// Assign the host-side value of an unconnected input. Returns whether
    /// the port's value changed.
    pub(crate) fn set_local(&mut self, port: PortId, value: PortValue) -> Result<bool, GraphError> {
        let input = self.port_mut(port)?;
        if !input.is_input() {
            return Err(GraphError::configuration(port, "outputs are written by their node"));
        }
        if input.kind == PortKind::TriggerButton {
            return Err(GraphError::configuration(port, "trigger inputs carry no value"));
        }
        if input.upstream.is_some() {
            return Err(GraphError::configuration(
                port,
                "connected inputs follow their upstream output",
            ));
        }
        let Some(value) = value.convert_to(input.kind) else {
            return Err(GraphError::configuration(
                port,
                format!("expected a {} value, got {}", input.kind, value.kind()),
            ));
        };
        let value = input.constraints.apply(value);
        input.local = Some(value.clone());
        let changed = input.replace_value(value);
        input.dirty |= changed;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::error::NodeError;
    use crate::gpu::InstanceId;
    use crate::node::NodeDefinition;
    use crate::port::{Constraints, Rgba};

    fn add(graph: &mut Graph, ports: &[(&str, PortKind, Direction)]) -> NodeId {
        let id = graph.allocate_id();
        let definition = Rc::new(NodeDefinition::new("test", |_| {
            Err(NodeError::runtime("not buildable"))
        }));
        let ports = ports
            .iter()
            .enumerate()
            .map(|(slot, (name, kind, direction))| {
                Port::new(
                    PortId {
                        node: id,
                        slot: slot as u32,
                    },
                    *name,
                    *kind,
                    *direction,
                    kind.empty_value(),
                    Constraints::new(),
                )
            })
            .collect();
        graph.insert(Node::new(id, definition, InstanceId(0), ports));
        id
    }

    fn image_node(graph: &mut Graph) -> (PortId, PortId) {
        let id = add(
            graph,
            &[
                ("image", PortKind::Image, Direction::Input),
                ("image", PortKind::Image, Direction::Output),
            ],
        );
        (PortId { node: id, slot: 0 }, PortId { node: id, slot: 1 })
    }

    #[test]
    fn connect_mirrors_upstream_value() {
        let mut graph = Graph::new();
        let number = add(&mut graph, &[("n", PortKind::Number, Direction::Output)]);
        let sink = add(&mut graph, &[("on", PortKind::Toggle, Direction::Input)]);
        let out = PortId { node: number, slot: 0 };
        let input = PortId { node: sink, slot: 0 };

        graph.set_output(out, PortValue::Number(3.0)).unwrap();
        let connected = graph.connect(out, input).unwrap();
        assert!(connected.changed);
        assert_eq!(graph.port(input).unwrap().value, PortValue::Toggle(true));
        assert!(graph.port(input).unwrap().is_dirty());
    }

    #[test]
    fn incompatible_kinds_leave_graph_unchanged() {
        let mut graph = Graph::new();
        let color = add(&mut graph, &[("c", PortKind::Color, Direction::Output)]);
        let (image_in, _) = image_node(&mut graph);
        let revision = graph.revision();

        let err = graph
            .connect(PortId { node: color, slot: 0 }, image_in)
            .unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.revision(), revision);
    }

    #[test]
    fn direction_is_checked_before_kind() {
        let mut graph = Graph::new();
        let (a_in, a_out) = image_node(&mut graph);
        let (b_in, _) = image_node(&mut graph);
        assert!(matches!(
            graph.connect(a_in, b_in),
            Err(GraphError::Configuration { .. })
        ));
        assert!(matches!(
            graph.connect(a_out, a_out),
            Err(GraphError::Configuration { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = Graph::new();
        let (a_in, a_out) = image_node(&mut graph);
        let (b_in, b_out) = image_node(&mut graph);
        let (c_in, c_out) = image_node(&mut graph);
        graph.connect(a_out, b_in).unwrap();
        graph.connect(b_out, c_in).unwrap();

        assert!(matches!(
            graph.connect(c_out, a_in),
            Err(GraphError::Cycle { .. })
        ));
        assert!(matches!(
            graph.connect(a_out, a_in),
            Err(GraphError::Cycle { .. })
        ));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn second_edge_replaces_first() {
        let mut graph = Graph::new();
        let (_, a_out) = image_node(&mut graph);
        let (_, b_out) = image_node(&mut graph);
        let (c_in, _) = image_node(&mut graph);

        graph.connect(a_out, c_in).unwrap();
        let connected = graph.connect(b_out, c_in).unwrap();

        assert_eq!(connected.replaced, Some(a_out));
        assert_eq!(graph.source_of(c_in), Some(b_out));
        assert_eq!(graph.port(a_out).unwrap().downstream().count(), 0);
        assert_eq!(
            graph.port(b_out).unwrap().downstream().collect::<Vec<_>>(),
            vec![c_in]
        );
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn disconnect_reverts_to_local_value() {
        let mut graph = Graph::new();
        let src = add(&mut graph, &[("c", PortKind::Color, Direction::Output)]);
        let dst = add(&mut graph, &[("c", PortKind::Color, Direction::Input)]);
        let out = PortId { node: src, slot: 0 };
        let input = PortId { node: dst, slot: 0 };

        graph
            .set_local(input, PortValue::Color(Rgba::WHITE))
            .unwrap();
        graph
            .set_output(out, PortValue::Color(Rgba::BLACK))
            .unwrap();
        graph.connect(out, input).unwrap();
        assert_eq!(graph.port(input).unwrap().value, PortValue::Color(Rgba::BLACK));
        assert!(graph.set_local(input, PortValue::Color(Rgba::WHITE)).is_err());

        let detached = graph.disconnect(input).unwrap().unwrap();
        assert_eq!(detached.source, out);
        assert!(detached.changed);
        assert_eq!(graph.port(input).unwrap().value, PortValue::Color(Rgba::WHITE));
        assert!(graph.disconnect(input).unwrap().is_none());
    }

    #[test]
    fn equal_output_values_do_not_propagate() {
        let mut graph = Graph::new();
        let src = add(&mut graph, &[("n", PortKind::Number, Direction::Output)]);
        let dst = add(&mut graph, &[("n", PortKind::Number, Direction::Input)]);
        let out = PortId { node: src, slot: 0 };
        let input = PortId { node: dst, slot: 0 };
        graph.connect(out, input).unwrap();

        assert_eq!(graph.set_output(out, PortValue::Number(2.0)).unwrap(), vec![input]);
        assert!(graph.set_output(out, PortValue::Number(2.0)).unwrap().is_empty());
    }

    #[test]
    fn remove_node_drops_its_edges() {
        let mut graph = Graph::new();
        let (a_in, a_out) = image_node(&mut graph);
        let (b_in, b_out) = image_node(&mut graph);
        let (c_in, _) = image_node(&mut graph);
        graph.connect(a_out, b_in).unwrap();
        graph.connect(b_out, c_in).unwrap();

        let (removed, _) = graph.remove_node(b_in.node).unwrap();
        assert_eq!(removed.id(), b_in.node);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.port(a_out).unwrap().downstream().count(), 0);
        assert_eq!(graph.port(c_in).unwrap().upstream(), None);
        assert!(graph.port(a_in).is_ok());
        assert!(matches!(
            graph.port(b_out),
            Err(GraphError::UnknownNode(_))
        ));
    }

    #[test]
    fn set_local_clamps_and_rejects_outputs() {
        let mut graph = Graph::new();
        let id = graph.allocate_id();
        let definition = Rc::new(NodeDefinition::new("clamp", |_| {
            Err(NodeError::runtime("not buildable"))
        }));
        let input = PortId { node: id, slot: 0 };
        let output = PortId { node: id, slot: 1 };
        graph.insert(Node::new(
            id,
            definition,
            InstanceId(0),
            vec![
                Port::new(
                    input,
                    "amount",
                    PortKind::Number,
                    Direction::Input,
                    PortValue::Number(0.0),
                    Constraints::new().min(0.0).max(1.0),
                ),
                Port::new(
                    output,
                    "out",
                    PortKind::Number,
                    Direction::Output,
                    PortValue::Number(0.0),
                    Constraints::new(),
                ),
            ],
        ));

        assert!(graph.set_local(input, PortValue::Number(4.0)).unwrap());
        assert_eq!(graph.port(input).unwrap().value, PortValue::Number(1.0));
        assert!(!graph.set_local(input, PortValue::Number(1.0)).unwrap());
        assert!(graph.set_local(output, PortValue::Number(1.0)).is_err());
        assert!(graph.set_local(input, PortValue::File(None)).is_err());
    }

    #[test]
    fn wired_values_are_clamped_by_the_input() {
        let mut graph = Graph::new();
        let source = add(&mut graph, &[("n", PortKind::Number, Direction::Output)]);
        let id = graph.allocate_id();
        let definition = Rc::new(NodeDefinition::new("sized", |_| {
            Err(NodeError::runtime("not buildable"))
        }));
        let width = PortId { node: id, slot: 0 };
        graph.insert(Node::new(
            id,
            definition,
            InstanceId(0),
            vec![Port::new(
                width,
                "width",
                PortKind::Number,
                Direction::Input,
                PortValue::Number(256.0),
                Constraints::new().min(1.0).max(8192.0),
            )],
        ));
        let out = PortId { node: source, slot: 0 };

        graph.set_output(out, PortValue::Number(1e6)).unwrap();
        graph.connect(out, width).unwrap();
        assert_eq!(graph.port(width).unwrap().value, PortValue::Number(8192.0));

        let changed = graph.set_output(out, PortValue::Number(-5.0)).unwrap();
        assert_eq!(changed, vec![width]);
        assert_eq!(graph.port(width).unwrap().value, PortValue::Number(1.0));
    }
}
