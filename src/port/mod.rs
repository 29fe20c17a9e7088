//! Typed ports: the value slots nodes read from and write to.
//!
//! A port is declared by node construction code through the typed factories on
//! [`NodeScope`](crate::NodeScope) and identified by a [`PortId`]. Inputs hold at
//! most one upstream connection and mirror the upstream output's last committed
//! value; unconnected inputs hold their host-assigned value or their default.
//! Outputs keep an ordered set of downstream inputs.
//!
//! # Kinds and conversion
//!
//! | Output kind | Accepted by inputs of kind |
//! |-------------|----------------------------|
//! | image       | image                      |
//! | number      | number, toggle, color      |
//! | color       | color                      |
//! | toggle      | toggle, number             |
//! | file        | file                       |
//! | trigger     | (never wired)              |

mod typed;
mod value;

use std::fmt;

use indexmap::IndexSet;

use crate::node::NodeId;

pub use typed::{In, Out, PortData, kinds};
pub use value::{ImageRef, PortKind, PortValue, Rgba};

/// Identifies a port: the owning node plus a slot that survives hot reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub node: NodeId,
    pub slot: u32,
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.slot)
    }
}

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// Kind-specific constraints attached at declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    /// Hint for the host's file picker, e.g. `"image/*"` or `".wgsl"`.
    pub file_type: Option<String>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    /// Clamp numbers into `[min, max]`. Other values pass through.
    pub fn apply(&self, value: PortValue) -> PortValue {
        match value {
            PortValue::Number(mut n) => {
                if let Some(min) = self.min {
                    n = n.max(min);
                }
                if let Some(max) = self.max {
                    n = n.min(max);
                }
                PortValue::Number(n)
            }
            other => other,
        }
    }
}

/// A typed, directional value slot on a node.
#[derive(Debug, Clone)]
pub struct Port {
    pub(crate) id: PortId,
    pub(crate) name: String,
    pub(crate) kind: PortKind,
    pub(crate) direction: Direction,
    pub(crate) value: PortValue,
    pub(crate) default: PortValue,
    /// Host-assigned value for an unconnected input.
    pub(crate) local: Option<PortValue>,
    pub(crate) constraints: Constraints,
    pub(crate) dirty: bool,
    pub(crate) upstream: Option<PortId>,
    pub(crate) downstream: IndexSet<PortId>,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        name: impl Into<String>,
        kind: PortKind,
        direction: Direction,
        default: PortValue,
        constraints: Constraints,
    ) -> Self {
        let default = constraints.apply(default);
        Self {
            id,
            name: name.into(),
            kind,
            direction,
            value: default.clone(),
            default,
            local: None,
            constraints,
            dirty: false,
            upstream: None,
            downstream: IndexSet::new(),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    /// Current committed value.
    pub fn value(&self) -> &PortValue {
        &self.value
    }

    pub fn default_value(&self) -> &PortValue {
        &self.default
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Whether the value changed since the owning node last rendered.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The output feeding this input, if connected.
    pub fn upstream(&self) -> Option<PortId> {
        self.upstream
    }

    /// Inputs fed by this output, in connection order.
    pub fn downstream(&self) -> impl Iterator<Item = PortId> + '_ {
        self.downstream.iter().copied()
    }

    /// The value an input falls back to when nothing is connected.
    pub(crate) fn unconnected_value(&self) -> PortValue {
        self.local.clone().unwrap_or_else(|| self.default.clone())
    }

    /// Store `value` if it differs from the current one. Returns whether it did.
    pub(crate) fn replace_value(&mut self, value: PortValue) -> bool {
        if self.value.same_as(&value) {
            return false;
        }
        self.value = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number_port(constraints: Constraints) -> Port {
        Port::new(
            PortId {
                node: NodeId(1),
                slot: 0,
            },
            "amount",
            PortKind::Number,
            Direction::Input,
            PortValue::Number(5.0),
            constraints,
        )
    }

    #[test]
    fn defaults_are_clamped() {
        let port = number_port(Constraints::new().min(0.0).max(1.0));
        assert_eq!(port.value(), &PortValue::Number(1.0));
    }

    #[test]
    fn replace_value_reports_changes_only() {
        let mut port = number_port(Constraints::new());
        assert!(!port.replace_value(PortValue::Number(5.0)));
        assert!(port.replace_value(PortValue::Number(6.0)));
        assert_eq!(port.value(), &PortValue::Number(6.0));
    }

    #[test]
    fn unconnected_value_prefers_local() {
        let mut port = number_port(Constraints::new());
        assert_eq!(port.unconnected_value(), PortValue::Number(5.0));
        port.local = Some(PortValue::Number(2.0));
        assert_eq!(port.unconnected_value(), PortValue::Number(2.0));
    }
}
