//! Per-tick render ordering and asynchronous render bookkeeping.
//!
//! The scheduler caches a topological order of the graph and recomputes it
//! only when the graph's revision moves. Among nodes with no ordering
//! constraint between them, earlier-inserted nodes render first, so the same
//! graph always renders in the same order.
//!
//! Asynchronous renders are plain futures polled with a no-op waker, at most
//! once per tick. Nothing ever blocks on them.

use std::collections::{BTreeSet, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use indexmap::{IndexMap, IndexSet};
use log::{debug, error, trace};

use crate::error::{NodeError, panic_message};
use crate::gpu::InstanceId;
use crate::graph::Graph;
use crate::node::{NodeId, Outputs};

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub index: u64,
    /// Seconds since the engine started.
    pub time: f64,
    /// The topological order used for this tick.
    pub order: Vec<NodeId>,
    /// Nodes whose `render()` was invoked.
    pub rendered: Vec<NodeId>,
    /// Nodes skipped because their previous render is still pending.
    pub skipped_pending: Vec<NodeId>,
    /// Nodes whose pending render from an earlier tick completed this tick.
    pub resolved: Vec<NodeId>,
    /// Nodes that failed this tick.
    pub failed: Vec<NodeId>,
}

/// A render future plus the outputs its synchronous part staged.
pub(crate) struct PendingRender {
    pub instance: InstanceId,
    pub staged: Outputs,
    pub future: LocalBoxFuture<'static, Result<Outputs, NodeError>>,
}

/// Render-order cache and pending render registry.
#[derive(Default)]
pub struct Scheduler {
    order: Vec<NodeId>,
    revision: Option<u64>,
    pending: IndexMap<NodeId, PendingRender>,
    /// Renders of disposed instances. Polled to completion, results dropped.
    orphans: Vec<PendingRender>,
    deferred_reloads: IndexSet<NodeId>,
    frame: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached order, recomputed if the graph changed since last call.
    pub fn order(&mut self, graph: &Graph) -> &[NodeId] {
        if self.revision != Some(graph.revision()) {
            self.order = topological_order(graph);
            self.revision = Some(graph.revision());
            debug!(
                "render order recomputed at revision {}: {:?}",
                graph.revision(),
                self.order
            );
        }
        &self.order
    }

    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    pub(crate) fn next_frame(&mut self) -> u64 {
        self.frame += 1;
        self.frame
    }

    pub fn is_pending(&self, node: NodeId) -> bool {
        self.pending.contains_key(&node)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub(crate) fn insert_pending(&mut self, node: NodeId, render: PendingRender) {
        self.pending.insert(node, render);
    }

    /// Nodes with a pending render, in the order they went pending.
    pub(crate) fn pending_nodes(&self) -> Vec<NodeId> {
        self.pending.keys().copied().collect()
    }

    /// Poll the pending render of `node` once. Resolved renders are removed
    /// and returned with their merged outputs.
    pub(crate) fn poll_pending(
        &mut self,
        node: NodeId,
    ) -> Option<(InstanceId, Result<Outputs, NodeError>)> {
        let render = self.pending.get_mut(&node)?;
        match poll_render(&mut render.future) {
            Poll::Pending => None,
            Poll::Ready(result) => {
                let render = self.pending.shift_remove(&node)?;
                let mut staged = render.staged;
                let result = result.map(|later| {
                    staged.merge(later);
                    staged
                });
                Some((render.instance, result))
            }
        }
    }

    /// Detach the pending render of a node being disposed.
    pub(crate) fn orphan(&mut self, node: NodeId) {
        if let Some(render) = self.pending.shift_remove(&node) {
            debug!("render of {node} ({}) orphaned", render.instance);
            self.orphans.push(render);
        }
    }

    /// Poll orphaned renders once; drop the ones that finished.
    pub(crate) fn poll_orphans(&mut self) {
        self.orphans.retain_mut(|render| match poll_render(&mut render.future) {
            Poll::Pending => true,
            Poll::Ready(result) => {
                trace!(
                    "discarding result of orphaned render ({}): ok = {}",
                    render.instance,
                    result.is_ok()
                );
                false
            }
        });
    }

    pub(crate) fn defer_reload(&mut self, node: NodeId) {
        self.deferred_reloads.insert(node);
    }

    /// Deferred reloads whose node is no longer pending.
    pub(crate) fn take_ready_reloads(&mut self) -> Vec<NodeId> {
        let ready: Vec<NodeId> = self
            .deferred_reloads
            .iter()
            .copied()
            .filter(|node| !self.pending.contains_key(node))
            .collect();
        for node in &ready {
            self.deferred_reloads.shift_remove(node);
        }
        ready
    }

    pub(crate) fn forget(&mut self, node: NodeId) {
        self.deferred_reloads.shift_remove(&node);
    }
}

/// Kahn's algorithm with the ready set ordered by insertion index.
pub fn topological_order(graph: &Graph) -> Vec<NodeId> {
    let ids: Vec<NodeId> = graph.node_ids().collect();
    let mut indegree = vec![0usize; ids.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut seen = HashSet::new();

    for edge in graph.edges() {
        let (Some(from), Some(to)) = (
            graph.insertion_index(edge.source.node),
            graph.insertion_index(edge.target.node),
        ) else {
            continue;
        };
        if seen.insert((from, to)) {
            successors[from].push(to);
            indegree[to] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(index) = ready.pop_first() {
        order.push(ids[index]);
        for &next in &successors[index] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != ids.len() {
        error!(
            "graph contains a cycle; {} nodes left out of the render order",
            ids.len() - order.len()
        );
    }
    order
}

/// Poll a render future once with a no-op waker. Panics resolve the render
/// as a failure.
pub(crate) fn poll_render(
    future: &mut LocalBoxFuture<'static, Result<Outputs, NodeError>>,
) -> Poll<Result<Outputs, NodeError>> {
    let mut cx = Context::from_waker(noop_waker_ref());
    match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
        Ok(poll) => poll,
        Err(payload) => Poll::Ready(Err(NodeError::AsyncFailure(format!(
            "render future panicked: {}",
            panic_message(payload)
        )))),
    }
}
