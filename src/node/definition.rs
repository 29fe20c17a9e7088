use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use super::context::{Context, Outputs, RenderContext};
use super::scope::NodeScope;
use crate::error::NodeError;
use crate::port::PortId;

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionSource {
    /// Compiled into the host.
    Builtin,
    /// Backed by a file; watched for hot reload.
    File(PathBuf),
}

/// Construction closure of a definition.
///
/// Called once per instantiation (and again on every reload) with a scope
/// bound to the new instance.
pub type NodeFactory = Rc<dyn Fn(&mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError>>;

/// A named, loadable node type.
#[derive(Clone)]
pub struct NodeDefinition {
    name: String,
    category: String,
    description: String,
    source: DefinitionSource,
    factory: NodeFactory,
}

impl NodeDefinition {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn(&mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
            description: String::new(),
            source: DefinitionSource::Builtin,
            factory: Rc::new(factory),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: DefinitionSource) -> Self {
        self.source = source;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn source(&self) -> &DefinitionSource {
        &self.source
    }

    /// The backing file, for file-sourced definitions.
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            DefinitionSource::File(path) => Some(path),
            DefinitionSource::Builtin => None,
        }
    }

    pub(crate) fn build(&self, scope: &mut NodeScope<'_>) -> Result<Box<dyn NodeLogic>, NodeError> {
        (self.factory)(scope)
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of one `render()` invocation.
///
/// The engine inspects the returned value each time, so a node may finish
/// synchronously on one tick and hand back a future on the next.
pub enum Render {
    /// Finished. Outputs staged on the context are committed on `Ok`.
    Done(Result<(), NodeError>),
    /// Still running. Staged outputs are held back and merged with the
    /// future's own outputs when it resolves.
    Pending(LocalBoxFuture<'static, Result<Outputs, NodeError>>),
}

impl Render {
    pub fn ok() -> Self {
        Render::Done(Ok(()))
    }

    pub fn pending(
        future: impl Future<Output = Result<Outputs, NodeError>> + 'static,
    ) -> Self {
        Render::Pending(Box::pin(future))
    }
}

impl From<Result<(), NodeError>> for Render {
    fn from(result: Result<(), NodeError>) -> Self {
        Render::Done(result)
    }
}

impl fmt::Debug for Render {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Render::Done(result) => f.debug_tuple("Done").field(result).finish(),
            Render::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Behaviour of a node instance.
///
/// Every hook runs on the render thread with exclusive access to the instance.
/// Only `render` and `on_trigger` can write outputs.
pub trait NodeLogic {
    /// Called exactly once after construction. May allocate GPU resources.
    fn start(&mut self, _ctx: &mut Context<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    /// Produce this tick's outputs.
    fn render(&mut self, ctx: &mut RenderContext<'_>) -> Render;

    /// Runs before the instance's resources are released.
    fn stop(&mut self, _ctx: &mut Context<'_>) {}

    /// An input's value changed.
    fn on_change(&mut self, _port: PortId, _ctx: &mut Context<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    /// A trigger input was activated.
    fn on_trigger(
        &mut self,
        _port: PortId,
        _ctx: &mut RenderContext<'_>,
    ) -> Result<(), NodeError> {
        Ok(())
    }
}
