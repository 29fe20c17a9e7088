//! Error types for the engine.
//!
//! Errors are split by who has to deal with them:
//!
//! - [`GraphError`] is returned synchronously by wiring operations. The graph is
//!   always left exactly as it was before the failing call.
//! - [`ResourceError`] comes out of the GPU facade. It fails the current
//!   operation only.
//! - [`NodeError`] is what a node hook reports. The engine catches it, moves the
//!   node to [`NodeState::Error`](crate::NodeState::Error) and keeps scheduling
//!   everything else.

use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::UniformKind;
use crate::node::NodeId;
use crate::port::{Direction, PortId, PortKind};

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Wiring and port-usage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The operation is not valid for the port it was applied to
    /// (setting an input, wiring two outputs, assigning a wrong-kind value).
    #[error("configuration error on {port}: {reason}")]
    Configuration { port: PortId, reason: String },

    /// The two port kinds are not convertible.
    #[error("cannot connect {from_kind} output {from} to {to_kind} input {to}")]
    TypeMismatch {
        from: PortId,
        to: PortId,
        from_kind: PortKind,
        to_kind: PortKind,
    },

    /// The edge would close a cycle.
    #[error("connecting {from} to {to} would create a cycle")]
    Cycle { from: PortId, to: PortId },

    /// No node with this id exists in the graph.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// No port with this id exists on its node.
    #[error("unknown port {0}")]
    UnknownPort(PortId),
}

impl GraphError {
    pub(crate) fn configuration(port: PortId, reason: impl Into<String>) -> Self {
        Self::Configuration {
            port,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the GPU resource facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    /// Shader compilation or pipeline creation failed.
    #[error("shader program '{label}' failed to compile: {message}")]
    Compile { label: String, message: String },

    /// A target or texture could not be allocated.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The handle was never issued, or was released individually.
    #[error("unknown {kind} handle #{id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    /// The handle belongs to a node instance that has been disposed.
    #[error("{kind} handle #{id} belongs to a disposed node")]
    OwnerDisposed { kind: &'static str, id: u64 },

    /// The texture was fetched before its render target was resized.
    #[error("texture #{0} is stale; the render target was resized")]
    StaleTexture(u64),

    /// Another render target is already bound.
    #[error("render target #{requested} cannot be bound while #{bound} is bound")]
    AlreadyBound { bound: u64, requested: u64 },

    /// A draw or clear was issued outside of a bind span.
    #[error("render target #{0} is not bound")]
    NotBound(u64),

    /// The draw samples the texture it renders into.
    #[error("render target #{0} cannot sample its own texture")]
    FeedbackLoop(u64),

    /// The uniform name is not declared by the program.
    #[error("program '{program}' declares no uniform named '{name}'")]
    UnknownUniform { program: String, name: String },

    /// The value's type differs from the uniform's declared type.
    #[error("program '{program}' declares '{name}' as {expected:?}, got a {found} value")]
    UniformMismatch {
        program: String,
        name: String,
        expected: UniformKind,
        found: &'static str,
    },

    /// A texture declared by the program was not supplied.
    #[error("program '{program}' needs texture '{name}'")]
    MissingTexture { program: String, name: String },

    /// The asset path resolves outside of the asset root.
    #[error("asset path {0} escapes the asset root")]
    AssetOutsideRoot(PathBuf),

    /// The image could not be decoded.
    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    /// Filesystem error while reading an asset.
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// No GPU device could be created.
    #[error("no GPU device available: {0}")]
    DeviceUnavailable(String),
}

/// Failure reported by (or on behalf of) a node hook.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    /// A GPU facade call failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A port operation failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The hook returned an error or panicked.
    #[error("{0}")]
    Runtime(String),

    /// An asynchronous render resolved to an error.
    #[error("asynchronous render failed: {0}")]
    AsyncFailure(String),

    /// The construction closure rejected the definition.
    #[error("failed to build node: {0}")]
    Build(String),
}

impl NodeError {
    /// Create a runtime error with a message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

/// Top-level error returned by [`Engine`](crate::Engine) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("node {node} failed: {error}")]
    Node { node: NodeId, error: NodeError },

    /// No definition is registered under this name.
    #[error("no node definition named '{0}'")]
    UnknownDefinition(String),

    #[error("node {node} has no {direction:?} port named '{name}'")]
    NoSuchPort {
        node: NodeId,
        name: String,
        direction: Direction,
    },
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
