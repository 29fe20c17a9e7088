//! Definition registry, instantiation and source watching.

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::error::{NodeError, panic_message};
use crate::gpu::{AssetResolver, Gpu, InstanceId};
use crate::node::{NodeDefinition, NodeId, NodeLogic, NodeScope};
use crate::port::Port;

/// Watches a definition's backing file for changes.
///
/// Polling only: each [`check`](Self::check) compares the file's modification
/// time and length with the last seen ones.
#[derive(Debug, Clone)]
pub struct SourceWatcher {
    path: PathBuf,
    stamp: Option<(SystemTime, u64)>,
}

impl SourceWatcher {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let stamp = Self::stamp(&path);
        if stamp.is_none() {
            warn!("cannot watch {}: file not readable yet", path.display());
        }
        Self { path, stamp }
    }

    fn stamp(path: &Path) -> Option<(SystemTime, u64)> {
        let metadata = fs::metadata(path).ok()?;
        Some((metadata.modified().ok()?, metadata.len()))
    }

    /// Returns `true` once per observed change.
    pub fn check(&mut self) -> bool {
        let Some(stamp) = Self::stamp(&self.path) else {
            return false;
        };
        if self.stamp == Some(stamp) {
            return false;
        }
        self.stamp = Some(stamp);
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A freshly built instance, not yet started.
pub(crate) struct Built {
    pub instance: InstanceId,
    pub ports: Vec<Port>,
    pub logic: Result<Box<dyn NodeLogic>, NodeError>,
}

/// Registered node definitions.
#[derive(Default)]
pub struct Loader {
    definitions: IndexMap<String, Rc<NodeDefinition>>,
    watchers: IndexMap<String, SourceWatcher>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Returns `true` if it replaced one of the same
    /// name.
    pub fn register(&mut self, definition: NodeDefinition) -> bool {
        let name = definition.name().to_string();
        match definition.source_path() {
            Some(path) => {
                self.watchers
                    .insert(name.clone(), SourceWatcher::new(path));
            }
            None => {
                self.watchers.shift_remove(&name);
            }
        }
        let replaced = self
            .definitions
            .insert(name.clone(), Rc::new(definition))
            .is_some();
        if replaced {
            info!("definition '{name}' replaced");
        } else {
            debug!("definition '{name}' registered");
        }
        replaced
    }

    pub fn definition(&self, name: &str) -> Option<Rc<NodeDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Registered definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.definitions.values().map(|d| d.as_ref())
    }

    /// Names of file-backed definitions whose source changed since the last
    /// call.
    pub(crate) fn changed_sources(&mut self) -> Vec<String> {
        self.watchers
            .iter_mut()
            .filter_map(|(name, watcher)| watcher.check().then(|| name.clone()))
            .collect()
    }

    /// Run `definition`'s construction closure for node `node`.
    ///
    /// `prior` holds the ports of the instance being replaced, if any. The
    /// construction closure runs with a fresh owner tag; a panic in it is
    /// reported as a build error.
    pub(crate) fn build(
        definition: &NodeDefinition,
        node: NodeId,
        gpu: &Gpu,
        assets: AssetResolver,
        prior: &[Port],
    ) -> Built {
        let instance = gpu.allocate_owner();
        let mut scope = NodeScope::new(node, gpu.scoped(instance), assets, prior);
        let logic = match catch_unwind(AssertUnwindSafe(|| definition.build(&mut scope))) {
            Ok(Ok(logic)) => Ok(logic),
            Ok(Err(NodeError::Build(message))) => Err(NodeError::Build(message)),
            Ok(Err(e)) => Err(NodeError::Build(e.to_string())),
            Err(payload) => Err(NodeError::Build(format!(
                "construction panicked: {}",
                panic_message(payload)
            ))),
        };
        Built {
            instance,
            ports: scope.into_ports(),
            logic,
        }
    }
}
