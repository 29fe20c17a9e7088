//! Engine configuration.

use std::path::PathBuf;

use crate::gpu::DeviceKind;

/// Environment variable overriding [`EngineConfig::asset_root`].
pub const ASSET_ROOT_ENV: &str = "HOTGRAPH_ASSET_ROOT";

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Directory asset paths resolve under. Nothing outside it can be loaded.
    pub asset_root: PathBuf,
    /// Size of a render target before its node calls `set_size`.
    pub default_target_size: (u32, u32),
    /// Poll file-backed definitions each tick and reload changed ones.
    pub watch_sources: bool,
    pub device: DeviceKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("assets"),
            default_target_size: (256, 256),
            watch_sources: true,
            device: DeviceKind::Cpu,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the asset root taken from `HOTGRAPH_ASSET_ROOT` when set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var_os(ASSET_ROOT_ENV) {
            Some(root) if !root.is_empty() => config.asset_root(root),
            _ => config,
        }
    }

    pub fn asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = root.into();
        self
    }

    pub fn default_target_size(mut self, width: u32, height: u32) -> Self {
        self.default_target_size = (width.max(1), height.max(1));
        self
    }

    pub fn watch_sources(mut self, watch: bool) -> Self {
        self.watch_sources = watch;
        self
    }

    pub fn device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::new()
            .asset_root("/data")
            .default_target_size(0, 32)
            .watch_sources(false);
        assert_eq!(config.asset_root, PathBuf::from("/data"));
        assert_eq!(config.default_target_size, (1, 32));
        assert!(!config.watch_sources);
        assert_eq!(config.device, DeviceKind::Cpu);
    }
}
