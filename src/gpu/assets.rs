//! Asset path resolution and off-thread image decoding.

use std::path::{Component, Path, PathBuf};
use std::thread;

use futures::channel::oneshot;
use image::RgbaImage;
use log::debug;

use crate::error::ResourceError;

const FILE_SCHEME: &str = "file://";

/// Resolves asset paths against a fixed root directory.
///
/// Resolution is lexical: `.` and `..` are folded without touching the
/// filesystem, and anything that ends up outside the root is rejected.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    root: PathBuf,
}

impl AssetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            normalize(&root)
        } else {
            std::env::current_dir()
                .map(|cwd| normalize(&cwd.join(&root)))
                .unwrap_or_else(|_| normalize(&root))
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative to the root, absolute, or a `file://` URL).
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ResourceError> {
        let raw = Path::new(path.strip_prefix(FILE_SCHEME).unwrap_or(path));
        let joined = if raw.is_absolute() {
            normalize(raw)
        } else {
            normalize(&self.root.join(raw))
        };
        if joined.starts_with(&self.root) {
            Ok(joined)
        } else {
            Err(ResourceError::AssetOutsideRoot(raw.to_path_buf()))
        }
    }

    /// Resolve `path` into a `file://` URL accepted by texture loading.
    pub fn url_for(&self, path: &str) -> Result<String, ResourceError> {
        self.resolve(path)
            .map(|resolved| format!("{FILE_SCHEME}{}", resolved.display()))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Decode `path` on a worker thread.
///
/// The receiver yields the decoded RGBA8 image or the decode error. Dropping
/// the receiver discards the result.
pub(crate) fn decode_in_background(
    path: PathBuf,
) -> oneshot::Receiver<Result<RgbaImage, ResourceError>> {
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        debug!("decoding {}", path.display());
        let result = match image::open(&path) {
            Ok(img) => Ok(img.to_rgba8()),
            Err(image::ImageError::IoError(e)) => Err(ResourceError::Io {
                path: path.clone(),
                message: e.to_string(),
            }),
            Err(e) => Err(ResourceError::Decode {
                path: path.clone(),
                message: e.to_string(),
            }),
        };
        let _ = tx.send(result);
    });
    rx
}
