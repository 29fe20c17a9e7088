//! Built-in node definitions.
//!
//! | name           | inputs                                 | outputs                  |
//! |----------------|----------------------------------------|--------------------------|
//! | `solid_color`  | `color`, `width`, `height`             | `image`                  |
//! | `pass_through` | `image`                                | `image`                  |
//! | `invert`       | `image`, `amount`                      | `image`                  |
//! | `image_file`   | `file`                                 | `image`, `width`, `height` |
//! | `output`       | `image`, `path`, `save`                |                          |
//! | `diagnostics`  | `overlay`                              | `visible`                |
//!
//! WGSL shader files become definitions through [`shader_file::definition`].

mod diagnostics;
mod filters;
mod image_file;
mod output;
pub mod shader_file;
mod solid_color;

use crate::engine::Engine;
use crate::node::NodeDefinition;

pub use diagnostics::OVERLAY_SIGNAL;
pub use output::SAVED_SIGNAL;

/// Definitions of every built-in node except shader files.
pub fn builtin_definitions() -> Vec<NodeDefinition> {
    vec![
        solid_color::definition(),
        filters::pass_through(),
        filters::invert(),
        image_file::definition(),
        output::definition(),
        diagnostics::definition(),
    ]
}

pub fn register_builtins(engine: &mut Engine) {
    for definition in builtin_definitions() {
        engine.register(definition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_unique() {
        let definitions = builtin_definitions();
        let mut names: Vec<&str> = definitions.iter().map(|d| d.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), definitions.len());
        assert!(definitions.iter().all(|d| !d.category().is_empty()));
    }
}
