//! Port kinds, values, and the convertibility table.

use std::fmt;

use crate::gpu::TextureId;

/// The declared kind of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// A GPU texture produced by another node.
    Image,
    /// A scalar number.
    Number,
    /// A 4-component color.
    Color,
    /// A boolean switch.
    Toggle,
    /// A path chosen by the host (file-open affordance).
    File,
    /// A momentary button. Carries no value.
    TriggerButton,
}

impl PortKind {
    /// Whether an output of kind `self` may feed an input of kind `target`.
    ///
    /// The table is exhaustive: every pair is listed, so adding a kind forces
    /// a decision for each existing one.
    pub fn converts_to(self, target: PortKind) -> bool {
        use PortKind::*;

        match (self, target) {
            (Image, Image) => true,
            (Image, Number | Color | Toggle | File | TriggerButton) => false,

            (Number, Number) => true,
            (Number, Toggle) => true,
            (Number, Color) => true,
            (Number, Image | File | TriggerButton) => false,

            (Color, Color) => true,
            (Color, Image | Number | Toggle | File | TriggerButton) => false,

            (Toggle, Toggle) => true,
            (Toggle, Number) => true,
            (Toggle, Image | Color | File | TriggerButton) => false,

            (File, File) => true,
            (File, Image | Number | Color | Toggle | TriggerButton) => false,

            // Triggers fire handlers, they never carry data across an edge.
            (TriggerButton, _) => false,
        }
    }

    /// The value an unconnected, never-assigned port of this kind holds.
    pub fn empty_value(self) -> PortValue {
        match self {
            PortKind::Image => PortValue::Image(None),
            PortKind::Number => PortValue::Number(0.0),
            PortKind::Color => PortValue::Color(Rgba::TRANSPARENT),
            PortKind::Toggle => PortValue::Toggle(false),
            PortKind::File => PortValue::File(None),
            PortKind::TriggerButton => PortValue::Trigger,
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortKind::Image => "image",
            PortKind::Number => "number",
            PortKind::Color => "color",
            PortKind::Toggle => "toggle",
            PortKind::File => "file",
            PortKind::TriggerButton => "trigger",
        };
        f.write_str(name)
    }
}

/// A color as authored by node code.
///
/// Accepts both conventions seen in node definitions: `[r, g, b, a]` with RGB in
/// `0..=255` and alpha in `0..=1`, or all four components in `0..=1`.
/// [`normalized`](Self::normalized) resolves either to `0..=1` RGBA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba(pub [f32; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0.0, 0.0, 0.0, 0.0]);
    pub const BLACK: Rgba = Rgba([0.0, 0.0, 0.0, 1.0]);
    pub const WHITE: Rgba = Rgba([1.0, 1.0, 1.0, 1.0]);

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self([r, g, b, a])
    }

    /// RGBA with all four components in `0..=1`.
    ///
    /// Any RGB component above 1 marks the color as 8-bit RGB.
    pub fn normalized(self) -> [f32; 4] {
        let [r, g, b, a] = self.0;
        let scale = if r > 1.0 || g > 1.0 || b > 1.0 {
            1.0 / 255.0
        } else {
            1.0
        };
        [
            (r * scale).clamp(0.0, 1.0),
            (g * scale).clamp(0.0, 1.0),
            (b * scale).clamp(0.0, 1.0),
            a.clamp(0.0, 1.0),
        ]
    }
}

impl From<[f32; 4]> for Rgba {
    fn from(value: [f32; 4]) -> Self {
        Self(value)
    }
}

/// A reference to an image living on the GPU.
///
/// Equality is handle identity: two refs are equal when they point at the same
/// texture generation, regardless of pixel contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
}

/// The value held by a port. The variant always matches the port's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PortValue {
    /// `None` is the "absent" sentinel: no image has been received yet.
    Image(Option<ImageRef>),
    Number(f64),
    Color(Rgba),
    Toggle(bool),
    File(Option<String>),
    Trigger,
}

impl PortValue {
    pub fn kind(&self) -> PortKind {
        match self {
            PortValue::Image(_) => PortKind::Image,
            PortValue::Number(_) => PortKind::Number,
            PortValue::Color(_) => PortKind::Color,
            PortValue::Toggle(_) => PortKind::Toggle,
            PortValue::File(_) => PortKind::File,
            PortValue::Trigger => PortKind::TriggerButton,
        }
    }

    /// Kind-appropriate equality, used to decide whether a set is a change.
    ///
    /// Numbers compare with `==` (so `NaN` is always a change), colors compare
    /// component-wise, images compare by handle identity.
    pub fn same_as(&self, other: &PortValue) -> bool {
        match (self, other) {
            (PortValue::Image(a), PortValue::Image(b)) => a == b,
            (PortValue::Number(a), PortValue::Number(b)) => a == b,
            (PortValue::Color(a), PortValue::Color(b)) => a.0 == b.0,
            (PortValue::Toggle(a), PortValue::Toggle(b)) => a == b,
            (PortValue::File(a), PortValue::File(b)) => a == b,
            (PortValue::Trigger, PortValue::Trigger) => true,
            _ => false,
        }
    }

    /// Convert this value for an input of kind `target`.
    ///
    /// Returns `None` when [`PortKind::converts_to`] forbids the pair.
    pub fn convert_to(&self, target: PortKind) -> Option<PortValue> {
        if !self.kind().converts_to(target) {
            return None;
        }
        let converted = match (self, target) {
            (PortValue::Number(n), PortKind::Toggle) => PortValue::Toggle(*n != 0.0),
            (PortValue::Toggle(b), PortKind::Number) => {
                PortValue::Number(if *b { 1.0 } else { 0.0 })
            }
            (PortValue::Number(n), PortKind::Color) => {
                let v = (*n as f32).clamp(0.0, 1.0);
                PortValue::Color(Rgba([v, v, v, 1.0]))
            }
            (value, _) => value.clone(),
        };
        Some(converted)
    }
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Image(Some(image)) => {
                write!(f, "image {}x{} ({})", image.width, image.height, image.texture)
            }
            PortValue::Image(None) => f.write_str("image <absent>"),
            PortValue::Number(n) => write!(f, "{n}"),
            PortValue::Color(c) => write!(f, "{:?}", c.0),
            PortValue::Toggle(b) => write!(f, "{b}"),
            PortValue::File(Some(path)) => f.write_str(path),
            PortValue::File(None) => f.write_str("<no file>"),
            PortValue::Trigger => f.write_str("<trigger>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PortKind; 6] = [
        PortKind::Image,
        PortKind::Number,
        PortKind::Color,
        PortKind::Toggle,
        PortKind::File,
        PortKind::TriggerButton,
    ];

    #[test]
    fn image_only_converts_to_image() {
        for kind in ALL {
            assert_eq!(PortKind::Image.converts_to(kind), kind == PortKind::Image);
            assert_eq!(kind.converts_to(PortKind::Image), kind == PortKind::Image);
        }
    }

    #[test]
    fn triggers_never_wire() {
        for kind in ALL {
            assert!(!PortKind::TriggerButton.converts_to(kind));
            assert!(!kind.converts_to(PortKind::TriggerButton));
        }
    }

    #[test]
    fn numeric_conversions() {
        let n = PortValue::Number(0.5);
        assert_eq!(n.convert_to(PortKind::Toggle), Some(PortValue::Toggle(true)));
        assert_eq!(
            PortValue::Number(0.0).convert_to(PortKind::Toggle),
            Some(PortValue::Toggle(false))
        );
        assert_eq!(
            PortValue::Toggle(true).convert_to(PortKind::Number),
            Some(PortValue::Number(1.0))
        );
        assert_eq!(
            n.convert_to(PortKind::Color),
            Some(PortValue::Color(Rgba([0.5, 0.5, 0.5, 1.0])))
        );
        assert_eq!(PortValue::Color(Rgba::WHITE).convert_to(PortKind::Number), None);
    }

    #[test]
    fn color_normalization_accepts_both_conventions() {
        assert_eq!(Rgba([255.0, 0.0, 0.0, 1.0]).normalized(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(Rgba([0.25, 0.5, 1.0, 0.5]).normalized(), [0.25, 0.5, 1.0, 0.5]);
    }

    #[test]
    fn equality_is_kind_aware() {
        assert!(PortValue::Number(2.0).same_as(&PortValue::Number(2.0)));
        assert!(!PortValue::Number(f64::NAN).same_as(&PortValue::Number(f64::NAN)));
        assert!(
            PortValue::Color(Rgba([1.0, 0.0, 0.0, 1.0]))
                .same_as(&PortValue::Color(Rgba([1.0, 0.0, 0.0, 1.0])))
        );
        assert!(!PortValue::Number(1.0).same_as(&PortValue::Toggle(true)));
    }
}
