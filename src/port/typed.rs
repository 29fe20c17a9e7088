//! Statically typed port handles.
//!
//! Construction code receives `In<K>` / `Out<K>` handles from the scope's port
//! factories. The marker `K` fixes the Rust type read from or written to the
//! port, so a node cannot write a number into an image output or call `set`
//! on an input handle.

use std::fmt;
use std::marker::PhantomData;

use super::value::{ImageRef, PortKind, PortValue, Rgba};
use super::PortId;

/// Maps a port kind marker to the Rust type nodes see.
pub trait PortData: 'static {
    const KIND: PortKind;
    type Value;

    fn read(value: &PortValue) -> Self::Value;
    fn write(value: Self::Value) -> PortValue;
}

/// Port kind markers used as the type parameter of [`In`] and [`Out`].
pub mod kinds {
    /// Reads as `Option<ImageRef>`; `None` means absent.
    #[derive(Debug)]
    pub struct Image;
    /// Reads as `f64`.
    #[derive(Debug)]
    pub struct Number;
    /// Reads as [`Rgba`](crate::Rgba).
    #[derive(Debug)]
    pub struct Color;
    /// Reads as `bool`.
    #[derive(Debug)]
    pub struct Toggle;
    /// Reads as `Option<String>`.
    #[derive(Debug)]
    pub struct File;
    /// Has no value; only fires `on_trigger`.
    #[derive(Debug)]
    pub struct Trigger;
}

impl PortData for kinds::Image {
    const KIND: PortKind = PortKind::Image;
    type Value = Option<ImageRef>;

    fn read(value: &PortValue) -> Self::Value {
        match value {
            PortValue::Image(image) => *image,
            _ => None,
        }
    }

    fn write(value: Self::Value) -> PortValue {
        PortValue::Image(value)
    }
}

impl PortData for kinds::Number {
    const KIND: PortKind = PortKind::Number;
    type Value = f64;

    fn read(value: &PortValue) -> Self::Value {
        match value {
            PortValue::Number(n) => *n,
            _ => 0.0,
        }
    }

    fn write(value: Self::Value) -> PortValue {
        PortValue::Number(value)
    }
}

impl PortData for kinds::Color {
    const KIND: PortKind = PortKind::Color;
    type Value = Rgba;

    fn read(value: &PortValue) -> Self::Value {
        match value {
            PortValue::Color(color) => *color,
            _ => Rgba::TRANSPARENT,
        }
    }

    fn write(value: Self::Value) -> PortValue {
        PortValue::Color(value)
    }
}

impl PortData for kinds::Toggle {
    const KIND: PortKind = PortKind::Toggle;
    type Value = bool;

    fn read(value: &PortValue) -> Self::Value {
        matches!(value, PortValue::Toggle(true))
    }

    fn write(value: Self::Value) -> PortValue {
        PortValue::Toggle(value)
    }
}

impl PortData for kinds::File {
    const KIND: PortKind = PortKind::File;
    type Value = Option<String>;

    fn read(value: &PortValue) -> Self::Value {
        match value {
            PortValue::File(path) => path.clone(),
            _ => None,
        }
    }

    fn write(value: Self::Value) -> PortValue {
        PortValue::File(value)
    }
}

impl PortData for kinds::Trigger {
    const KIND: PortKind = PortKind::TriggerButton;
    type Value = ();

    fn read(_value: &PortValue) -> Self::Value {}

    fn write(_value: Self::Value) -> PortValue {
        PortValue::Trigger
    }
}

/// Handle to an input port of kind `K`.
pub struct In<K> {
    id: PortId,
    _kind: PhantomData<fn() -> K>,
}

/// Handle to an output port of kind `K`.
pub struct Out<K> {
    id: PortId,
    _kind: PhantomData<fn() -> K>,
}

macro_rules! port_handle {
    ($name:ident) => {
        impl<K> $name<K> {
            pub(crate) fn new(id: PortId) -> Self {
                Self {
                    id,
                    _kind: PhantomData,
                }
            }

            pub fn id(&self) -> PortId {
                self.id
            }
        }

        impl<K> Clone for $name<K> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<K> Copy for $name<K> {}

        impl<K> PartialEq for $name<K> {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl<K> Eq for $name<K> {}

        impl<K> fmt::Debug for $name<K> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.id)
            }
        }

        impl<K> From<$name<K>> for PortId {
            fn from(handle: $name<K>) -> PortId {
                handle.id
            }
        }
    };
}

port_handle!(In);
port_handle!(Out);
