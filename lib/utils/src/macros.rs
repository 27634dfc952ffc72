//! Newtype helpers shared by the driver core crates.

/// Implement [core::ops::Deref] for a newtype whose payload lives in a field named `inner`.
#[macro_export]
macro_rules! impl_deref {
    ($name: ident, $type: ty) => {
        impl core::ops::Deref for $name {
            type Target = $type;

            fn deref(&self) -> &Self::Target {
                &self.inner
            }
        }
    };
}

/// Implement lossless conversions in both directions between a newtype and its `inner` payload.
#[macro_export]
macro_rules! impl_conversion {
    ($name: ident, $type: ty) => {
        impl core::convert::From<$type> for $name {
            fn from(value: $type) -> Self {
                $name { inner: value }
            }
        }
        impl core::convert::From<$name> for $type {
            fn from(value: $name) -> Self {
                value.inner
            }
        }
    };
}
