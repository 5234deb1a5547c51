//! Helper types shared across the wire layer.

pub mod b64;

pub use b64::*;
