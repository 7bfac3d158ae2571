//! Embedding crate
//!
//! The token module exposes the trainable lookup table used by decoders and
//! encoders. A table can be shared between components by cloning it.

pub mod token;

pub use token::*;
