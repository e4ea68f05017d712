//! Native protocol primitives for the quorum driver: frame headers,
//! request serializers, response parsers and server error types.
//!
//! Values bound to statements and returned in rows stay opaque here;
//! encoding them is left to a separate type codec.

pub mod errors;
pub mod frame;
pub mod values;

pub use crate::frame::types::{Consistency, SerialConsistency};
