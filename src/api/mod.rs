//! Deriv WebSocket API: frame envelope accessors and request/response bodies.

pub mod frame;
mod types;

pub use types::*;
