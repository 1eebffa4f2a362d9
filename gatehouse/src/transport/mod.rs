//! Transport layer for gatehouse.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{serve, routes};
