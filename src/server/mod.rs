//! HTTP server for the read-through cache.
//!
//! - [`api`]: axum router, handlers and application state

pub mod api;
