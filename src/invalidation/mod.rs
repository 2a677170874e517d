//! Cache invalidation broadcast.
//!
//! - [`registry`]: subscriber registry and the `invalidate` fan-out
//! - [`persisted`]: persisted local copies and the background purge worker

pub mod persisted;
pub mod registry;
