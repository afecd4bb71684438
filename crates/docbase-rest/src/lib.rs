//! REST synchronisation for docbase collections.
//!
//! Local writes are delivered through the shared offline queue, so they
//! survive outages and restarts (with a durable queue store). Remote state is
//! pulled on demand and merged through a [`ConflictResolver`].

mod client;
mod config;
mod conflict;
mod sync;

pub use client::RestClient;
pub use config::RestConfig;
pub use conflict::ConflictResolver;
pub use sync::{RestSync, REST_SOURCE};
