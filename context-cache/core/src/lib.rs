//! Global context cache.
//!
//! Policies reference named context entries whose data must be available synchronously while a
//! rule is evaluated. Each entry owns a background data source (a watch of cluster resources or
//! a poll of an API endpoint) and serves the latest snapshot of that source, along with any
//! named projections computed from it.
//!
//! ```text
//! [ GlobalContextEntry ] -> [ Controller ] -> [ Store ] <- [ Resolver ] <- rule evaluation
//!                                               |
//!                                          [ Entry ] <- watch / poll task
//! ```
//!
//! This crate holds the pieces shared by every entry type: the [`Entry`] trait, the [`Store`],
//! projections and the [`resolve::Resolver`] used by the evaluation engine.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod invalid;
mod notify;
pub mod projection;
mod query;
pub mod resolve;
mod store;
mod task;
pub mod variables;

#[cfg(test)]
mod tests;

pub use self::{
    invalid::InvalidEntry,
    notify::{Notify, Reason},
    projection::{Cached, Evaluate, Projection, Projections, Snapshot},
    query::JmesPath,
    resolve::{Reference, Resolver},
    store::Store,
    task::Task,
};
pub use serde_json::Value;
use std::sync::Arc;

/// The projection name under which an entry serves its unprojected data.
pub const RAW: &str = "";

/// A named, cached piece of data that policy rules may reference.
///
/// Reads never block on a refresh: `get` returns whatever snapshot is currently held.
#[async_trait::async_trait]
pub trait Entry: Send + Sync + 'static {
    /// Returns the value of the named projection, or the raw data for [`RAW`].
    fn get(&self, projection: &str) -> Result<Arc<Value>, Error>;

    /// Cancels the entry's background work and waits for it to complete.
    ///
    /// Calling `stop` more than once has no further effect.
    async fn stop(&self);
}

/// An opaque source error, shared so that a stored error may be served to many readers.
pub type SourceError = Arc<anyhow::Error>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("projection {0:?} not found")]
    ProjectionNotFound(String),

    #[error("failed to evaluate projection {name:?}: {error:#}")]
    Projection { name: String, error: SourceError },

    #[error("failed to sync resource cache: {0:#}")]
    Sync(SourceError),

    #[error("failed to call API: {0:#}")]
    Call(SourceError),

    #[error("invalid entry: {0:#}")]
    Invalid(SourceError),
}

impl Error {
    pub fn sync(error: impl Into<anyhow::Error>) -> Self {
        Self::Sync(Arc::new(error.into()))
    }

    pub fn call(error: impl Into<anyhow::Error>) -> Self {
        Self::Call(Arc::new(error.into()))
    }

    pub fn invalid(error: impl Into<anyhow::Error>) -> Self {
        Self::Invalid(Arc::new(error.into()))
    }
}
