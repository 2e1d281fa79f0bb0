//! Reconciles `GlobalContextEntry` resources into the global context store.
//!
//! Watch events update an [`Index`], which queues the names of entries whose spec changed. A
//! fixed pool of workers drains the [`WorkQueue`], building and installing entries through a
//! [`BuildEntry`] implementation. Failed builds are retried with exponential backoff.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;
mod queue;
mod reconcile;
pub mod validation;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Index, SharedIndex},
    metrics::{register_sizes, ControllerMetrics},
    queue::WorkQueue,
    reconcile::{BuildEntry, Controller},
    validation::{validate, Source},
};
