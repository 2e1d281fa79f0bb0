//! Surfaces entry health on `GlobalContextEntry` resources.
//!
//! Entries report through a [`Notifier`], which forwards updates over a bounded channel to the
//! status [`Controller`]. The controller publishes a warning event for every failure and, while
//! this replica holds the write lease, patches each resource's `Ready` condition.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod metrics;
mod notify;


pub use self::{
    controller::Controller,
    metrics::{ControllerMetrics, NotifyMetrics},
    notify::{Kind, Notifier, Update},
};

/// The name under which status patches and events are written.
pub const STATUS_CONTROLLER_NAME: &str = "context-cache";
