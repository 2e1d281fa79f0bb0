#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use context_cache_core as core;
pub use context_cache_external as external;
pub use context_cache_k8s_api as k8s;
pub use context_cache_k8s_controller as controller;
pub use context_cache_k8s_resource as resource;
pub use context_cache_k8s_status as status;

mod admission;
mod args;
mod builder;
mod lease;

pub use self::args::Args;
