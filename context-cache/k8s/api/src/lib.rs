#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod global_context_entry;

pub use self::{
    duration::K8sDuration,
    global_context_entry::{
        ExternalApiCall, GlobalContextEntry, GlobalContextEntrySpec, GlobalContextEntryStatus,
        HttpHeader, KubernetesResource, Method, Projection, RequestData, ServiceCall,
    },
};
pub use k8s_openapi::{
    api::{self, core::v1::ObjectReference},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    discovery::ApiResource,
    core::DynamicObject,
    Client, Error, Resource, ResourceExt,
};
