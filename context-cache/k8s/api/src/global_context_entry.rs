use crate::duration::K8sDuration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares data that policies may reference while rules are evaluated.
///
/// Exactly one of `kubernetesResource` or `apiCall` must be set.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kyverno.io",
    version = "v2alpha1",
    kind = "GlobalContextEntry",
    status = "GlobalContextEntryStatus",
    shortname = "gctxentry",
    category = "kyverno"
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContextEntrySpec {
    /// Mirrors all resources of a kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_resource: Option<KubernetesResource>,

    /// Periodically fetches data from an API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ExternalApiCall>,

    /// Named queries evaluated against the entry's data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<Projection>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResource {
    /// The API group; empty for the core group.
    #[serde(default)]
    pub group: String,

    pub version: String,

    /// The plural resource name, e.g. `deployments`.
    pub resource: String,

    /// Restricts the mirror to one namespace. Ignored for cluster-scoped resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalApiCall {
    /// A path on the Kubernetes API server, e.g. `/api/v1/namespaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,

    #[serde(default)]
    pub method: Method,

    /// Key/value pairs sent as the JSON body of POST requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<RequestData>,

    /// An HTTP(S) service to call instead of the API server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceCall>,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: K8sDuration,

    /// The number of times a failed call is retried within one refresh.
    #[serde(default)]
    pub retry_limit: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct RequestData {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCall {
    pub url: String,

    /// PEM-encoded CA certificates used to verify the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub name: String,
    pub jmes_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContextEntryStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_time: Option<Time>,
}

fn default_refresh_interval() -> K8sDuration {
    K8sDuration::from_secs(10 * 60)
}

impl Default for ExternalApiCall {
    fn default() -> Self {
        Self {
            url_path: None,
            method: Method::default(),
            data: Vec::new(),
            service: None,
            refresh_interval: default_refresh_interval(),
            retry_limit: 0,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

impl std::fmt::Display for KubernetesResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}
