use ahash::AHashSet as HashSet;
use context_cache_core::Evaluate;
use context_cache_k8s_api::{
    ExternalApiCall, GlobalContextEntrySpec, K8sDuration, KubernetesResource,
};
use std::time::Duration;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRY_LIMIT: u32 = 10;

/// The data source declared by a valid entry.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Source<'s> {
    Resource(&'s KubernetesResource),
    ApiCall(&'s ExternalApiCall),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("exactly one of kubernetesResource or apiCall must be set")]
    Source,

    #[error("kubernetesResource: version must be set")]
    MissingVersion,

    #[error("kubernetesResource: group must be set unless version is v1")]
    MissingGroup,

    #[error("kubernetesResource: resource must be set")]
    MissingResource,

    #[error("apiCall: exactly one of urlPath or service must be set")]
    Target,

    #[error("apiCall: service url must be set")]
    MissingUrl,

    #[error("apiCall: refreshInterval must be at least 1s, got {0}")]
    RefreshInterval(K8sDuration),

    #[error("apiCall: retryLimit must be at most {MAX_RETRY_LIMIT}, got {0}")]
    RetryLimit(u32),

    #[error("projections[{0}]: name must be set")]
    ProjectionName(usize),

    #[error("projections[{index}]: name {name:?} is already used")]
    DuplicateProjection { index: usize, name: String },

    #[error("projections[{index}]: name {name:?} must differ from the entry name")]
    ProjectionNamedAfterEntry { index: usize, name: String },

    #[error("projections[{0}]: jmesPath must be set")]
    MissingExpression(usize),

    #[error("projections[{index}]: invalid jmesPath {expression:?}: {error}")]
    Expression {
        index: usize,
        expression: String,
        error: anyhow::Error,
    },
}

/// Checks an entry's spec, returning its data source.
pub fn validate<'s>(
    name: &str,
    spec: &'s GlobalContextEntrySpec,
    evaluator: &dyn Evaluate,
) -> Result<Source<'s>, Error> {
    let source = match (&spec.kubernetes_resource, &spec.api_call) {
        (Some(resource), None) => {
            validate_resource(resource)?;
            Source::Resource(resource)
        }
        (None, Some(call)) => {
            validate_api_call(call)?;
            Source::ApiCall(call)
        }
        _ => return Err(Error::Source),
    };

    let mut names = HashSet::with_capacity(spec.projections.len());
    for (index, projection) in spec.projections.iter().enumerate() {
        if projection.name.is_empty() {
            return Err(Error::ProjectionName(index));
        }
        if projection.name == name {
            return Err(Error::ProjectionNamedAfterEntry {
                index,
                name: projection.name.clone(),
            });
        }
        if !names.insert(projection.name.as_str()) {
            return Err(Error::DuplicateProjection {
                index,
                name: projection.name.clone(),
            });
        }
        if projection.jmes_path.is_empty() {
            return Err(Error::MissingExpression(index));
        }
        evaluator
            .check(&projection.jmes_path)
            .map_err(|error| Error::Expression {
                index,
                expression: projection.jmes_path.clone(),
                error,
            })?;
    }

    Ok(source)
}

fn validate_resource(resource: &KubernetesResource) -> Result<(), Error> {
    if resource.version.is_empty() {
        return Err(Error::MissingVersion);
    }
    if resource.group.is_empty() && resource.version != "v1" {
        return Err(Error::MissingGroup);
    }
    if resource.resource.is_empty() {
        return Err(Error::MissingResource);
    }
    Ok(())
}

fn validate_api_call(call: &ExternalApiCall) -> Result<(), Error> {
    match (&call.url_path, &call.service) {
        (Some(path), None) if !path.is_empty() => {}
        (None, Some(service)) => {
            if service.url.is_empty() {
                return Err(Error::MissingUrl);
            }
        }
        _ => return Err(Error::Target),
    }
    if call.refresh_interval.as_duration() < MIN_REFRESH_INTERVAL {
        return Err(Error::RefreshInterval(call.refresh_interval));
    }
    if call.retry_limit > MAX_RETRY_LIMIT {
        return Err(Error::RetryLimit(call.retry_limit));
    }
    Ok(())
}
