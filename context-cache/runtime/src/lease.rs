use crate::k8s::{self, api::apps::v1::Deployment, ObjectMeta, Resource};
use anyhow::{Context, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "context-cache-status-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Joins the election for the status write lease, returning a watch of the current claim.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The Lease is owned by the controller's Deployment so that it is removed along with it.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("deployment must have a name and uid")?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/component".to_string(),
                        "context-cache".to_string(),
                    ),
                    ("app.kubernetes.io/part-of".to_string(), "kyverno".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: Some(crate::status::STATUS_CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
