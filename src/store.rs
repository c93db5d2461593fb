//! Access to the cluster objects a pass reads and mutates.
//!
//! [`ObjectStore`] is the seam between the pass driver and the API server, the integration tests swap in an
//! in-memory implementation.

use crate::{
    probe_job::MANAGER_NAME,
    resources::{
        DNSMonitor,
        DNSMonitorStatus,
    },
};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::Pod,
};
use kube::{
    api::{
        DeleteParams,
        ListParams,
        Patch,
        PatchParams,
        PostParams,
        Preconditions,
    },
    Api,
    Resource,
    ResourceExt as _,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("object has no name")]
    MissingName,
    #[error(transparent)]
    Api(kube::Error),
}

impl StoreError {
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound,
            kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                StoreError::AlreadyExists
            }
            kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(response.message),
            err => StoreError::Api(err),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_monitor(&self, namespace: &str, name: &str) -> Result<Option<DNSMonitor>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Replaces the deployment, failing with [`StoreError::Conflict`] when it changed since it was read.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Deletes exactly the observed pod, not a replacement that reuses its name.
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn delete_job(&self, job: &Job) -> Result<()>;

    /// Writes `status` to the monitor's status subresource, guarded by the monitor's resource version.
    async fn update_status(&self, monitor: &DNSMonitor, status: &DNSMonitorStatus) -> Result<()>;
}

pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn uid_guarded(uid: Option<String>) -> DeleteParams {
    DeleteParams {
        preconditions: uid.map(|uid| Preconditions {
            uid: Some(uid),
            resource_version: None,
        }),
        ..DeleteParams::background()
    }
}

fn coordinates<K: Resource>(object: &K) -> Result<(String, String)> {
    let name = object.meta().name.clone().ok_or(StoreError::MissingName)?;
    let namespace = object.meta().namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_monitor(&self, namespace: &str, name: &str) -> Result<Option<DNSMonitor>> {
        self.namespaced::<DNSMonitor>(namespace)
            .get_opt(name)
            .await
            .map_err(StoreError::from_kube)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.namespaced::<Deployment>(namespace)
            .get_opt(name)
            .await
            .map_err(StoreError::from_kube)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let (namespace, name) = coordinates(deployment)?;
        trace!(%namespace, %name, resource_version = ?deployment.resource_version(), "replacing deployment");
        self.namespaced::<Deployment>(&namespace)
            .replace(&name, &PostParams::default(), deployment)
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .namespaced::<Pod>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(StoreError::from_kube)?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let (namespace, name) = coordinates(pod)?;
        self.namespaced::<Pod>(&namespace)
            .delete(&name, &uid_guarded(pod.metadata.uid.clone()))
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.namespaced::<Job>(namespace)
            .get_opt(name)
            .await
            .map_err(StoreError::from_kube)
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let (namespace, _) = coordinates(job)?;
        self.namespaced::<Job>(&namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let (namespace, name) = coordinates(job)?;
        self.namespaced::<Job>(&namespace)
            .delete(&name, &uid_guarded(job.metadata.uid.clone()))
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    async fn update_status(&self, monitor: &DNSMonitor, status: &DNSMonitorStatus) -> Result<()> {
        let (namespace, name) = coordinates(monitor)?;
        // A merge patch carrying the resource version is rejected with 409 once the monitor moved on.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": monitor.resource_version() },
            "status": status,
        });
        self.namespaced::<DNSMonitor>(&namespace)
            .patch_status(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(matches!(
            StoreError::from_kube(api_error(404, "NotFound")),
            StoreError::NotFound
        ));
        assert!(matches!(
            StoreError::from_kube(api_error(409, "AlreadyExists")),
            StoreError::AlreadyExists
        ));
        assert!(matches!(
            StoreError::from_kube(api_error(409, "Conflict")),
            StoreError::Conflict(message) if message == "Conflict happened"
        ));
        assert!(matches!(
            StoreError::from_kube(api_error(503, "ServiceUnavailable")),
            StoreError::Api(_)
        ));
    }
}
