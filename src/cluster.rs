//! Kubernetes API adapter
//!
//! Implements [`ClusterApi`] with typed `kube::Api` handles. Absent objects
//! come back as `Ok(None)` and HTTP 409 as [`Error::Conflict`].
//!
//! [`rate_limited_client`] builds the client the driver talks through, with
//! its request rate held under the configured QPS and burst.

use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::{CSIStorageCapacity, StorageClass};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::client::ConfigExt;
use kube::{Client, Config};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tower::limit::RateLimitLayer;
use tower::ServiceBuilder;
use tracing::{debug, info};

/// Field manager recorded on every patch
const FIELD_MANAGER: &str = "local-lvm-csi";

/// [`ClusterApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

// =============================================================================
// Client
// =============================================================================

/// Requests let through per window so that the average rate is `qps` and at
/// most `burst` requests leave back to back. `None` when `qps` is not positive.
pub fn rate_window(qps: f32, burst: u32) -> Option<(u64, Duration)> {
    if !qps.is_finite() || qps <= 0.0 {
        return None;
    }
    let burst = burst.max(1);
    Some((
        u64::from(burst),
        Duration::from_secs_f64(f64::from(burst) / f64::from(qps)),
    ))
}

/// Client from the inferred configuration, limited to `qps` requests per
/// second with bursts of `burst`. A non-positive `qps` leaves it unlimited.
pub async fn rate_limited_client(qps: f32, burst: u32) -> Result<Client> {
    let config = Config::infer()
        .await
        .map_err(|e| Error::Configuration(format!("failed to infer Kubernetes config: {}", e)))?;
    let https = config.rustls_https_connector()?;
    let limit = rate_window(qps, burst).map(|(num, per)| {
        info!("Limiting API requests to {} per {:?}", num, per);
        RateLimitLayer::new(num, per)
    });

    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .option_layer(limit)
        .service(hyper::Client::builder().build::<_, hyper::Body>(https));
    Ok(Client::new(service, config.default_namespace))
}

/// Map a failed write onto the driver's error types
fn write_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| write_error(e, "PersistentVolume", name))?;
        debug!("Deletion requested for PersistentVolume {}", name);
        Ok(())
    }

    async fn patch_persistent_volume_finalizers(
        &self,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(e, "PersistentVolume", name))?;
        Ok(())
    }

    async fn patch_persistent_volume_annotations(
        &self,
        name: &str,
        resource_version: Option<&str>,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let mut metadata = json!({ "annotations": annotations });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(e, "PersistentVolume", name))?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_storage_capacities(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CSIStorageCapacity>> {
        let api: Api<CSIStorageCapacity> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_storage_capacity(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<CSIStorageCapacity> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| write_error(e, "CSIStorageCapacity", name))?;
        Ok(())
    }
}
