//! Cluster access for the harness.
//!
//! This module provides the `KubeCluster` type, which talks to the cluster the
//! current kubeconfig points at, plus the two seams the harness engine is
//! written against:
//!
//! - `ResourceLookup`: read the status of a Tekton run (used by the wait engine)
//! - `ClusterOps`: namespace lifecycle, cleanup and failure diagnostics
//!
//! Fixture creation (Secrets, ConfigMaps, arbitrary Tekton objects) is only
//! needed by scenario tests and lives on `KubeCluster` directly.

use crate::error::{HarnessError, Result};
use crate::resource::{ResourceKind, ResourceRef, ResourceStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Label put on every namespace the harness creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of `MANAGED_BY_LABEL`.
pub const MANAGED_BY_VALUE: &str = "example-tests";

/// Read access to Tekton run status.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// Current status of `resource`.
    async fn resource_status(&self, resource: &ResourceRef) -> Result<ResourceStatus>;
}

/// Cluster operations the lifecycle coordinator and orchestrator need.
#[async_trait]
pub trait ClusterOps: ResourceLookup {
    /// Create a namespace. Fails if it already exists.
    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Delete a namespace. Deleting a missing namespace succeeds.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Whether `name` ServiceAccount exists in `namespace`.
    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Delete a Tekton object. Deleting a missing object succeeds.
    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()>;

    /// Render the Tekton objects in `namespace` for failure diagnostics.
    async fn dump_namespace(&self, namespace: &str) -> Result<String>;
}

/// Connection to the cluster selected by the ambient kubeconfig.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    api_version: String,
}

impl KubeCluster {
    /// Connect using the default kubeconfig / in-cluster configuration.
    ///
    /// `api_version` is the `tekton.dev` version used for all Tekton objects.
    pub async fn connect(api_version: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| {
            HarnessError::Cluster(format!(
                "Failed to create Kubernetes client - check KUBECONFIG and the current context: {}",
                e
            ))
        })?;

        Ok(Self::new(client, api_version))
    }

    pub fn new(client: Client, api_version: impl Into<String>) -> Self {
        Self {
            client,
            api_version: api_version.into(),
        }
    }

    fn tekton_api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource(&self.api_version);
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// Create an Opaque Secret fixture.
    pub async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let secret = Secret {
            metadata: object_meta(namespace, name),
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &secret)
            .await
            .map_err(|e| HarnessError::Cluster(format!("Failed to create Secret `{}`: {}", name, e)))?;

        info!(namespace = %namespace, secret = %name, "Created secret");
        Ok(())
    }

    /// Create a ConfigMap fixture.
    pub async fn create_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let config_map = ConfigMap {
            metadata: object_meta(namespace, name),
            data: Some(data),
            ..Default::default()
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| {
                HarnessError::Cluster(format!("Failed to create configMap `{}`: {}", name, e))
            })?;

        info!(namespace = %namespace, config_map = %name, "Created configMap");
        Ok(())
    }

    /// Create a Tekton object of `kind` with the given `spec`.
    pub async fn create_tekton_object(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        spec: serde_json::Value,
    ) -> Result<()> {
        let ar = kind.api_resource(&self.api_version);
        let mut obj = DynamicObject::new(name, &ar).data(serde_json::json!({ "spec": spec }));
        if kind.is_namespaced() {
            obj = obj.within(namespace);
        }

        self.tekton_api(kind, Some(namespace))
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| {
                HarnessError::Cluster(format!("Failed to create {} `{}`: {}", kind.kind(), name, e))
            })?;

        info!(namespace = %namespace, kind = %kind, name = %name, "Created Tekton object");
        Ok(())
    }
}

#[async_trait]
impl ResourceLookup for KubeCluster {
    async fn resource_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
        let lookup_error = |message: String| HarnessError::Lookup {
            resource: resource.to_string(),
            message,
        };

        let obj = self
            .tekton_api(resource.kind, resource.namespace.as_deref())
            .get(&resource.name)
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        ResourceStatus::from_object(&obj.data).map_err(|e| lookup_error(format!("invalid status: {}", e)))
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut metadata = ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        };
        metadata.labels = Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )]));
        let namespace = Namespace {
            metadata,
            ..Default::default()
        };

        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), &namespace)
            .await
            .map_err(|e| {
                HarnessError::Cluster(format!("Failed to create namespace {} for tests: {}", name, e))
            })?;

        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace = %name, "Namespace already gone");
                Ok(())
            }
            Err(e) => Err(HarnessError::Cluster(format!(
                "Failed to delete namespace {}: {}",
                name, e
            ))),
        }
    }

    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()> {
        let api = self.tekton_api(resource.kind, resource.namespace.as_deref());
        match api.delete(&resource.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(HarnessError::Cluster(format!(
                "Failed to delete {}: {}",
                resource, e
            ))),
        }
    }

    async fn dump_namespace(&self, namespace: &str) -> Result<String> {
        let mut dump = String::new();

        for kind in ResourceKind::namespaced_kinds() {
            // Not every kind is served at every API version.
            let list = match self
                .tekton_api(kind, Some(namespace))
                .list(&ListParams::default())
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    dump.push_str(&format!("# {}: not listed ({})\n", kind.kind(), e));
                    continue;
                }
            };

            for obj in list.items {
                let rendered = serde_json::to_string_pretty(&obj)
                    .map_err(|e| HarnessError::Cluster(format!("Failed to render {}: {}", kind, e)))?;
                dump.push_str(&format!("# {}\n{}\n", kind.kind(), rendered));
            }
        }

        Ok(dump)
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Mock cluster module for testing.
///
/// This module provides an in-memory `ClusterOps` implementation that records
/// every call and replays scripted statuses.
pub mod mock {
    use super::*;
    use crate::resource::Condition;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a status whose `Succeeded` condition has the given value.
    pub fn status(succeeded: &str, reason: &str) -> ResourceStatus {
        ResourceStatus {
            conditions: vec![Condition {
                type_: "Succeeded".to_string(),
                status: succeeded.to_string(),
                reason: Some(reason.to_string()),
                message: None,
            }],
            ..Default::default()
        }
    }

    /// Mock cluster for unit testing.
    #[derive(Default)]
    pub struct MockCluster {
        /// Scripted statuses per resource name; the last one repeats.
        statuses: Mutex<HashMap<String, VecDeque<ResourceStatus>>>,
        created_namespaces: Mutex<Vec<String>>,
        deleted_namespaces: Mutex<Vec<String>>,
        deleted_resources: Mutex<Vec<ResourceRef>>,
        dumped_namespaces: Mutex<Vec<String>>,
        lookups: AtomicUsize,
        fail_namespace_creation: bool,
        fail_namespace_deletion: bool,
    }

    impl MockCluster {
        /// Create a mock where every call succeeds.
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the statuses returned for `name`, in order.
        pub fn with_statuses(self, name: &str, statuses: Vec<ResourceStatus>) -> Self {
            lock(&self.statuses).insert(name.to_string(), statuses.into());
            self
        }

        /// Create a mock whose namespace creation fails.
        pub fn failing_namespace_creation(mut self) -> Self {
            self.fail_namespace_creation = true;
            self
        }

        /// Create a mock whose namespace deletion fails.
        pub fn failing_namespace_deletion(mut self) -> Self {
            self.fail_namespace_deletion = true;
            self
        }

        pub fn created_namespaces(&self) -> Vec<String> {
            lock(&self.created_namespaces).clone()
        }

        /// Every delete call, including failed ones.
        pub fn deleted_namespaces(&self) -> Vec<String> {
            lock(&self.deleted_namespaces).clone()
        }

        pub fn deleted_resources(&self) -> Vec<ResourceRef> {
            lock(&self.deleted_resources).clone()
        }

        pub fn dumped_namespaces(&self) -> Vec<String> {
            lock(&self.dumped_namespaces).clone()
        }

        /// Get the number of status lookups made.
        pub fn lookup_count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceLookup for MockCluster {
        async fn resource_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
            self.lookups.fetch_add(1, Ordering::SeqCst);

            let mut statuses = lock(&self.statuses);
            let Some(queue) = statuses.get_mut(&resource.name) else {
                return Err(HarnessError::Lookup {
                    resource: resource.to_string(),
                    message: "not found".to_string(),
                });
            };

            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            Ok(next.unwrap_or_default())
        }
    }

    #[async_trait]
    impl ClusterOps for MockCluster {
        async fn create_namespace(&self, name: &str) -> Result<()> {
            if self.fail_namespace_creation {
                return Err(HarnessError::Cluster(format!(
                    "Failed to create namespace {} for tests: mock failure",
                    name
                )));
            }
            lock(&self.created_namespaces).push(name.to_string());
            Ok(())
        }

        async fn delete_namespace(&self, name: &str) -> Result<()> {
            lock(&self.deleted_namespaces).push(name.to_string());
            if self.fail_namespace_deletion {
                return Err(HarnessError::Cluster(format!(
                    "Failed to delete namespace {}: mock failure",
                    name
                )));
            }
            Ok(())
        }

        async fn service_account_exists(&self, namespace: &str, _name: &str) -> Result<bool> {
            Ok(lock(&self.created_namespaces).iter().any(|ns| ns == namespace))
        }

        async fn delete_resource(&self, resource: &ResourceRef) -> Result<()> {
            lock(&self.deleted_resources).push(resource.clone());
            Ok(())
        }

        async fn dump_namespace(&self, namespace: &str) -> Result<String> {
            lock(&self.dumped_namespaces).push(namespace.to_string());
            Ok(format!("# TaskRun\n{{\"metadata\":{{\"namespace\":\"{}\"}}}}\n", namespace))
        }
    }
}
