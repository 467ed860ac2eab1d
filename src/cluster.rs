//! Cluster API access
//!
//! Wrapper over the target cluster's API server. Core resources go through
//! typed `k8s-openapi` bindings; OpenShift, OLM and metal3 resources are
//! accessed dynamically through `DynamicObject` plus an `ApiResource`
//! description, so no foreign CRD bindings are compiled in.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Node, Pod, Service};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, ObjectMeta, Patch,
    PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::models::OperatorCondition;
use crate::{Error, Result};

/// Field manager used for server-side patches
const FIELD_MANAGER: &str = "assisted-installer";

/// Name of the singleton OpenShift config resources
const CLUSTER_RESOURCE: &str = "cluster";

/// Name of the cluster-version resource
const CLUSTER_VERSION_RESOURCE: &str = "version";

/// Configmap carrying the install-config payload
const CLUSTER_CONFIG_MAP: &str = "cluster-config-v1";
const CLUSTER_CONFIG_NAMESPACE: &str = "kube-system";

/// A cluster operator (or cluster version) reduced to what the controller
/// needs: its name and status conditions.
#[derive(Debug, Clone)]
pub struct ClusterOperatorRecord {
    /// Operator name
    pub name: String,
    /// Status conditions
    pub conditions: Vec<OperatorCondition>,
}

/// Capability interface over the cluster API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Control-plane nodes
    async fn list_master_nodes(&self) -> Result<Vec<Node>>;

    /// Events in a namespace
    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>>;

    /// Create a named event
    async fn create_event(
        &self,
        namespace: &str,
        name: &str,
        message: &str,
        component: &str,
    ) -> Result<()>;

    /// Pods in a namespace, optionally filtered
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
        field_selector: Option<String>,
    ) -> Result<Vec<Pod>>;

    /// A pod's recent logs
    async fn get_pod_logs(&self, namespace: &str, pod_name: &str, since_seconds: i64)
        -> Result<String>;

    /// Services; empty namespace means all namespaces
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    /// Delete one service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete every pod in a namespace
    async fn delete_pods(&self, namespace: &str) -> Result<()>;

    /// Fetch a configmap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Service networks from the cluster network configuration
    async fn get_service_networks(&self) -> Result<Vec<String>>;

    /// Cluster network type (OVNKubernetes, OpenShiftSDN, ...)
    async fn get_network_type(&self) -> Result<String>;

    /// All cluster operators
    async fn list_cluster_operators(&self) -> Result<Vec<ClusterOperatorRecord>>;

    /// One cluster operator by name
    async fn get_cluster_operator(&self, name: &str) -> Result<ClusterOperatorRecord>;

    /// The cluster-version resource
    async fn get_cluster_version(&self) -> Result<ClusterOperatorRecord>;

    /// Name of the CSV installed by a subscription
    async fn get_csv_from_subscription(
        &self,
        namespace: &str,
        subscription: &str,
    ) -> Result<String>;

    /// Phase of a CSV
    async fn get_csv(&self, namespace: &str, name: &str) -> Result<String>;

    /// All certificate signing requests
    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>>;

    /// Approve one CSR
    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<()>;

    /// Merge labels onto a node
    async fn patch_node_labels(
        &self,
        node_name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    /// Allow a non-HA transient etcd quorum during bootstrap (OCP < 4.7)
    async fn patch_etcd(&self) -> Result<()>;

    /// controlPlane.replicas from the install-config payload
    async fn get_control_plane_replicas(&self) -> Result<i64>;

    /// Lower controlPlane.replicas to 2 while the bootstrap holds a seat
    async fn patch_control_plane_replicas(&self) -> Result<()>;

    /// Restore controlPlane.replicas to 3
    async fn unpatch_control_plane_replicas(&self) -> Result<()>;

    /// All bare-metal hosts
    async fn list_bmhs(&self) -> Result<Vec<DynamicObject>>;

    /// Replace a bare-metal host object
    async fn update_bmh(&self, bmh: &DynamicObject) -> Result<()>;

    /// Replace a bare-metal host's status subresource
    async fn update_bmh_status(&self, bmh: &DynamicObject) -> Result<()>;

    /// Machines in the machine-api namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<DynamicObject>>;

    /// True when the metal3 provisioning configuration exists
    async fn is_metal_provisioning_exists(&self) -> Result<bool>;
}

/// Builder producing a [`ClusterApi`] from a kubeconfig path.
///
/// The bootstrap installer only gains a kubeconfig once bootkube has
/// produced one, so client construction is deferred behind this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApiBuilder: Send + Sync {
    /// Build a client from the kubeconfig at `kubeconfig_path`
    async fn build(&self, kubeconfig_path: &Path) -> Result<Arc<dyn ClusterApi>>;
}

/// Real [`ClusterApiBuilder`]
#[derive(Default, Clone)]
pub struct KubeClusterApiBuilder;

#[async_trait]
impl ClusterApiBuilder for KubeClusterApiBuilder {
    async fn build(&self, kubeconfig_path: &Path) -> Result<Arc<dyn ClusterApi>> {
        let api = KubeClusterApi::from_kubeconfig(kubeconfig_path).await?;
        Ok(Arc::new(api))
    }
}

fn cluster_operator_resource() -> ApiResource {
    ApiResource {
        group: "config.openshift.io".into(),
        version: "v1".into(),
        api_version: "config.openshift.io/v1".into(),
        kind: "ClusterOperator".into(),
        plural: "clusteroperators".into(),
    }
}

fn cluster_version_resource() -> ApiResource {
    ApiResource {
        group: "config.openshift.io".into(),
        version: "v1".into(),
        api_version: "config.openshift.io/v1".into(),
        kind: "ClusterVersion".into(),
        plural: "clusterversions".into(),
    }
}

fn network_resource() -> ApiResource {
    ApiResource {
        group: "config.openshift.io".into(),
        version: "v1".into(),
        api_version: "config.openshift.io/v1".into(),
        kind: "Network".into(),
        plural: "networks".into(),
    }
}

fn etcd_resource() -> ApiResource {
    ApiResource {
        group: "operator.openshift.io".into(),
        version: "v1".into(),
        api_version: "operator.openshift.io/v1".into(),
        kind: "Etcd".into(),
        plural: "etcds".into(),
    }
}

fn subscription_resource() -> ApiResource {
    ApiResource {
        group: "operators.coreos.com".into(),
        version: "v1alpha1".into(),
        api_version: "operators.coreos.com/v1alpha1".into(),
        kind: "Subscription".into(),
        plural: "subscriptions".into(),
    }
}

fn csv_resource() -> ApiResource {
    ApiResource {
        group: "operators.coreos.com".into(),
        version: "v1alpha1".into(),
        api_version: "operators.coreos.com/v1alpha1".into(),
        kind: "ClusterServiceVersion".into(),
        plural: "clusterserviceversions".into(),
    }
}

fn bmh_resource() -> ApiResource {
    ApiResource {
        group: "metal3.io".into(),
        version: "v1alpha1".into(),
        api_version: "metal3.io/v1alpha1".into(),
        kind: "BareMetalHost".into(),
        plural: "baremetalhosts".into(),
    }
}

fn provisioning_resource() -> ApiResource {
    ApiResource {
        group: "metal3.io".into(),
        version: "v1alpha1".into(),
        api_version: "metal3.io/v1alpha1".into(),
        kind: "Provisioning".into(),
        plural: "provisionings".into(),
    }
}

fn machine_resource() -> ApiResource {
    ApiResource {
        group: "machine.openshift.io".into(),
        version: "v1beta1".into(),
        api_version: "machine.openshift.io/v1beta1".into(),
        kind: "Machine".into(),
        plural: "machines".into(),
    }
}

/// Real [`ClusterApi`] implementation over a kube client
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig file
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::validation(format!("reading kubeconfig {}: {}", path.display(), e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::validation(format!("loading kubeconfig: {}", e)))?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    /// Build a client from the in-cluster service account
    pub async fn in_cluster() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(Error::Kube)?;
        Ok(Self::new(client))
    }

    fn dynamic(&self, ar: &ApiResource) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), ar)
    }

    fn dynamic_namespaced(&self, namespace: &str, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }

    async fn get_network_config(&self) -> Result<Value> {
        let api = self.dynamic(&network_resource());
        let network = api.get(CLUSTER_RESOURCE).await?;
        Ok(network.data)
    }

    async fn install_config(&self) -> Result<serde_yaml::Value> {
        let config_map = self
            .get_config_map(CLUSTER_CONFIG_NAMESPACE, CLUSTER_CONFIG_MAP)
            .await?;
        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get("install-config"))
            .ok_or_else(|| Error::validation("cluster-config-v1 has no install-config"))?;
        serde_yaml::from_str(raw)
            .map_err(|e| Error::validation(format!("parsing install-config: {}", e)))
    }

    async fn set_control_plane_replicas(&self, replicas: i64) -> Result<()> {
        let mut install_config = self.install_config().await?;
        let slot = install_config
            .get_mut("controlPlane")
            .and_then(|control_plane| control_plane.get_mut("replicas"))
            .ok_or_else(|| Error::validation("install-config has no controlPlane.replicas"))?;
        *slot = serde_yaml::Value::from(replicas);
        let raw = serde_yaml::to_string(&install_config)
            .map_err(|e| Error::validation(format!("serializing install-config: {}", e)))?;
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), CLUSTER_CONFIG_NAMESPACE);
        let patch = json!({ "data": { "install-config": raw } });
        api.patch(
            CLUSTER_CONFIG_MAP,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(replicas, "Patched control plane replicas");
        Ok(())
    }
}

fn operator_record(name: &str, data: &Value) -> ClusterOperatorRecord {
    let conditions = data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|c| OperatorCondition {
                    condition_type: c
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: c
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    message: c
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    ClusterOperatorRecord {
        name: name.to_string(),
        conditions,
    }
}

/// True when the node's Ready condition is True.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// All addresses the node advertises.
pub fn node_addresses(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .map(|addresses| addresses.iter().map(|a| a.address.clone()).collect())
        .unwrap_or_default()
}

/// True when the CSR carries an Approved or Denied condition.
pub fn is_csr_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
        .unwrap_or(false)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_master_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels("node-role.kubernetes.io/master");
        Ok(api.list(&params).await?.items)
    }

    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_event(
        &self,
        namespace: &str,
        name: &str,
        message: &str,
        component: &str,
    ) -> Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let event = Event {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            message: Some(message.to_string()),
            reason: Some(name.to_string()),
            type_: Some("Normal".to_string()),
            reporting_component: Some(component.to_string()),
            ..Default::default()
        };
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
        field_selector: Option<String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(labels) = label_selector {
            params = params.labels(&labels);
        }
        if let Some(fields) = field_selector {
            params = params.fields(&fields);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        since_seconds: i64,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            since_seconds: Some(since_seconds),
            ..Default::default()
        };
        Ok(api.logs(pod_name, &params).await?)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::default(), &ListParams::default())
            .await?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_service_networks(&self) -> Result<Vec<String>> {
        let network = self.get_network_config().await?;
        let networks = network
            .pointer("/status/serviceNetwork")
            .or_else(|| network.pointer("/spec/serviceNetwork"))
            .and_then(Value::as_array)
            .ok_or_else(|| Error::validation("network config has no serviceNetwork"))?;
        Ok(networks
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    async fn get_network_type(&self) -> Result<String> {
        let network = self.get_network_config().await?;
        network
            .pointer("/status/networkType")
            .or_else(|| network.pointer("/spec/networkType"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::validation("network config has no networkType"))
    }

    async fn list_cluster_operators(&self) -> Result<Vec<ClusterOperatorRecord>> {
        let api = self.dynamic(&cluster_operator_resource());
        let operators = api.list(&ListParams::default()).await?;
        Ok(operators
            .items
            .iter()
            .map(|op| operator_record(op.metadata.name.as_deref().unwrap_or_default(), &op.data))
            .collect())
    }

    async fn get_cluster_operator(&self, name: &str) -> Result<ClusterOperatorRecord> {
        let api = self.dynamic(&cluster_operator_resource());
        let operator = api.get(name).await?;
        Ok(operator_record(name, &operator.data))
    }

    async fn get_cluster_version(&self) -> Result<ClusterOperatorRecord> {
        let api = self.dynamic(&cluster_version_resource());
        let version = api.get(CLUSTER_VERSION_RESOURCE).await?;
        Ok(operator_record(CLUSTER_VERSION_RESOURCE, &version.data))
    }

    async fn get_csv_from_subscription(
        &self,
        namespace: &str,
        subscription: &str,
    ) -> Result<String> {
        let api = self.dynamic_namespaced(namespace, &subscription_resource());
        let sub = api.get(subscription).await?;
        sub.data
            .pointer("/status/installedCSV")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::NotFound(format!("subscription {} has no installed CSV", subscription))
            })
    }

    async fn get_csv(&self, namespace: &str, name: &str) -> Result<String> {
        let api = self.dynamic_namespaced(namespace, &csv_resource());
        let csv = api.get(name).await?;
        Ok(csv
            .data
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let name = csr
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("csr without a name"))?;
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let mut approved = csr.clone();
        let condition = CertificateSigningRequestCondition {
            type_: "Approved".to_string(),
            status: "True".to_string(),
            reason: Some("NodeCSRApprove".to_string()),
            message: Some("This CSR was approved by the assisted-installer".to_string()),
            ..Default::default()
        };
        let status = approved.status.get_or_insert_with(Default::default);
        status
            .conditions
            .get_or_insert_with(Vec::new)
            .push(condition);
        api.replace_subresource(
            "approval",
            name,
            &PostParams::default(),
            serde_json::to_vec(&approved)?,
        )
        .await?;
        debug!(csr = %name, "Approved CSR");
        Ok(())
    }

    async fn patch_node_labels(
        &self,
        node_name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(
            node_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_etcd(&self) -> Result<()> {
        let api = self.dynamic(&etcd_resource());
        let patch = json!({
            "spec": {
                "unsupportedConfigOverrides": {
                    "useUnsupportedUnsafeNonHANonProductionUnstableEtcd": true
                }
            }
        });
        api.patch(
            CLUSTER_RESOURCE,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        info!("Patched etcd to tolerate a transient non-HA quorum");
        Ok(())
    }

    async fn get_control_plane_replicas(&self) -> Result<i64> {
        let install_config = self.install_config().await?;
        install_config
            .get("controlPlane")
            .and_then(|control_plane| control_plane.get("replicas"))
            .and_then(serde_yaml::Value::as_i64)
            .ok_or_else(|| Error::validation("install-config has no controlPlane.replicas"))
    }

    async fn patch_control_plane_replicas(&self) -> Result<()> {
        self.set_control_plane_replicas(2).await
    }

    async fn unpatch_control_plane_replicas(&self) -> Result<()> {
        self.set_control_plane_replicas(3).await
    }

    async fn list_bmhs(&self) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic(&bmh_resource());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_bmh(&self, bmh: &DynamicObject) -> Result<()> {
        let name = bmh
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("bmh without a name"))?;
        let namespace = bmh.metadata.namespace.as_deref().unwrap_or_default();
        let api = self.dynamic_namespaced(namespace, &bmh_resource());
        api.replace(name, &PostParams::default(), bmh).await?;
        Ok(())
    }

    async fn update_bmh_status(&self, bmh: &DynamicObject) -> Result<()> {
        let name = bmh
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("bmh without a name"))?;
        let namespace = bmh.metadata.namespace.as_deref().unwrap_or_default();
        let api = self.dynamic_namespaced(namespace, &bmh_resource());
        api.replace_status(name, &PostParams::default(), serde_json::to_vec(bmh)?)
            .await?;
        Ok(())
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic_namespaced(namespace, &machine_resource());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn is_metal_provisioning_exists(&self) -> Result<bool> {
        let api = self.dynamic(&provisioning_resource());
        match api.get("provisioning-configuration").await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
