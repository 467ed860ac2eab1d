//! Post-install controller
//!
//! Runs as a job inside the freshly installed cluster and drives it from
//! "bootstrap complete" to "installation complete". Each concern is an
//! independent loop over its own ticker: node progress, CSR approval, the
//! DNS address-conflict workaround, bare-metal host reconciliation, log
//! uploads and the operator-availability pipeline. The loops share nothing
//! but a cancellation token and the [`ControllerStatus`] error accumulator.

mod status;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;
use kube::api::DynamicObject;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use status::ControllerStatus;

use crate::cluster::{is_csr_decided, is_node_ready, node_addresses, ClusterApi};
use crate::config::ControllerConfig;
use crate::installer::{
    CONTROLLER_JOB_NAME, CONTROLLER_LOGS_SECONDS_AGO, CONTROLLER_READY_EVENT,
};
use crate::inventory::InventoryClient;
use crate::models::{
    hosts_by_ip, operator_status_from_conditions, operator_status_from_csv_phase, ClusterStatus,
    HostStage, HostStatus, HostsByName, LogsType, MonitoredOperator, OperatorStatus,
};
use crate::ops::HostOps;
use crate::retry::{retry_fixed, wait_for_predicate, WAIT_FOREVER};
use crate::{Error, Result};

/// Monitored-operator name of the console operator
pub const CONSOLE_OPERATOR_NAME: &str = "console";

/// Monitored-operator name of the cluster-version operator
pub const CVO_OPERATOR_NAME: &str = "cvo";

/// Message reported for operators whose wait budget ran out
pub const OPERATOR_TIMED_OUT_MESSAGE: &str = "Waiting for operator timed out";

const INGRESS_CONFIG_MAP_NAME: &str = "default-ingress-cert";
const INGRESS_CONFIG_MAP_NAMESPACE: &str = "openshift-config-managed";

const DNS_SERVICE_NAME: &str = "dns-default";
const DNS_OPERATOR_NAMESPACE: &str = "openshift-dns-operator";

const MCS_NAMESPACE: &str = "openshift-machine-config-operator";
const MCS_LABEL_SELECTOR: &str = "k8s-app=machine-config-server";

const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";
const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

const BMH_STATUS_ANNOTATION: &str = "baremetalhost.metal3.io/status";
const BMH_PAUSED_ANNOTATION: &str = "baremetalhost.metal3.io/paused";

const CUSTOM_MANIFESTS_FILE: &str = "custom_manifests.json";
const KUBECONFIG_FILE_NAME: &str = "kubeconfig-noingress";

const DELETE_RETRIES: u32 = 10;

/// The post-install controller
#[derive(Clone)]
pub struct Controller {
    config: ControllerConfig,
    inventory: Arc<dyn InventoryClient>,
    ops: Arc<dyn HostOps>,
    cluster: Arc<dyn ClusterApi>,
    /// Shared error state consulted when posting the completion report
    pub status: ControllerStatus,
    wait_interval: Duration,
    dns_interval: Duration,
    bmh_interval: Duration,
    logs_upload_period: Duration,
    wait_timeout: Duration,
    cvo_timeout: Duration,
    dns_attempts: u32,
}

impl Controller {
    /// Build a controller from its collaborators
    pub fn new(
        config: ControllerConfig,
        inventory: Arc<dyn InventoryClient>,
        ops: Arc<dyn HostOps>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            config,
            inventory,
            ops,
            cluster,
            status: ControllerStatus::new(),
            wait_interval: Duration::from_secs(5),
            dns_interval: Duration::from_secs(1),
            bmh_interval: Duration::from_secs(10),
            logs_upload_period: Duration::from_secs(5 * 60),
            wait_timeout: Duration::from_secs(70 * 60),
            cvo_timeout: Duration::from_secs(3 * 60 * 60),
            dns_attempts: 120,
        }
    }

    /// Override the tick intervals, for tests
    pub fn with_intervals(mut self, wait: Duration, dns: Duration, bmh: Duration) -> Self {
        self.wait_interval = wait;
        self.dns_interval = dns;
        self.bmh_interval = bmh;
        self
    }

    /// Override the wait budgets, for tests
    pub fn with_timeouts(mut self, wait: Duration, cvo: Duration) -> Self {
        self.wait_timeout = wait;
        self.cvo_timeout = cvo;
        self
    }

    /// Override the DNS-conflict attempt budget, for tests
    pub fn with_dns_attempts(mut self, attempts: u32) -> Self {
        self.dns_attempts = attempts;
        self
    }

    /// Run all loops to completion. Returns an error when the installation
    /// completed with a fatal error recorded.
    pub async fn run(&self) -> Result<()> {
        self.set_ready_state().await;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { this.approve_csrs(token).await }));
        }
        {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                this.hack_dns_address_conflict(token).await
            }));
        }
        {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { this.update_bmhs(token).await }));
        }
        {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { this.upload_logs(token).await }));
        }
        {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if this.wait_and_update_nodes_status().await {
                        info!("All nodes reached a terminal stage");
                        return;
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(this.wait_interval) => {}
                    }
                }
            }));
        }

        self.post_install_configs(&cancel).await;
        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }

        if self.status.has_error() {
            Err(Error::ops(self.status.error_message()))
        } else {
            Ok(())
        }
    }

    /// Announce readiness: verify connectivity to the inventory and to the
    /// cluster, then create the ready event the bootstrap installer waits
    /// for. Retries forever; nothing can proceed without it.
    pub async fn set_ready_state(&self) {
        info!("Start waiting to be ready");
        let _ = wait_for_predicate(
            WAIT_FOREVER,
            self.wait_interval,
            &CancellationToken::new(),
            || async {
                if let Err(e) = self.inventory.get_cluster().await {
                    warn!(error = %e, "Failed to connect to assisted service");
                    return false;
                }
                if let Err(e) = self.cluster.list_nodes().await {
                    warn!(error = %e, "Failed to connect to ocp cluster");
                    return false;
                }
                if let Err(e) = self
                    .cluster
                    .create_event(
                        &self.config.namespace,
                        CONTROLLER_READY_EVENT,
                        "Assisted controller managed to connect to the cluster and service",
                        CONTROLLER_JOB_NAME,
                    )
                    .await
                {
                    warn!(error = %e, "Failed to create ready event");
                    return false;
                }
                true
            },
        )
        .await;
        info!("Controller is ready");
    }

    /// One pass of the node-progress loop. Returns true when every
    /// non-disabled host is in a terminal stage and the loop may exit.
    pub async fn wait_and_update_nodes_status(&self) -> bool {
        debug!("Checking node progress");
        let mut hosts = match self.inventory.get_hosts(&[HostStatus::Disabled]).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Failed to get hosts from inventory");
                return false;
            }
        };
        if hosts.values().all(|host| host.is_terminal()) {
            return true;
        }

        let nodes = match self.cluster.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Failed to list nodes");
                return false;
            }
        };

        let by_ip = hosts_by_ip(&hosts);
        for node in &nodes {
            let Some(node_name) = node.metadata.name.clone() else { continue };
            let host_name = if hosts.contains_key(&node_name) {
                Some(node_name.clone())
            } else {
                node_addresses(node)
                    .iter()
                    .find_map(|address| by_ip.get(address).cloned())
            };
            let Some(host_name) = host_name else {
                debug!(node = %node_name, "Node has no matching inventory host");
                continue;
            };
            let Some(host) = hosts.get_mut(&host_name) else { continue };
            if host.is_terminal() {
                continue;
            }

            let joined_or_later = host
                .progress
                .current_stage
                .map(|stage| stage.ordinal() >= HostStage::Joined.ordinal())
                .unwrap_or(false);
            if !joined_or_later {
                self.report_host_stage(host, HostStage::Joined).await;
                host.progress.current_stage = Some(HostStage::Joined);
            }
            if is_node_ready(node) && host.progress.current_stage == Some(HostStage::Joined) {
                self.report_host_stage(host, HostStage::Done).await;
                host.progress.current_stage = Some(HostStage::Done);
            }
        }

        // hosts without a node yet may already be fetching ignition
        self.report_configuring_from_mcs(&mut hosts).await;
        false
    }

    async fn report_host_stage(&self, host: &crate::models::Host, stage: HostStage) {
        info!(host_id = %host.id, stage = %stage, "Updating host progress");
        if let Err(e) = self
            .inventory
            .update_host_install_progress(&host.infra_env_id, &host.id, stage, "")
            .await
        {
            error!(host_id = %host.id, stage = %stage, error = %e, "Failed to update host progress");
        }
    }

    /// Correlate machine-config-server logs to hosts that pulled ignition
    /// but have no node object yet, and report those as configuring.
    async fn report_configuring_from_mcs(&self, hosts: &mut HostsByName) {
        let pending: Vec<String> = hosts
            .iter()
            .filter(|(_, host)| {
                !host.is_terminal()
                    && !host
                        .progress
                        .current_stage
                        .map(|stage| stage.ordinal() >= HostStage::Configuring.ordinal())
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if pending.is_empty() {
            return;
        }
        let pods = match self
            .cluster
            .list_pods(MCS_NAMESPACE, Some(MCS_LABEL_SELECTOR.to_string()), None)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                debug!(error = %e, "Failed to list machine-config-server pods");
                return;
            }
        };
        let mut logs = String::new();
        for pod in &pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else { continue };
            match self
                .cluster
                .get_pod_logs(MCS_NAMESPACE, pod_name, CONTROLLER_LOGS_SECONDS_AGO)
                .await
            {
                Ok(pod_logs) => logs.push_str(&pod_logs),
                Err(e) => debug!(pod = %pod_name, error = %e, "Failed to get MCS pod logs"),
            }
        }
        if logs.is_empty() {
            return;
        }
        for name in pending {
            let Some(host) = hosts.get_mut(&name) else { continue };
            let ips = crate::models::host_ips(host).unwrap_or_default();
            if ips.iter().any(|ip| logs.contains(ip.as_str())) {
                self.report_host_stage(host, HostStage::Configuring).await;
                host.progress.current_stage = Some(HostStage::Configuring);
            }
        }
    }

    /// Approve every pending CSR. Runs until cancelled; errors are logged
    /// and retried on the next tick, never fatal.
    pub async fn approve_csrs(&self, cancel: CancellationToken) {
        info!("Start approving CSRs");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.wait_interval) => {
                    self.approve_pending_csrs().await;
                }
            }
        }
    }

    /// One approval pass: approve every CSR not already decided. Re-running
    /// is safe; decided CSRs are skipped.
    pub async fn approve_pending_csrs(&self) {
        let csrs = match self.cluster.list_csrs().await {
            Ok(csrs) => csrs,
            Err(e) => {
                warn!(error = %e, "Failed to get CSRs");
                return;
            }
        };
        for csr in &csrs {
            if is_csr_decided(csr) {
                continue;
            }
            if let Err(e) = self.cluster.approve_csr(csr).await {
                warn!(
                    csr = %csr.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "Failed to approve CSR"
                );
            }
        }
    }

    /// Work around the DNS operator racing other services for its address:
    /// if anything but the DNS service holds the expected service IP, delete
    /// it and bounce the DNS operator pods until the address settles.
    pub async fn hack_dns_address_conflict(&self, cancel: CancellationToken) {
        let networks = match self.cluster.get_service_networks().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!(error = %e, "Failed to get service networks, skipping DNS conflict check");
                return;
            }
        };
        let Some(first_network) = networks.first() else {
            warn!("No service networks defined, skipping DNS conflict check");
            return;
        };
        let expected_ip = match dns_service_ip(first_network) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(network = %first_network, error = %e, "Failed to compute DNS service IP");
                return;
            }
        };
        info!(ip = %expected_ip, "Checking for DNS address conflicts");

        for _ in 0..self.dns_attempts {
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(self.dns_interval).await;

            let services = match self.cluster.list_services("").await {
                Ok(services) => services,
                Err(e) => {
                    warn!(error = %e, "Failed to list services");
                    continue;
                }
            };
            let holder = services.iter().find(|service| {
                service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.cluster_ip.as_deref())
                    == Some(expected_ip.as_str())
            });
            let Some(holder) = holder else { continue };
            let holder_name = holder.metadata.name.clone().unwrap_or_default();
            if holder_name == DNS_SERVICE_NAME {
                info!(ip = %expected_ip, "DNS service holds its expected address");
                return;
            }

            let holder_namespace = holder.metadata.namespace.clone().unwrap_or_default();
            warn!(
                service = %holder_name,
                namespace = %holder_namespace,
                ip = %expected_ip,
                "Deleting service conflicting with the DNS address"
            );
            if retry_fixed(DELETE_RETRIES, self.dns_interval, "delete conflicting service", || {
                self.cluster.delete_service(&holder_namespace, &holder_name)
            })
            .await
            .is_err()
            {
                continue;
            }
            // the operator recreates its pods, which re-creates the service
            // on the now-free address
            if let Err(e) = retry_fixed(
                DELETE_RETRIES,
                self.dns_interval,
                "delete dns operator pods",
                || self.cluster.delete_pods(DNS_OPERATOR_NAMESPACE),
            )
            .await
            {
                warn!(error = %e, "Failed to delete DNS operator pods");
            }
        }
        warn!("Giving up on the DNS address conflict check");
    }

    /// Periodic log upload; a final flush runs on cancellation so the last
    /// state always reaches the inventory.
    pub async fn upload_logs(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.upload_controller_logs().await {
                        warn!(error = %e, "Final log upload failed");
                    }
                    if let Err(e) = self
                        .inventory
                        .cluster_log_progress_report(crate::models::LogsState::Completed)
                        .await
                    {
                        warn!(error = %e, "Failed to report log completion");
                    }
                    return;
                }
                _ = tokio::time::sleep(self.logs_upload_period) => {
                    if let Err(e) = self.upload_controller_logs().await {
                        warn!(error = %e, "Periodic log upload failed");
                    }
                }
            }
        }
    }

    async fn upload_controller_logs(&self) -> Result<()> {
        let pods = self
            .cluster
            .list_pods(
                &self.config.namespace,
                Some(format!("job-name={}", CONTROLLER_JOB_NAME)),
                Some("status.phase=Running".to_string()),
            )
            .await?;
        let Some(pod_name) = pods.first().and_then(|pod| pod.metadata.name.clone()) else {
            debug!("Controller pod not found, skipping log upload");
            return Ok(());
        };
        self.upload_summary_logs(&pod_name, &self.config.namespace, CONTROLLER_LOGS_SECONDS_AGO)
            .await
    }

    /// Bundle the controller pod logs and the cluster-operator report into
    /// one archive and upload it. When the installation is in an error
    /// state, must-gather output is collected and bundled as well.
    pub async fn upload_summary_logs(
        &self,
        pod_name: &str,
        namespace: &str,
        since_seconds: i64,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;

        match self.cluster.list_cluster_operators().await {
            Ok(operators) => {
                let report: Vec<Value> = operators
                    .iter()
                    .map(|op| {
                        json!({
                            "name": op.name,
                            "conditions": op
                                .conditions
                                .iter()
                                .map(|c| json!({
                                    "type": c.condition_type,
                                    "status": c.status,
                                    "message": c.message,
                                }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                tokio::fs::write(
                    staging.path().join("cluster-operators.json"),
                    serde_json::to_vec_pretty(&report)?,
                )
                .await?;
            }
            Err(e) => warn!(error = %e, "Failed to list cluster operators for the log bundle"),
        }

        match self
            .cluster
            .get_pod_logs(namespace, pod_name, since_seconds)
            .await
        {
            Ok(logs) => {
                tokio::fs::write(staging.path().join(format!("{}.log", pod_name)), logs).await?;
            }
            Err(e) => warn!(pod = %pod_name, error = %e, "Failed to get controller pod logs"),
        }

        if self.status.has_error() {
            self.collect_must_gather(staging.path()).await;
        }

        let archive_dir = tempfile::tempdir()?;
        let archive = archive_dir.path().join("controller-logs.tar.gz");
        crate::ops::create_tar_gz(&archive, staging.path())?;
        self.inventory
            .upload_logs(LogsType::Controller, &archive)
            .await
    }

    async fn collect_must_gather(&self, staging: &Path) {
        let images = self.parse_must_gather_images();
        if images.is_empty() {
            return;
        }
        let kubeconfig = match self.ensure_kubeconfig().await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Failed to fetch kubeconfig for must-gather");
                return;
            }
        };
        let work_dir = std::env::temp_dir().join("must-gather-work");
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            warn!(error = %e, "Failed to create must-gather work dir");
            return;
        }
        let result = retry_fixed(3, self.wait_interval, "must-gather", || {
            self.ops
                .get_must_gather_logs(&work_dir, &kubeconfig, &images)
        })
        .await;
        match result {
            Ok(archive) => {
                if let Err(e) =
                    tokio::fs::copy(&archive, staging.join("must-gather.tar.gz")).await
                {
                    warn!(error = %e, "Failed to stage must-gather archive");
                }
            }
            Err(e) => warn!(error = %e, "Failed to collect must-gather logs"),
        }
    }

    /// Resolve the must-gather image set: empty means none, a plain string
    /// is a single image, and a JSON map contributes the `ocp` entry plus
    /// one entry per operator currently in error. Unknown keys are opaque
    /// image references.
    pub fn parse_must_gather_images(&self) -> Vec<String> {
        let raw = self.config.must_gather_image.trim();
        if raw.is_empty() {
            return vec![];
        }
        match serde_json::from_str::<HashMap<String, String>>(raw) {
            Ok(map) => {
                let errored = self.status.get_operators_in_error();
                map.into_iter()
                    .filter(|(key, _)| key == "ocp" || errored.iter().any(|op| op == key))
                    .map(|(_, image)| image)
                    .collect()
            }
            Err(_) => vec![raw.to_string()],
        }
    }

    async fn ensure_kubeconfig(&self) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(KUBECONFIG_FILE_NAME);
        if tokio::fs::metadata(&path).await.is_err() {
            self.inventory
                .download_cluster_credentials(KUBECONFIG_FILE_NAME, &path)
                .await?;
        }
        Ok(path)
    }

    /// The operator-availability pipeline: wait for finalizing, drive the
    /// console (and optionally the cluster-version) operator to available,
    /// upload the ingress CA, wait out the OLM operators, patch node labels
    /// and post the completion report.
    pub async fn post_install_configs(&self, cancel: &CancellationToken) {
        info!("Waiting for cluster to reach finalizing");
        let finalizing = wait_for_predicate(WAIT_FOREVER, self.wait_interval, cancel, || async {
            match self.inventory.get_cluster().await {
                Ok(cluster) => cluster.status == ClusterStatus::Finalizing,
                Err(e) => {
                    warn!(error = %e, "Failed to get cluster");
                    false
                }
            }
        })
        .await;
        if finalizing.is_err() {
            return;
        }

        if let Err(e) = self.waiting_for_cluster_operators(cancel).await {
            self.status.error(format!(
                "Timeout while waiting for cluster operators to be available: {}",
                e
            ));
        }

        if let Err(e) = self.upload_ingress_cert().await {
            self.status
                .error(format!("Failed to upload default ingress cert: {}", e));
        }

        if let Err(e) = self.wait_for_olm_operators(cancel).await {
            self.status
                .error(format!("Failed to wait for OLM operators: {}", e));
        }

        self.patch_node_labels().await;

        let success = !self.status.has_error();
        let error_info = if success {
            None
        } else {
            Some(self.status.error_message())
        };
        info!(success, "Posting installation completion");
        if let Err(e) = self.inventory.complete_installation(success, error_info).await {
            error!(error = %e, "Failed to post installation completion");
        }
    }

    /// Wait for the console operator, then the cluster-version operator when
    /// configured, each within its own budget.
    pub async fn waiting_for_cluster_operators(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Waiting for cluster operators");
        self.wait_for_operator(CONSOLE_OPERATOR_NAME, self.wait_timeout, cancel)
            .await?;
        if self.config.wait_for_cluster_version {
            self.wait_for_operator(CVO_OPERATOR_NAME, self.cvo_timeout, cancel)
                .await?;
        }
        Ok(())
    }

    /// Drive one built-in operator to available in the inventory, sending a
    /// progress update only when the reported message changes.
    async fn wait_for_operator(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        wait_for_predicate(timeout, self.wait_interval, cancel, || async {
            self.operator_tick(name).await
        })
        .await
        .map_err(|e| Error::timeout(format!("waiting for operator {}: {}", name, e)))
    }

    /// One polling step for a built-in operator: true once the inventory
    /// already records it available.
    async fn operator_tick(&self, name: &str) -> bool {
        let operator = match self.inventory.get_cluster_monitored_operator(name).await {
            Ok(operator) => operator,
            Err(e) => {
                warn!(operator = %name, error = %e, "Failed to get monitored operator");
                return false;
            }
        };
        if operator.status == Some(OperatorStatus::Available) {
            return true;
        }

        let record = if name == CVO_OPERATOR_NAME {
            self.cluster.get_cluster_version().await
        } else {
            self.cluster.get_cluster_operator(name).await
        };
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(operator = %name, error = %e, "Failed to get cluster operator state");
                return false;
            }
        };
        let (status, message) = operator_status_from_conditions(&record.conditions);
        if operator.status == Some(status) && operator.status_info == message {
            // nothing changed since the last report
            return false;
        }
        if let Err(e) = self
            .inventory
            .update_cluster_operator(name, status, &message)
            .await
        {
            warn!(operator = %name, error = %e, "Failed to update operator status");
        }
        false
    }

    async fn upload_ingress_cert(&self) -> Result<()> {
        let config_map = self
            .cluster
            .get_config_map(INGRESS_CONFIG_MAP_NAMESPACE, INGRESS_CONFIG_MAP_NAME)
            .await?;
        let ca = config_map
            .data
            .as_ref()
            .and_then(|data| data.get("ca-bundle.crt"))
            .ok_or_else(|| Error::validation("default-ingress-cert has no ca-bundle.crt"))?;
        self.inventory.upload_ingress_ca(ca).await?;
        info!("Uploaded default ingress CA bundle");
        Ok(())
    }

    /// Apply the user's post-install manifests, then wait for every OLM
    /// operator's CSV within the aggregated budget.
    pub async fn wait_for_olm_operators(&self, cancel: &CancellationToken) -> Result<()> {
        self.apply_post_install_manifests().await?;
        let operators = self.inventory.get_cluster_monitored_olm_operators().await?;
        if operators.is_empty() {
            return Ok(());
        }
        let timeout = self.maximum_olm_timeout(&operators);
        self.wait_for_csv(cancel, timeout).await
    }

    async fn apply_post_install_manifests(&self) -> Result<()> {
        let operators = self.inventory.get_cluster_monitored_olm_operators().await?;
        info!(count = operators.len(), "Applying post-install manifests");

        let staging = tempfile::tempdir()?;
        let manifests_file = staging.path().join(CUSTOM_MANIFESTS_FILE);
        self.inventory
            .download_file(CUSTOM_MANIFESTS_FILE, &manifests_file)
            .await?;
        let kubeconfig = staging.path().join(KUBECONFIG_FILE_NAME);
        self.inventory
            .download_cluster_credentials(KUBECONFIG_FILE_NAME, &kubeconfig)
            .await?;

        let raw = tokio::fs::read_to_string(&manifests_file).await?;
        let manifests: Vec<Value> = serde_json::from_str(&raw)?;
        if manifests.is_empty() {
            return Ok(());
        }

        let manifests_dir = staging.path().join("manifests");
        tokio::fs::create_dir_all(&manifests_dir).await?;
        for (index, manifest) in manifests.iter().enumerate() {
            let file_name = manifest
                .get("file_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("manifest-{}.yaml", index));
            let content = manifest
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation("custom manifest without content"))?;
            let decoded = BASE64
                .decode(content)
                .map_err(|e| Error::validation(format!("bad manifest content: {}", e)))?;
            tokio::fs::write(manifests_dir.join(file_name), decoded).await?;
        }

        let args: Vec<String> = [
            "--kubeconfig",
            &kubeconfig.to_string_lossy(),
            "apply",
            "-f",
            &manifests_dir.to_string_lossy(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.ops.exec_privilege_command("oc", &args).await?;
        info!(count = manifests.len(), "Applied post-install manifests");
        Ok(())
    }

    /// The OLM wait budget: the general timeout or the largest per-operator
    /// timeout, whichever is bigger.
    pub fn maximum_olm_timeout(&self, operators: &[MonitoredOperator]) -> Duration {
        operators
            .iter()
            .map(|op| Duration::from_secs(op.timeout_seconds))
            .chain(std::iter::once(self.wait_timeout))
            .max()
            .unwrap_or(self.wait_timeout)
    }

    /// Wait for every monitored OLM operator's CSV to reach a terminal
    /// state. An operator whose own budget runs out is reported failed and
    /// stops blocking completion.
    pub async fn wait_for_csv(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        let operators = self.inventory.get_cluster_monitored_olm_operators().await?;
        let mut pending: Vec<MonitoredOperator> = operators
            .into_iter()
            .filter(|op| op.status != Some(OperatorStatus::Available))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "Waiting for OLM operators");

        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        while !pending.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::timeout("cancelled while waiting for OLM operators"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::timeout("waiting for OLM operators"));
                }
                _ = tokio::time::sleep(self.wait_interval) => {
                    let mut still_pending = Vec::new();
                    for operator in pending {
                        if started.elapsed() >= Duration::from_secs(operator.timeout_seconds) {
                            warn!(operator = %operator.name, "Waiting for operator timed out");
                            if let Err(e) = self
                                .inventory
                                .update_cluster_operator(
                                    &operator.name,
                                    OperatorStatus::Failed,
                                    OPERATOR_TIMED_OUT_MESSAGE,
                                )
                                .await
                            {
                                warn!(operator = %operator.name, error = %e, "Failed to report operator timeout");
                            }
                            self.status.operator_error(&operator.name);
                            continue;
                        }
                        if !self.olm_operator_tick(&operator).await {
                            still_pending.push(operator);
                        }
                    }
                    pending = still_pending;
                }
            }
        }
        info!("All OLM operators reached a terminal state");
        Ok(())
    }

    /// One polling step for an OLM operator: true once the inventory records
    /// it available.
    async fn olm_operator_tick(&self, operator: &MonitoredOperator) -> bool {
        let current = match self
            .inventory
            .get_cluster_monitored_operator(&operator.name)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                warn!(operator = %operator.name, error = %e, "Failed to get monitored operator");
                return false;
            }
        };
        if current.status == Some(OperatorStatus::Available) {
            return true;
        }

        let csv_name = match self
            .cluster
            .get_csv_from_subscription(&operator.namespace, &operator.subscription_name)
            .await
        {
            Ok(name) => name,
            Err(e) => {
                debug!(operator = %operator.name, error = %e, "Subscription has no CSV yet");
                return false;
            }
        };
        let phase = match self.cluster.get_csv(&operator.namespace, &csv_name).await {
            Ok(phase) => phase,
            Err(e) => {
                debug!(operator = %operator.name, error = %e, "Failed to get CSV");
                return false;
            }
        };
        let status = operator_status_from_csv_phase(&phase);
        if current.status == Some(status) && current.status_info == phase {
            return false;
        }
        if let Err(e) = self
            .inventory
            .update_cluster_operator(&operator.name, status, &phase)
            .await
        {
            warn!(operator = %operator.name, error = %e, "Failed to update operator status");
        }
        false
    }

    /// Patch inventory-requested labels onto the matching nodes.
    pub async fn patch_node_labels(&self) {
        let hosts = match self.inventory.get_hosts(&[HostStatus::Disabled]).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Failed to get hosts for node labelling");
                return;
            }
        };
        if hosts.values().all(|host| host.node_labels.is_empty()) {
            return;
        }
        let nodes = match self.cluster.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Failed to list nodes for labelling");
                return;
            }
        };
        let by_ip = hosts_by_ip(&hosts);
        for node in &nodes {
            let Some(node_name) = node.metadata.name.clone() else { continue };
            let host = hosts.get(&node_name).or_else(|| {
                node_addresses(node)
                    .iter()
                    .find_map(|address| by_ip.get(address).and_then(|name| hosts.get(name)))
            });
            let Some(host) = host else { continue };
            if host.node_labels.is_empty() {
                continue;
            }
            let labels: HashMap<String, String> = match serde_json::from_str(&host.node_labels) {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(host_id = %host.id, error = %e, "Bad node labels, skipping");
                    continue;
                }
            };
            if let Err(e) = self.cluster.patch_node_labels(&node_name, &labels).await {
                warn!(node = %node_name, error = %e, "Failed to patch node labels");
            } else {
                info!(node = %node_name, "Patched node labels");
            }
        }
    }

    /// Bare-metal host reconciliation loop.
    pub async fn update_bmhs(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.bmh_interval) => {
                    if self.update_bmhs_once().await {
                        info!("All bare-metal hosts reconciled");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Returns true once every BMH is reconciled.
    pub async fn update_bmhs_once(&self) -> bool {
        let bmhs = match self.cluster.list_bmhs().await {
            Ok(bmhs) => bmhs,
            Err(e) => {
                debug!(error = %e, "Failed to list bare-metal hosts");
                return false;
            }
        };
        if bmhs.is_empty() {
            return true;
        }
        let machines = match self.cluster.list_machines(MACHINE_API_NAMESPACE).await {
            Ok(machines) => machines,
            Err(e) => {
                debug!(error = %e, "Failed to list machines");
                return false;
            }
        };
        let provisioning_exists = match self.cluster.is_metal_provisioning_exists().await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(error = %e, "Failed to check metal3 provisioning");
                return false;
            }
        };

        let mut all_reconciled = true;
        for bmh in bmhs {
            if !self.reconcile_bmh(bmh, provisioning_exists, &machines).await {
                all_reconciled = false;
            }
        }
        all_reconciled
    }

    async fn reconcile_bmh(
        &self,
        mut bmh: DynamicObject,
        provisioning_exists: bool,
        machines: &[DynamicObject],
    ) -> bool {
        let name = bmh.metadata.name.clone().unwrap_or_default();

        // the status annotation lets the baremetal operator adopt the
        // hardware state without re-inspecting the host
        if let Some(status) = bmh.data.get("status").cloned() {
            match serde_json::to_string(&status) {
                Ok(serialized) => {
                    bmh.metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(BMH_STATUS_ANNOTATION.to_string(), serialized);
                }
                Err(e) => {
                    warn!(bmh = %name, error = %e, "Failed to serialize BMH status");
                    return false;
                }
            }
        }
        if let Err(e) = self.cluster.update_bmh_status(&bmh).await {
            warn!(bmh = %name, error = %e, "Failed to update BMH status");
            return false;
        }

        if provisioning_exists {
            // metal3 owns the host lifecycle; pause reconciliation and mark
            // it externally provisioned
            bmh.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(BMH_PAUSED_ANNOTATION.to_string(), String::new());
            bmh.data["spec"]["externallyProvisioned"] = Value::Bool(true);
        } else {
            if let Some(annotations) = bmh.metadata.annotations.as_mut() {
                annotations.remove(BMH_PAUSED_ANNOTATION);
            }
            let has_consumer = bmh
                .data
                .pointer("/spec/consumerRef/name")
                .and_then(Value::as_str)
                .is_some();
            if !has_consumer {
                let Some(machine) = find_unbound_worker_machine(machines) else {
                    warn!(bmh = %name, "No worker machine available for BMH");
                    return false;
                };
                bmh.data["spec"]["consumerRef"] = json!({
                    "apiVersion": "machine.openshift.io/v1beta1",
                    "kind": "Machine",
                    "name": machine.metadata.name.clone().unwrap_or_default(),
                    "namespace": MACHINE_API_NAMESPACE,
                });
            }
        }

        if let Err(e) = self.cluster.update_bmh(&bmh).await {
            warn!(bmh = %name, error = %e, "Failed to update BMH");
            return false;
        }
        info!(bmh = %name, "Reconciled bare-metal host");
        true
    }
}

fn find_unbound_worker_machine(machines: &[DynamicObject]) -> Option<&DynamicObject> {
    machines.iter().find(|machine| {
        machine
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MACHINE_ROLE_LABEL))
            .map(|role| role == "worker")
            .unwrap_or(false)
    })
}

/// The expected DNS service address: the tenth address of the service
/// network, IPv6-aware.
pub fn dns_service_ip(service_network_cidr: &str) -> Result<String> {
    let network: IpNet = service_network_cidr
        .parse()
        .map_err(|e| Error::validation(format!("bad service network {}: {}", service_network_cidr, e)))?;
    match network.network() {
        IpAddr::V4(base) => {
            let ip = std::net::Ipv4Addr::from(u32::from(base) + 10);
            Ok(ip.to_string())
        }
        IpAddr::V6(base) => {
            let ip = std::net::Ipv6Addr::from(u128::from(base) + 10);
            Ok(ip.to_string())
        }
    }
}

#[cfg(test)]
mod tests;
