//! Per-host install state machine
//!
//! Drives one host from the live provisioning environment to its reboot into
//! the installed system: disk preparation, ignition resolution, image write,
//! and the inter-host synchronization around the bootstrap transition. All
//! cross-host coordination goes through the inventory service; the only
//! in-process concurrency is the bootstrap sub-flow running alongside the
//! configuring-status watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{is_node_ready, node_addresses, ClusterApi, ClusterApiBuilder};
use crate::config::InstallerConfig;
use crate::ignition::IgnitionHandler;
use crate::inventory::InventoryClient;
use crate::models::{
    host_ips, hosts_by_ip, is_version_less_than_47, ClusterKind, HighAvailabilityMode, HostRole,
    HostStage, HostsByName, LogsState, LogsType,
};
use crate::ops::HostOps;
use crate::retry::retry_fixed;
use crate::{Error, Result, BOOTKUBE_DONE_PATH, DOCKER_CONFIG_PATH, INSTALL_DIR, KUBECONFIG_PATH,
    SINGLE_NODE_MASTER_IGNITION_PATH};

/// Namespace the post-install controller job runs in
pub const CONTROLLER_NAMESPACE: &str = "assisted-installer";

/// Event the controller creates once it is up; the bootstrap installer waits
/// for it before rebooting.
pub const CONTROLLER_READY_EVENT: &str = "assisted-controller-is-ready";

/// Job-name label the controller pod carries
pub const CONTROLLER_JOB_NAME: &str = "assisted-installer-controller";

/// Window of controller logs fetched on each pre-emptive upload
pub const CONTROLLER_LOGS_SECONDS_AGO: i64 = 120;

const MIN_MASTER_NODES: usize = 2;
const NUM_MASTER_NODES: i64 = 3;
const EXTRACT_RETRY_COUNT: u32 = 3;
const OVN_KUBERNETES: &str = "OVNKubernetes";

const SSH_DIR: &str = "/root/.ssh";
const SSH_KEY_PATH: &str = "/root/.ssh/id_rsa";
const SSH_PUB_KEY_PATH: &str = "/root/.ssh/id_rsa.pub";
const SSH_MANIFEST_PATH: &str = "/opt/openshift/openshift/99-assisted-installer-master-ssh.yaml";

const WAITING_FOR_MASTERS_STATUS_INFO: &str =
    "Waiting for masters to join bootstrap control plane";
const WAITING_FOR_BOOTSTRAP_TO_PREPARE: &str = "Waiting for bootstrap node preparation";

/// Stages a host has passed once it no longer needs configuring reports
const CONFIGURING_PASSED_STAGES: [HostStage; 4] = [
    HostStage::Configuring,
    HostStage::Joined,
    HostStage::Done,
    HostStage::WaitingForIgnition,
];

/// The per-host installer
#[derive(Clone)]
pub struct Installer {
    config: InstallerConfig,
    inventory: Arc<dyn InventoryClient>,
    ops: Arc<dyn HostOps>,
    cluster_builder: Arc<dyn ClusterApiBuilder>,
    ignition: Arc<dyn IgnitionHandler>,
    wait_interval: Duration,
    watcher_interval: Duration,
    logs_upload_period: Duration,
}

impl Installer {
    /// Build an installer from its collaborators
    pub fn new(
        config: InstallerConfig,
        inventory: Arc<dyn InventoryClient>,
        ops: Arc<dyn HostOps>,
        cluster_builder: Arc<dyn ClusterApiBuilder>,
        ignition: Arc<dyn IgnitionHandler>,
    ) -> Self {
        Self {
            config,
            inventory,
            ops,
            cluster_builder,
            ignition,
            wait_interval: Duration::from_secs(5),
            watcher_interval: Duration::from_secs(30),
            logs_upload_period: Duration::from_secs(5 * 60),
        }
    }

    /// Override the poll intervals, for tests
    pub fn with_intervals(mut self, wait: Duration, watcher: Duration) -> Self {
        self.wait_interval = wait;
        self.watcher_interval = watcher;
        self
    }

    /// Run the whole install: best-effort disk formatting, then the install
    /// state machine. On failure the host reports stage failed and the error
    /// is returned for a non-zero exit.
    pub async fn run(&self) -> Result<()> {
        self.format_disks().await;
        if let Err(e) = self.install_node().await {
            self.update_progress(HostStage::Failed, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort format of the disks requested for formatting. Per-disk
    /// failures are logged and do not fail the install.
    async fn format_disks(&self) {
        for disk in &self.config.disks_to_format {
            if let Err(e) = self.ops.format_disk(disk).await {
                warn!(disk = %disk, error = %e, "Failed to format disk");
            }
        }
    }

    async fn install_node(&self) -> Result<()> {
        info!(role = %self.config.role, "Installing node");
        self.update_progress(HostStage::StartingInstallation, &self.config.role.to_string())
            .await;

        let device = self.ops.evaluate_disk_symlink(&self.config.device).await;
        self.cleanup_install_device(&device).await.map_err(|e| {
            error!(device = %device, error = %e, "Failed to prepare install device");
            e
        })?;
        self.ops.mkdir(INSTALL_DIR).await?;

        let cancel = CancellationToken::new();
        let _watcher_guard = cancel.clone().drop_guard();

        let mut role = self.config.role;
        let is_bootstrap = role == HostRole::Bootstrap
            && self.config.high_availability_mode != HighAvailabilityMode::None;
        let mut bootstrap_flow = None;
        if is_bootstrap {
            let this = self.clone();
            bootstrap_flow = Some(tokio::spawn(async move { this.start_bootstrap().await }));
            let watcher = self.clone();
            let watcher_cancel = cancel.clone();
            tokio::spawn(async move { watcher.update_configuring_status(watcher_cancel).await });
            role = HostRole::Master;
        }

        self.update_progress(HostStage::Installing, &role.to_string()).await;

        // high-availability mode is None only on single-node installs; workers
        // joining any cluster carry the full mode
        let ignition_path = if self.config.high_availability_mode == HighAvailabilityMode::None {
            info!("Installing single node openshift");
            self.create_single_node_master_ignition().await?
        } else {
            self.download_host_ignition(role).await?
        };

        self.write_image_to_disk(&ignition_path, &device).await?;

        if let Err(e) = self.ops.set_boot_order(&device).await {
            warn!(error = %e, "Failed to set boot order");
        }

        if let Some(flow) = bootstrap_flow {
            self.update_progress(HostStage::WaitingForControlPlane, WAITING_FOR_BOOTSTRAP_TO_PREPARE)
                .await;
            flow.await
                .map_err(|e| Error::ops(format!("bootstrap flow panicked: {}", e)))??;
            self.wait_for_control_plane(&cancel).await?;
            info!("Setting bootstrap node new role to master");
        } else if role == HostRole::Worker {
            self.worker_wait_for_2_ready_masters(&cancel).await?;
        }

        info!(
            host_id = %self.config.host_id,
            cluster_id = %self.config.cluster_id,
            "Uploading logs and reporting status before rebooting"
        );
        self.upload_host_logs(is_bootstrap
            || self.config.high_availability_mode == HighAvailabilityMode::None)
            .await;

        self.finalize().await
    }

    /// Report a stage transition to the inventory. Reporting failures are
    /// logged; they never fail the install on their own.
    async fn update_progress(&self, stage: HostStage, info: &str) {
        info!(stage = %stage, info = %info, "Updating node installation stage");
        if self.config.host_id.is_empty() {
            return;
        }
        if let Err(e) = self
            .inventory
            .update_host_install_progress(
                &self.config.infra_env_id,
                &self.config.host_id,
                stage,
                info,
            )
            .await
        {
            error!(stage = %stage, error = %e, "Failed to update node installation stage");
        }
    }

    async fn cleanup_install_device(&self, device: &str) -> Result<()> {
        if self.config.dry_run || self.config.skip_installation_disk_cleanup {
            return Ok(());
        }
        info!(device = %device, "Start cleaning up device");
        self.cleanup_device(device).await?;

        if self.ops.is_raid_member(device).await {
            info!(device = %device, "A raid was detected on the device - cleaning");
            for raid_device in self.ops.get_raid_devices(device).await? {
                // the raid device itself may hold volume groups
                self.cleanup_device(&raid_device).await?;
            }
            self.ops.clean_raid_membership(device).await?;
        }
        self.ops.wipefs(device).await
    }

    async fn cleanup_device(&self, device: &str) -> Result<()> {
        if let Some(vg) = self.ops.get_vg_by_pv(device).await? {
            info!(device = %device, vg = %vg, "A volume group was detected on the installation device - cleaning");
            self.ops.remove_vg(&vg).await?;
            self.ops.remove_pv(device).await?;
        }
        Ok(())
    }

    async fn write_image_to_disk(&self, ignition_path: &Path, device: &str) -> Result<()> {
        self.update_progress(HostStage::WritingImageToDisk, "").await;
        retry_fixed(3, Duration::from_secs(1), "write image to disk", || {
            self.ops
                .write_image_to_disk(ignition_path, device, &self.config.installer_args)
        })
        .await?;
        info!("Done writing image to disk");
        Ok(())
    }

    /// Bootstrap sub-flow: stage the transient control plane on this host.
    async fn start_bootstrap(&self) -> Result<()> {
        info!("Running bootstrap");
        // log collection mounts this directory and the SSH keypair lands here
        self.ops.mkdir(SSH_DIR).await?;

        let ignition_path = self.get_file_from_service("bootstrap.ign").await?;

        // the pull secret has to reach the docker config before podman can
        // pull the MCO image
        self.ops
            .extract_from_ignition(&ignition_path, DOCKER_CONFIG_PATH)
            .await?;

        self.extract_ignition_to_fs(&ignition_path).await?;

        if self.config.high_availability_mode != HighAvailabilityMode::None {
            self.generate_ssh_key_pair().await?;
            self.ops
                .create_openshift_ssh_manifest(
                    Path::new(SSH_MANIFEST_PATH),
                    Path::new(SSH_PUB_KEY_PATH),
                )
                .await?;
        }

        self.ops.systemctl_action("daemon-reload", None).await?;

        // a "localhost" hostname would let the NetworkManager hostname service
        // reset /etc/resolv.conf and undo the local DNS prepender, which in
        // turn breaks bootkube
        self.check_localhost_name().await?;

        self.ops
            .systemctl_action("restart", Some("NetworkManager.service"))
            .await?;

        self.ops.prepare_controller().await?;

        for service in ["bootkube.service", "approve-csr.service", "progress.service"] {
            self.ops.systemctl_action("start", Some(service)).await?;
        }
        info!("Done setting up bootstrap");
        Ok(())
    }

    async fn extract_ignition_to_fs(&self, ignition_path: &Path) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let mco_image = &self.config.mco_image;
        info!(image = %mco_image, "Extracting ignition to disk");
        let args: Vec<String> = [
            "run",
            "--net",
            "host",
            "--pid=host",
            "--volume",
            "/:/rootfs:rw",
            "--volume",
            "/usr/bin/rpm-ostree:/usr/bin/rpm-ostree",
            "--privileged",
            "--entrypoint",
            "/usr/bin/machine-config-daemon",
            mco_image,
            "start",
            "--node-name",
            "localhost",
            "--root-mount",
            "/rootfs",
            "--once-from",
            &ignition_path.to_string_lossy(),
            "--skip-reboot",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mut last_err = None;
        for _ in 0..EXTRACT_RETRY_COUNT {
            match self.ops.exec_privilege_command("podman", &args).await {
                Ok(_) => {
                    info!("Done extracting ignition to filesystem");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to extract ignition to disk");
                    last_err = Some(e);
                }
            }
        }
        error!("Failed to extract ignition to disk, giving up");
        Err(last_err.unwrap_or_else(|| Error::ops("ignition extraction failed")))
    }

    async fn generate_ssh_key_pair(&self) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        info!("Generating new SSH key pair");
        let args: Vec<String> = ["-q", "-f", SSH_KEY_PATH, "-N", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.ops
            .exec_privilege_command("ssh-keygen", &args)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to generate SSH key pair");
                e
            })?;
        Ok(())
    }

    async fn get_file_from_service(&self, filename: &str) -> Result<PathBuf> {
        info!(filename = %filename, "Getting file from service");
        let dest = Path::new(INSTALL_DIR).join(filename);
        self.inventory
            .download_file(filename, &dest)
            .await
            .map_err(|e| {
                error!(filename = %filename, error = %e, "Failed to fetch file from service");
                e
            })?;
        Ok(dest)
    }

    async fn download_host_ignition(&self, role: HostRole) -> Result<PathBuf> {
        let filename = format!("{}-{}.ign", role, self.config.host_id);
        info!(filename = %filename, "Getting host ignition");
        let dest = Path::new(INSTALL_DIR).join(&filename);
        self.inventory
            .download_host_ignition(&self.config.infra_env_id, &self.config.host_id, &dest)
            .await
            .map_err(|e| {
                error!(filename = %filename, error = %e, "Failed to fetch host ignition");
                e
            })?;
        Ok(dest)
    }

    async fn wait_for_control_plane(&self, cancel: &CancellationToken) -> Result<()> {
        // NetworkManager rewrote resolv.conf during bootstrap setup
        self.ops
            .reload_host_file(Path::new("/etc/resolv.conf"))
            .await?;
        let cluster = self
            .cluster_builder
            .build(Path::new(KUBECONFIG_PATH))
            .await?;
        self.update_progress(HostStage::WaitingForControlPlane, WAITING_FOR_MASTERS_STATUS_INFO)
            .await;

        self.wait_for_min_master_nodes(cancel, cluster.clone()).await?;

        if is_version_less_than_47(&self.config.openshift_version)? {
            cluster.patch_etcd().await?;
        } else {
            info!(
                version = %self.config.openshift_version,
                "Skipping etcd patch for cluster version"
            );
        }

        self.wait_for_bootkube(cancel).await;

        self.wait_for_controller(cluster).await
    }

    /// Whether the control-plane replicas patch applies: OCP < 4.7, network
    /// type OVNKubernetes and a 3-replica control plane. OVN waits for the
    /// configured replica count before starting, and the bootstrap node holds
    /// one of those seats until it pivots to a master.
    async fn should_patch_control_plane_replicas(
        &self,
        cluster: &Arc<dyn ClusterApi>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if !is_version_less_than_47(&self.config.openshift_version)? {
            info!("Control plane replicas patch not required: Openshift version is not less than 4.7");
            return Ok(false);
        }

        self.wait_for_network_type(cluster, cancel).await?;
        let network_type = cluster.get_network_type().await?;
        if network_type != OVN_KUBERNETES {
            info!(network_type = %network_type, "Control plane replicas patch not required: network type");
            return Ok(false);
        }

        let replicas = cluster.get_control_plane_replicas().await?;
        if replicas != NUM_MASTER_NODES {
            info!(replicas, "Control plane replicas patch not required: replica count");
            return Ok(false);
        }
        info!("Applying control plane replicas patch");
        Ok(true)
    }

    async fn wait_for_network_type(
        &self,
        cluster: &Arc<dyn ClusterApi>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        crate::retry::wait_for_predicate(
            crate::retry::WAIT_FOREVER,
            self.wait_interval,
            cancel,
            || async {
                match cluster.get_network_type().await {
                    Ok(_) => true,
                    Err(e) => {
                        error!(error = %e, "Failed to get network type");
                        false
                    }
                }
            },
        )
        .await
    }

    async fn wait_for_min_master_nodes(
        &self,
        cancel: &CancellationToken,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<()> {
        let patch = self
            .should_patch_control_plane_replicas(&cluster, cancel)
            .await?;
        if patch {
            cluster.patch_control_plane_replicas().await.map_err(|e| {
                error!(error = %e, "Failed to patch control plane replicas");
                e
            })?;
        }
        self.wait_for_master_nodes(cancel, MIN_MASTER_NODES, &cluster)
            .await;
        if patch {
            cluster.unpatch_control_plane_replicas().await.map_err(|e| {
                error!(error = %e, "Failed to restore control plane replicas");
                e
            })?;
        }
        Ok(())
    }

    /// Wait until `min_masters` control-plane nodes are Ready and correlated
    /// to inventory hosts. Each newly-ready master is reported as joined.
    async fn wait_for_master_nodes(
        &self,
        cancel: &CancellationToken,
        min_masters: usize,
        cluster: &Arc<dyn ClusterApi>,
    ) {
        let mut ready_masters: Vec<String> = Vec::new();
        let mut hosts: Option<HostsByName> = None;
        info!(min_masters, "Waiting for master nodes");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled, terminating wait for master nodes");
                    return;
                }
                _ = tokio::time::sleep(self.wait_interval) => {
                    if hosts.is_none() {
                        hosts = self.inventory_hosts_without_self().await;
                    }
                    let Some(hosts_map) = hosts.as_ref() else { continue };
                    let nodes = match cluster.list_master_nodes().await {
                        Ok(nodes) => nodes,
                        Err(e) => {
                            warn!(error = %e, "Still waiting for master nodes");
                            continue;
                        }
                    };
                    if let Err(e) = self
                        .update_ready_masters(&nodes, &mut ready_masters, hosts_map)
                        .await
                    {
                        warn!(error = %e, "Failed to update ready masters");
                        continue;
                    }
                    info!(count = ready_masters.len(), "Found ready master nodes");
                    if ready_masters.len() >= min_masters {
                        info!("Waiting for master nodes - Done");
                        return;
                    }
                }
            }
        }
    }

    /// Enabled inventory hosts keyed by name, with this host removed.
    async fn inventory_hosts_without_self(&self) -> Option<HostsByName> {
        match self.inventory.get_enabled_hosts_names_hosts().await {
            Ok(mut hosts) => {
                hosts.retain(|_, host| host.id != self.config.host_id);
                Some(hosts)
            }
            Err(e) => {
                warn!(error = %e, "Failed to get hosts info from inventory");
                None
            }
        }
    }

    async fn update_ready_masters(
        &self,
        nodes: &[k8s_openapi::api::core::v1::Node],
        ready_masters: &mut Vec<String>,
        hosts: &HostsByName,
    ) -> Result<()> {
        let by_ip = hosts_by_ip(hosts);
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else { continue };
            if !is_node_ready(node) || ready_masters.contains(&name) {
                continue;
            }
            info!(node = %name, "Found a new ready master node");
            ready_masters.push(name.clone());

            let matched = hosts.get(&name).or_else(|| {
                node_addresses(node)
                    .iter()
                    .find_map(|address| by_ip.get(address).and_then(|n| hosts.get(n)))
            });
            let Some(host) = matched else {
                return Err(Error::validation(format!(
                    "node {} is not in inventory hosts",
                    name
                )));
            };
            if let Err(e) = self
                .inventory
                .update_host_install_progress(
                    &host.infra_env_id,
                    &host.id,
                    HostStage::Joined,
                    "",
                )
                .await
            {
                error!(node = %name, error = %e, "Failed to update node installation status");
            }
        }
        Ok(())
    }

    /// Poll for the bootkube completion sentinel. Bounded only by
    /// cancellation; bootkube owns its own timeout story.
    async fn wait_for_bootkube(&self, cancel: &CancellationToken) {
        info!("Waiting for bootkube to complete");
        self.update_progress(HostStage::WaitingForBootkube, "").await;
        let stat_args = vec![BOOTKUBE_DONE_PATH.to_string()];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled, terminating wait for bootkube");
                    return;
                }
                _ = tokio::time::sleep(self.wait_interval) => {
                    if self.ops.exec_privilege_command("stat", &stat_args).await.is_ok() {
                        info!("bootkube service completed");
                        if let Ok(status) = self
                            .ops
                            .systemctl_action("status", Some("bootkube.service"))
                            .await
                        {
                            info!(status = %status, "bootkube status");
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Wait for the controller job to announce itself via its ready event.
    /// Controller pod logs are uploaded pre-emptively every few minutes so a
    /// controller that never becomes ready still leaves a trace.
    async fn wait_for_controller(&self, cluster: Arc<dyn ClusterApi>) -> Result<()> {
        info!("Waiting for controller to be ready");
        self.update_progress(
            HostStage::WaitingForController,
            "waiting for controller pod ready event",
        )
        .await;

        let mut seen_events = std::collections::HashSet::new();
        let mut check = tokio::time::interval(self.wait_interval);
        let mut upload = tokio::time::interval(self.logs_upload_period);
        upload.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = check.tick() => {
                    if self.controller_ready_event_set(&cluster, &mut seen_events).await {
                        info!("Assisted controller is ready");
                        if let Err(e) = self
                            .inventory
                            .cluster_log_progress_report(LogsState::Requested)
                            .await
                        {
                            warn!(error = %e, "Failed to report cluster log progress");
                        }
                        self.upload_controller_logs(&cluster).await;
                        return Ok(());
                    }
                }
                _ = upload.tick() => {
                    self.upload_controller_logs(&cluster).await;
                }
            }
        }
    }

    async fn controller_ready_event_set(
        &self,
        cluster: &Arc<dyn ClusterApi>,
        seen_events: &mut std::collections::HashSet<String>,
    ) -> bool {
        let events = match cluster.list_events(CONTROLLER_NAMESPACE).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Failed to get controller events");
                return false;
            }
        };
        let mut ready = false;
        for event in events {
            let uid = event.metadata.uid.clone().unwrap_or_default();
            if seen_events.insert(uid) {
                info!(
                    message = %event.message.as_deref().unwrap_or_default(),
                    "Assisted controller new event"
                );
            }
            if event.metadata.name.as_deref() == Some(CONTROLLER_READY_EVENT) {
                ready = true;
            }
        }
        ready
    }

    /// Pre-fetch controller pod logs and push them to the inventory. Log
    /// progress is deliberately not reported here: the controller may never
    /// become ready, and it reports its own progress once it does.
    async fn upload_controller_logs(&self, cluster: &Arc<dyn ClusterApi>) {
        let pods = match cluster
            .list_pods(
                CONTROLLER_NAMESPACE,
                Some(format!("job-name={}", CONTROLLER_JOB_NAME)),
                Some("status.phase=Running".to_string()),
            )
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list controller pods");
                return;
            }
        };
        let Some(pod_name) = pods.first().and_then(|p| p.metadata.name.clone()) else {
            return;
        };
        let logs = match cluster
            .get_pod_logs(CONTROLLER_NAMESPACE, &pod_name, CONTROLLER_LOGS_SECONDS_AGO)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Failed to get controller pod logs");
                return;
            }
        };
        let path = std::env::temp_dir().join("controller-logs.log");
        if let Err(e) = tokio::fs::write(&path, logs).await {
            warn!(error = %e, "Failed to stage controller logs");
            return;
        }
        if let Err(e) = self.inventory.upload_logs(LogsType::Controller, &path).await {
            warn!(error = %e, "Failed to upload controller logs");
        }
    }

    /// Workers hold their reboot until two masters finished, so the cluster
    /// can admit them the moment they come back. Add-hosts clusters have a
    /// running control plane already and skip the wait.
    async fn worker_wait_for_2_ready_masters(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Waiting for 2 ready masters");
        self.update_progress(HostStage::WaitingForControlPlane, "").await;
        let mut cluster_kind: Option<ClusterKind> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled, terminating wait for ready masters");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.wait_interval) => {
                    if cluster_kind.is_none() {
                        match self.inventory.get_cluster().await {
                            Ok(cluster) => cluster_kind = Some(cluster.kind),
                            Err(e) => {
                                error!(error = %e, "Failed getting cluster");
                                continue;
                            }
                        }
                    }
                    if cluster_kind == Some(ClusterKind::AddHostsCluster) {
                        return Ok(());
                    }
                    match self.inventory.list_hosts_for_role(HostRole::Master).await {
                        Ok(hosts) => {
                            let done = hosts
                                .iter()
                                .filter(|h| h.progress.current_stage == Some(HostStage::Done))
                                .count();
                            if done >= MIN_MASTER_NODES {
                                return Ok(());
                            }
                        }
                        Err(e) => error!(error = %e, "Failed getting cluster hosts"),
                    }
                }
            }
        }
    }

    /// Configuring-status watcher: mine the machine-config-server logs for
    /// host IPs that already pulled ignition and report those hosts as
    /// configuring. Runs alongside the bootstrap sub-flow.
    async fn update_configuring_status(&self, cancel: CancellationToken) {
        info!("Start waiting for configuring state");
        let mut hosts: Option<HostsByName> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Exiting configuring status watcher");
                    return;
                }
                _ = tokio::time::sleep(self.watcher_interval) => {
                    info!("Searching for hosts that pulled ignition already");
                    if hosts.is_none() {
                        hosts = self.inventory_hosts_without_self().await;
                    }
                    let Some(hosts_map) = hosts.as_mut() else { continue };
                    self.report_configuring_hosts(hosts_map).await;
                    hosts_map.retain(|_, host| {
                        !host
                            .progress
                            .current_stage
                            .map(|stage| CONFIGURING_PASSED_STAGES.contains(&stage))
                            .unwrap_or(false)
                    });
                    if hosts_map.is_empty() {
                        info!("Exiting configuring status watcher");
                        return;
                    }
                }
            }
        }
    }

    async fn report_configuring_hosts(&self, hosts: &mut HostsByName) {
        let logs = match self.ops.get_mcs_logs().await {
            Ok(logs) => logs,
            Err(_) => {
                info!("Failed to get MCS logs, will retry");
                return;
            }
        };
        for host in hosts.values_mut() {
            let already_passed = host
                .progress
                .current_stage
                .map(|stage| CONFIGURING_PASSED_STAGES.contains(&stage))
                .unwrap_or(false);
            if already_passed {
                continue;
            }
            let ips = host_ips(host).unwrap_or_default();
            if !ips.iter().any(|ip| logs.contains(ip.as_str())) {
                continue;
            }
            info!(host_id = %host.id, "Host pulled ignition, reporting configuring");
            if let Err(e) = self
                .inventory
                .update_host_install_progress(
                    &host.infra_env_id,
                    &host.id,
                    HostStage::Configuring,
                    "",
                )
                .await
            {
                error!(host_id = %host.id, error = %e, "Failed to report configuring stage");
                continue;
            }
            host.progress.current_stage = Some(HostStage::Configuring);
        }
    }

    /// Single-node install: run the bootstrap flow to completion locally,
    /// wait for bootkube to produce the master ignition, then merge the
    /// host-specific overrides into it.
    async fn create_single_node_master_ignition(&self) -> Result<PathBuf> {
        self.start_bootstrap().await.map_err(|e| {
            error!(error = %e, "Bootstrap failed");
            e
        })?;
        self.wait_for_bootkube(&CancellationToken::new()).await;
        let stat_args = vec![SINGLE_NODE_MASTER_IGNITION_PATH.to_string()];
        self.ops
            .exec_privilege_command("stat", &stat_args)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to find single node master ignition");
                e
            })?;
        self.update_single_node_ignition(Path::new(SINGLE_NODE_MASTER_IGNITION_PATH))
            .await?;
        Ok(PathBuf::from(SINGLE_NODE_MASTER_IGNITION_PATH))
    }

    async fn update_single_node_ignition(&self, single_node_ignition_path: &Path) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let host_ignition_path = self.download_host_ignition(HostRole::Master).await?;
        let single_node_config = self
            .ignition
            .parse_ignition_file(single_node_ignition_path)
            .await?;
        let mut host_config = self.ignition.parse_ignition_file(&host_ignition_path).await?;
        // only the storage/systemd overrides should apply; the nested config
        // references would pull the full master config in a second time
        host_config["ignition"]["config"] = crate::ignition::empty_ignition_config();
        let merged = self
            .ignition
            .merge_ignition_config(&single_node_config, &host_config)
            .map_err(|e| {
                Error::ignition(format!("failed to apply host ignition config overrides: {}", e))
            })?;
        self.ignition
            .write_ignition_file(single_node_ignition_path, merged)
            .await
    }

    async fn check_localhost_name(&self) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let hostname = self.ops.get_hostname().await?;
        if hostname != "localhost" {
            info!(hostname = %hostname, "Hostname is not localhost, no need to do anything");
            return Ok(());
        }
        let hostname = format!("random-hostname-{}", Uuid::new_v4());
        info!(hostname = %hostname, "Hostname is localhost, setting a random one");
        self.ops.create_random_hostname(&hostname).await
    }

    /// Best-effort log upload before the reboot.
    async fn upload_host_logs(&self, include_bootstrap_journal: bool) {
        if let Err(e) = self
            .inventory
            .host_log_progress_report(
                &self.config.infra_env_id,
                &self.config.host_id,
                LogsState::Requested,
            )
            .await
        {
            warn!(error = %e, "Failed to report host log progress");
        }
        match self
            .ops
            .gather_installation_logs(include_bootstrap_journal)
            .await
        {
            Ok(archive) => {
                if let Err(e) = self.inventory.upload_logs(LogsType::Host, &archive).await {
                    error!(error = %e, "Failed to upload installation logs");
                }
            }
            Err(e) => error!(error = %e, "Failed to gather installation logs"),
        }
    }

    /// Dispatch the reboot, or hand control back to ironic when its agent
    /// owns the host.
    async fn finalize(&self) -> Result<()> {
        self.update_progress(HostStage::Rebooting, "").await;
        if self.config.dry_run {
            let marker = self
                .config
                .fake_reboot_marker_path
                .clone()
                .ok_or_else(|| Error::validation("dry run without a fake reboot marker path"))?;
            let args = vec![marker.to_string_lossy().into_owned()];
            self.ops
                .exec_privilege_command("touch", &args)
                .await
                .map_err(|e| Error::ops(format!("failed to touch fake reboot marker: {}", e)))?;
            return Ok(());
        }

        // when the ironic agent runs on this host, ironic owns the reboot;
        // stopping the agent service signals it that we are done
        let ironic_unit = "ironic-agent.service";
        let args: Vec<String> = ["list-units", "--no-legend", ironic_unit]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let units = self
            .ops
            .exec_privilege_command("systemctl", &args)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to check if ironic agent service exists");
                e
            })?;
        if units.contains(ironic_unit) {
            self.ops.systemctl_action("stop", Some("agent.service")).await?;
        } else {
            self.ops.reboot().await?;
        }
        Ok(())
    }
}
