//! Inventory-side data model
//!
//! Wire types exchanged with the assisted inventory service, plus the small
//! pure helpers that interpret them (stage ordering, version gates, condition
//! and CSV phase mapping, host IP extraction). The inventory service is the
//! system of record; these types mirror its JSON representation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role a host installs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    /// Temporary bootstrap node, later promoted to master
    Bootstrap,
    /// Control-plane node
    Master,
    /// Worker node
    Worker,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Bootstrap => write!(f, "bootstrap"),
            HostRole::Master => write!(f, "master"),
            HostRole::Worker => write!(f, "worker"),
        }
    }
}

/// Cluster high-availability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[value(rename_all = "PascalCase")]
pub enum HighAvailabilityMode {
    /// Multi-node cluster with a dedicated bootstrap phase
    #[serde(rename = "Full")]
    Full,
    /// Single-node cluster, bootstrap-in-place
    #[serde(rename = "None")]
    None,
}

impl fmt::Display for HighAvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HighAvailabilityMode::Full => write!(f, "Full"),
            HighAvailabilityMode::None => write!(f, "None"),
        }
    }
}

/// Host lifecycle stage reported to the inventory.
///
/// Stages are monotonic per host in normal flow; the canonical order is the
/// declaration order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStage {
    /// Install process started on the host
    #[serde(rename = "Starting installation")]
    StartingInstallation,
    /// Ignition resolved, branch selected
    #[serde(rename = "Installing")]
    Installing,
    /// Target image and ignition being written to the device
    #[serde(rename = "Writing image to disk")]
    WritingImageToDisk,
    /// Waiting for masters to join the bootstrap control plane
    #[serde(rename = "Waiting for control plane")]
    WaitingForControlPlane,
    /// Waiting for the bootkube completion sentinel
    #[serde(rename = "Waiting for bootkube")]
    WaitingForBootkube,
    /// Waiting for the post-install controller ready event
    #[serde(rename = "Waiting for controller")]
    WaitingForController,
    /// Host rebooted and is fetching its final ignition
    #[serde(rename = "Waiting for ignition")]
    WaitingForIgnition,
    /// Host pulled ignition from the machine-config server
    #[serde(rename = "Configuring")]
    Configuring,
    /// Host joined the cluster as a node
    #[serde(rename = "Joined")]
    Joined,
    /// Host is about to reboot into the installed system
    #[serde(rename = "Rebooting")]
    Rebooting,
    /// Installation finished on this host
    #[serde(rename = "Done")]
    Done,
    /// Installation failed on this host
    #[serde(rename = "Failed")]
    Failed,
}

impl HostStage {
    /// Position in the canonical lifecycle order.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Stages after which no further progress reports are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostStage::Done | HostStage::Failed)
    }
}

impl fmt::Display for HostStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStage::StartingInstallation => "Starting installation",
            HostStage::Installing => "Installing",
            HostStage::WritingImageToDisk => "Writing image to disk",
            HostStage::WaitingForControlPlane => "Waiting for control plane",
            HostStage::WaitingForBootkube => "Waiting for bootkube",
            HostStage::WaitingForController => "Waiting for controller",
            HostStage::WaitingForIgnition => "Waiting for ignition",
            HostStage::Configuring => "Configuring",
            HostStage::Joined => "Joined",
            HostStage::Rebooting => "Rebooting",
            HostStage::Done => "Done",
            HostStage::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Host status as tracked by the inventory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStatus {
    /// Queued for installation
    Known,
    /// Install command dispatched
    Installing,
    /// Installer reported at least one stage
    InstallingInProgress,
    /// Host reached stage Done
    Installed,
    /// Host failed installation
    Error,
    /// Host excluded from installation
    Disabled,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Known => "known",
            HostStatus::Installing => "installing",
            HostStatus::InstallingInProgress => "installing-in-progress",
            HostStatus::Installed => "installed",
            HostStatus::Error => "error",
            HostStatus::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// Progress record attached to a host
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostProgress {
    /// Latest reported stage
    #[serde(default)]
    pub current_stage: Option<HostStage>,
    /// Free-text info attached to the latest stage report
    #[serde(default)]
    pub progress_info: String,
}

/// A host as seen through the inventory service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Host identifier
    pub id: String,
    /// Infra-env the host registered under
    pub infra_env_id: String,
    /// Current status
    pub status: HostStatus,
    /// Progress record
    #[serde(default)]
    pub progress: HostProgress,
    /// Hostname requested for the node
    #[serde(default)]
    pub requested_hostname: String,
    /// Hardware inventory, JSON-encoded
    #[serde(default)]
    pub inventory: String,
    /// Node labels to apply at completion time, JSON-encoded
    #[serde(default)]
    pub node_labels: String,
}

impl Host {
    /// True once the host needs no further progress reports.
    pub fn is_terminal(&self) -> bool {
        self.status == HostStatus::Error
            || self
                .progress
                .current_stage
                .map(|s| s == HostStage::Done)
                .unwrap_or(false)
    }
}

/// A host together with the name it is known by
pub type HostsByName = HashMap<String, Host>;

/// Hardware inventory subset used for IP correlation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInventory {
    /// Network interfaces
    #[serde(default)]
    pub interfaces: Vec<HostInterface>,
}

/// A single interface in the hardware inventory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInterface {
    /// IPv4 addresses in CIDR notation
    #[serde(default)]
    pub ipv4_addresses: Vec<String>,
    /// IPv6 addresses in CIDR notation
    #[serde(default)]
    pub ipv6_addresses: Vec<String>,
}

/// All IP addresses a host reported, CIDR suffixes stripped.
pub fn host_ips(host: &Host) -> Result<Vec<String>> {
    if host.inventory.is_empty() {
        return Ok(vec![]);
    }
    let inventory: HostInventory = serde_json::from_str(&host.inventory)?;
    let mut ips = Vec::new();
    for interface in &inventory.interfaces {
        for cidr in interface
            .ipv4_addresses
            .iter()
            .chain(interface.ipv6_addresses.iter())
        {
            let net = IpNet::from_str(cidr)
                .map_err(|e| Error::validation(format!("bad address {}: {}", cidr, e)))?;
            ips.push(net.addr().to_string());
        }
    }
    Ok(ips)
}

/// Map from every known IP address to the owning host name.
pub fn hosts_by_ip(hosts: &HostsByName) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, host) in hosts {
        if let Ok(ips) = host_ips(host) {
            for ip in ips {
                map.insert(ip, name.clone());
            }
        }
    }
    map
}

/// Cluster kind as tracked by the inventory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterKind {
    /// Regular installation cluster
    #[serde(rename = "Cluster")]
    Cluster,
    /// Day-2 cluster accepting additional hosts
    #[serde(rename = "AddHostsCluster")]
    AddHostsCluster,
}

/// Cluster status as tracked by the inventory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStatus {
    /// Cluster install in progress
    Installing,
    /// Minimum masters reached, waiting for post-install completion
    Finalizing,
    /// Installation complete
    Installed,
    /// Installation failed
    Error,
    /// Day-2 host addition in progress
    AddingHosts,
}

/// A cluster as seen through the inventory service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identifier
    pub id: String,
    /// Current status
    pub status: ClusterStatus,
    /// Cluster kind
    #[serde(default = "default_cluster_kind")]
    pub kind: ClusterKind,
}

fn default_cluster_kind() -> ClusterKind {
    ClusterKind::Cluster
}

/// Classification of a monitored operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorType {
    /// Cluster operator shipped with the payload
    Builtin,
    /// Operator installed through OLM
    Olm,
}

/// Availability classification reported to the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    /// Operator converged
    Available,
    /// Operator still rolling out
    Progressing,
    /// Operator degraded or timed out
    Failed,
}

impl fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatorStatus::Available => "available",
            OperatorStatus::Progressing => "progressing",
            OperatorStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// An operator the controller mirrors into the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredOperator {
    /// Operator name
    pub name: String,
    /// Namespace the operator is installed in (OLM only)
    #[serde(default)]
    pub namespace: String,
    /// Subscription that owns the operator (OLM only)
    #[serde(default)]
    pub subscription_name: String,
    /// Built-in vs OLM
    pub operator_type: OperatorType,
    /// Last status mirrored into the inventory
    #[serde(default)]
    pub status: Option<OperatorStatus>,
    /// Last status message mirrored into the inventory
    #[serde(default)]
    pub status_info: String,
    /// Per-operator wait budget in seconds
    #[serde(default)]
    pub timeout_seconds: u64,
}

/// Log collection state reported to the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsState {
    /// Log collection asked for
    Requested,
    /// Logs being gathered
    Collecting,
    /// Upload finished
    Completed,
}

/// Origin of an uploaded log archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsType {
    /// Per-host installation logs
    Host,
    /// Controller job logs
    Controller,
}

impl fmt::Display for LogsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogsType::Host => write!(f, "host"),
            LogsType::Controller => write!(f, "controller"),
        }
    }
}

/// A condition on a cluster operator or cluster version resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorCondition {
    /// Condition type: Available, Progressing, Degraded, ...
    pub condition_type: String,
    /// "True" / "False" / "Unknown"
    pub status: String,
    /// Human-readable message
    pub message: String,
}

/// Map cluster-operator conditions to the status reported to the inventory.
///
/// Available=True wins, then Progressing=True, then Degraded=True (reported
/// as failed). Anything else is still progressing.
pub fn operator_status_from_conditions(
    conditions: &[OperatorCondition],
) -> (OperatorStatus, String) {
    for condition in conditions {
        if condition.condition_type == "Available" && condition.status == "True" {
            return (OperatorStatus::Available, condition.message.clone());
        }
        if condition.condition_type == "Progressing" && condition.status == "True" {
            return (OperatorStatus::Progressing, condition.message.clone());
        }
        if condition.condition_type == "Degraded" && condition.status == "True" {
            return (OperatorStatus::Failed, condition.message.clone());
        }
    }
    (OperatorStatus::Progressing, String::new())
}

/// Map an OLM CSV phase to the status reported to the inventory.
pub fn operator_status_from_csv_phase(phase: &str) -> OperatorStatus {
    match phase {
        "Succeeded" => OperatorStatus::Available,
        "Failed" => OperatorStatus::Failed,
        _ => OperatorStatus::Progressing,
    }
}

/// Parse an OpenShift version, tolerating missing minor/patch components.
pub fn parse_openshift_version(version: &str) -> Result<semver::Version> {
    let base = version
        .split(['-', '+'])
        .next()
        .unwrap_or(version);
    let mut parts = base.split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    let patch = parts.next().unwrap_or("0");
    semver::Version::parse(&format!("{}.{}.{}", major, minor, patch))
        .map_err(|e| Error::validation(format!("bad OpenShift version {}: {}", version, e)))
}

/// True when `version` predates OpenShift 4.7.
///
/// Gates the control-plane replicas patch and the etcd patch; both became
/// unnecessary with 4.7.
pub fn is_version_less_than_47(version: &str) -> Result<bool> {
    let parsed = parse_openshift_version(version)?;
    Ok(parsed < semver::Version::new(4, 7, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_with_inventory(inventory: &str) -> Host {
        Host {
            id: "h1".into(),
            infra_env_id: "ie1".into(),
            status: HostStatus::Installing,
            progress: HostProgress::default(),
            requested_hostname: "node0".into(),
            inventory: inventory.into(),
            node_labels: String::new(),
        }
    }

    #[test]
    fn stage_wire_strings_round_trip() {
        let stage: HostStage = serde_json::from_str("\"Writing image to disk\"").unwrap();
        assert_eq!(stage, HostStage::WritingImageToDisk);
        assert_eq!(
            serde_json::to_string(&HostStage::WaitingForControlPlane).unwrap(),
            "\"Waiting for control plane\""
        );
    }

    #[test]
    fn stage_order_is_monotonic() {
        let order = [
            HostStage::StartingInstallation,
            HostStage::Installing,
            HostStage::WritingImageToDisk,
            HostStage::WaitingForControlPlane,
            HostStage::WaitingForBootkube,
            HostStage::WaitingForController,
            HostStage::WaitingForIgnition,
            HostStage::Configuring,
            HostStage::Joined,
            HostStage::Rebooting,
            HostStage::Done,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
        assert!(HostStage::Done.is_terminal());
        assert!(HostStage::Failed.is_terminal());
        assert!(!HostStage::Rebooting.is_terminal());
    }

    #[test]
    fn host_ips_strip_cidr_suffix() {
        let host = host_with_inventory(
            r#"{"interfaces":[{"ipv4_addresses":["192.168.126.10/24"],"ipv6_addresses":["fe80::1/64"]}]}"#,
        );
        let ips = host_ips(&host).unwrap();
        assert_eq!(ips, vec!["192.168.126.10", "fe80::1"]);
    }

    #[test]
    fn host_ips_empty_inventory() {
        let host = host_with_inventory("");
        assert!(host_ips(&host).unwrap().is_empty());
    }

    #[test]
    fn hosts_by_ip_maps_every_address() {
        let mut hosts = HostsByName::new();
        hosts.insert(
            "node0".into(),
            host_with_inventory(r#"{"interfaces":[{"ipv4_addresses":["10.0.0.5/24"]}]}"#),
        );
        let by_ip = hosts_by_ip(&hosts);
        assert_eq!(by_ip.get("10.0.0.5"), Some(&"node0".to_string()));
    }

    #[test]
    fn version_gate_for_47() {
        assert!(is_version_less_than_47("4.6").unwrap());
        assert!(is_version_less_than_47("4.6.8").unwrap());
        assert!(!is_version_less_than_47("4.7").unwrap());
        assert!(!is_version_less_than_47("4.10.3").unwrap());
        assert!(!is_version_less_than_47("4.7.0-rc.2").unwrap());
        assert!(is_version_less_than_47("nonsense").is_err());
    }

    #[test]
    fn condition_mapping_prefers_available() {
        let conditions = vec![
            OperatorCondition {
                condition_type: "Available".into(),
                status: "True".into(),
                message: "ready".into(),
            },
            OperatorCondition {
                condition_type: "Degraded".into(),
                status: "True".into(),
                message: "broken".into(),
            },
        ];
        let (status, message) = operator_status_from_conditions(&conditions);
        assert_eq!(status, OperatorStatus::Available);
        assert_eq!(message, "ready");
    }

    #[test]
    fn condition_mapping_degraded_is_failed() {
        let conditions = vec![OperatorCondition {
            condition_type: "Degraded".into(),
            status: "True".into(),
            message: "pods crashing".into(),
        }];
        let (status, _) = operator_status_from_conditions(&conditions);
        assert_eq!(status, OperatorStatus::Failed);
    }

    #[test]
    fn condition_mapping_defaults_to_progressing() {
        let (status, message) = operator_status_from_conditions(&[]);
        assert_eq!(status, OperatorStatus::Progressing);
        assert!(message.is_empty());
    }

    #[test]
    fn csv_phase_mapping() {
        assert_eq!(
            operator_status_from_csv_phase("Succeeded"),
            OperatorStatus::Available
        );
        assert_eq!(
            operator_status_from_csv_phase("Failed"),
            OperatorStatus::Failed
        );
        assert_eq!(
            operator_status_from_csv_phase("Installing"),
            OperatorStatus::Progressing
        );
    }

}
