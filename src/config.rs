//! Process configuration for the installer and controller binaries
//!
//! Both binaries are configured from arguments and environment variables with
//! no subcommands. The installer runs once per host inside the live
//! provisioning environment; the controller runs as a job inside the freshly
//! installed cluster.

use std::ops::Deref;
use std::path::PathBuf;

use clap::Parser;

use crate::models::{HighAvailabilityMode, HostRole};

/// Default install progress log location on the host
pub const INSTALLER_LOG_PATH: &str = "/var/log/assisted-installer.log";

/// Extra arguments forwarded to the image writer, passed on the command line
/// or through the environment as a JSON string array.
#[derive(Debug, Clone, Default)]
pub struct InstallerArgs(pub Vec<String>);

impl Deref for InstallerArgs {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

/// Configuration for a single node installation run
#[derive(Parser, Debug, Clone)]
#[command(name = "assisted-installer", version, about)]
pub struct InstallerConfig {
    /// Role this host installs as
    #[arg(long, env = "ROLE", value_enum)]
    pub role: HostRole,

    /// Target installation disk device (may be a symlink)
    #[arg(long, env = "DEVICE")]
    pub device: String,

    /// Cluster identifier in the inventory service
    #[arg(long = "cluster-id", env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Infra-env identifier this host was registered under
    #[arg(long = "infra-env-id", env = "INFRA_ENV_ID")]
    pub infra_env_id: String,

    /// Host identifier in the inventory service
    #[arg(long = "host-id", env = "HOST_ID")]
    pub host_id: String,

    /// Base URL of the inventory service
    #[arg(long, env = "INVENTORY_URL")]
    pub url: String,

    /// Pull-secret token used as the bearer credential against the inventory
    #[arg(long = "pull-secret-token", env = "PULL_SECRET_TOKEN", hide_env_values = true)]
    pub pull_secret_token: String,

    /// Cluster high-availability mode
    #[arg(
        long = "high-availability-mode",
        env = "HIGH_AVAILABILITY_MODE",
        value_enum,
        default_value_t = HighAvailabilityMode::Full
    )]
    pub high_availability_mode: HighAvailabilityMode,

    /// OpenShift version being installed
    #[arg(long = "openshift-version", env = "OPENSHIFT_VERSION")]
    pub openshift_version: String,

    /// Machine-config-operator image used to extract ignition to the filesystem
    #[arg(long = "mco-image", env = "MCO_IMAGE")]
    pub mco_image: String,

    /// Additional arguments forwarded to the image writer
    #[arg(long = "installer-args", env = "INSTALLER_ARGS", value_parser = parse_string_list, default_value = "[]")]
    pub installer_args: InstallerArgs,

    /// Disks to best-effort format before installation
    #[arg(long = "format-disk", env = "DISKS_TO_FORMAT", value_delimiter = ',', num_args = 0..)]
    pub disks_to_format: Vec<String>,

    /// Path to a CA bundle for inventory TLS verification
    #[arg(long = "cacert", env = "CA_CERT_PATH")]
    pub ca_cert_path: Option<PathBuf>,

    /// Skip inventory TLS certificate verification
    #[arg(long = "insecure", env = "SKIP_CERT_VERIFICATION", default_value_t = false)]
    pub skip_cert_verification: bool,

    /// Skip LVM/RAID/wipefs cleanup of the installation disk
    #[arg(long = "skip-installation-disk-cleanup", env = "SKIP_INSTALLATION_DISK_CLEANUP", default_value_t = false)]
    pub skip_installation_disk_cleanup: bool,

    /// Dry-run mode: no destructive host operations are performed
    #[arg(long = "dry-run", env = "DRY_ENABLE", default_value_t = false)]
    pub dry_run: bool,

    /// File touched instead of rebooting when running in dry-run mode
    #[arg(long = "fake-reboot-marker", env = "FAKE_REBOOT_MARKER_PATH")]
    pub fake_reboot_marker_path: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl InstallerConfig {
    /// Log file for this run; per-host in dry-run so concurrent fake hosts
    /// on one machine do not collide.
    pub fn log_path(&self) -> String {
        if self.dry_run {
            format!("/var/log/assisted-installer-{}.log", self.host_id)
        } else {
            INSTALLER_LOG_PATH.to_string()
        }
    }
}

/// Configuration for the in-cluster post-install controller
#[derive(Parser, Debug, Clone)]
#[command(name = "assisted-installer-controller", version, about)]
pub struct ControllerConfig {
    /// Cluster identifier in the inventory service
    #[arg(long = "cluster-id", env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Base URL of the inventory service
    #[arg(long, env = "INVENTORY_URL")]
    pub url: String,

    /// Namespace the controller job runs in
    #[arg(long, env = "NAMESPACE", default_value = "assisted-installer")]
    pub namespace: String,

    /// OpenShift version being installed
    #[arg(long = "openshift-version", env = "OPENSHIFT_VERSION")]
    pub openshift_version: String,

    /// Wait for the cluster-version operator before completing
    #[arg(long = "wait-for-cluster-version", env = "CHECK_CLUSTER_VERSION", default_value_t = false)]
    pub wait_for_cluster_version: bool,

    /// Must-gather image: empty, a plain image reference, or a JSON map of
    /// operator key to image reference
    #[arg(long = "must-gather-image", env = "MUST_GATHER_IMAGE", default_value = "")]
    pub must_gather_image: String,

    /// Pull-secret token used as the bearer credential against the inventory
    #[arg(long = "pull-secret-token", env = "PULL_SECRET_TOKEN", hide_env_values = true, default_value = "")]
    pub pull_secret_token: String,

    /// Path to a CA bundle for inventory TLS verification
    #[arg(long = "cacert", env = "CA_CERT_PATH")]
    pub ca_cert_path: Option<PathBuf>,

    /// Skip inventory TLS certificate verification
    #[arg(long = "insecure", env = "SKIP_CERT_VERIFICATION", default_value_t = false)]
    pub skip_cert_verification: bool,

    /// Dry-run mode: short-circuits waits, fewer inventory retries
    #[arg(long = "dry-run", env = "DRY_ENABLE", default_value_t = false)]
    pub dry_run: bool,
}

fn parse_string_list(raw: &str) -> Result<InstallerArgs, String> {
    if raw.trim().is_empty() {
        return Ok(InstallerArgs::default());
    }
    serde_json::from_str(raw)
        .map(InstallerArgs)
        .map_err(|e| format!("expected a JSON string array: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installer_args_parse_as_json_array() {
        let args = parse_string_list(r#"["--append-karg", "nameserver=8.8.8.8"]"#).unwrap();
        assert_eq!(args.0, vec!["--append-karg", "nameserver=8.8.8.8"]);
        assert!(parse_string_list("").unwrap().is_empty());
        assert!(parse_string_list("not-json").is_err());
    }

    #[test]
    fn dry_run_log_path_is_per_host() {
        let cfg = InstallerConfig::parse_from([
            "assisted-installer",
            "--role",
            "master",
            "--device",
            "/dev/vda",
            "--cluster-id",
            "c1",
            "--infra-env-id",
            "ie1",
            "--host-id",
            "h1",
            "--url",
            "http://service.example",
            "--pull-secret-token",
            "tok",
            "--openshift-version",
            "4.10.0",
            "--mco-image",
            "quay.io/mco:latest",
        ]);
        assert_eq!(cfg.log_path(), INSTALLER_LOG_PATH);

        let mut dry = cfg;
        dry.dry_run = true;
        assert_eq!(dry.log_path(), "/var/log/assisted-installer-h1.log");
    }

    #[test]
    fn controller_defaults() {
        let cfg = ControllerConfig::parse_from([
            "assisted-installer-controller",
            "--cluster-id",
            "c1",
            "--url",
            "http://service.example",
            "--openshift-version",
            "4.10.0",
        ]);
        assert_eq!(cfg.namespace, "assisted-installer");
        assert!(!cfg.wait_for_cluster_version);
        assert!(cfg.must_gather_image.is_empty());
    }
}
