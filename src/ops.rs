//! Privileged host operations
//!
//! Everything the installer does to the machine it runs on goes through the
//! [`HostOps`] trait: disk preparation, image writing, systemd, container
//! runtime invocations and log gathering. [`SystemOps`] is the real
//! implementation; destructive operations short-circuit under dry-run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::InstallerConfig;
use crate::ignition::{file_content_from_ignition, FileIgnition, IgnitionHandler};
use crate::{Error, Result};

/// Directory bootkube consumes extra manifests from
pub const OPENSHIFT_MANIFESTS_DIR: &str = "/opt/openshift/openshift";

/// Where controller deployment templates are baked into the installer image
const CONTROLLER_TEMPLATES_DIR: &str = "/usr/local/share/assisted-installer-controller";

const SSH_MANIFEST_TEMPLATE: &str = r#"apiVersion: machineconfiguration.openshift.io/v1
kind: MachineConfig
metadata:
  labels:
    machineconfiguration.openshift.io/role: master
  name: 99-openshift-machineconfig-master-ssh
spec:
  config:
    ignition:
      version: 3.2.0
    passwd:
      users:
      - name: core
        sshAuthorizedKeys:
        - {SSH_KEY}
"#;

/// Capability interface over the host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Resolve a device symlink to its target; returns the input on failure
    async fn evaluate_disk_symlink(&self, device: &str) -> String;

    /// Zero the partition table of a disk
    async fn format_disk(&self, disk: &str) -> Result<()>;

    /// Create a directory and any missing parents
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Write the target image with embedded ignition to the device
    async fn write_image_to_disk(
        &self,
        ignition_path: &Path,
        device: &str,
        extra_args: &[String],
    ) -> Result<()>;

    /// Point BIOS/UEFI boot order at the device
    async fn set_boot_order(&self, device: &str) -> Result<()>;

    /// Reboot the host
    async fn reboot(&self) -> Result<()>;

    /// Run a systemctl action, optionally against one unit
    async fn systemctl_action<'a>(&self, action: &str, unit: Option<&'a str>) -> Result<String>;

    /// Run an arbitrary privileged command, returning stdout
    async fn exec_privilege_command(&self, command: &str, args: &[String]) -> Result<String>;

    /// Write one file embedded in an ignition config to its path on disk
    async fn extract_from_ignition(&self, ignition_path: &Path, file_to_extract: &str)
        -> Result<()>;

    /// Render the controller deployment manifests into the bootkube manifest dir
    async fn prepare_controller(&self) -> Result<()>;

    /// Volume group backed by a physical volume, if any
    async fn get_vg_by_pv(&self, pv: &str) -> Result<Option<String>>;

    /// Remove a volume group
    async fn remove_vg(&self, vg: &str) -> Result<()>;

    /// Remove a physical volume
    async fn remove_pv(&self, pv: &str) -> Result<()>;

    /// True when the device participates in a software RAID
    async fn is_raid_member(&self, device: &str) -> bool;

    /// Devices of the RAID the device belongs to
    async fn get_raid_devices(&self, device: &str) -> Result<Vec<String>>;

    /// Stop the RAID and clear the device's membership
    async fn clean_raid_membership(&self, device: &str) -> Result<()>;

    /// Wipe filesystem signatures from the device
    async fn wipefs(&self, device: &str) -> Result<()>;

    /// Re-read a host configuration file after external changes
    async fn reload_host_file(&self, path: &Path) -> Result<()>;

    /// Kernel hostname
    async fn get_hostname(&self) -> Result<String>;

    /// Persist and apply a new hostname
    async fn create_random_hostname(&self, hostname: &str) -> Result<()>;

    /// Bundle installation logs into a tar.gz, returning its path
    async fn gather_installation_logs(&self, include_bootstrap_journal: bool) -> Result<PathBuf>;

    /// Run `oc adm must-gather` for each image, returning the archive path
    async fn get_must_gather_logs(
        &self,
        work_dir: &Path,
        kubeconfig_path: &Path,
        images: &[String],
    ) -> Result<PathBuf>;

    /// Machine-config-server pod logs from the bootstrap node
    async fn get_mcs_logs(&self) -> Result<String>;

    /// Emit a MachineConfig manifest granting cluster SSH access
    async fn create_openshift_ssh_manifest(
        &self,
        manifest_path: &Path,
        ssh_pub_key_path: &Path,
    ) -> Result<()>;
}

/// Real [`HostOps`] implementation shelling out to the live environment
pub struct SystemOps {
    dry_run: bool,
    controller_params: HashMap<String, String>,
}

impl SystemOps {
    /// Build from the installer configuration. The controller template
    /// parameters are captured here so `prepare_controller` can render the
    /// deployment manifests without reaching back into config.
    pub fn new(config: &InstallerConfig) -> Self {
        let mut controller_params = HashMap::new();
        controller_params.insert("CLUSTER_ID".to_string(), config.cluster_id.clone());
        controller_params.insert("INVENTORY_URL".to_string(), config.url.clone());
        controller_params.insert(
            "PULL_SECRET_TOKEN".to_string(),
            config.pull_secret_token.clone(),
        );
        controller_params.insert(
            "OPENSHIFT_VERSION".to_string(),
            config.openshift_version.clone(),
        );
        Self {
            dry_run: config.dry_run,
            controller_params,
        }
    }

    /// Construct for the controller process, which only gathers must-gather
    /// logs and never mutates the host.
    pub fn for_controller() -> Self {
        Self {
            dry_run: false,
            controller_params: HashMap::new(),
        }
    }

    async fn run(&self, command: &str, args: &[&str]) -> Result<String> {
        debug!(command = %command, args = ?args, "Executing privileged command");
        let output = Command::new(command)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ops(format!("failed to execute {}: {}", command, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ops(format!(
                "{} {} failed with {}: {}",
                command,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    fn skip_for_dry_run(&self, what: &str) -> bool {
        if self.dry_run {
            debug!(operation = %what, "Dry run, skipping");
        }
        self.dry_run
    }
}

#[async_trait]
impl HostOps for SystemOps {
    async fn evaluate_disk_symlink(&self, device: &str) -> String {
        match tokio::fs::canonicalize(device).await {
            Ok(resolved) => resolved.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(device = %device, error = %e, "Could not resolve device symlink");
                device.to_string()
            }
        }
    }

    async fn format_disk(&self, disk: &str) -> Result<()> {
        if self.skip_for_dry_run("format disk") {
            return Ok(());
        }
        info!(disk = %disk, "Formatting disk");
        self.run(
            "dd",
            &[
                "if=/dev/zero",
                &format!("of={}", disk),
                "bs=512",
                "count=80",
                "oflag=direct",
            ],
        )
        .await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn write_image_to_disk(
        &self,
        ignition_path: &Path,
        device: &str,
        extra_args: &[String],
    ) -> Result<()> {
        if self.skip_for_dry_run("write image to disk") {
            return Ok(());
        }
        info!(device = %device, "Writing image and ignition to disk");
        let ignition = ignition_path.to_string_lossy();
        let mut args: Vec<&str> = vec!["install", "--insecure", "-i", &ignition];
        for arg in extra_args {
            args.push(arg);
        }
        args.push(device);
        self.run("coreos-installer", &args).await?;
        Ok(())
    }

    async fn set_boot_order(&self, device: &str) -> Result<()> {
        if self.skip_for_dry_run("set boot order") {
            return Ok(());
        }
        if tokio::fs::metadata("/sys/firmware/efi").await.is_err() {
            debug!("Not an EFI system, no boot order to set");
            return Ok(());
        }
        info!(device = %device, "Setting boot order");
        self.run(
            "efibootmgr",
            &["--create", "--disk", device, "--label", "Red Hat CoreOS", "--loader", r"\EFI\redhat\shimx64.efi"],
        )
        .await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        info!("Rebooting host");
        self.run("shutdown", &["-r", "+1", "perform installation reboot"])
            .await?;
        Ok(())
    }

    async fn systemctl_action<'a>(&self, action: &str, unit: Option<&'a str>) -> Result<String> {
        if self.skip_for_dry_run("systemctl") {
            return Ok(String::new());
        }
        let mut args = vec![action];
        if let Some(unit) = unit {
            args.push(unit);
        }
        self.run("systemctl", &args).await
    }

    async fn exec_privilege_command(&self, command: &str, args: &[String]) -> Result<String> {
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(command, &borrowed).await
    }

    async fn extract_from_ignition(
        &self,
        ignition_path: &Path,
        file_to_extract: &str,
    ) -> Result<()> {
        if self.skip_for_dry_run("extract from ignition") {
            return Ok(());
        }
        let config = FileIgnition.parse_ignition_file(ignition_path).await?;
        let content = file_content_from_ignition(&config, file_to_extract)?;
        let dest = Path::new(file_to_extract);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, content).await?;
        info!(path = %file_to_extract, "Extracted file from ignition");
        Ok(())
    }

    async fn prepare_controller(&self) -> Result<()> {
        if self.skip_for_dry_run("prepare controller") {
            return Ok(());
        }
        info!("Rendering controller deployment manifests");
        tokio::fs::create_dir_all(OPENSHIFT_MANIFESTS_DIR).await?;
        let mut entries = tokio::fs::read_dir(CONTROLLER_TEMPLATES_DIR).await?;
        while let Some(entry) = entries.next_entry().await? {
            let template = tokio::fs::read_to_string(entry.path()).await?;
            let mut rendered = template;
            for (key, value) in &self.controller_params {
                rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
            }
            let dest = Path::new(OPENSHIFT_MANIFESTS_DIR).join(entry.file_name());
            tokio::fs::write(&dest, rendered).await?;
            debug!(manifest = %dest.display(), "Wrote controller manifest");
        }
        Ok(())
    }

    async fn get_vg_by_pv(&self, pv: &str) -> Result<Option<String>> {
        let output = self
            .run(
                "vgs",
                &["--noheadings", "-o", "vg_name,pv_name", "--select", &format!("pv_name={}", pv)],
            )
            .await?;
        let vg = output.split_whitespace().next().map(str::to_string);
        Ok(vg)
    }

    async fn remove_vg(&self, vg: &str) -> Result<()> {
        if self.skip_for_dry_run("remove vg") {
            return Ok(());
        }
        self.run("vgremove", &["-f", vg]).await?;
        Ok(())
    }

    async fn remove_pv(&self, pv: &str) -> Result<()> {
        if self.skip_for_dry_run("remove pv") {
            return Ok(());
        }
        self.run("pvremove", &["-ff", "-y", pv]).await?;
        Ok(())
    }

    async fn is_raid_member(&self, device: &str) -> bool {
        match self.run("mdadm", &["--examine", device]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(device = %device, error = %e, "Not a RAID member");
                false
            }
        }
    }

    async fn get_raid_devices(&self, device: &str) -> Result<Vec<String>> {
        // active arrays are listed in mdstat as: md0 : active raid1 sda1[0] sdb1[1]
        let mdstat = tokio::fs::read_to_string("/proc/mdstat").await?;
        let device_name = device.trim_start_matches("/dev/");
        let mut raids = Vec::new();
        for line in mdstat.lines() {
            if line.contains(device_name) {
                if let Some(md) = line.split(':').next() {
                    raids.push(format!("/dev/{}", md.trim()));
                }
            }
        }
        Ok(raids)
    }

    async fn clean_raid_membership(&self, device: &str) -> Result<()> {
        if self.skip_for_dry_run("clean raid membership") {
            return Ok(());
        }
        for raid in self.get_raid_devices(device).await? {
            self.run("mdadm", &["--stop", &raid]).await?;
        }
        self.run("mdadm", &["--zero-superblock", device]).await?;
        Ok(())
    }

    async fn wipefs(&self, device: &str) -> Result<()> {
        if self.skip_for_dry_run("wipefs") {
            return Ok(());
        }
        self.run("wipefs", &["--all", "--force", device]).await?;
        Ok(())
    }

    async fn reload_host_file(&self, path: &Path) -> Result<()> {
        // force a fresh read so later resolver lookups see the current content
        tokio::fs::read(path).await?;
        Ok(())
    }

    async fn get_hostname(&self) -> Result<String> {
        let output = self.run("hostname", &[]).await?;
        Ok(output.trim().to_string())
    }

    async fn create_random_hostname(&self, hostname: &str) -> Result<()> {
        if self.skip_for_dry_run("set hostname") {
            return Ok(());
        }
        tokio::fs::write("/etc/hostname", format!("{}\n", hostname)).await?;
        self.run("hostnamectl", &["set-hostname", hostname]).await?;
        Ok(())
    }

    async fn gather_installation_logs(&self, include_bootstrap_journal: bool) -> Result<PathBuf> {
        let staging = tempfile::tempdir()?;
        let log_path = Path::new(crate::config::INSTALLER_LOG_PATH);
        if log_path.exists() {
            tokio::fs::copy(log_path, staging.path().join("assisted-installer.log")).await?;
        }
        if include_bootstrap_journal && !self.dry_run {
            for unit in ["bootkube.service", "approve-csr.service"] {
                if let Ok(journal) = self.run("journalctl", &["-u", unit, "--no-pager"]).await {
                    tokio::fs::write(staging.path().join(format!("{}.log", unit)), journal)
                        .await?;
                }
            }
        }
        let archive_path = std::env::temp_dir().join("installation-logs.tar.gz");
        create_tar_gz(&archive_path, staging.path())?;
        Ok(archive_path)
    }

    async fn get_must_gather_logs(
        &self,
        work_dir: &Path,
        kubeconfig_path: &Path,
        images: &[String],
    ) -> Result<PathBuf> {
        let dest_dir = work_dir.join("must-gather");
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "adm".into(),
            "must-gather".into(),
            format!("--dest-dir={}", dest),
        ];
        for image in images {
            args.push(format!("--image={}", image));
        }
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(images = ?images, "Running oc adm must-gather");
        let output = Command::new("oc")
            .env("KUBECONFIG", kubeconfig_path)
            .args(&borrowed)
            .output()
            .await
            .map_err(|e| Error::ops(format!("failed to execute oc: {}", e)))?;
        if !output.status.success() {
            return Err(Error::ops(format!(
                "must-gather failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let archive_path = work_dir.join("must-gather.tar.gz");
        create_tar_gz(&archive_path, &dest_dir)?;
        Ok(archive_path)
    }

    async fn get_mcs_logs(&self) -> Result<String> {
        let id = self
            .run(
                "podman",
                &["ps", "--filter", "name=machine-config-server", "--format", "{{.ID}}"],
            )
            .await?;
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::ops("machine-config-server container not running"));
        }
        self.run("podman", &["logs", id]).await
    }

    async fn create_openshift_ssh_manifest(
        &self,
        manifest_path: &Path,
        ssh_pub_key_path: &Path,
    ) -> Result<()> {
        let pub_key = tokio::fs::read_to_string(ssh_pub_key_path).await?;
        let manifest = SSH_MANIFEST_TEMPLATE.replace("{SSH_KEY}", pub_key.trim());
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(manifest_path, manifest).await?;
        Ok(())
    }
}

/// Tar and gzip a directory's contents into `archive_path`.
pub(crate) fn create_tar_gz(archive_path: &Path, source_dir: &Path) -> Result<()> {
    let file = std::fs::File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", source_dir)?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dry_ops() -> SystemOps {
        SystemOps {
            dry_run: true,
            controller_params: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn dry_run_skips_destructive_operations() {
        let ops = dry_ops();
        ops.format_disk("/dev/vda").await.unwrap();
        ops.wipefs("/dev/vda").await.unwrap();
        ops.write_image_to_disk(Path::new("/tmp/nope.ign"), "/dev/vda", &[])
            .await
            .unwrap();
        assert_eq!(ops.systemctl_action("start", Some("bootkube.service")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn symlink_evaluation_falls_back_to_input() {
        let ops = dry_ops();
        let device = ops.evaluate_disk_symlink("/dev/does-not-exist").await;
        assert_eq!(device, "/dev/does-not-exist");
    }

    #[tokio::test]
    async fn ssh_manifest_embeds_public_key() {
        let ops = dry_ops();
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("id_rsa.pub");
        tokio::fs::write(&key_path, "ssh-rsa AAAA test@host\n")
            .await
            .unwrap();
        let manifest_path = dir.path().join("openshift").join("99-ssh.yaml");
        ops.create_openshift_ssh_manifest(&manifest_path, &key_path)
            .await
            .unwrap();
        let manifest = tokio::fs::read_to_string(&manifest_path).await.unwrap();
        assert!(manifest.contains("ssh-rsa AAAA test@host"));
        assert!(manifest.contains("MachineConfig"));
    }

    #[tokio::test]
    async fn tar_gz_archives_directory_contents() {
        let source = tempdir().unwrap();
        let out = tempdir().unwrap();
        tokio::fs::write(source.path().join("a.log"), "log body")
            .await
            .unwrap();
        let archive = out.path().join("out.tar.gz");
        create_tar_gz(&archive, source.path()).unwrap();
        assert!(archive.exists());
        assert!(archive.metadata().unwrap().len() > 0);
    }
}
