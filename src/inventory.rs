//! Client for the assisted inventory service
//!
//! The inventory service is the system of record for cluster and host state.
//! Every operation here retries with exponential backoff; a 404 is surfaced
//! immediately, a 5xx or transport failure is retried until the attempt
//! budget runs out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{
    Cluster, Host, HostRole, HostStage, HostStatus, HostsByName, LogsState, LogsType,
    MonitoredOperator, OperatorStatus,
};
use crate::{Error, Result};

/// Production retry budget for inventory calls
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// In dry run mode we prefer quick feedback about errors over persistence.
pub const DRY_RUN_MAX_RETRIES: u32 = 3;

/// Capability interface over the inventory service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Fetch the cluster this process installs
    async fn get_cluster(&self) -> Result<Cluster>;

    /// Fetch all cluster hosts keyed by name, excluding `skipped_statuses`
    async fn get_hosts(&self, skipped_statuses: &[HostStatus]) -> Result<HostsByName>;

    /// Fetch the cluster hosts holding `role`
    async fn list_hosts_for_role(&self, role: HostRole) -> Result<Vec<Host>>;

    /// Fetch all enabled hosts keyed by name
    async fn get_enabled_hosts_names_hosts(&self) -> Result<HostsByName>;

    /// Report a host stage transition
    async fn update_host_install_progress(
        &self,
        infra_env_id: &str,
        host_id: &str,
        stage: HostStage,
        info: &str,
    ) -> Result<()>;

    /// Download a cluster file (bootstrap.ign, custom manifests, ...)
    async fn download_file(&self, filename: &str, dest: &Path) -> Result<()>;

    /// Download the per-host ignition
    async fn download_host_ignition(
        &self,
        infra_env_id: &str,
        host_id: &str,
        dest: &Path,
    ) -> Result<()>;

    /// Download cluster credentials (kubeconfig and friends)
    async fn download_cluster_credentials(&self, filename: &str, dest: &Path) -> Result<()>;

    /// Report host log collection state
    async fn host_log_progress_report(
        &self,
        infra_env_id: &str,
        host_id: &str,
        state: LogsState,
    ) -> Result<()>;

    /// Report cluster log collection state
    async fn cluster_log_progress_report(&self, state: LogsState) -> Result<()>;

    /// Upload the default-ingress CA bundle
    async fn upload_ingress_ca(&self, ca: &str) -> Result<()>;

    /// Upload a log archive
    async fn upload_logs(&self, logs_type: LogsType, archive: &Path) -> Result<()>;

    /// Fetch one monitored operator by name
    async fn get_cluster_monitored_operator(&self, operator_name: &str)
        -> Result<MonitoredOperator>;

    /// Mirror an operator status into the inventory
    async fn update_cluster_operator(
        &self,
        operator_name: &str,
        status: OperatorStatus,
        status_info: &str,
    ) -> Result<()>;

    /// Fetch the OLM operators the controller must wait for
    async fn get_cluster_monitored_olm_operators(&self) -> Result<Vec<MonitoredOperator>>;

    /// Declare the installation finished
    async fn complete_installation(&self, success: bool, error_info: Option<String>) -> Result<()>;
}

/// HTTP implementation of [`InventoryClient`]
pub struct HttpInventoryClient {
    base_url: String,
    cluster_id: String,
    client: reqwest::Client,
    max_retries: u32,
}

#[derive(Serialize)]
struct ProgressReport<'a> {
    current_stage: HostStage,
    progress_info: &'a str,
}

#[derive(Serialize)]
struct LogsProgressReport {
    logs_state: LogsState,
}

#[derive(Serialize)]
struct OperatorReport<'a> {
    name: &'a str,
    status: OperatorStatus,
    status_info: &'a str,
}

#[derive(Serialize)]
struct CompletionReport {
    is_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_info: Option<String>,
}

impl HttpInventoryClient {
    /// Build a client against `base_url` authenticating with the pull-secret
    /// token. `ca_cert_path` adds a root certificate; `skip_cert_verification`
    /// disables TLS verification entirely.
    pub fn new(
        base_url: &str,
        cluster_id: &str,
        pull_secret_token: &str,
        ca_cert_path: Option<&Path>,
        skip_cert_verification: bool,
        max_retries: u32,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            pull_secret_token
        ))
        .map_err(|e| Error::validation(format!("bad pull secret token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(skip_cert_verification);

        if let Some(path) = ca_cert_path {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::validation(format!("bad CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.to_string(),
            client: builder
                .build()
                .map_err(|e| Error::validation(format!("building http client: {}", e)))?,
            max_retries,
        })
    }

    fn cluster_url(&self, suffix: &str) -> String {
        format!(
            "{}/api/assisted-install/v2/clusters/{}{}",
            self.base_url, self.cluster_id, suffix
        )
    }

    fn host_url(&self, infra_env_id: &str, host_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/assisted-install/v2/infra-envs/{}/hosts/{}{}",
            self.base_url, infra_env_id, host_id, suffix
        )
    }

    /// Retry `operation` with exponential backoff, stopping early on errors
    /// no retry can fix.
    async fn with_retries<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_retries => {
                    warn!(operation = %operation_name, attempt, error = %e, "Inventory call failed");
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Inventory call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::inventory(format!("{}: {} {}", what, status, body)))
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        self.with_retries(what, || async {
            let response = self.client.get(url).send().await?;
            let response = Self::check(response, what).await?;
            Ok(response.json::<T>().await?)
        })
        .await
    }

    async fn put_json<B: Serialize>(&self, url: &str, body: &B, what: &str) -> Result<()> {
        self.with_retries(what, || async {
            let response = self.client.put(url).json(body).send().await?;
            Self::check(response, what).await?;
            Ok(())
        })
        .await
    }

    async fn download(&self, url: &str, dest: &Path, what: &str) -> Result<()> {
        self.with_retries(what, || async {
            let response = self.client.get(url).send().await?;
            let response = Self::check(response, what).await?;
            let bytes = response.bytes().await?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, &bytes).await?;
            Ok(())
        })
        .await
    }

    fn hosts_by_name(hosts: Vec<Host>, skipped_statuses: &[HostStatus]) -> HostsByName {
        let mut map = HashMap::new();
        for host in hosts {
            if skipped_statuses.contains(&host.status) {
                continue;
            }
            let name = if host.requested_hostname.is_empty() {
                host.id.clone()
            } else {
                host.requested_hostname.clone()
            };
            map.insert(name, host);
        }
        map
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn get_cluster(&self) -> Result<Cluster> {
        self.get_json(&self.cluster_url(""), "get cluster").await
    }

    async fn get_hosts(&self, skipped_statuses: &[HostStatus]) -> Result<HostsByName> {
        let hosts: Vec<Host> = self
            .get_json(&self.cluster_url("/hosts"), "get hosts")
            .await?;
        Ok(Self::hosts_by_name(hosts, skipped_statuses))
    }

    async fn list_hosts_for_role(&self, role: HostRole) -> Result<Vec<Host>> {
        let url = format!("{}?role={}", self.cluster_url("/hosts"), role);
        self.get_json(&url, "list hosts for role").await
    }

    async fn get_enabled_hosts_names_hosts(&self) -> Result<HostsByName> {
        self.get_hosts(&[HostStatus::Disabled]).await
    }

    async fn update_host_install_progress(
        &self,
        infra_env_id: &str,
        host_id: &str,
        stage: HostStage,
        info: &str,
    ) -> Result<()> {
        let report = ProgressReport {
            current_stage: stage,
            progress_info: info,
        };
        self.put_json(
            &self.host_url(infra_env_id, host_id, "/progress"),
            &report,
            "update host install progress",
        )
        .await
    }

    async fn download_file(&self, filename: &str, dest: &Path) -> Result<()> {
        let url = format!(
            "{}?file_name={}",
            self.cluster_url("/downloads/files"),
            filename
        );
        self.download(&url, dest, "download file").await
    }

    async fn download_host_ignition(
        &self,
        infra_env_id: &str,
        host_id: &str,
        dest: &Path,
    ) -> Result<()> {
        let url = self.host_url(infra_env_id, host_id, "/downloads/ignition");
        self.download(&url, dest, "download host ignition").await
    }

    async fn download_cluster_credentials(&self, filename: &str, dest: &Path) -> Result<()> {
        let url = format!(
            "{}?file_name={}",
            self.cluster_url("/downloads/credentials"),
            filename
        );
        self.download(&url, dest, "download cluster credentials")
            .await
    }

    async fn host_log_progress_report(
        &self,
        infra_env_id: &str,
        host_id: &str,
        state: LogsState,
    ) -> Result<()> {
        self.put_json(
            &self.host_url(infra_env_id, host_id, "/logs_progress"),
            &LogsProgressReport { logs_state: state },
            "host log progress report",
        )
        .await
    }

    async fn cluster_log_progress_report(&self, state: LogsState) -> Result<()> {
        self.put_json(
            &self.cluster_url("/logs_progress"),
            &LogsProgressReport { logs_state: state },
            "cluster log progress report",
        )
        .await
    }

    async fn upload_ingress_ca(&self, ca: &str) -> Result<()> {
        let url = self.cluster_url("/ingress-cert");
        self.with_retries("upload ingress ca", || async {
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "ingress_cert": ca }))
                .send()
                .await?;
            Self::check(response, "upload ingress ca").await?;
            Ok(())
        })
        .await
    }

    async fn upload_logs(&self, logs_type: LogsType, archive: &Path) -> Result<()> {
        let url = format!("{}?logs_type={}", self.cluster_url("/logs"), logs_type);
        let archive = PathBuf::from(archive);
        self.with_retries("upload logs", || {
            let archive = archive.clone();
            let url = url.clone();
            async move {
                let bytes = tokio::fs::read(&archive).await?;
                let file_name = archive
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "logs.tar.gz".to_string());
                let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
                let form = reqwest::multipart::Form::new().part("upfile", part);
                let response = self.client.post(&url).multipart(form).send().await?;
                Self::check(response, "upload logs").await?;
                Ok(())
            }
        })
        .await
    }

    async fn get_cluster_monitored_operator(
        &self,
        operator_name: &str,
    ) -> Result<MonitoredOperator> {
        let url = format!(
            "{}?operator_name={}",
            self.cluster_url("/monitored-operators"),
            operator_name
        );
        let mut operators: Vec<MonitoredOperator> =
            self.get_json(&url, "get monitored operator").await?;
        operators
            .pop()
            .ok_or_else(|| Error::NotFound(format!("operator {}", operator_name)))
    }

    async fn update_cluster_operator(
        &self,
        operator_name: &str,
        status: OperatorStatus,
        status_info: &str,
    ) -> Result<()> {
        let report = OperatorReport {
            name: operator_name,
            status,
            status_info,
        };
        self.put_json(
            &self.cluster_url("/monitored-operators"),
            &report,
            "update cluster operator",
        )
        .await
    }

    async fn get_cluster_monitored_olm_operators(&self) -> Result<Vec<MonitoredOperator>> {
        let operators: Vec<MonitoredOperator> = self
            .get_json(
                &self.cluster_url("/monitored-operators"),
                "get monitored olm operators",
            )
            .await?;
        Ok(operators
            .into_iter()
            .filter(|op| op.operator_type == crate::models::OperatorType::Olm)
            .collect())
    }

    async fn complete_installation(&self, success: bool, error_info: Option<String>) -> Result<()> {
        let url = self.cluster_url("/actions/complete-installation");
        let report = CompletionReport {
            is_success: success,
            error_info,
        };
        self.with_retries("complete installation", || async {
            let response = self.client.post(&url).json(&report).send().await?;
            Self::check(response, "complete installation").await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostProgress;

    fn host(name: &str, status: HostStatus) -> Host {
        Host {
            id: format!("id-{}", name),
            infra_env_id: "ie".into(),
            status,
            progress: HostProgress::default(),
            requested_hostname: name.into(),
            inventory: String::new(),
            node_labels: String::new(),
        }
    }

    #[test]
    fn hosts_by_name_filters_skipped_statuses() {
        let hosts = vec![
            host("node0", HostStatus::Installing),
            host("node1", HostStatus::Disabled),
        ];
        let map = HttpInventoryClient::hosts_by_name(hosts, &[HostStatus::Disabled]);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("node0"));
    }

    #[test]
    fn hosts_by_name_falls_back_to_id() {
        let mut anonymous = host("", HostStatus::Installing);
        anonymous.requested_hostname = String::new();
        let map = HttpInventoryClient::hosts_by_name(vec![anonymous], &[]);
        assert!(map.contains_key("id-"));
    }

    #[test]
    fn url_layout() {
        let client = HttpInventoryClient::new(
            "https://service.example/",
            "c1",
            "token",
            None,
            false,
            DEFAULT_MAX_RETRIES,
        )
        .unwrap();
        assert_eq!(
            client.cluster_url("/hosts"),
            "https://service.example/api/assisted-install/v2/clusters/c1/hosts"
        );
        assert_eq!(
            client.host_url("ie1", "h1", "/progress"),
            "https://service.example/api/assisted-install/v2/infra-envs/ie1/hosts/h1/progress"
        );
    }
}
