//! Post-install controller binary: runs as a job inside the new cluster and
//! drives it from bootstrap-complete to installation-complete.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assisted_installer::cluster::KubeClusterApi;
use assisted_installer::config::ControllerConfig;
use assisted_installer::controller::Controller;
use assisted_installer::inventory::{
    HttpInventoryClient, DEFAULT_MAX_RETRIES, DRY_RUN_MAX_RETRIES,
};
use assisted_installer::ops::SystemOps;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        cluster_id = %config.cluster_id,
        namespace = %config.namespace,
        version = %config.openshift_version,
        wait_for_cluster_version = config.wait_for_cluster_version,
        "Assisted installer controller started"
    );

    let max_retries = if config.dry_run {
        DRY_RUN_MAX_RETRIES
    } else {
        DEFAULT_MAX_RETRIES
    };
    let inventory = HttpInventoryClient::new(
        &config.url,
        &config.cluster_id,
        &config.pull_secret_token,
        config.ca_cert_path.as_deref(),
        config.skip_cert_verification,
        max_retries,
    )?;

    let cluster = KubeClusterApi::in_cluster().await?;

    let controller = Controller::new(
        config,
        Arc::new(inventory),
        Arc::new(SystemOps::for_controller()),
        Arc::new(cluster),
    );

    controller.run().await?;
    tracing::info!("Installation completed, controller exiting");
    Ok(())
}
