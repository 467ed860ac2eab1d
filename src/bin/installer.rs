//! Node installer binary: drives one host from the live environment to its
//! reboot into the installed system.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assisted_installer::cluster::KubeClusterApiBuilder;
use assisted_installer::config::InstallerConfig;
use assisted_installer::ignition::FileIgnition;
use assisted_installer::installer::Installer;
use assisted_installer::inventory::{
    HttpInventoryClient, DEFAULT_MAX_RETRIES, DRY_RUN_MAX_RETRIES,
};
use assisted_installer::ops::SystemOps;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InstallerConfig::parse();

    // log to console and to the host log file, which is uploaded to the
    // inventory before reboot
    let log_path = config.log_path();
    let log_file = Path::new(&log_path);
    let file_appender = tracing_appender::rolling::never(
        log_file.parent().unwrap_or_else(|| Path::new("/var/log")),
        log_file.file_name().unwrap_or_default(),
    );
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    tracing::info!(
        role = %config.role,
        device = %config.device,
        cluster_id = %config.cluster_id,
        version = %config.openshift_version,
        dry_run = config.dry_run,
        "Assisted installer started"
    );

    // in dry run we prefer quick feedback about errors over persistence
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

    let installer = Installer::new(
        config.clone(),
        Arc::new(inventory),
        Arc::new(SystemOps::new(&config)),
        Arc::new(KubeClusterApiBuilder),
        Arc::new(FileIgnition),
    );

    installer.run().await?;
    tracing::info!("Node installation finished, reboot dispatched");
    Ok(())
}
