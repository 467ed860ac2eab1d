//! Assisted installer - node installer and post-install controller for
//! OpenShift clusters driven by an assisted inventory service
//!
//! Two processes share this library:
//! - The node installer runs once per host inside the live provisioning
//!   environment, writes the target image and ignition to disk, coordinates
//!   the bootstrap transition with its peers through the inventory service,
//!   and reboots the host at the right moment.
//! - The post-install controller runs as a job inside the new cluster and
//!   drives it from "bootstrap complete" to "installation complete":
//!   approving node certificates, watching cluster operators, collecting
//!   logs, reconciling bare-metal hosts and reporting final status.
//!
//! # Modules
//!
//! - [`config`] - process configuration for both binaries
//! - [`models`] - inventory-side wire types and pure helpers
//! - [`ignition`] - ignition config parse/write/merge
//! - [`inventory`] - inventory service REST client
//! - [`ops`] - privileged host operations
//! - [`cluster`] - cluster API access
//! - [`installer`] - per-host install state machine
//! - [`controller`] - post-install reconciliation loops
//! - [`retry`] - retry and wait utilities
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod ignition;
pub mod installer;
pub mod inventory;
pub mod models;
pub mod ops;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Directory holding downloaded ignition files and intermediate artifacts
pub const INSTALL_DIR: &str = "/opt/install-dir";

/// Kubeconfig produced by bootkube during bootstrap
pub const KUBECONFIG_PATH: &str = "/opt/openshift/auth/kubeconfig";

/// Sentinel file signalling bootkube completion
pub const BOOTKUBE_DONE_PATH: &str = "/opt/openshift/.bootkube.done";

/// Master ignition produced by bootkube on single-node installs
pub const SINGLE_NODE_MASTER_IGNITION_PATH: &str = "/opt/openshift/master.ign";

/// Docker config receiving the pull secret extracted from ignition
pub const DOCKER_CONFIG_PATH: &str = "/root/.docker/config.json";
