//! Error types shared by the installer and the controller

use thiserror::Error;

/// Main error type for installer and controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport error talking to the inventory service
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Inventory service rejected or failed a request
    #[error("inventory error: {0}")]
    Inventory(String),

    /// The inventory service answered 404 for the requested resource
    #[error("not found: {0}")]
    NotFound(String),

    /// Host operation (disk, systemd, container runtime) failed
    #[error("host operation error: {0}")]
    Ops(String),

    /// Ignition parsing or merging error
    #[error("ignition error: {0}")]
    Ignition(String),

    /// Bad configuration or malformed input
    #[error("validation error: {0}")]
    Validation(String),

    /// A wait-for-predicate budget elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an inventory error with the given message
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }

    /// Create a host operation error with the given message
    pub fn ops(msg: impl Into<String>) -> Self {
        Self::Ops(msg.into())
    }

    /// Create an ignition error with the given message
    pub fn ignition(msg: impl Into<String>) -> Self {
        Self::Ignition(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for errors that a bounded retry may recover from.
    ///
    /// Not-found answers and local validation problems stay failed no matter
    /// how often they are retried; transport-level and server-side failures
    /// are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::NotFound(_) | Error::Validation(_))
    }
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_accept_str_and_string() {
        let err = Error::ops("wipefs failed");
        assert!(err.to_string().contains("host operation error"));

        let device = "/dev/sda";
        let err = Error::ops(format!("device {} busy", device));
        assert!(err.to_string().contains("/dev/sda"));
    }

    #[test]
    fn not_found_and_validation_are_not_retryable() {
        assert!(!Error::NotFound("cluster".into()).is_retryable());
        assert!(!Error::validation("bad role").is_retryable());
        assert!(Error::inventory("503 from service").is_retryable());
        assert!(Error::timeout("waiting for bootkube").is_retryable());
    }
}
