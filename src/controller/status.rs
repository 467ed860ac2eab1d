//! Shared error state for the controller loops
//!
//! Each loop handles its own transient errors; only errors that must change
//! the final completion report are recorded here. The status decides the
//! success flag of the completion call, so operator timeouts are tracked
//! separately: they mark the operator failed without failing the install.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Thread-safe error accumulator shared by the controller loops
#[derive(Clone, Default)]
pub struct ControllerStatus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    messages: Vec<String>,
    operators: BTreeSet<String>,
}

impl ControllerStatus {
    /// Create an empty status
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.inner.lock().unwrap();
        inner.messages.push(message);
    }

    /// Record an operator that failed or timed out
    pub fn operator_error(&self, name: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.operators.insert(name.into());
    }

    /// True when a fatal error was recorded
    pub fn has_error(&self) -> bool {
        !self.inner.lock().unwrap().messages.is_empty()
    }

    /// True when any operator error was recorded
    pub fn has_operator_error(&self) -> bool {
        !self.inner.lock().unwrap().operators.is_empty()
    }

    /// Names of the operators in error
    pub fn get_operators_in_error(&self) -> Vec<String> {
        self.inner.lock().unwrap().operators.iter().cloned().collect()
    }

    /// All fatal error messages joined into one report
    pub fn error_message(&self) -> String {
        self.inner.lock().unwrap().messages.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_status_is_clean() {
        let status = ControllerStatus::new();
        assert!(!status.has_error());
        assert!(!status.has_operator_error());
        assert!(status.get_operators_in_error().is_empty());
        assert_eq!(status.error_message(), "");
    }

    #[test]
    fn errors_accumulate() {
        let status = ControllerStatus::new();
        status.error("console timed out");
        status.error("cvo timed out");
        assert!(status.has_error());
        assert_eq!(status.error_message(), "console timed out, cvo timed out");
    }

    #[test]
    fn operator_errors_do_not_flip_the_fatal_flag() {
        let status = ControllerStatus::new();
        status.operator_error("lso");
        status.operator_error("lso");
        assert!(!status.has_error());
        assert!(status.has_operator_error());
        assert_eq!(status.get_operators_in_error(), vec!["lso"]);
    }

    #[test]
    fn clones_share_state() {
        let status = ControllerStatus::new();
        let shared = status.clone();
        shared.error("from another loop");
        assert!(status.has_error());
    }
}
