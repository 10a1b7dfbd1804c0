//! Error types for the load-balancer engine
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant belongs to one failure category with its own handling rule:
//! validation errors are surfaced and never retried, `NotFound` is a
//! control-flow signal, transient store failures are retried a bounded
//! number of times before surfacing as `StoreUnavailable`, and provisioning
//! failures tear the half-built instance down before surfacing.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for dkcloud operations
#[derive(Debug, Error)]
pub enum Error {
    /// A policy hint carried a value outside its declared bounds or enum set
    #[error("invalid value {value:?} for option {key}: {reason}")]
    InvalidOption {
        /// The option key as supplied by the caller
        key: String,
        /// The original, unparsed value
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The desired state is not something this engine can serve
    #[error("validation error for {balancer}: {message}")]
    Validation {
        /// Balancer the request was for
        balancer: String,
        /// Description of what's invalid
        message: String,
    },

    /// The store has no resource with this identifier
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource kind (e.g. "cloud server")
        resource: String,
        /// Identifier or hostname that was looked up
        id: String,
    },

    /// Transient store failures persisted past the retry budget
    #[error("store unavailable during {operation} after {attempts} attempt(s): {message}")]
    StoreUnavailable {
        /// Store operation (e.g. "create", "list")
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last transient failure
        message: String,
    },

    /// The store definitively rejected a request
    #[error("store rejected {operation} (HTTP {status}): {message}")]
    StoreRejected {
        /// Store operation (e.g. "create", "list")
        operation: String,
        /// HTTP status code returned by the store
        status: u16,
        /// Response body or description
        message: String,
    },

    /// The instance never accepted an SSH connection within the readiness window
    #[error("{hostname} did not accept SSH connections within {waited_secs}s: {message}")]
    ProvisioningTimeout {
        /// Hostname of the backing instance
        hostname: String,
        /// Length of the readiness window in seconds
        waited_secs: u64,
        /// Last connection failure
        message: String,
    },

    /// A provisioning command exited non-zero
    #[error("command failed on {hostname} with exit status {exit_status}: {command}")]
    RemoteCommand {
        /// Hostname of the backing instance
        hostname: String,
        /// The command that was executed
        command: String,
        /// Exit status reported by the remote shell
        exit_status: u32,
        /// Combined stdout/stderr of the command
        output: String,
    },

    /// The configuration was uploaded but the daemon refused to reload it
    #[error("configuration applied on {hostname} but reload failed: {message}")]
    ReloadFailed {
        /// Hostname of the backing instance
        hostname: String,
        /// Reload output or failure description
        message: String,
    },

    /// The store reports an instance that cannot be used (e.g. no addresses)
    #[error("inconsistent state for {hostname}: {message}")]
    InconsistentState {
        /// Hostname of the backing instance
        hostname: String,
        /// What is inconsistent
        message: String,
    },

    /// SSH or SFTP transport failure
    #[error("remote channel error [{hostname}]: {message}")]
    RemoteChannel {
        /// Hostname or address of the remote end
        hostname: String,
        /// Description of what failed
        message: String,
    },

    /// Process configuration is missing or malformed
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// The store returned a payload we could not decode
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create an invalid-option error
    pub fn invalid_option(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error without balancer context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            balancer: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific balancer
    pub fn validation_for(balancer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            balancer: balancer.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an error for a store operation whose retries were exhausted
    pub fn store_unavailable(
        operation: impl Into<String>,
        attempts: u32,
        msg: impl Into<String>,
    ) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create an error for a definitive store rejection
    pub fn store_rejected(operation: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::StoreRejected {
            operation: operation.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create a provisioning timeout error
    pub fn provisioning_timeout(
        hostname: impl Into<String>,
        waited_secs: u64,
        msg: impl Into<String>,
    ) -> Self {
        Self::ProvisioningTimeout {
            hostname: hostname.into(),
            waited_secs,
            message: msg.into(),
        }
    }

    /// Create a remote command failure
    pub fn remote_command(
        hostname: impl Into<String>,
        command: impl Into<String>,
        exit_status: u32,
        output: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            hostname: hostname.into(),
            command: command.into(),
            exit_status,
            output: output.into(),
        }
    }

    /// Create a reload failure
    pub fn reload_failed(hostname: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ReloadFailed {
            hostname: hostname.into(),
            message: msg.into(),
        }
    }

    /// Create an inconsistent-state error
    pub fn inconsistent_state(hostname: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InconsistentState {
            hostname: hostname.into(),
            message: msg.into(),
        }
    }

    /// Create an SSH/SFTP transport error
    pub fn remote_channel(hostname: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteChannel {
            hostname: hostname.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and inconsistent-state errors need a human
    /// (or a changed desired state) to fix them. Transport and provisioning
    /// failures may succeed on the next reconciliation pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidOption { .. } => false,
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::StoreUnavailable { .. } => true,
            Error::StoreRejected { status, .. } => *status == 409,
            Error::ProvisioningTimeout { .. } => true,
            Error::RemoteCommand { .. } => true,
            Error::ReloadFailed { .. } => true,
            Error::InconsistentState { .. } => false,
            Error::RemoteChannel { .. } => true,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Whether this error is the `NotFound` control-flow signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Hostname of the backing instance, if the error is tied to one
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Error::ProvisioningTimeout { hostname, .. }
            | Error::RemoteCommand { hostname, .. }
            | Error::ReloadFailed { hostname, .. }
            | Error::InconsistentState { hostname, .. }
            | Error::RemoteChannel { hostname, .. } => Some(hostname),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Balancer Operations
    // ==========================================================================

    /// Story: A bad annotation is reported with the offending key and the
    /// untouched value, so the operator can fix the Service.
    #[test]
    fn story_invalid_option_names_key_and_value() {
        let err = Error::invalid_option(
            "kubernetes.cloud.dk/load-balancer-connection-limit",
            "25000",
            "must be between 1 and 20000",
        );
        let msg = err.to_string();
        assert!(msg.contains("load-balancer-connection-limit"));
        assert!(msg.contains("\"25000\""));
        assert!(msg.contains("between 1 and 20000"));
        assert!(!err.is_retryable());
    }

    /// Story: A store outage is retried by the store client, and once the
    /// budget is spent the reconciler is told to come back later.
    #[test]
    fn story_exhausted_store_retries_are_retryable_later() {
        let err = Error::store_unavailable("list", 3, "connection reset");
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert!(err.is_retryable());

        let err = Error::store_rejected("create", 422, "unknown package");
        assert!(err.to_string().contains("HTTP 422"));
        assert!(!err.is_retryable());
    }

    /// Story: Provisioning failures carry the hostname of the torn-down instance
    #[test]
    fn story_provisioning_failures_carry_hostname() {
        let err = Error::provisioning_timeout("k8s-load-balancer-abc", 300, "connection refused");
        assert_eq!(err.hostname(), Some("k8s-load-balancer-abc"));
        assert!(err.is_retryable());

        let err = Error::remote_command("k8s-load-balancer-abc", "/bin/bash x.sh", 100, "E: boom");
        assert!(err.to_string().contains("exit status 100"));
        match err {
            Error::RemoteCommand { output, .. } => assert_eq!(output, "E: boom"),
            _ => panic!("Expected RemoteCommand variant"),
        }
    }

    /// Story: An instance without addresses is never silently accepted
    #[test]
    fn story_inconsistent_state_is_fatal() {
        let err = Error::inconsistent_state("k8s-load-balancer-abc", "no IP addresses");
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
        assert!(Error::not_found("cloud server", "abc").is_not_found());
    }
}
