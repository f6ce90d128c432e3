use std::fmt;

use shared::profile::BadProfile;
use shared::wire::WireError;

/// Crate-wide error taxonomy. Transport/timeout variants always taint the
/// VM that produced them before they are propagated to the caller; pool
/// bookkeeping failures during release are logged and swallowed at the
/// point they occur rather than surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid capability profile: {0}")]
    BadProfile(#[from] BadProfile),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("connection closed before frame was complete")]
    ConnectionClosed,

    #[error("failed to start vm {vm_id}: {reason}")]
    VmStartup { vm_id: String, reason: String },

    #[error("dependency provisioning failed for profile {profile_key}: {reason}")]
    Provisioning { profile_key: String, reason: String },

    #[error("no vm available in pool {profile_key} within the acquire timeout")]
    PoolExhausted { profile_key: String },

    #[error("pool {profile_key} is shut down")]
    PoolClosed { profile_key: String },

    #[error("{function_ref} timed out after {cpu_ms}ms")]
    SandboxTimeout { function_ref: String, cpu_ms: u32 },

    #[error("{0}")]
    SandboxRemote(RemoteFailure),

    #[error("vm {vm_id} crashed: {reason}")]
    SandboxCrash { vm_id: String, reason: String },
}

impl SandboxError {
    /// Transport/timeout errors always taint the VM that served the call,
    /// even if the guest might still be alive.
    pub fn taints_vm(&self) -> bool {
        matches!(
            self,
            SandboxError::Wire(_)
                | SandboxError::ConnectionClosed
                | SandboxError::SandboxTimeout { .. }
                | SandboxError::SandboxCrash { .. }
        )
    }

    pub fn remote(error_type: impl Into<String>, message: impl Into<String>, traceback: impl Into<String>) -> Self {
        SandboxError::SandboxRemote(RemoteFailure {
            error_type: error_type.into(),
            message: message.into(),
            traceback: traceback.into(),
        })
    }
}

impl From<shared::rpc::RemoteError> for SandboxError {
    fn from(e: shared::rpc::RemoteError) -> Self {
        SandboxError::remote(e.error_type, e.message, e.traceback)
    }
}

/// Reconstructed guest-side exception. Preserves the original type string
/// and traceback verbatim rather than mapping it onto a typed host
/// exception tree.
#[derive(Debug, Clone)]
pub struct RemoteFailure {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)?;
        if !self.traceback.is_empty() {
            write!(f, "\n\nRemote traceback:\n{}", self.traceback)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failure_formats_type_and_message() {
        let err = SandboxError::remote("TimeoutError", "too slow", "");
        assert_eq!(err.to_string(), "[TimeoutError] too slow");
    }

    #[test]
    fn remote_failure_appends_traceback_when_present() {
        let err = SandboxError::remote("ValueError", "bad", "line 1\nline 2");
        assert!(err.to_string().contains("Remote traceback:\nline 1\nline 2"));
    }

    #[test]
    fn transport_and_timeout_errors_taint() {
        assert!(SandboxError::ConnectionClosed.taints_vm());
        assert!(
            SandboxError::SandboxTimeout {
                function_ref: "m:f".to_string(),
                cpu_ms: 10
            }
            .taints_vm()
        );
        assert!(!SandboxError::PoolExhausted {
            profile_key: "abc".to_string()
        }
        .taints_vm());
    }
}
