use std::time::Duration;

use thiserror::Error;

use crate::process::Role;

/// Failure taxonomy for harness operations.
///
/// Process-level failures ([`ExecutableNotFound`](HarnessError::ExecutableNotFound),
/// [`ProcessFailure`](HarnessError::ProcessFailure), [`TimedOut`](HarnessError::TimedOut))
/// are kept distinct from verification mismatches so a broken subject is never
/// reported as a protocol bug, and vice versa. No variant is retried; a trial
/// either fully succeeds or fails with exactly one of these.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The subject executable could not be located or started.
    #[error("subject executable not found: {0}")]
    ExecutableNotFound(String),

    /// A role process exited nonzero; carries its stderr for diagnostics.
    #[error("{role} process exited with code {code:?}: {stderr}")]
    ProcessFailure {
        role: Role,
        code: Option<i32>,
        stderr: String,
    },

    /// A role process outlived its deadline and had to be torn down.
    #[error("{role} process did not exit within {timeout:?}")]
    TimedOut { role: Role, timeout: Duration },

    /// The required loopback shaping rule could not be established.
    #[error("failed to establish network fault profile: {0}")]
    FaultInjection(String),

    /// The passive capture could not be started, stopped, or decoded.
    #[error("packet capture failed: {0}")]
    Capture(String),

    /// Protocol output or wire confidentiality did not match expectations.
    #[error("verification failed: {0}")]
    Verification(String),

    /// No unused port is left in the session's ephemeral range.
    #[error("ephemeral port range exhausted")]
    PortsExhausted,

    /// The selection environment variable named no known subject variant.
    #[error("unknown subject variant: {0}")]
    UnknownSubject(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
