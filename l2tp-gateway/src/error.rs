// Error types

//! Typed errors for the two places where the kind of failure decides what
//! happens next: the runner's exit path and the PPP hook's kill path.

use thiserror::Error;

/// Exit code for unknown or runtime failures
pub const EXIT_UNKNOWN: i32 = 2;
/// Exit code for a failed start sequence
pub const EXIT_START_FAILED: i32 = 3;
/// Exit code when a configured interface is missing
pub const EXIT_START_INTERFACE_FAILED: i32 = 4;
/// Exit code after a SIGTERM requested stop
pub const EXIT_GOT_SIGTERM: i32 = 5;
/// Exit code when the DHCP lease expired
pub const EXIT_DHCP_EXPIRED: i32 = 6;
/// Exit code when the DHCP lease changed
pub const EXIT_DHCP_CHANGED: i32 = 7;
/// Exit code when a daemon could not be killed
pub const EXIT_REBOOT_REQUIRED: i32 = 8;
/// Exit code when no router answered for too long
pub const EXIT_ROUTERS_NOT_RESPONDING: i32 = 9;

/// Conditions that end a runner incarnation
#[derive(Debug, Error)]
pub enum RunnerError {
    /// SIGTERM received, stop for good
    #[error("got SIGTERM")]
    GotSigTerm,
    /// A configured interface is missing or unusable
    #[error("interface check failed: {0}")]
    StartFailedInterface(String),
    /// Network or daemon start failed
    #[error("start failed: {0}")]
    StartFailed(String),
    /// Failure during the main loop
    #[error("runtime error: {0}")]
    Runtime(String),
    /// dhclient never produced a lease
    #[error("no DHCP response: {0}")]
    DhcpNoResponse(String),
    /// The lease now carries different settings
    #[error("DHCP lease changed")]
    DhcpChanged,
    /// The lease was lost
    #[error("DHCP lease expired")]
    DhcpExpired,
    /// Pseudo-error: re-run the main loop immediately
    #[error("recheck requested")]
    Recheck,
    /// Kernel state cannot be recovered without a reboot
    #[error("reboot required: {0}")]
    RebootRequired(String),
    /// The router watchdog expired
    #[error("routers not responding: {0}")]
    RoutersNotResponding(String),
}

impl RunnerError {
    /// Process exit code for this condition
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::GotSigTerm => EXIT_GOT_SIGTERM,
            RunnerError::StartFailedInterface(_) => EXIT_START_INTERFACE_FAILED,
            RunnerError::StartFailed(_) | RunnerError::DhcpNoResponse(_) => EXIT_START_FAILED,
            RunnerError::Runtime(_) | RunnerError::Recheck => EXIT_UNKNOWN,
            RunnerError::DhcpChanged => EXIT_DHCP_CHANGED,
            RunnerError::DhcpExpired => EXIT_DHCP_EXPIRED,
            RunnerError::RebootRequired(_) => EXIT_REBOOT_REQUIRED,
            RunnerError::RoutersNotResponding(_) => EXIT_ROUTERS_NOT_RESPONDING,
        }
    }

    /// Whether the final stop should suppress its own error logging
    pub fn silent_stop(&self) -> bool {
        !matches!(
            self,
            RunnerError::GotSigTerm
                | RunnerError::Runtime(_)
                | RunnerError::DhcpChanged
                | RunnerError::DhcpExpired
        )
    }

    /// Wrap any non-typed failure raised inside `start()`
    pub fn start_failed(err: anyhow::Error) -> Self {
        match err.downcast::<RunnerError>() {
            Ok(e @ (RunnerError::StartFailedInterface(_) | RunnerError::RebootRequired(_))) => e,
            Ok(e @ RunnerError::GotSigTerm)
            | Ok(e @ RunnerError::DhcpChanged)
            | Ok(e @ RunnerError::DhcpNoResponse(_)) => e,
            Ok(other) => RunnerError::StartFailed(other.to_string()),
            Err(err) => RunnerError::StartFailed(format!("{:#}", err)),
        }
    }
}

/// Fatal-to-connection failures raised by the PPP hooks
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// User identity or site-to-site role could not be resolved consistently
    #[error("identity: {0}")]
    Identity(String),
    /// Assigned addresses violate the pool policy
    #[error("address check: {0}")]
    AddressCheck(String),
    /// License policy demands the connection be dropped
    #[error("license drop: {0}")]
    LicenseDrop(String),
    /// Allocator markers do not describe a coherent allocation
    #[error("internal consistency: {0}")]
    Internal(String),
    /// Anything else, usually a failed command
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_condition() {
        assert_eq!(RunnerError::GotSigTerm.exit_code(), 5);
        assert_eq!(RunnerError::StartFailedInterface("eth9".into()).exit_code(), 4);
        assert_eq!(RunnerError::StartFailed("x".into()).exit_code(), 3);
        assert_eq!(RunnerError::DhcpNoResponse("x".into()).exit_code(), 3);
        assert_eq!(RunnerError::Runtime("x".into()).exit_code(), 2);
        assert_eq!(RunnerError::Recheck.exit_code(), 2);
        assert_eq!(RunnerError::DhcpExpired.exit_code(), 6);
        assert_eq!(RunnerError::DhcpChanged.exit_code(), 7);
        assert_eq!(RunnerError::RebootRequired("x".into()).exit_code(), 8);
        assert_eq!(RunnerError::RoutersNotResponding("x".into()).exit_code(), 9);
    }

    #[test]
    fn test_silent_stop() {
        assert!(!RunnerError::GotSigTerm.silent_stop());
        assert!(!RunnerError::DhcpChanged.silent_stop());
        assert!(RunnerError::StartFailed("x".into()).silent_stop());
        assert!(RunnerError::RoutersNotResponding("x".into()).silent_stop());
    }

    #[test]
    fn test_start_failed_keeps_typed_errors() {
        let err = anyhow::Error::new(RunnerError::StartFailedInterface("eth1".into()));
        assert!(matches!(
            RunnerError::start_failed(err),
            RunnerError::StartFailedInterface(_)
        ));

        let err = anyhow::Error::new(RunnerError::RebootRequired("pluto".into()));
        assert!(matches!(
            RunnerError::start_failed(err),
            RunnerError::RebootRequired(_)
        ));

        let err = anyhow::anyhow!("ip addr add failed");
        match RunnerError::start_failed(err) {
            RunnerError::StartFailed(msg) => assert!(msg.contains("ip addr add failed")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
