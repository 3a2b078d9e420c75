//! Error types for slot claims and coordination sessions.
//!
//! Every failure a caller can observe surfaces as an [`Error`] at the call
//! that triggered it. The only swallowed failures are the best-effort claim
//! record writes and deletes, which are logged instead.
//!
//! ## Error Cases
//! - `ResourceExhausted`: every slot in the pool is live and the reuse queue is
//!   empty.
//! - `CoordinationUnavailable`: the session is down or a request failed.
//! - `InvalidArgument`: a pool size, TTL or base path was rejected.
//! - `ClaimNotHeld`: the claim has been relinquished.
//! - `ConnectTimeout`: a session could not be established in time.
//! - `NotConfigured`: a session was requested before an address was set.
//! - `Aborted`: a coordination wait was cancelled.
//! - `MonitorStopped`: the lease monitor is no longer running.
//! - `CorruptedData`: a stored counter or queue entry could not be parsed.

use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for slot claims and coordination sessions.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// All `pool_size` slots are live and no relinquished slot is queued.
    ///
    /// Terminal for the call that produced it; nothing retries internally.
    #[error("Resource pool exhausted: all {pool_size} slots are claimed")]
    ResourceExhausted { pool_size: u32 },

    /// The coordination service could not be reached or rejected a request.
    #[error("Coordination service unavailable: {context}")]
    CoordinationUnavailable { context: String },

    /// A caller-supplied argument was out of range or malformed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The claim expired and its slot was relinquished.
    #[error("Resource claim not held.")]
    ClaimNotHeld,

    /// The session did not reach `SyncConnected` within the connect timeout.
    #[error("Connection to coordination quorum timed out after {} seconds", .0.as_secs())]
    ConnectTimeout(Duration),

    /// [`SessionManager::get`] was called before
    /// [`SessionManager::configure`].
    ///
    /// [`SessionManager::get`]: crate::SessionManager::get
    /// [`SessionManager::configure`]: crate::SessionManager::configure
    #[error("Coordination quorum addresses were never configured")]
    NotConfigured,

    /// A coordination wait was interrupted by cancellation.
    #[error("Operation aborted")]
    Aborted,

    /// The lease monitor has shut down and cannot track new claims.
    #[error("Lease monitor is not running")]
    MonitorStopped,

    /// A value read from the coordination service could not be decoded.
    #[error("Corrupted data at {path}: {reason}")]
    CorruptedData { path: String, reason: String },
}

impl Error {
    pub(crate) fn unavailable(context: impl Into<String>) -> Self {
        Self::CoordinationUnavailable {
            context: context.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns `true` when retrying later against a healthy session could
    /// succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CoordinationUnavailable { .. } | Self::ConnectTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_not_held_message() {
        assert_eq!(Error::ClaimNotHeld.to_string(), "Resource claim not held.");
    }

    #[test]
    fn connect_timeout_reports_seconds() {
        let err = Error::ConnectTimeout(Duration::from_secs(10));
        assert_eq!(
            err.to_string(),
            "Connection to coordination quorum timed out after 10 seconds"
        );
        assert!(err.is_transient());
        assert!(!Error::ResourceExhausted { pool_size: 1 }.is_transient());
    }
}
