//! The coordination-service boundary.
//!
//! A [`CoordinationSession`] exposes the handful of atomic primitives the
//! allocator and lease monitor need. Sessions are opened by a [`Connector`]
//! and owned by a [`SessionManager`], which also fans state transitions out to
//! registered [`SessionObserver`]s.

#[cfg(feature = "etcd")]
mod etcd;
mod manager;
mod memory;

use core::time::Duration;

#[cfg_attr(docsrs, doc(cfg(feature = "etcd")))]
#[cfg(feature = "etcd")]
pub use etcd::*;
pub use manager::*;
pub use memory::*;
use tokio::sync::watch;

use crate::Result;

/// Session timeout requested from the backend.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long [`SessionManager::get`] waits for a new session to
/// reach [`SessionState::SyncConnected`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(11);

/// Liveness of a coordination session.
///
/// Transitions are owned by the backend:
/// `Disconnected -> SyncConnected -> {Disconnected, Expired}`. A session that
/// reached `Expired` never recovers and must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    SyncConnected,
    Expired,
}

/// Receives session liveness notifications.
///
/// Dispatch order across observers is unspecified. Implementations run on the
/// session watcher task and must not block.
pub trait SessionObserver: Send + Sync {
    fn connected(&self);
    fn disconnected(&self);
}

/// Atomic primitives offered by a coordination backend.
///
/// Each method is a single linearizable step against the shared namespace.
/// Implementations retry their own compare-and-swap races; callers never see
/// a lost race as an error.
pub trait CoordinationSession: Send + Sync + 'static {
    /// Identifies this session as the owner in claim records.
    fn id(&self) -> &str;

    /// The most recently observed liveness of this session.
    fn state(&self) -> SessionState;

    /// Increments the counter at `path` unless it already equals `ceiling`.
    ///
    /// Returns the pre-increment value, or `None` without mutating anything
    /// when the counter is at the ceiling. A missing counter reads as zero.
    fn increment_bounded(
        &self,
        path: &str,
        ceiling: u32,
    ) -> impl Future<Output = Result<Option<u32>>> + Send;

    /// Appends `slot` to the queue at `path`.
    fn push(&self, path: &str, slot: u32) -> impl Future<Output = Result<()>> + Send;

    /// Removes and returns the oldest entry of the queue at `path`, if any.
    fn pop(&self, path: &str) -> impl Future<Output = Result<Option<u32>>> + Send;

    /// Stores an opaque record at `path`, replacing any previous value.
    fn put_record(&self, path: &str, data: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Removes the record at `path`. Missing records are not an error.
    fn delete_record(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Releases backend resources held by this session.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens sessions against a backend address.
pub trait Connector: Send + Sync + 'static {
    type Session: CoordinationSession;

    /// Opens a session and returns it with a receiver of its state
    /// transitions.
    ///
    /// The returned session may still be [`SessionState::Disconnected`]; the
    /// [`SessionManager`] waits for `SyncConnected` before handing it out.
    fn connect(
        &self,
        address: &str,
        session_timeout: Duration,
    ) -> impl Future<Output = Result<(Self::Session, watch::Receiver<SessionState>)>> + Send;
}

/// Timeouts applied by the [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
