use core::time::Duration;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

use crate::{ClaimRecord, Connector, CoordinationSession, Error, Result, SessionState};

/// An in-process coordination backend.
///
/// All sessions opened from the same cluster (or its clones) share one
/// namespace guarded by a single lock, so every operation is linearizable.
/// The cluster can be made unreachable or have its sessions expired to
/// exercise failure paths.
///
/// # Example
///
/// ```
/// use ferroid_lease::{CoordinationSession, MemoryCluster};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let cluster = MemoryCluster::new();
/// let session = cluster.session();
///
/// assert_eq!(session.increment_bounded("/ids/pool/counter", 2).await.unwrap(), Some(0));
/// assert_eq!(session.increment_bounded("/ids/pool/counter", 2).await.unwrap(), Some(1));
/// assert_eq!(session.increment_bounded("/ids/pool/counter", 2).await.unwrap(), None);
/// assert_eq!(cluster.counter("/ids/pool/counter"), 2);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug)]
struct ClusterInner {
    namespace: Mutex<Namespace>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
    reachable: AtomicBool,
    next_session: AtomicU64,
}

#[derive(Debug, Default)]
struct Namespace {
    counters: HashMap<String, u32>,
    queues: HashMap<String, VecDeque<u32>>,
    records: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct SessionShared {
    id: String,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
}

impl SessionShared {
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            // Expired is terminal.
            if *current == next || *current == SessionState::Expired {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                namespace: Mutex::new(Namespace::default()),
                sessions: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// A [`Connector`] that opens sessions against this cluster.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
        }
    }

    /// Opens a session directly, bypassing any [`SessionManager`].
    ///
    /// [`SessionManager`]: crate::SessionManager
    pub fn session(&self) -> MemorySession {
        self.open().0
    }

    fn open(&self) -> (MemorySession, watch::Receiver<SessionState>) {
        let initial = if self.is_reachable() {
            SessionState::SyncConnected
        } else {
            SessionState::Disconnected
        };
        let (state, receiver) = watch::channel(initial);
        let number = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared {
            id: format!("memory-session-{number}"),
            state,
            closed: AtomicBool::new(false),
        });

        let mut sessions = self.inner.sessions.lock();
        sessions.retain(|session| session.strong_count() > 0);
        sessions.push(Arc::downgrade(&shared));

        (
            MemorySession {
                shared,
                cluster: Arc::clone(&self.inner),
            },
            receiver,
        )
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::Acquire)
    }

    /// Simulates losing or regaining the quorum.
    ///
    /// Live sessions move to [`SessionState::Disconnected`] or back to
    /// [`SessionState::SyncConnected`]. Expired and closed sessions stay
    /// where they are.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Release);
        let next = if reachable {
            SessionState::SyncConnected
        } else {
            SessionState::Disconnected
        };
        for session in self.live_sessions() {
            if !session.closed.load(Ordering::Acquire) {
                session.transition(next);
            }
        }
    }

    /// Expires every session opened so far.
    pub fn expire_sessions(&self) {
        for session in self.live_sessions() {
            session.transition(SessionState::Expired);
        }
    }

    fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Current value of the counter at `path` (zero when absent).
    pub fn counter(&self, path: &str) -> u32 {
        self.inner
            .namespace
            .lock()
            .counters
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of the queue at `path`, oldest entry first.
    pub fn queue(&self, path: &str) -> Vec<u32> {
        self.inner
            .namespace
            .lock()
            .queues
            .get(path)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The claim record stored at `path`, if present and decodable.
    pub fn record(&self, path: &str) -> Option<ClaimRecord> {
        let namespace = self.inner.namespace.lock();
        let data = namespace.records.get(path)?;
        ClaimRecord::from_bytes(path, data).ok()
    }
}

/// Opens [`MemorySession`]s against a [`MemoryCluster`].
///
/// The address is ignored. When the cluster is unreachable the session starts
/// out [`SessionState::Disconnected`] and only becomes usable once the
/// cluster is reachable again.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
}

impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(
        &self,
        _address: &str,
        _session_timeout: Duration,
    ) -> Result<(MemorySession, watch::Receiver<SessionState>)> {
        Ok(self.cluster.open())
    }
}

/// A session on a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<SessionShared>,
    cluster: Arc<ClusterInner>,
}

impl MemorySession {
    fn with_namespace<T>(&self, op: impl FnOnce(&mut Namespace) -> T) -> Result<T> {
        match self.state() {
            SessionState::SyncConnected if self.cluster.reachable.load(Ordering::Acquire) => {
                Ok(op(&mut self.cluster.namespace.lock()))
            }
            SessionState::Expired => Err(Error::unavailable(format!(
                "session {} expired",
                self.shared.id
            ))),
            _ => Err(Error::unavailable(format!(
                "session {} is disconnected",
                self.shared.id
            ))),
        }
    }
}

impl CoordinationSession for MemorySession {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    async fn increment_bounded(&self, path: &str, ceiling: u32) -> Result<Option<u32>> {
        self.with_namespace(|namespace| {
            let counter = namespace.counters.entry(path.to_owned()).or_insert(0);
            if *counter >= ceiling {
                return None;
            }
            let issued = *counter;
            *counter += 1;
            Some(issued)
        })
    }

    async fn push(&self, path: &str, slot: u32) -> Result<()> {
        self.with_namespace(|namespace| {
            namespace
                .queues
                .entry(path.to_owned())
                .or_default()
                .push_back(slot);
        })
    }

    async fn pop(&self, path: &str) -> Result<Option<u32>> {
        self.with_namespace(|namespace| namespace.queues.get_mut(path)?.pop_front())
    }

    async fn put_record(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.with_namespace(|namespace| {
            namespace.records.insert(path.to_owned(), data);
        })
    }

    async fn delete_record(&self, path: &str) -> Result<()> {
        self.with_namespace(|namespace| {
            namespace.records.remove(path);
        })
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.transition(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = "/ids/pool/counter";
    const QUEUE: &str = "/ids/queue";

    #[tokio::test]
    async fn counter_stops_at_ceiling_without_mutation() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();

        for expected in 0..3 {
            assert_eq!(
                session.increment_bounded(COUNTER, 3).await.unwrap(),
                Some(expected)
            );
        }
        assert_eq!(session.increment_bounded(COUNTER, 3).await.unwrap(), None);
        assert_eq!(session.increment_bounded(COUNTER, 3).await.unwrap(), None);
        assert_eq!(cluster.counter(COUNTER), 3);
    }

    #[tokio::test]
    async fn queue_is_fifo_and_shared_between_sessions() {
        let cluster = MemoryCluster::new();
        let first = cluster.session();
        let second = cluster.session();
        assert_ne!(first.id(), second.id());

        first.push(QUEUE, 5).await.unwrap();
        second.push(QUEUE, 2).await.unwrap();
        assert_eq!(cluster.queue(QUEUE), vec![5, 2]);

        assert_eq!(second.pop(QUEUE).await.unwrap(), Some(5));
        assert_eq!(first.pop(QUEUE).await.unwrap(), Some(2));
        assert_eq!(first.pop(QUEUE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_operations() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let mut states = session.shared.state.subscribe();

        cluster.set_reachable(false);
        assert_eq!(*states.borrow_and_update(), SessionState::Disconnected);
        assert!(matches!(
            session.pop(QUEUE).await,
            Err(Error::CoordinationUnavailable { .. })
        ));
        assert_eq!(cluster.counter(COUNTER), 0);

        cluster.set_reachable(true);
        assert_eq!(session.state(), SessionState::SyncConnected);
        assert_eq!(session.increment_bounded(COUNTER, 1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn expired_sessions_never_recover() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();

        cluster.expire_sessions();
        cluster.set_reachable(false);
        cluster.set_reachable(true);

        assert_eq!(session.state(), SessionState::Expired);
        assert!(session.push(QUEUE, 1).await.is_err());
        assert_eq!(cluster.session().state(), SessionState::SyncConnected);
    }

    #[tokio::test]
    async fn closed_session_stays_disconnected() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();

        session.close().await;
        cluster.set_reachable(true);

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.delete_record("/ids/claims/0").await.is_err());
    }

    #[tokio::test]
    async fn sessions_opened_while_unreachable_start_disconnected() {
        let cluster = MemoryCluster::new();
        cluster.set_reachable(false);

        let (session, receiver) = cluster.open();
        assert_eq!(*receiver.borrow(), SessionState::Disconnected);

        cluster.set_reachable(true);
        assert_eq!(session.state(), SessionState::SyncConnected);
    }
}
