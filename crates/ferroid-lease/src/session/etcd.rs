//! etcd coordination backend.
//!
//! Every primitive is a compare-and-swap transaction:
//!
//! - counters are decimal values guarded by their `mod_revision` (or by
//!   `version == 0` while absent),
//! - a queue at `path` is the set of keys `{path}/{slot:010}`, popped in
//!   creation order with a delete guarded by the entry's `mod_revision`,
//! - records are plain puts and deletes.
//!
//! etcd has no session of its own here, so liveness is tracked client-side: a
//! probe task polls the cluster status, and every request outcome updates the
//! state. A session that stays disconnected for the whole session timeout is
//! declared expired.

use core::time::Duration;
use std::sync::Arc;

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, SortOrder, SortTarget, Txn, TxnOp,
};
use portable_atomic::{AtomicBool, Ordering};
use rand::{Rng, rng};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{Connector, CoordinationSession, Error, Result, SessionState};

/// Attempts per compare-and-swap loop before reporting contention as
/// [`Error::CoordinationUnavailable`].
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// Opens [`EtcdSession`]s.
///
/// The address is a comma-separated list of endpoints, e.g.
/// `http://etcd-0:2379,http://etcd-1:2379`.
#[derive(Clone, Default)]
pub struct EtcdConnector {
    options: Option<ConnectOptions>,
}

impl EtcdConnector {
    pub const fn new() -> Self {
        Self { options: None }
    }

    /// Uses `options` instead of options derived from the session timeout.
    pub fn with_options(options: ConnectOptions) -> Self {
        Self {
            options: Some(options),
        }
    }
}

impl Connector for EtcdConnector {
    type Session = EtcdSession;

    async fn connect(
        &self,
        address: &str,
        session_timeout: Duration,
    ) -> Result<(EtcdSession, watch::Receiver<SessionState>)> {
        let endpoints: Vec<&str> = address
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(Error::invalid("etcd address lists no endpoints"));
        }

        let options = self.options.clone().unwrap_or_else(|| {
            ConnectOptions::new()
                .with_connect_timeout(session_timeout)
                .with_timeout(session_timeout)
                .with_keep_alive(session_timeout / 3, session_timeout / 3)
        });
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| Error::unavailable(format!("unable to reach etcd at {address}: {e}")))?;

        let (state, receiver) = watch::channel(SessionState::Disconnected);
        let shared = Arc::new(Shared {
            id: format!("etcd-{:016x}", rng().random::<u64>()),
            state,
            closed: AtomicBool::new(false),
        });
        let probe = CancellationToken::new();
        tokio::spawn(probe_session(
            client.clone(),
            Arc::clone(&shared),
            session_timeout,
            probe.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::debug!(session = %shared.id, "Opened etcd session against {address}");

        Ok((
            EtcdSession {
                client,
                shared,
                probe,
            },
            receiver,
        ))
    }
}

#[derive(Debug)]
struct Shared {
    id: String,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
}

impl Shared {
    fn transition(&self, next: SessionState) {
        if next == SessionState::SyncConnected && self.closed.load(Ordering::Acquire) {
            return;
        }
        self.state.send_if_modified(|current| {
            if *current == next || *current == SessionState::Expired {
                return false;
            }
            *current = next;
            true
        });
    }

    fn observe<T>(&self, path: &str, result: Result<T, etcd_client::Error>) -> Result<T> {
        match result {
            Ok(value) => {
                self.transition(SessionState::SyncConnected);
                Ok(value)
            }
            Err(e) => {
                self.transition(SessionState::Disconnected);
                Err(Error::unavailable(format!("etcd request on {path} failed: {e}")))
            }
        }
    }
}

/// Polls the cluster until the session is closed or expires.
async fn probe_session(
    mut client: Client,
    shared: Arc<Shared>,
    session_timeout: Duration,
    cancelled: CancellationToken,
) {
    let interval = (session_timeout / 3).max(Duration::from_millis(100));
    let mut disconnected_since = None;

    loop {
        let reachable = tokio::select! {
            () = cancelled.cancelled() => break,
            status = client.status() => status.is_ok(),
        };

        if reachable {
            disconnected_since = None;
            shared.transition(SessionState::SyncConnected);
        } else {
            shared.transition(SessionState::Disconnected);
            let since = *disconnected_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= session_timeout {
                #[cfg(feature = "tracing")]
                tracing::warn!(session = %shared.id, "etcd unreachable for the whole session timeout");
                shared.transition(SessionState::Expired);
                break;
            }
        }

        tokio::select! {
            () = cancelled.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

/// A session on an etcd cluster.
pub struct EtcdSession {
    client: Client,
    shared: Arc<Shared>,
    probe: CancellationToken,
}

impl EtcdSession {
    fn queue_entry(path: &str, slot: u32) -> String {
        format!("{path}/{slot:010}")
    }
}

fn parse_u32(path: &str, data: &[u8]) -> Result<u32> {
    core::str::from_utf8(data)
        .map_err(|e| e.to_string())
        .and_then(|text| text.trim().parse::<u32>().map_err(|e| e.to_string()))
        .map_err(|reason| Error::CorruptedData {
            path: path.to_owned(),
            reason,
        })
}

impl CoordinationSession for EtcdSession {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    async fn increment_bounded(&self, path: &str, ceiling: u32) -> Result<Option<u32>> {
        let mut client = self.client.clone();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let response = self.shared.observe(path, client.get(path, None).await)?;
            let (current, guard) = match response.kvs().first() {
                Some(kv) => (
                    parse_u32(path, kv.value())?,
                    Compare::mod_revision(path, CompareOp::Equal, kv.mod_revision()),
                ),
                None => (0, Compare::version(path, CompareOp::Equal, 0)),
            };
            if current >= ceiling {
                return Ok(None);
            }

            let txn = Txn::new()
                .when(vec![guard])
                .and_then(vec![TxnOp::put(path, (current + 1).to_string(), None)]);
            if self.shared.observe(path, client.txn(txn).await)?.succeeded() {
                return Ok(Some(current));
            }
        }
        Err(Error::unavailable(format!(
            "counter {path} stayed contended for {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn push(&self, path: &str, slot: u32) -> Result<()> {
        let mut client = self.client.clone();
        let key = Self::queue_entry(path, slot);
        self.shared
            .observe(path, client.put(key, slot.to_string(), None).await)
            .map(drop)
    }

    async fn pop(&self, path: &str) -> Result<Option<u32>> {
        let mut client = self.client.clone();
        let prefix = format!("{path}/");

        for _ in 0..MAX_CAS_ATTEMPTS {
            let oldest = GetOptions::new()
                .with_prefix()
                .with_sort(SortTarget::Create, SortOrder::Ascend)
                .with_limit(1);
            let response = self
                .shared
                .observe(path, client.get(prefix.as_str(), Some(oldest)).await)?;
            let Some(kv) = response.kvs().first() else {
                return Ok(None);
            };
            let slot = parse_u32(path, kv.value())?;

            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    kv.key(),
                    CompareOp::Equal,
                    kv.mod_revision(),
                )])
                .and_then(vec![TxnOp::delete(kv.key(), None)]);
            // Losing the race means another claimant took this entry.
            if self.shared.observe(path, client.txn(txn).await)?.succeeded() {
                return Ok(Some(slot));
            }
        }
        Err(Error::unavailable(format!(
            "queue {path} stayed contended for {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn put_record(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        self.shared
            .observe(path, client.put(path, data, None).await)
            .map(drop)
    }

    async fn delete_record(&self, path: &str) -> Result<()> {
        let mut client = self.client.clone();
        self.shared
            .observe(path, client.delete(path, None).await)
            .map(drop)
    }

    async fn close(&self) {
        self.probe.cancel();
        self.shared.closed.store(true, Ordering::Release);
        self.shared.transition(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn queue_entries_sort_by_slot_width() {
        assert_eq!(EtcdSession::queue_entry("/ids/queue", 7), "/ids/queue/0000000007");
        assert_eq!(
            EtcdSession::queue_entry("/ids/queue", u32::MAX),
            "/ids/queue/4294967295"
        );
    }

    #[test]
    fn counters_must_be_decimal() {
        assert_eq!(parse_u32("/c", b"42"), Ok(42));
        assert_eq!(parse_u32("/c", b" 7\n"), Ok(7));
        assert!(matches!(
            parse_u32("/c", b"forty-two"),
            Err(Error::CorruptedData { path, .. }) if path == "/c"
        ));
        assert!(matches!(
            parse_u32("/c", &[0xff, 0xfe]),
            Err(Error::CorruptedData { .. })
        ));
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let connector = EtcdConnector::new();
        let result = connector.connect(" , ", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    /// Runs against the cluster named by `ETCD_ENDPOINTS`, e.g.
    /// `ETCD_ENDPOINTS=http://127.0.0.1:2379 cargo test --features etcd -- --ignored`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs an etcd cluster at ETCD_ENDPOINTS"]
    async fn contended_pops_and_increments_hand_out_each_slot_once() {
        const QUEUED: u32 = 16;
        const CEILING: u32 = 32;
        const CLAIMANTS: u32 = QUEUED + CEILING + 8;

        let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") else {
            return;
        };
        let base = format!("/ferroid-lease-test/{:016x}", rng().random::<u64>());
        let counter = format!("{base}/pool/counter");
        let queue = format!("{base}/queue");

        let connector = EtcdConnector::new();
        let mut sessions = Vec::new();
        for _ in 0..4 {
            let (session, mut states) = connector
                .connect(&endpoints, Duration::from_secs(10))
                .await
                .unwrap();
            states
                .wait_for(|state| *state == SessionState::SyncConnected)
                .await
                .unwrap();
            sessions.push(Arc::new(session));
        }
        // Distinct from the slots the counter hands out.
        for slot in CEILING..CEILING + QUEUED {
            sessions[0].push(&queue, slot).await.unwrap();
        }

        let tasks: Vec<_> = (0..CLAIMANTS)
            .map(|claimant| {
                let session = Arc::clone(&sessions[claimant as usize % sessions.len()]);
                let (counter, queue) = (counter.clone(), queue.clone());
                tokio::spawn(async move {
                    match session.pop(&queue).await {
                        Ok(None) => session.increment_bounded(&counter, CEILING).await,
                        popped => popped,
                    }
                })
            })
            .collect();

        let mut slots = HashSet::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(Some(slot)) => assert!(slots.insert(slot), "slot {slot} handed out twice"),
                Ok(None) => exhausted += 1,
                Err(e) => panic!("coordination failed: {e}"),
            }
        }

        assert_eq!(slots, (0..CEILING + QUEUED).collect::<HashSet<_>>());
        assert_eq!(exhausted, CLAIMANTS - CEILING - QUEUED);
        assert_eq!(sessions[0].pop(&queue).await.unwrap(), None);
        assert_eq!(
            sessions[0].increment_bounded(&counter, CEILING).await.unwrap(),
            None
        );

        let mut client = sessions[0].client.clone();
        let stored = client.get(counter.as_str(), None).await.unwrap();
        let value = stored.kvs().first().map(|kv| parse_u32(&counter, kv.value()));
        assert_eq!(value, Some(Ok(CEILING)));

        client
            .delete(base.as_str(), Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await
            .unwrap();
        for session in &sessions {
            session.close().await;
        }
    }
}
