use core::time::Duration;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    ClaimHandle, ClaimRecord, CoordinationSession, Error, LeaseMonitor, PoolLayout, Result,
    SessionState,
    claim::{handle::ClaimCell, monitor::Lease},
};

/// Longest TTL a claim may be issued for.
///
/// The lease monitor's timer wheel cannot schedule deadlines much further out
/// than two years.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Claims exclusive, expiring slots from a bounded pool.
///
/// A claim first tries to reuse a relinquished slot from the pool's queue and
/// otherwise grows the pool's counter. Both steps are single atomic operations
/// on the coordination service, so concurrent claimants in any number of
/// processes never receive a slot that is live elsewhere. Which slot a
/// particular claimant receives is not specified.
///
/// Every handle is registered with the allocator's [`LeaseMonitor`], which
/// returns the slot to the queue when the TTL elapses.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use ferroid_lease::{LeaseMonitor, MemoryCluster, SlotAllocator};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let cluster = MemoryCluster::new();
/// let session = Arc::new(cluster.session());
/// let allocator = SlotAllocator::new(LeaseMonitor::spawn());
///
/// let claim = allocator
///     .claim_expiring(&session, 1024, "/unique-id-generator", Duration::from_secs(30))
///     .await
///     .unwrap();
/// let machine_id = claim.get().unwrap();
/// assert!(machine_id < 1024);
/// # });
/// ```
pub struct SlotAllocator<S: CoordinationSession> {
    monitor: LeaseMonitor<S>,
    cancellation: CancellationToken,
}

impl<S: CoordinationSession> Clone for SlotAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            monitor: self.monitor.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<S: CoordinationSession> SlotAllocator<S> {
    pub fn new(monitor: LeaseMonitor<S>) -> Self {
        Self::with_cancellation(monitor, CancellationToken::new())
    }

    /// Creates an allocator whose in-flight coordination waits end with
    /// [`Error::Aborted`] once `cancellation` fires.
    pub const fn with_cancellation(
        monitor: LeaseMonitor<S>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            cancellation,
        }
    }

    pub const fn monitor(&self) -> &LeaseMonitor<S> {
        &self.monitor
    }

    /// Claims a slot in `[0, pool_size)` for `ttl`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`]: `pool_size` or `ttl` is zero, `ttl`
    ///   exceeds [`MAX_TTL`], or `base_path` is malformed.
    /// - [`Error::CoordinationUnavailable`]: the session is not connected or a
    ///   request failed.
    /// - [`Error::ResourceExhausted`]: every slot is live and none is queued
    ///   for reuse. The counter and queue are left untouched.
    /// - [`Error::Aborted`]: the allocator was cancelled while waiting on the
    ///   coordination service.
    /// - [`Error::MonitorStopped`]: the lease monitor has shut down. A slot
    ///   obtained before noticing is pushed back first.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, session), fields(session = session.id()))
    )]
    pub async fn claim_expiring(
        &self,
        session: &Arc<S>,
        pool_size: u32,
        base_path: &str,
        ttl: Duration,
    ) -> Result<ClaimHandle> {
        if pool_size == 0 {
            return Err(Error::invalid("pool size must be greater than 0"));
        }
        if ttl.is_zero() {
            return Err(Error::invalid("ttl must be greater than 0"));
        }
        if ttl > MAX_TTL {
            return Err(Error::invalid(format!(
                "ttl must not exceed {} days",
                MAX_TTL.as_secs() / 86_400
            )));
        }
        let layout = PoolLayout::new(base_path)?;
        if session.state() != SessionState::SyncConnected {
            return Err(Error::unavailable(format!(
                "session {} is {:?}",
                session.id(),
                session.state()
            )));
        }

        let slot = self.acquire(session, &layout, pool_size).await?;
        let Some(deadline) = Instant::now().checked_add(ttl) else {
            hand_back(session.as_ref(), &layout, slot).await;
            return Err(Error::invalid("ttl overflows the clock"));
        };
        let cell = Arc::new(ClaimCell::new());

        let record = ClaimRecord::new(slot, session.id(), ttl).to_bytes().ok();
        let lease = Lease {
            slot,
            layout: layout.clone(),
            cell: Arc::clone(&cell),
            session: Arc::clone(session),
            record,
        };

        if let Err(e) = self.monitor.track(lease, deadline) {
            // Nobody will ever expire this claim.
            hand_back(session.as_ref(), &layout, slot).await;
            return Err(e);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            slot,
            ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            "Claimed slot"
        );

        Ok(ClaimHandle::new(slot, deadline, cell))
    }

    async fn acquire(&self, session: &S, layout: &PoolLayout, pool_size: u32) -> Result<u32> {
        let queue = layout.queue();
        while let Some(slot) = self.abortable(session.pop(&queue)).await? {
            if slot < pool_size {
                return Ok(slot);
            }
            #[cfg(feature = "tracing")]
            tracing::warn!(slot, pool_size, "Discarding queued slot outside the pool");
        }

        self.abortable(session.increment_bounded(&layout.counter(), pool_size))
            .await?
            .ok_or(Error::ResourceExhausted { pool_size })
    }

    async fn abortable<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Error::Aborted),
            result = op => result,
        }
    }
}

/// Returns a slot that will never be handed out as a claim.
async fn hand_back<S: CoordinationSession>(session: &S, layout: &PoolLayout, slot: u32) {
    if let Err(_e) = session.push(&layout.queue(), slot).await {
        #[cfg(feature = "tracing")]
        tracing::error!(slot, "Failed to return untracked slot: {_e}");
    }
}
