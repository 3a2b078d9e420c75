//! Client-side TTL enforcement for issued claims.
//!
//! A [`LeaseMonitor`] owns a single dispatcher task. Claims are registered with
//! their deadline; when a deadline passes the dispatcher relinquishes the
//! handle, deletes the claim record and pushes the slot back onto the reuse
//! queue. Releases that fail because the coordination service is unreachable
//! are parked and retried on the next sign that it is reachable again: a
//! `connected()` notification, a newly established session, or the next
//! tracked claim.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_stream::StreamExt;
use tokio_util::{sync::CancellationToken, time::DelayQueue};

use crate::{
    Connector, CoordinationSession, Error, PoolLayout, Result, SessionManager, SessionObserver,
    SessionState, claim::handle::ClaimCell,
};

/// A claim registered with the monitor.
pub(crate) struct Lease<S> {
    pub(crate) slot: u32,
    pub(crate) layout: PoolLayout,
    pub(crate) cell: Arc<ClaimCell>,
    pub(crate) session: Arc<S>,
    pub(crate) record: Option<Vec<u8>>,
}

enum Command<S> {
    Track { lease: Lease<S>, deadline: Instant },
    Adopt(Arc<S>),
    Retry,
}

/// Schedules the expiry of every claim handed out by a [`SlotAllocator`].
///
/// Cloning is cheap; all clones feed the same dispatcher task. The dispatcher
/// must be spawned inside a Tokio runtime.
///
/// [`attach`](LeaseMonitor::attach) the monitor to the [`SessionManager`] so
/// that parked releases are retried as soon as the session reconnects or is
/// replaced.
///
/// [`SlotAllocator`]: crate::SlotAllocator
pub struct LeaseMonitor<S: CoordinationSession> {
    commands: mpsc::UnboundedSender<Command<S>>,
    shutdown: CancellationToken,
}

impl<S: CoordinationSession> Clone for LeaseMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: CoordinationSession> LeaseMonitor<S> {
    /// Spawns the dispatcher task on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            commands: receiver,
            shutdown: shutdown.clone(),
            leases: DelayQueue::new(),
            parked: Vec::new(),
            latest: None,
        };
        tokio::spawn(dispatcher.run());
        Self { commands, shutdown }
    }

    pub(crate) fn track(&self, lease: Lease<S>, deadline: Instant) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::MonitorStopped);
        }
        self.commands
            .send(Command::Track { lease, deadline })
            .map_err(|_| Error::MonitorStopped)
    }

    /// Registers [`observer`](LeaseMonitor::observer) with `manager` and
    /// [`follow`](LeaseMonitor::follow)s the sessions it hands out.
    pub fn attach<C: Connector<Session = S>>(&self, manager: &SessionManager<C>) {
        manager.register_observer(self.observer());
        self.follow(manager.subscribe());
    }

    /// Releases through every session `sessions` announces while the session a
    /// claim was made on is unusable, and retries parked releases as soon as
    /// one is announced.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn follow(&self, mut sessions: watch::Receiver<Option<Arc<S>>>) {
        let commands = self.commands.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let announced = sessions.borrow_and_update().clone();
                if let Some(session) = announced {
                    if commands.send(Command::Adopt(session)).is_err() {
                        break;
                    }
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    changed = sessions.changed() => if changed.is_err() { break },
                }
            }
        });
    }

    /// An observer that retries parked releases whenever a session reports
    /// `connected()`.
    pub fn observer(&self) -> Arc<dyn SessionObserver> {
        Arc::new(MonitorObserver {
            commands: self.commands.clone(),
        })
    }

    /// Stops the dispatcher.
    ///
    /// Claims still outstanding keep their deadline, but their slots are no
    /// longer pushed back for reuse.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.commands.is_closed()
    }
}

struct MonitorObserver<S> {
    commands: mpsc::UnboundedSender<Command<S>>,
}

impl<S: CoordinationSession> SessionObserver for MonitorObserver<S> {
    fn connected(&self) {
        // A closed channel means the dispatcher is gone; nothing to retry.
        let _ = self.commands.send(Command::Retry);
    }

    fn disconnected(&self) {}
}

struct Dispatcher<S> {
    commands: mpsc::UnboundedReceiver<Command<S>>,
    shutdown: CancellationToken,
    leases: DelayQueue<Lease<S>>,
    parked: Vec<Lease<S>>,
    /// Most recent session a claim was tracked on or that was announced to
    /// the monitor, used for releases whose own session is not connected.
    latest: Option<Arc<S>>,
}

impl<S: CoordinationSession> Dispatcher<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Track { lease, deadline }) => self.track(lease, deadline).await,
                    Some(Command::Adopt(session)) => self.adopt(session).await,
                    Some(Command::Retry) => self.retry_parked().await,
                    None => break,
                },
                Some(expired) = self.leases.next() => self.expire(expired.into_inner()).await,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            outstanding = self.leases.len(),
            parked = self.parked.len(),
            "Lease monitor stopped"
        );
    }

    async fn track(&mut self, lease: Lease<S>, deadline: Instant) {
        self.latest = Some(Arc::clone(&lease.session));

        if let Some(record) = &lease.record {
            let path = lease.layout.claim(lease.slot);
            if let Err(_e) = lease.session.put_record(&path, record.clone()).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(slot = lease.slot, "Failed to write claim record: {_e}");
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(slot = lease.slot, "Tracking claim until its deadline");
        self.leases.insert_at(lease, deadline);

        // A claim just went through, so the service is reachable again.
        self.retry_parked().await;
    }

    async fn adopt(&mut self, session: Arc<S>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(session = session.id(), "Releasing through a new session");
        self.latest = Some(session);
        self.retry_parked().await;
    }

    async fn expire(&mut self, lease: Lease<S>) {
        // Relinquish before the slot becomes visible to other claimants.
        lease.cell.relinquish();

        #[cfg(feature = "tracing")]
        tracing::debug!(slot = lease.slot, "Claim expired, releasing slot");

        if let Err(_e) = release(&lease, self.latest.as_ref()).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                slot = lease.slot,
                "Slot release deferred until the session reconnects: {_e}"
            );
            self.parked.push(lease);
        }
    }

    async fn retry_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }

        for lease in core::mem::take(&mut self.parked) {
            match release(&lease, self.latest.as_ref()).await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(slot = lease.slot, "Deferred slot release completed");
                }
                Err(_) => self.parked.push(lease),
            }
        }
    }
}

/// Deletes the claim record and returns the slot to the reuse queue.
///
/// The record delete is best-effort; only the push decides success. A lease
/// whose own session is not connected is released through `latest` when that
/// one is.
async fn release<S: CoordinationSession>(lease: &Lease<S>, latest: Option<&Arc<S>>) -> Result<()> {
    let session = match latest {
        Some(latest)
            if lease.session.state() != SessionState::SyncConnected
                && latest.state() == SessionState::SyncConnected =>
        {
            latest
        }
        _ => &lease.session,
    };

    if lease.record.is_some() {
        let path = lease.layout.claim(lease.slot);
        if let Err(_e) = session.delete_record(&path).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(slot = lease.slot, "Failed to delete claim record: {_e}");
        }
    }

    session.push(&lease.layout.queue(), lease.slot).await
}
