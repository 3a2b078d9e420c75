//! Explicit owner of the coordination session.
//!
//! [`SessionManager`] lazily connects on first use, hands the same session to
//! every caller until it is shut down, reset, or reported expired, and relays
//! session state transitions to registered observers.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, Ordering};
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    Connector, CoordinationSession, Error, Result, SessionConfig, SessionObserver, SessionState,
};

/// Owns the process's coordination session.
///
/// Construct one per backend, [`configure`] it with the backend address, and
/// pass the sessions it returns to the allocator. Nothing here is global.
///
/// [`configure`]: SessionManager::configure
pub struct SessionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Connector> {
    connector: C,
    config: SessionConfig,
    address: RwLock<Option<String>>,
    current: Mutex<Option<Connection<C::Session>>>,
    /// Serializes connection attempts so concurrent callers share one.
    connecting: AsyncMutex<()>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    /// The session handed out by `get`, or `None` while there is none.
    sessions: watch::Sender<Option<Arc<C::Session>>>,
    generation: AtomicU64,
}

struct Connection<S> {
    generation: u64,
    session: Arc<S>,
    watcher: CancellationToken,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                address: RwLock::new(None),
                current: Mutex::new(None),
                connecting: AsyncMutex::new(()),
                observers: RwLock::new(Vec::new()),
                sessions: watch::Sender::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Sets the backend address used by subsequent connections.
    ///
    /// An already established session is kept until it is shut down, reset or
    /// expires.
    pub fn configure(&self, address: impl Into<String>) {
        *self.inner.address.write() = Some(address.into());
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the current session, connecting first if there is none.
    ///
    /// A new session must reach [`SessionState::SyncConnected`] within the
    /// configured connect timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConfigured`] if [`configure`] was never called.
    /// - [`Error::ConnectTimeout`] if the session did not connect in time.
    /// - Any error the connector reports while opening the session.
    ///
    /// [`configure`]: SessionManager::configure
    pub async fn get(&self) -> Result<Arc<C::Session>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let _connecting = self.inner.connecting.lock().await;
        // Another caller may have connected while we waited.
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let address = self
            .inner
            .address
            .read()
            .clone()
            .ok_or(Error::NotConfigured)?;
        self.connect(&address).await
    }

    fn current_session(&self) -> Option<Arc<C::Session>> {
        self.inner
            .current
            .lock()
            .as_ref()
            .map(|connection| Arc::clone(&connection.session))
    }

    async fn connect(&self, address: &str) -> Result<Arc<C::Session>> {
        let SessionConfig {
            session_timeout,
            connect_timeout,
        } = self.inner.config;
        let deadline = Instant::now() + connect_timeout;

        #[cfg(feature = "tracing")]
        tracing::info!("Connecting to coordination quorum at {address}");

        let (session, mut states) =
            timeout_at(deadline, self.inner.connector.connect(address, session_timeout))
                .await
                .map_err(|_| Error::ConnectTimeout(connect_timeout))??;

        let connected = timeout_at(
            deadline,
            states.wait_for(|state| *state == SessionState::SyncConnected),
        )
        .await
        .map(|waited| waited.is_ok())
        .unwrap_or(false);

        if !connected {
            session.close().await;
            return Err(Error::ConnectTimeout(connect_timeout));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(session);
        let watcher = CancellationToken::new();
        tokio::spawn(watch_session(
            states,
            Arc::downgrade(&self.inner),
            generation,
            watcher.clone(),
        ));

        *self.inner.current.lock() = Some(Connection {
            generation,
            session: Arc::clone(&session),
            watcher,
        });
        self.inner.sessions.send_replace(Some(Arc::clone(&session)));

        #[cfg(feature = "tracing")]
        tracing::info!(generation, "Coordination session established");

        Ok(session)
    }

    /// Closes and forgets the current session, if any.
    pub async fn shutdown(&self) {
        let connection = self.inner.current.lock().take();
        if let Some(connection) = connection {
            self.inner.sessions.send_replace(None);
            connection.watcher.cancel();
            connection.session.close().await;

            #[cfg(feature = "tracing")]
            tracing::info!(
                generation = connection.generation,
                "Coordination session closed"
            );
        }
    }

    /// Forgets the current session without closing it, so the next
    /// [`get`](SessionManager::get) establishes a new one.
    pub fn reset(&self) {
        self.inner.reset(None);
    }

    /// Follows the session handed out by [`get`](SessionManager::get).
    ///
    /// The receiver sees every newly established session and `None` whenever
    /// the current one is shut down, reset or expires.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<C::Session>>> {
        self.inner.sessions.subscribe()
    }

    /// Adds an observer for `connected()` / `disconnected()` notifications.
    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Removes every registration of `observer`.
    pub fn deregister_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.inner.observers.write().retain(|registered| {
            !core::ptr::addr_eq(Arc::as_ptr(registered), Arc::as_ptr(observer))
        });
    }
}

impl<C: Connector> Inner<C> {
    /// Drops the current connection. With `Some(generation)` only that
    /// particular connection is dropped.
    fn reset(&self, generation: Option<u64>) {
        let mut current = self.current.lock();
        let matches = current
            .as_ref()
            .is_some_and(|connection| generation.is_none_or(|g| g == connection.generation));
        if matches {
            if let Some(connection) = current.take() {
                connection.watcher.cancel();
                self.sessions.send_replace(None);
            }
        }
    }

    fn notify(&self, state: SessionState) {
        // Snapshot so observers run without the registry lock held.
        let observers = self.observers.read().clone();
        for observer in &observers {
            match state {
                SessionState::SyncConnected => observer.connected(),
                SessionState::Disconnected => observer.disconnected(),
                SessionState::Expired => {}
            }
        }
    }
}

async fn watch_session<C: Connector>(
    mut states: watch::Receiver<SessionState>,
    inner: Weak<Inner<C>>,
    generation: u64,
    cancelled: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancelled.cancelled() => break,
            changed = states.changed() => if changed.is_err() { break },
        }

        let state = *states.borrow_and_update();
        let Some(manager) = inner.upgrade() else {
            break;
        };

        match state {
            SessionState::Disconnected => {
                #[cfg(feature = "tracing")]
                tracing::warn!(generation, "Disconnected from coordination quorum");
                manager.notify(state);
            }
            SessionState::SyncConnected => {
                #[cfg(feature = "tracing")]
                tracing::info!(generation, "Reconnected to coordination quorum");
                manager.notify(state);
            }
            SessionState::Expired => {
                #[cfg(feature = "tracing")]
                tracing::warn!(generation, "Coordination session expired");
                manager.reset(Some(generation));
                break;
            }
        }
    }
}
