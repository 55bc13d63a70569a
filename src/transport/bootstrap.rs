//! Connection bootstrap.
//!
//! Every connect attempt is stamped with a generation number. An attempt
//! that finishes after a newer one started is stale: its transport is
//! stopped and its caller gets [`Error::Superseded`]. Callers asking for the
//! same target while an attempt is in flight share that attempt.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::identifiers::Generation;

use super::connection::{Connection, Connector};

// ============================================================================
// Types
// ============================================================================

/// Outcome of one attempt, shareable between waiters.
type SharedConnect = Shared<BoxFuture<'static, std::result::Result<Connection, Arc<Error>>>>;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    address: String,
    room: Option<String>,
}

/// The attempt currently in flight.
struct PendingConnect {
    generation: Generation,
    target: Target,
    result: SharedConnect,
}

/// Mutable bootstrap state.
#[derive(Default)]
struct BootstrapState {
    current: Option<Connection>,
    pending: Option<PendingConnect>,
}

/// Shared bootstrap internals.
struct BootstrapInner {
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    connect_timeout: Duration,
    generation: AtomicU64,
    state: Mutex<BootstrapState>,
}

// ============================================================================
// Bootstrapper
// ============================================================================

/// Creates and replaces the one current [`Connection`].
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Bootstrapper {
    inner: Arc<BootstrapInner>,
}

impl fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Bootstrapper")
            .field("generation", &self.generation())
            .field("connected", &state.current.is_some())
            .field("pending", &state.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl Bootstrapper {
    /// Creates a bootstrapper with the default connect timeout.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, dispatcher: Dispatcher) -> Self {
        Self::with_timeout(connector, dispatcher, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Creates a bootstrapper with a custom connect timeout.
    #[must_use]
    pub fn with_timeout(
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BootstrapInner {
                connector,
                dispatcher,
                connect_timeout,
                generation: AtomicU64::new(0),
                state: Mutex::new(BootstrapState::default()),
            }),
        }
    }

    /// Returns the latest generation handed out.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation::new(self.inner.generation.load(Ordering::SeqCst))
    }

    /// Returns the dispatcher new connections are attached to.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Connects to `address`, replacing the current connection.
    ///
    /// A call for the target already being connected joins that attempt.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `address` is empty
    /// - [`Error::ConnectionTimeout`] if the connect timeout elapses first
    /// - [`Error::Superseded`] if a newer attempt started meanwhile
    /// - Any error from the connector
    pub async fn connect(&self, address: &str, room: Option<&str>) -> Result<Connection> {
        if address.trim().is_empty() {
            return Err(Error::config("transport address is required"));
        }

        let target = Target {
            address: address.to_string(),
            room: room.map(str::to_string),
        };

        let attempt = {
            let mut state = self.inner.state.lock();

            let joined = state
                .pending
                .as_ref()
                .filter(|pending| pending.target == target)
                .map(|pending| (pending.generation, pending.result.clone()));

            if let Some((generation, result)) = joined {
                debug!(%generation, address, "Joining connect attempt in flight");
                result
            } else {
                let generation =
                    Generation::new(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);

                if let Some(previous) = state.current.take() {
                    info!(
                        previous = %previous.generation(),
                        next = %generation,
                        "Stopping current connection"
                    );
                    previous.stop();
                }

                let handle = tokio::spawn(run_attempt(
                    Arc::clone(&self.inner),
                    target.clone(),
                    generation,
                ));
                let result: SharedConnect = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(Arc::new(Error::connection(format!(
                            "connect task failed: {e}"
                        )))),
                    }
                }
                .boxed()
                .shared();

                state.pending = Some(PendingConnect {
                    generation,
                    target,
                    result: result.clone(),
                });
                result
            }
        };

        attempt.await.map_err(Error::from_shared)
    }

    /// Returns the current connection, waiting for an attempt in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if there is neither a connection nor an attempt
    /// - The attempt's error if it fails
    pub async fn current(&self) -> Result<Connection> {
        let attempt = {
            let state = self.inner.state.lock();
            if let Some(connection) = &state.current {
                return Ok(connection.clone());
            }
            match &state.pending {
                Some(pending) => pending.result.clone(),
                None => return Err(Error::NotConnected),
            }
        };

        attempt.await.map_err(Error::from_shared)
    }

    /// Returns the current connection without waiting.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.inner.state.lock().current.clone()
    }

    /// Stops the current connection and invalidates any attempt in flight.
    pub fn disconnect(&self) {
        let generation = Generation::new(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);

        let mut state = self.inner.state.lock();
        state.pending = None;
        if let Some(connection) = state.current.take() {
            connection.stop();
            info!(
                previous = %connection.generation(),
                %generation,
                "Disconnected"
            );
        }
    }
}

// ============================================================================
// Attempt
// ============================================================================

/// Races the connector against the connect timeout and installs the result.
async fn run_attempt(
    inner: Arc<BootstrapInner>,
    target: Target,
    generation: Generation,
) -> std::result::Result<Connection, Arc<Error>> {
    debug!(%generation, address = %target.address, room = ?target.room, "Connect attempt started");

    let outcome = tokio::time::timeout(
        inner.connect_timeout,
        inner
            .connector
            .connect(&target.address, target.room.as_deref()),
    )
    .await;

    let mut state = inner.state.lock();
    if state
        .pending
        .as_ref()
        .is_some_and(|pending| pending.generation == generation)
    {
        state.pending = None;
    }

    let transport = match outcome {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!(%generation, address = %target.address, error = %e, "Connect failed");
            return Err(Arc::new(e));
        }
        Err(_) => {
            let timeout_ms = inner.connect_timeout.as_millis() as u64;
            warn!(%generation, address = %target.address, timeout_ms, "Connect timed out");
            return Err(Arc::new(Error::connection_timeout(timeout_ms)));
        }
    };

    let latest = inner.generation.load(Ordering::SeqCst);
    if latest != generation.as_u64() {
        info!(%generation, latest, "Discarding superseded connection");
        transport.clear_envelope_handler();
        transport.stop();
        return Err(Arc::new(Error::superseded(generation)));
    }

    let connection = Connection::new(generation, transport);
    inner.dispatcher.attach(&connection);
    state.current = Some(connection.clone());

    info!(%generation, address = %target.address, "Connected");
    Ok(connection)
}

// ============================================================================
// Tests
// ============================================================================
