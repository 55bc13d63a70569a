//! Envelope demultiplexing by route.
//!
//! The dispatcher consumes the single inbound envelope stream of the current
//! connection and fans it out to one listener per [`RouteKey`].
//!
//! ```text
//! ┌──────────────┐   envelope    ┌──────────────────────────────────┐
//! │  Connection  │──────────────►│           Dispatcher             │
//! └──────────────┘               │  route 1:3 → listener            │
//!                                │  route 1:0 → listener            │
//!                                │  route 2:5 → [pool: e1, e2, e3]  │
//!                                └──────────────────────────────────┘
//! ```
//!
//! Envelopes for a route without a listener wait in a bounded pool. The
//! first [`Dispatcher::listen`] for that route takes the pool as a
//! [`Backlog`]. While the backlog is held, live envelopes for the route are
//! queued behind it and flushed to the listener when it is released, so
//! backlog and live delivery never interleave.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_MAX_PENDING_PER_ROUTE;
use crate::identifiers::RouteKey;
use crate::protocol::Envelope;
use crate::transport::Connection;

// ============================================================================
// Types
// ============================================================================

/// Listener callback for one route.
pub type EnvelopeListener = Arc<dyn Fn(Envelope) + Send + Sync>;

/// One listener registration.
struct Registration {
    /// Distinguishes successive registrations for the same route.
    id: u64,
    /// The callback.
    listener: EnvelopeListener,
    /// Live envelopes held back while the backlog is outstanding.
    held: Option<VecDeque<Envelope>>,
}

/// Mutable dispatcher state.
#[derive(Default)]
struct DispatcherState {
    /// Active listeners.
    listeners: FxHashMap<RouteKey, Registration>,
    /// Envelopes that arrived before a listener existed.
    pending: FxHashMap<RouteKey, VecDeque<Envelope>>,
    /// Next registration id.
    next_id: u64,
}

/// Shared dispatcher internals.
struct DispatcherInner {
    state: Mutex<DispatcherState>,
    max_pending_per_route: usize,
    dropped: AtomicU64,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound envelopes to per-route listeners.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field("pending", &self.pending_total())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_PER_ROUTE)
    }
}

impl Dispatcher {
    /// Creates a dispatcher keeping at most `max_pending_per_route`
    /// unclaimed envelopes per route.
    #[must_use]
    pub fn new(max_pending_per_route: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatcherState::default()),
                max_pending_per_route: max_pending_per_route.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to the inbound stream of `connection`.
    pub fn attach(&self, connection: &Connection) {
        let dispatcher = self.clone();
        connection.set_envelope_handler(Box::new(move |envelope| dispatcher.dispatch(envelope)));
        debug!(generation = %connection.generation(), "Dispatcher attached");
    }

    /// Installs the listener for `route` and returns its backlog.
    ///
    /// Replaces any existing listener for the route. Live envelopes for the
    /// route are held until the returned [`Backlog`] is dropped.
    pub fn listen<F>(&self, route: RouteKey, listener: F) -> Backlog
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let mut envelopes: Vec<Envelope> = state
            .pending
            .remove(&route)
            .map(Vec::from)
            .unwrap_or_default();

        let previous = state.listeners.insert(
            route,
            Registration {
                id,
                listener: Arc::new(listener),
                held: Some(VecDeque::new()),
            },
        );

        if let Some(held) = previous.and_then(|p| p.held) {
            envelopes.extend(held);
        }

        debug!(route = %route, backlog = envelopes.len(), "Listener registered");

        Backlog {
            route,
            id,
            envelopes,
            dispatcher: Arc::clone(&self.inner),
        }
    }

    /// Removes the listener for `route`.
    ///
    /// The pool is untouched; later envelopes for the route are pooled.
    pub fn remove(&self, route: RouteKey) {
        let removed = self.inner.state.lock().listeners.remove(&route);

        if let Some(registration) = removed {
            let unflushed = registration.held.map_or(0, |held| held.len());
            debug!(route = %route, unflushed, "Listener removed");
        }
    }

    /// Routes one inbound envelope.
    ///
    /// Envelopes whose route does not resolve are dropped.
    pub fn dispatch(&self, envelope: Envelope) {
        let Some(route) = envelope.route() else {
            trace!(method = %envelope.method, "Dropping envelope without route");
            return;
        };

        let listener = {
            let mut state = self.inner.state.lock();
            let DispatcherState {
                listeners, pending, ..
            } = &mut *state;

            match listeners.get_mut(&route) {
                Some(Registration {
                    held: Some(held), ..
                }) => {
                    held.push_back(envelope);
                    return;
                }
                Some(registration) => Arc::clone(&registration.listener),
                None => {
                    let queue = pending.entry(route).or_default();
                    if queue.len() >= self.inner.max_pending_per_route {
                        queue.pop_front();
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            route = %route,
                            depth = queue.len(),
                            "Pending pool full, dropping oldest envelope"
                        );
                    }
                    queue.push_back(envelope);
                    return;
                }
            }
        };

        listener(envelope);
    }

    /// Returns the number of pooled envelopes for `route`.
    #[must_use]
    pub fn pending_depth(&self, route: RouteKey) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .get(&route)
            .map_or(0, VecDeque::len)
    }

    /// Returns the number of pooled envelopes across all routes.
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.inner.state.lock().pending.values().map(VecDeque::len).sum()
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Returns the number of envelopes evicted from full pools.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Backlog
// ============================================================================

/// Envelopes that were pooled before a listener registered.
///
/// Process them before dropping the guard; live envelopes that arrive in
/// the meantime are delivered to the listener on drop, in arrival order.
#[must_use = "live delivery for the route resumes when the backlog is dropped"]
pub struct Backlog {
    route: RouteKey,
    id: u64,
    envelopes: Vec<Envelope>,
    dispatcher: Arc<DispatcherInner>,
}

impl fmt::Debug for Backlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backlog")
            .field("route", &self.route)
            .field("len", &self.envelopes.len())
            .finish_non_exhaustive()
    }
}

impl Backlog {
    /// Returns the route this backlog belongs to.
    #[inline]
    #[must_use]
    pub fn route(&self) -> RouteKey {
        self.route
    }

    /// Takes the envelopes out, leaving the guard in place.
    pub fn take(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.envelopes)
    }

    /// Ends the backlog phase and resumes live delivery.
    pub fn release(self) {}

    /// Flushes held envelopes until none remain, then goes live.
    fn flush(&self) {
        loop {
            let (listener, batch) = {
                let mut state = self.dispatcher.state.lock();
                let Some(registration) = state.listeners.get_mut(&self.route) else {
                    return;
                };
                if registration.id != self.id {
                    return;
                }
                let Some(held) = registration.held.as_mut() else {
                    return;
                };
                if held.is_empty() {
                    registration.held = None;
                    return;
                }
                (Arc::clone(&registration.listener), std::mem::take(held))
            };

            trace!(route = %self.route, count = batch.len(), "Flushing held envelopes");
            for envelope in batch {
                listener(envelope);
            }
        }
    }
}

impl Deref for Backlog {
    type Target = [Envelope];

    fn deref(&self) -> &Self::Target {
        &self.envelopes
    }
}

impl Drop for Backlog {
    fn drop(&mut self) {
        self.flush();
    }
}

// ============================================================================
// Tests
// ============================================================================
