//! Transport seams and the connection handle.
//!
//! A [`Connector`] produces a live [`Transport`]; the bootstrapper wraps it
//! in a [`Connection`] stamped with the generation of the attempt that
//! created it. Everything above this module talks to a `Connection`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::error::Result;
use crate::identifiers::{Generation, RouteKey};
use crate::protocol::{Command, Envelope, Request, Response};

// ============================================================================
// Types
// ============================================================================

/// Envelope handler callback type.
///
/// Called for each inbound envelope, in arrival order.
pub type EnvelopeHandler = Box<dyn Fn(Envelope) + Send + Sync>;

// ============================================================================
// Transport
// ============================================================================

/// One live link to a remote debug server.
///
/// Implementations deliver every inbound envelope to the installed handler
/// and correlate requests with their responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for its response.
    ///
    /// A response carrying a remote error is still `Ok`.
    async fn send(&self, request: Request) -> Result<Response>;

    /// Installs the inbound envelope handler, replacing any previous one.
    fn set_envelope_handler(&self, handler: EnvelopeHandler);

    /// Removes the inbound envelope handler.
    fn clear_envelope_handler(&self);

    /// Stops the link. Pending requests fail with `ConnectionClosed`.
    fn stop(&self);

    /// Returns `true` while the link is usable.
    fn is_alive(&self) -> bool;
}

// ============================================================================
// Connector
// ============================================================================

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `address`, optionally scoped to a room.
    async fn connect(&self, address: &str, room: Option<&str>) -> Result<Arc<dyn Transport>>;
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to the current transport.
///
/// Cheap to clone. Only the bootstrapper stops or replaces it; every other
/// component just borrows it to issue requests.
#[derive(Clone)]
pub struct Connection {
    /// Generation of the bootstrap attempt that created this connection.
    generation: Generation,
    /// Underlying transport.
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps a transport.
    pub(crate) fn new(generation: Generation, transport: Arc<dyn Transport>) -> Self {
        Self {
            generation,
            transport,
        }
    }

    /// Returns the generation this connection was created in.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `true` while the transport is usable.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Sends a command and returns the raw response.
    ///
    /// Use this when the caller must inspect a remote error itself.
    ///
    /// # Errors
    ///
    /// Transport-level failures only; remote errors stay in the response.
    pub async fn send(&self, route: RouteKey, command: impl Into<Command>) -> Result<Response> {
        let request = Request::new(route, command);
        trace!(route = %route, method = request.command.method(), "Sending request");
        self.transport.send(request).await
    }

    /// Sends a command and unwraps its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`](crate::Error::Transport) if the remote end reported an error.
    pub async fn execute(&self, route: RouteKey, command: impl Into<Command>) -> Result<Value> {
        self.send(route, command).await?.into_result()
    }

    /// Installs the inbound envelope handler.
    pub(crate) fn set_envelope_handler(&self, handler: EnvelopeHandler) {
        self.transport.set_envelope_handler(handler);
    }

    /// Stops the transport.
    pub(crate) fn stop(&self) {
        self.transport.clear_envelope_handler();
        self.transport.stop();
    }
}
