//! WebSocket transport and event loop.
//!
//! This module handles the WebSocket link to the remote debug server,
//! including request/response correlation and envelope routing.
//!
//! # Event Loop
//!
//! Each transport spawns a tokio task that handles:
//!
//! - Incoming messages (responses, envelopes)
//! - Outgoing requests from the API
//! - Request/response correlation by UUID
//! - Envelope handler callbacks

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{from_str, to_string};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::{Envelope, Request, Response};

use super::connection::{Connector, EnvelopeHandler, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

/// Query parameter carrying the room discriminator.
const ROOM_QUERY_KEY: &str = "room";

// ============================================================================
// Types
// ============================================================================

/// WebSocket stream type for client connections.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Response>>>;

/// Shared slot holding the envelope handler.
type HandlerSlot = Arc<Mutex<Option<EnvelopeHandler>>>;

// ============================================================================
// TransportCommand
// ============================================================================

/// Internal commands for the event loop.
enum TransportCommand {
    /// Send a request and wait for response.
    Send {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(RequestId),
    /// Shutdown the link.
    Shutdown,
}

// ============================================================================
// WsTransport
// ============================================================================

/// WebSocket link to a remote debug server.
///
/// Handles request/response correlation and envelope routing.
/// The transport spawns an internal event loop task.
pub struct WsTransport {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
    /// Envelope handler (shared with event loop).
    envelope_handler: HandlerSlot,
    /// Cleared when the event loop exits.
    alive: Arc<AtomicBool>,
    /// Per-request deadline.
    request_timeout: Duration,
}

impl WsTransport {
    /// Creates a new transport from a WebSocket stream.
    ///
    /// Spawns the event loop task internally.
    pub(crate) fn new(ws_stream: WsStream, request_timeout: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let envelope_handler: HandlerSlot = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&correlation),
            Arc::clone(&envelope_handler),
            Arc::clone(&alive),
        ));

        Self {
            command_tx,
            correlation,
            envelope_handler,
            alive,
            request_timeout,
        }
    }

    /// Returns the number of pending requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Sends a request and waits for response with custom timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the link is closed
    /// - [`Error::RequestTimeout`] if response not received within timeout
    /// - [`Error::Protocol`] if too many pending requests
    pub async fn send_with_timeout(
        &self,
        request: Request,
        request_timeout: Duration,
    ) -> Result<Response> {
        let request_id = request.id;

        {
            let correlation = self.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    correlation.len(),
                    MAX_PENDING_REQUESTS
                )));
            }
        }

        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(TransportCommand::Send {
                request,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(TransportCommand::RemoveCorrelation(request_id));

                Err(Error::request_timeout(
                    request_id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        envelope_handler: HandlerSlot,
        alive: Arc<AtomicBool>,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming_message(&text, &correlation, &envelope_handler);
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(TransportCommand::Send { request, response_tx }) => {
                            Self::handle_send_command(
                                request,
                                response_tx,
                                &mut ws_write,
                                &correlation,
                            ).await;
                        }

                        Some(TransportCommand::RemoveCorrelation(request_id)) => {
                            correlation.lock().remove(&request_id);
                            debug!(%request_id, "Removed timed-out correlation");
                        }

                        Some(TransportCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        Self::fail_pending_requests(&correlation);

        debug!("Event loop terminated");
    }

    /// Handles an incoming text message.
    fn handle_incoming_message(
        text: &str,
        correlation: &Arc<Mutex<CorrelationMap>>,
        envelope_handler: &HandlerSlot,
    ) {
        if let Ok(response) = from_str::<Response>(text) {
            let tx = correlation.lock().remove(&response.id);

            if let Some(tx) = tx {
                let _ = tx.send(Ok(response));
            } else {
                warn!(id = %response.id, "Response for unknown request");
            }

            return;
        }

        if let Ok(envelope) = from_str::<Envelope>(text) {
            let handler = envelope_handler.lock();
            if let Some(ref handler) = *handler {
                handler(envelope);
            }
            return;
        }

        warn!(text = %text, "Failed to parse incoming message");
    }

    /// Handles a send command from the API.
    async fn handle_send_command(
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
        ws_write: &mut SplitSink<WsStream, Message>,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) {
        let request_id = request.id;

        let json = match to_string(&request) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(Error::Json(e)));
                return;
            }
        };

        // Store correlation before sending
        correlation.lock().insert(request_id, response_tx);

        if let Err(e) = ws_write.send(Message::Text(json.into())).await
            && let Some(tx) = correlation.lock().remove(&request_id)
        {
            let _ = tx.send(Err(Error::connection(e.to_string())));
        }

        trace!(%request_id, "Request sent");
    }

    /// Fails all pending requests with ConnectionClosed error.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        self.send_with_timeout(request, self.request_timeout).await
    }

    fn set_envelope_handler(&self, handler: EnvelopeHandler) {
        *self.envelope_handler.lock() = Some(handler);
    }

    fn clear_envelope_handler(&self) {
        *self.envelope_handler.lock() = None;
    }

    fn stop(&self) {
        let _ = self.command_tx.send(TransportCommand::Shutdown);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ============================================================================
// WsConnector
// ============================================================================

/// Opens [`WsTransport`] links.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Per-request deadline for opened transports.
    request_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl WsConnector {
    /// Creates a connector whose transports use `request_timeout`.
    #[inline]
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Builds the endpoint URL for an address and optional room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is not a `ws`/`wss` URL.
    pub fn endpoint(address: &str, room: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(address)
            .map_err(|e| Error::config(format!("Invalid transport address {address}: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported transport scheme: {}",
                url.scheme()
            )));
        }

        if let Some(room) = room {
            url.query_pairs_mut().append_pair(ROOM_QUERY_KEY, room);
        }

        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str, room: Option<&str>) -> Result<Arc<dyn Transport>> {
        let url = Self::endpoint(address, room)?;

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

        info!(%url, "WebSocket connection established");

        Ok(Arc::new(WsTransport::new(ws_stream, self.request_timeout)))
    }
}

// ============================================================================
// Tests
// ============================================================================
