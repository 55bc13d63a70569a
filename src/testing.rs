//! Test doubles shared by unit tests.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use crate::capture::{CaptureClient, ClientCapabilities, FinishOutcome};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, FrameMetadata, Request, Response};
use crate::screencast::ScreencastConsumer;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::transport::{Connector, EnvelopeHandler, Transport};

// ============================================================================
// Logging
// ============================================================================

/// Installs a test subscriber honoring `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FakeTransport
// ============================================================================

/// Scripted reply for one request.
pub(crate) enum Reply {
    /// Success with a result payload.
    Ok(Value),
    /// Remote protocol error.
    RemoteError(i64, &'static str),
    /// Transport-level failure.
    Fail,
    /// Never answers.
    Hang,
}

/// In-memory transport recording every request.
#[derive(Default)]
pub(crate) struct FakeTransport {
    sent: Mutex<Vec<Request>>,
    replies: Mutex<FxHashMap<&'static str, VecDeque<Reply>>>,
    handler: Mutex<Option<EnvelopeHandler>>,
    stopped: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a reply for the next request with `method`.
    pub(crate) fn reply(&self, method: &'static str, reply: Reply) {
        self.replies
            .lock()
            .entry(method)
            .or_default()
            .push_back(reply);
    }

    /// Pushes an envelope through the installed handler.
    pub(crate) fn emit(&self, envelope: Envelope) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(envelope);
        }
    }

    /// Returns the methods sent so far, in order.
    pub(crate) fn methods(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|r| r.command.method()).collect()
    }

    /// Returns the requests sent with `method`.
    pub(crate) fn sent_with(&self, method: &str) -> Vec<Request> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.command.method() == method)
            .cloned()
            .collect()
    }

    /// Returns the serialized params of every request sent with `method`.
    pub(crate) fn params_of(&self, method: &str) -> Vec<Value> {
        self.sent_with(method)
            .iter()
            .map(|r| {
                serde_json::to_value(r)
                    .ok()
                    .and_then(|v| v.get("params").cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let id = request.id;
        let method = request.command.method();
        self.sent.lock().push(request);
        tokio::task::yield_now().await;

        let reply = self
            .replies
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front);

        match reply.unwrap_or(Reply::Ok(json!({}))) {
            Reply::Ok(result) => Ok(Response::success(id, result)),
            Reply::RemoteError(code, message) => Ok(Response::failure(id, code, message)),
            Reply::Fail => Err(Error::ConnectionClosed),
            Reply::Hang => std::future::pending().await,
        }
    }

    fn set_envelope_handler(&self, handler: EnvelopeHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn clear_envelope_handler(&self) {
        *self.handler.lock() = None;
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        !self.is_stopped()
    }
}

// ============================================================================
// FakeConnector
// ============================================================================

/// Connector handing out [`FakeTransport`]s after a per-address delay.
#[derive(Default)]
pub(crate) struct FakeConnector {
    delays: Mutex<FxHashMap<String, Duration>>,
    failures: Mutex<FxHashMap<String, String>>,
    opened: Mutex<Vec<(String, Option<String>, Arc<FakeTransport>)>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn delay(&self, address: &str, delay: Duration) {
        self.delays.lock().insert(address.to_string(), delay);
    }

    pub(crate) fn fail(&self, address: &str, message: &str) {
        self.failures
            .lock()
            .insert(address.to_string(), message.to_string());
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the transport opened for `address`, most recent first.
    pub(crate) fn transport(&self, address: &str) -> Option<Arc<FakeTransport>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(a, _, _)| a == address)
            .map(|(_, _, t)| Arc::clone(t))
    }

    pub(crate) fn room_of(&self, address: &str) -> Option<String> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(a, _, _)| a == address)
            .and_then(|(_, room, _)| room.clone())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &str, room: Option<&str>) -> Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.lock().get(address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().get(address).cloned();
        if let Some(message) = failure {
            return Err(Error::connection(message));
        }

        let transport = FakeTransport::new();
        self.opened.lock().push((
            address.to_string(),
            room.map(str::to_string),
            Arc::clone(&transport),
        ));
        Ok(transport)
    }
}

// ============================================================================
// RecordingConsumer
// ============================================================================

/// Screencast consumer recording frames and visibility changes.
#[derive(Default)]
pub(crate) struct RecordingConsumer {
    pub(crate) frames: Mutex<Vec<(String, FrameMetadata)>>,
    pub(crate) visibility: Mutex<Vec<bool>>,
}

impl RecordingConsumer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn frame_data(&self) -> Vec<String> {
        self.frames.lock().iter().map(|(d, _)| d.clone()).collect()
    }
}

impl ScreencastConsumer for RecordingConsumer {
    fn on_frame(&self, data: &str, metadata: &FrameMetadata) {
        self.frames.lock().push((data.to_string(), metadata.clone()));
    }

    fn on_visibility_changed(&self, visible: bool) {
        self.visibility.lock().push(visible);
    }
}

// ============================================================================
// RecordingClient
// ============================================================================

/// One notification received by [`RecordingClient`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notice {
    EventsCollected(usize),
    Complete,
    BufferUsage(f64),
    Progress(f64, Option<String>),
    Finished(FinishOutcome),
    NeedConversion(bool),
}

/// Capture client recording every notification.
pub(crate) struct RecordingClient {
    capabilities: ClientCapabilities,
    pub(crate) notices: Mutex<Vec<Notice>>,
}

impl RecordingClient {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_capabilities(ClientCapabilities::all())
    }

    pub(crate) fn with_capabilities(capabilities: ClientCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            notices: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub(crate) fn progress_values(&self) -> Vec<f64> {
        self.notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notice::Progress(value, None) => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn progress_labels(&self) -> Vec<String> {
        self.notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notice::Progress(_, Some(label)) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn finished(&self) -> Vec<FinishOutcome> {
        self.notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notice::Finished(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CaptureClient for RecordingClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
    }

    fn trace_events_collected(&self, events: &[Value]) {
        self.notices.lock().push(Notice::EventsCollected(events.len()));
    }

    fn tracing_complete(&self) {
        self.notices.lock().push(Notice::Complete);
    }

    fn tracing_buffer_usage(&self, ratio: f64) {
        self.notices.lock().push(Notice::BufferUsage(ratio));
    }

    fn events_retrieval_progress(&self, value: f64, label: Option<&str>) {
        self.notices
            .lock()
            .push(Notice::Progress(value, label.map(str::to_string)));
    }

    fn tracing_finished(&self, outcome: FinishOutcome) {
        self.notices.lock().push(Notice::Finished(outcome));
    }

    fn trace_need_conversion(&self, pending: bool) {
        self.notices.lock().push(Notice::NeedConversion(pending));
    }
}

// ============================================================================
// RecordingTelemetry
// ============================================================================

/// Telemetry sink keeping every event.
#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    pub(crate) events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
