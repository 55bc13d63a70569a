//! Capture lifecycle.
//!
//! ```text
//! Idle ─start─► Starting ─ok─► Recording ─stop─► Stopping
//!                  │                               │ Tracing.tracingComplete
//!                  └─error─► Idle                  ▼
//!             Idle ◄─finished─ Converting ◄─eof─ Draining
//! ```
//!
//! Tracing commands and events travel on the browser-level route of the
//! inspected client; trace mode, reload and the screencast use the page
//! route.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{SessionConfig, Settings, SharedSettings};
use crate::error::{Error, Result};
use crate::identifiers::{CaptureToken, RouteKey};
use crate::protocol::{
    DevtoolCommand, Envelope, PageCommand, ParsedEvent, TraceConfig, TracingCommand, TransferMode,
};
use crate::screencast::ScreencastController;
use crate::telemetry::{LogTelemetry, Telemetry, TelemetryEvent};
use crate::transport::{Bootstrapper, Connection};

use super::client::{CaptureClient, FinishOutcome};
use super::drain::{close_stream, drain_stream};
use super::state::{
    CapturePhase, CaptureSession, buffer_usage_ratio, included_categories, progress_label,
    progress_ratio,
};
use super::worker::{ConversionWorker, JsonTraceConverter, TraceConverter, WorkerMessage};

// ============================================================================
// Constants
// ============================================================================

/// Remote buffer record mode.
pub const RECORD_MODE: &str = "recordUntilFull";

// ============================================================================
// CaptureManagerBuilder
// ============================================================================

/// Builder for [`CaptureManager`].
pub struct CaptureManagerBuilder {
    bootstrapper: Bootstrapper,
    page_route: RouteKey,
    config: SessionConfig,
    settings: SharedSettings,
    screencast: Option<ScreencastController>,
    telemetry: Arc<dyn Telemetry>,
    converter: Arc<dyn TraceConverter>,
}

impl CaptureManagerBuilder {
    /// Sets timeouts, chunk size and buffer budget.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the settings map.
    #[must_use]
    pub fn settings(mut self, settings: SharedSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the screencast that a capture suspends.
    #[must_use]
    pub fn screencast(mut self, screencast: ScreencastController) -> Self {
        self.screencast = Some(screencast);
        self
    }

    /// Sets the telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the trace converter.
    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn TraceConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Builds the manager and subscribes to the tracing route.
    #[must_use]
    pub fn build(self) -> CaptureManager {
        let inner = Arc::new(CaptureInner {
            tracing_route: self.page_route.browser(),
            page_route: self.page_route,
            bootstrapper: self.bootstrapper,
            config: self.config,
            settings: self.settings,
            screencast: self.screencast,
            telemetry: self.telemetry,
            worker: ConversionWorker::new(self.converter),
            session: Mutex::new(None),
            completion: Mutex::new(None),
            cleanup: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let mut backlog =
            inner
                .bootstrapper
                .dispatcher()
                .listen(inner.tracing_route, move |envelope| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_envelope(envelope);
                    }
                });
        for envelope in backlog.take() {
            inner.handle_envelope(envelope);
        }
        backlog.release();

        CaptureManager { inner }
    }
}

// ============================================================================
// CaptureManager
// ============================================================================

struct CaptureInner {
    bootstrapper: Bootstrapper,
    tracing_route: RouteKey,
    page_route: RouteKey,
    config: SessionConfig,
    settings: SharedSettings,
    screencast: Option<ScreencastController>,
    telemetry: Arc<dyn Telemetry>,
    worker: ConversionWorker,
    session: Mutex<Option<CaptureSession>>,
    completion: Mutex<Option<JoinHandle<()>>>,
    /// Remote cleanup left by the last reset.
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

/// Runs captures for one inspected client.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CaptureManager {
    inner: Arc<CaptureInner>,
}

impl fmt::Debug for CaptureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureManager")
            .field("route", &self.inner.tracing_route)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl CaptureManager {
    /// Starts building a manager for the client owning `page_route`.
    #[must_use]
    pub fn builder(bootstrapper: Bootstrapper, page_route: RouteKey) -> CaptureManagerBuilder {
        CaptureManagerBuilder {
            bootstrapper,
            page_route,
            config: SessionConfig::default(),
            settings: Settings::default().shared(),
            screencast: None,
            telemetry: Arc::new(LogTelemetry),
            converter: Arc::new(JsonTraceConverter),
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> CapturePhase {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(CapturePhase::Idle, |s| s.phase)
    }

    /// Returns `true` while a capture session exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Returns the token of the current capture session.
    #[must_use]
    pub fn token(&self) -> Option<CaptureToken> {
        self.inner.session.lock().as_ref().map(|s| s.token)
    }

    /// Starts a capture for `client`.
    ///
    /// `category_filter` is a comma separated list added to the required
    /// categories. `options` is forwarded to the remote end as is and
    /// omitted when blank. Returns the remote start result.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyActive`] if a capture is running
    /// - Any transport or remote error; the manager returns to idle
    pub async fn start(
        &self,
        client: Arc<dyn CaptureClient>,
        category_filter: &str,
        options: &str,
    ) -> Result<Value> {
        let inner = &self.inner;
        let settings = inner.settings.read().clone();

        let token = {
            let mut session = inner.session.lock();
            if session.is_some() {
                return Err(Error::already_active("capture"));
            }
            let created = CaptureSession::new(client, settings.screencast_enabled);
            let token = created.token;
            *session = Some(created);
            token
        };
        debug!(%token, "Capture starting");

        let cleanup = inner.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            let _ = cleanup.await;
        }

        let categories = included_categories(category_filter, &settings);
        let category_count = categories.len();
        let command = TracingCommand::Start {
            trace_config: TraceConfig {
                included_categories: categories,
                record_mode: RECORD_MODE.to_string(),
                trace_buffer_size_kb: inner.config.trace_buffer_size_kb,
            },
            transfer_mode: TransferMode::ReturnAsStream,
            buffer_usage_reporting_interval: inner.config.buffer_usage_interval.as_millis() as u64,
            options: Some(options.trim())
                .filter(|o| !o.is_empty())
                .map(str::to_string),
        };

        let outcome = match inner.bootstrapper.current().await {
            Ok(connection) => match connection.execute(inner.tracing_route, command).await {
                Ok(result) => Ok((connection, result)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (connection, result) = match outcome {
            Ok(started) => started,
            Err(e) => {
                inner.clear_session(token);
                warn!(%token, error = %e, "Capture start failed");
                inner.telemetry.record(TelemetryEvent::CaptureStartFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        if let Some(screencast) = &inner.screencast
            && let Err(e) = screencast.suspend().await
        {
            warn!(error = %e, "Screencast suspend failed");
        }
        inner.set_trace_mode(&connection, true).await;

        if !inner.set_phase(token, CapturePhase::Recording) {
            warn!(%token, "Capture reset while starting");
            inner.end_trace(&connection).await;
            inner
                .leave_capture_mode(&connection, settings.screencast_enabled)
                .await;
            return Err(Error::not_active("capture"));
        }

        inner
            .telemetry
            .record(TelemetryEvent::CaptureStarted { category_count });
        info!(%token, category_count, "Capture recording");
        Ok(result)
    }

    /// Ends the capture.
    ///
    /// Draining starts when the remote end reports completion. If the end
    /// request itself fails, the client is told the capture failed and the
    /// session stays in place.
    ///
    /// # Errors
    ///
    /// - [`Error::NotActive`] if no capture is running
    /// - [`Error::AlreadyFinishing`] if a stop is already underway
    /// - The end request's own failure
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;

        let (token, client) = {
            let mut session = inner.session.lock();
            let Some(session) = session.as_mut() else {
                return Err(Error::not_active("capture"));
            };
            if session.finishing {
                return Err(Error::already_finishing("capture"));
            }
            session.finishing = true;
            session.phase = CapturePhase::Stopping;
            (session.token, Arc::clone(&session.client))
        };
        debug!(%token, "Capture stopping");

        let outcome = match inner.bootstrapper.current().await {
            Ok(connection) => connection.send(inner.tracing_route, TracingCommand::End).await,
            Err(e) => Err(e),
        };

        let failure = match outcome {
            Ok(response) => match response.error {
                None => return Ok(()),
                Some(error) => {
                    let payload = serde_json::to_value(&error).unwrap_or(Value::Null);
                    (payload, Error::from(error))
                }
            },
            Err(e) => (json!({ "message": e.to_string() }), e),
        };

        let (payload, error) = failure;
        warn!(%token, error = %error, "Capture end request failed");
        if client.capabilities().tracing_finished {
            client.tracing_finished(FinishOutcome::failure(Some(payload)));
        }
        Err(error)
    }

    /// Drops the capture session and aborts any drain or conversion.
    ///
    /// Remote state the capture changed is restored in the background: a
    /// running trace is ended, an open stream is closed, trace mode is
    /// cleared and a suspended screencast resumes. The next [`start`]
    /// waits for that cleanup.
    ///
    /// [`start`]: Self::start
    pub fn reset(&self) {
        if let Some(task) = self.inner.completion.lock().take() {
            task.abort();
        }

        let session = self.inner.session.lock().take();
        let Some(session) = session else {
            return;
        };

        info!(token = %session.token, phase = %session.phase, "Capture reset");
        if session.phase == CapturePhase::Converting
            && session.client.capabilities().trace_need_conversion
        {
            session.client.trace_need_conversion(false);
        }
        self.inner.schedule_cleanup(&session);
    }

    /// Stops the conversion worker and unsubscribes from the tracing route.
    pub(crate) fn detach(&self) {
        self.reset();
        self.inner.worker.shutdown();
        self.inner
            .bootstrapper
            .dispatcher()
            .remove(self.inner.tracing_route);
    }
}

// ============================================================================
// Event handling
// ============================================================================

impl CaptureInner {
    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope.parse() {
            ParsedEvent::TracingBufferUsage {
                percent_full,
                event_count,
                value,
            } => self.on_buffer_usage(percent_full, event_count, value),
            ParsedEvent::TracingDataCollected { events } => self.on_data_collected(&events),
            ParsedEvent::TracingComplete {
                stream,
                data_loss_occurred,
            } => self.on_complete(stream, data_loss_occurred),
            other => trace!(event = ?other, "Ignoring browser event"),
        }
    }

    fn on_buffer_usage(&self, percent_full: Option<f64>, event_count: Option<u64>, value: Option<f64>) {
        let client = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut() else {
                return;
            };
            if let Some(count) = event_count {
                session.buffer_budget = Some(count);
            }
            Arc::clone(&session.client)
        };

        client.tracing_buffer_usage(buffer_usage_ratio(percent_full, value));
    }

    fn on_data_collected(&self, events: &[Value]) {
        let (client, ratio) = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut() else {
                trace!(count = events.len(), "Trace events without a capture");
                return;
            };
            session.events_retrieved += events.len() as u64;
            let budget = session.buffer_budget.filter(|b| *b > 0);
            if let Some(budget) = budget {
                session.events_retrieved = session.events_retrieved.min(budget);
            }
            let ratio = budget.map(|b| progress_ratio(session.events_retrieved, Some(b)));
            (Arc::clone(&session.client), ratio)
        };

        client.trace_events_collected(events);
        if let Some(ratio) = ratio {
            client.events_retrieval_progress(ratio, None);
        }
    }

    fn on_complete(self: &Arc<Self>, stream: Option<String>, data_loss_occurred: bool) {
        let token = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut() else {
                debug!("Capture completion without a capture");
                return;
            };
            if matches!(
                session.phase,
                CapturePhase::Draining | CapturePhase::Converting
            ) {
                warn!(token = %session.token, "Duplicate capture completion ignored");
                return;
            }
            session.phase = CapturePhase::Draining;
            session.stream.clone_from(&stream);
            session.token
        };

        if data_loss_occurred {
            warn!(%token, "Remote trace buffer overflowed");
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.finish(token, stream).await });
        *self.completion.lock() = Some(task);
    }

    // ========================================================================
    // Drain and conversion
    // ========================================================================

    async fn finish(self: Arc<Self>, token: CaptureToken, stream: Option<String>) {
        let Some(client) = self.client_for(token) else {
            return;
        };

        let connection = match self.bootstrapper.current().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%token, error = %e, "No connection to drain capture");
                self.fail(token, &client, json!({ "message": e.to_string() }));
                return;
            }
        };

        let raw = match &stream {
            Some(handle) => Some(self.drain(token, &connection, handle, &client).await),
            None => {
                warn!(%token, "Capture completed without a stream");
                None
            }
        };

        if self.client_for(token).is_none() {
            return;
        }
        client.tracing_complete();
        self.restore(token, &connection).await;

        match raw {
            Some(raw) => self.convert(token, raw, &client).await,
            None => self.fail(
                token,
                &client,
                json!({ "message": "capture completed without a stream" }),
            ),
        }
    }

    async fn drain(
        &self,
        token: CaptureToken,
        connection: &Connection,
        handle: &str,
        client: &Arc<dyn CaptureClient>,
    ) -> Vec<u8> {
        let started = Instant::now();
        let progress_client = Arc::clone(client);

        let drained = drain_stream(
            connection,
            self.tracing_route,
            handle,
            self.config.read_chunk_size,
            move |bytes| {
                progress_client.events_retrieval_progress(1.0, Some(&progress_label(bytes)));
            },
        )
        .await;

        if let Some(e) = &drained.error {
            warn!(%token, error = %e, bytes = drained.bytes.len(), "Drain ended early, converting partial trace");
        }

        let bytes = drained.bytes.len();
        if let Some(session) = self.session.lock().as_mut()
            && session.token == token
        {
            session.payload_bytes = bytes;
        }
        self.telemetry.record(TelemetryEvent::CaptureTransmitted {
            bytes,
            duration: started.elapsed(),
        });
        debug!(%token, bytes, chunks = drained.chunks, eof = drained.eof, "Capture drained");

        drained.bytes
    }

    /// Restores what the capture changed on the remote end.
    async fn restore(&self, token: CaptureToken, connection: &Connection) {
        let screencast_enabled = self
            .session
            .lock()
            .as_ref()
            .filter(|s| s.token == token)
            .is_some_and(|s| s.screencast_enabled);

        self.leave_capture_mode(connection, screencast_enabled).await;

        let reload = PageCommand::Reload {
            ignore_cache: false,
        };
        if let Err(e) = connection.execute(self.page_route, reload).await {
            warn!(error = %e, "Page reload after capture failed");
        }
    }

    async fn convert(&self, token: CaptureToken, raw: Vec<u8>, client: &Arc<dyn CaptureClient>) {
        let bytes = raw.len();
        let capabilities = client.capabilities();
        self.set_phase(token, CapturePhase::Converting);
        if capabilities.trace_need_conversion {
            client.trace_need_conversion(true);
        }

        let started = Instant::now();
        let mut messages = match self.worker.submit(raw) {
            Ok(messages) => messages,
            Err(e) => {
                self.fail_conversion(token, client, &e);
                return;
            }
        };

        let result = loop {
            match messages.recv().await {
                Some(WorkerMessage::Progress(message)) => {
                    if self.client_for(token).is_some() {
                        client.events_retrieval_progress(1.0, Some(&message));
                    }
                }
                Some(WorkerMessage::Done(result)) => break result,
                None => break Err(Error::WorkerStopped),
            }
        };

        if self.client_for(token).is_none() {
            return;
        }

        match result {
            Ok(converted) => {
                self.telemetry.record(TelemetryEvent::CaptureConverted {
                    bytes,
                    duration: started.elapsed(),
                });
                info!(%token, bytes, "Capture converted");
                if capabilities.tracing_finished {
                    client.tracing_finished(FinishOutcome::success(converted));
                }
                if capabilities.trace_need_conversion {
                    client.trace_need_conversion(false);
                }
                self.clear_session(token);
            }
            Err(e) => self.fail_conversion(token, client, &e),
        }
    }

    fn fail_conversion(&self, token: CaptureToken, client: &Arc<dyn CaptureClient>, error: &Error) {
        warn!(%token, error = %error, "Capture conversion failed");
        let capabilities = client.capabilities();
        if capabilities.tracing_finished {
            client.tracing_finished(FinishOutcome::failure(Some(
                json!({ "message": error.to_string() }),
            )));
        }
        if capabilities.trace_need_conversion {
            client.trace_need_conversion(false);
        }
        self.clear_session(token);
    }

    fn fail(&self, token: CaptureToken, client: &Arc<dyn CaptureClient>, payload: Value) {
        if client.capabilities().tracing_finished {
            client.tracing_finished(FinishOutcome::failure(Some(payload)));
        }
        self.clear_session(token);
    }

    // ========================================================================
    // Reset cleanup
    // ========================================================================

    fn schedule_cleanup(self: &Arc<Self>, session: &CaptureSession) {
        // Starting undoes its own changes; Converting was already restored.
        let (end_trace, stream) = match session.phase {
            CapturePhase::Recording | CapturePhase::Stopping => (true, None),
            CapturePhase::Draining => (false, session.stream.clone()),
            _ => return,
        };

        let Ok(runtime) = Handle::try_current() else {
            warn!(token = %session.token, "No runtime for capture cleanup");
            return;
        };

        let inner = Arc::clone(self);
        let token = session.token;
        let screencast_enabled = session.screencast_enabled;
        let task = runtime.spawn(async move {
            inner
                .cleanup_remote(token, end_trace, stream, screencast_enabled)
                .await;
        });
        *self.cleanup.lock() = Some(task);
    }

    async fn cleanup_remote(
        &self,
        token: CaptureToken,
        end_trace: bool,
        stream: Option<String>,
        screencast_enabled: bool,
    ) {
        let connection = match self.bootstrapper.current().await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(%token, error = %e, "No connection for capture cleanup");
                return;
            }
        };

        if end_trace {
            self.end_trace(&connection).await;
        }
        if let Some(handle) = stream {
            close_stream(&connection, self.tracing_route, &handle).await;
        }
        self.leave_capture_mode(&connection, screencast_enabled).await;
        debug!(%token, "Capture cleanup done");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Clears trace mode and resumes a suspended screencast.
    async fn leave_capture_mode(&self, connection: &Connection, screencast_enabled: bool) {
        if screencast_enabled
            && let Some(screencast) = &self.screencast
            && let Err(e) = screencast.resume().await
        {
            warn!(error = %e, "Screencast resume failed");
        }

        self.set_trace_mode(connection, false).await;
    }

    async fn end_trace(&self, connection: &Connection) {
        if let Err(e) = connection.execute(self.tracing_route, TracingCommand::End).await {
            warn!(error = %e, "Ending abandoned trace failed");
        }
    }

    async fn set_trace_mode(&self, connection: &Connection, enabled: bool) {
        let command = DevtoolCommand::SetTraceMode { enabled };
        if let Err(e) = connection.execute(self.page_route, command).await {
            warn!(enabled, error = %e, "Trace mode update failed");
        }
    }

    /// Returns the client if `token` is still the current session.
    fn client_for(&self, token: CaptureToken) -> Option<Arc<dyn CaptureClient>> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.token == token)
            .map(|s| Arc::clone(&s.client))
    }

    /// Moves the session to `phase`; `false` if `token` is no longer current.
    fn set_phase(&self, token: CaptureToken, phase: CapturePhase) -> bool {
        match self.session.lock().as_mut() {
            Some(session) if session.token == token => {
                debug!(%token, from = %session.phase, to = %phase, "Capture phase");
                session.phase = phase;
                true
            }
            _ => false,
        }
    }

    fn clear_session(&self, token: CaptureToken) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.token == token)
            && let Some(finished) = session.take()
        {
            debug!(
                %token,
                elapsed_ms = finished.started_at.elapsed().as_millis() as u64,
                payload_bytes = finished.payload_bytes,
                "Capture session cleared"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use crate::capture::ClientCapabilities;
    use crate::dispatcher::Dispatcher;
    use crate::screencast::{ScreencastConsumer, ScreencastOptions};
    use crate::testing::{
        FakeConnector, FakeTransport, Notice, RecordingClient, RecordingConsumer,
        RecordingTelemetry, Reply, init_tracing,
    };
    use crate::transport::Connector;

    const PAGE: RouteKey = RouteKey::from_raw(2, 9);
    const BROWSER: RouteKey = RouteKey::from_raw(2, 0);

    struct Harness {
        transport: Arc<FakeTransport>,
        manager: CaptureManager,
        screencast: ScreencastController,
        telemetry: Arc<RecordingTelemetry>,
        client: Arc<RecordingClient>,
    }

    async fn harness_with(settings: Settings, client: Arc<RecordingClient>) -> Harness {
        init_tracing();
        let connector = FakeConnector::new();
        let bootstrapper = Bootstrapper::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Dispatcher::default(),
        );
        bootstrapper.connect("ws://device", None).await.unwrap();

        let settings = settings.shared();
        let telemetry = RecordingTelemetry::new();
        let screencast = ScreencastController::new(bootstrapper.clone(), PAGE, settings.clone());
        let manager = CaptureManager::builder(bootstrapper, PAGE)
            .settings(settings)
            .screencast(screencast.clone())
            .telemetry(Arc::clone(&telemetry) as Arc<dyn Telemetry>)
            .build();

        Harness {
            transport: connector.transport("ws://device").unwrap(),
            manager,
            screencast,
            telemetry,
            client,
        }
    }

    async fn harness() -> Harness {
        harness_with(Settings::default(), RecordingClient::new()).await
    }

    impl Harness {
        fn client(&self) -> Arc<dyn CaptureClient> {
            Arc::clone(&self.client) as Arc<dyn CaptureClient>
        }

        fn emit(&self, method: &str, params: Value) {
            self.transport.emit(Envelope::new(BROWSER, method, params));
        }

        async fn wait_until(&self, done: impl Fn(&Self) -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !done(self) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("condition not reached in time");
        }

        async fn wait_idle(&self) {
            self.wait_until(|h| h.manager.phase() == CapturePhase::Idle)
                .await;
        }

        async fn start_screencast(&self) {
            self.screencast
                .start(
                    ScreencastOptions::new(),
                    RecordingConsumer::new() as Arc<dyn ScreencastConsumer>,
                )
                .await
                .unwrap();
        }
    }

    fn chunk(bytes: &[u8], eof: bool) -> Reply {
        Reply::Ok(json!({"data": STANDARD.encode(bytes), "eof": eof, "base64Encoded": true}))
    }

    #[tokio::test]
    async fn test_start_configures_remote_capture() {
        let settings = Settings {
            capture_screenshots: true,
            ..Settings::default()
        };
        let h = harness_with(settings, RecordingClient::new()).await;

        h.manager
            .start(h.client(), "custom.category", "sampling-frequency=10000")
            .await
            .unwrap();

        assert_eq!(h.manager.phase(), CapturePhase::Recording);
        let start = &h.transport.sent_with("Tracing.start")[0];
        assert_eq!(start.route(), BROWSER);

        let params = &h.transport.params_of("Tracing.start")[0];
        assert_eq!(params["transferMode"], "ReturnAsStream");
        assert_eq!(params["bufferUsageReportingInterval"], 500);
        assert_eq!(params["options"], "sampling-frequency=10000");
        assert_eq!(params["traceConfig"]["recordMode"], RECORD_MODE);
        assert_eq!(params["traceConfig"]["traceBufferSizeInKb"], 200 * 1024);
        let categories = params["traceConfig"]["includedCategories"].as_array().unwrap();
        assert!(categories.contains(&json!("custom.category")));
        assert!(categories.contains(&json!("disabled-by-default-devtools.screenshot")));

        let trace_mode = h.transport.sent_with("Devtool.setTraceMode");
        assert_eq!(trace_mode[0].route(), PAGE);
        assert_eq!(
            h.transport.params_of("Devtool.setTraceMode"),
            vec![json!({"enabled": true})]
        );
        assert!(matches!(
            h.telemetry.events()[..],
            [TelemetryEvent::CaptureStarted { .. }]
        ));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let h = harness().await;
        h.manager.start(h.client(), "", " ").await.unwrap();
        let token = h.manager.token();
        assert!(h.transport.params_of("Tracing.start")[0].get("options").is_none());

        let err = h.manager.start(h.client(), "", "").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive { .. }));
        assert!(err.is_contract_violation());
        assert_eq!(h.manager.phase(), CapturePhase::Recording);
        assert_eq!(h.manager.token(), token);
        assert_eq!(h.transport.sent_with("Tracing.start").len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_returns_to_idle() {
        let h = harness().await;
        h.transport
            .reply("Tracing.start", Reply::RemoteError(-32601, "tracing unavailable"));

        let err = h.manager.start(h.client(), "", "").await.unwrap_err();
        assert!(matches!(err, Error::Transport { code: -32601, .. }));
        assert_eq!(h.manager.phase(), CapturePhase::Idle);
        assert!(matches!(
            h.telemetry.events()[..],
            [TelemetryEvent::CaptureStartFailed { .. }]
        ));
        assert!(h.transport.sent_with("Devtool.setTraceMode").is_empty());

        h.manager.start(h.client(), "", "").await.unwrap();
        assert_eq!(h.manager.phase(), CapturePhase::Recording);
    }

    #[tokio::test]
    async fn test_start_suspends_screencast() {
        let h = harness().await;
        let consumer = RecordingConsumer::new();
        h.screencast
            .start(
                ScreencastOptions::new(),
                Arc::clone(&consumer) as Arc<dyn ScreencastConsumer>,
            )
            .await
            .unwrap();

        h.manager.start(h.client(), "", "").await.unwrap();

        assert!(!h.screencast.is_active());
        assert_eq!(h.transport.sent_with("Page.stopScreencast").len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_usage_and_progress() {
        let h = harness().await;
        h.manager.start(h.client(), "", "").await.unwrap();

        h.emit("Tracing.dataCollected", json!({"value": [{}, {}]}));
        h.emit(
            "Tracing.bufferUsage",
            json!({"percentFull": 0.25, "eventCount": 100, "value": 0.9}),
        );
        h.emit("Tracing.bufferUsage", json!({"value": 0.3}));
        h.emit("Tracing.dataCollected", json!({"value": vec![json!({}); 48]}));
        h.emit("Tracing.dataCollected", json!({"value": vec![json!({}); 100]}));

        let notices = h.client.notices();
        assert_eq!(
            notices,
            vec![
                Notice::EventsCollected(2),
                Notice::BufferUsage(0.25),
                Notice::BufferUsage(0.3),
                Notice::EventsCollected(48),
                Notice::Progress(0.5, None),
                Notice::EventsCollected(100),
                Notice::Progress(1.0, None),
            ]
        );
        assert_eq!(h.client.progress_values(), vec![0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_events_without_capture_ignored() {
        let h = harness().await;
        h.emit("Tracing.dataCollected", json!({"value": [{}]}));
        h.emit("Tracing.bufferUsage", json!({"percentFull": 0.5}));
        assert!(h.client.notices().is_empty());
    }

    #[tokio::test]
    async fn test_stop_contracts() {
        let h = harness().await;
        assert!(matches!(
            h.manager.stop().await,
            Err(Error::NotActive { .. })
        ));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        assert_eq!(h.manager.phase(), CapturePhase::Stopping);

        assert!(matches!(
            h.manager.stop().await,
            Err(Error::AlreadyFinishing { .. })
        ));
        assert_eq!(h.transport.sent_with("Tracing.end").len(), 1);
    }

    #[tokio::test]
    async fn test_end_error_reported_to_client() {
        let h = harness().await;
        h.transport
            .reply("Tracing.end", Reply::RemoteError(-32000, "not tracing"));
        h.manager.start(h.client(), "", "").await.unwrap();

        let err = h.manager.stop().await.unwrap_err();
        assert!(matches!(err, Error::Transport { code: -32000, .. }));

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].success);
        assert_eq!(
            finished[0].result,
            Some(json!({"code": -32000, "message": "not tracing"}))
        );
        assert_eq!(h.manager.phase(), CapturePhase::Stopping);
    }

    #[tokio::test]
    async fn test_end_transport_failure_reported_to_client() {
        let h = harness().await;
        h.transport.reply("Tracing.end", Reply::Fail);
        h.manager.start(h.client(), "", "").await.unwrap();

        let err = h.manager.stop().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].success);
        assert_eq!(
            finished[0].result,
            Some(json!({"message": Error::ConnectionClosed.to_string()}))
        );
        assert_eq!(h.manager.phase(), CapturePhase::Stopping);
    }

    #[tokio::test]
    async fn test_end_error_respects_capabilities() {
        let h = harness_with(
            Settings::default(),
            RecordingClient::with_capabilities(ClientCapabilities::none()),
        )
        .await;
        h.transport
            .reply("Tracing.end", Reply::RemoteError(-32000, "not tracing"));
        h.manager.start(h.client(), "", "").await.unwrap();

        assert!(h.manager.stop().await.is_err());
        assert!(h.client.finished().is_empty());
    }

    #[tokio::test]
    async fn test_full_capture_lifecycle() {
        let h = harness().await;
        let consumer = RecordingConsumer::new();
        h.screencast
            .start(
                ScreencastOptions::new(),
                Arc::clone(&consumer) as Arc<dyn ScreencastConsumer>,
            )
            .await
            .unwrap();

        let trace = br#"[{"name":"a"},{"name":"b"}]"#;
        h.transport.reply("IO.read", chunk(&trace[..10], false));
        h.transport.reply("IO.read", chunk(&trace[10..], true));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-1"}));
        h.wait_idle().await;

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].success);
        assert_eq!(
            finished[0].result,
            Some(json!({"traceEvents": [{"name": "a"}, {"name": "b"}]}))
        );

        let notices = h.client.notices();
        let complete = notices.iter().position(|n| *n == Notice::Complete).unwrap();
        let converting = notices
            .iter()
            .position(|n| *n == Notice::NeedConversion(true))
            .unwrap();
        let done = notices
            .iter()
            .position(|n| matches!(n, Notice::Finished(_)))
            .unwrap();
        assert!(complete < converting && converting < done);
        assert_eq!(notices.last(), Some(&Notice::NeedConversion(false)));
        assert!(
            h.client
                .progress_labels()
                .contains(&"Retrieving trace data: 0.0 MB".to_string())
        );

        let methods = h.transport.methods();
        let close = methods.iter().position(|m| *m == "IO.close").unwrap();
        let reload = methods.iter().position(|m| *m == "Page.reload").unwrap();
        assert!(close < reload);
        assert_eq!(
            h.transport.params_of("Devtool.setTraceMode"),
            vec![json!({"enabled": true}), json!({"enabled": false})]
        );
        assert_eq!(h.transport.sent_with("Page.startScreencast").len(), 2);
        assert!(h.screencast.is_active());

        let events = h.telemetry.events();
        assert!(events.iter().any(|e| matches!(
            e,
            TelemetryEvent::CaptureTransmitted { bytes, .. } if *bytes == trace.len()
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, TelemetryEvent::CaptureConverted { .. })));

        h.manager.start(h.client(), "", "").await.unwrap();
        assert_eq!(h.manager.phase(), CapturePhase::Recording);
    }

    #[tokio::test]
    async fn test_screencast_not_restored_when_disabled() {
        let settings = Settings {
            screencast_enabled: false,
            ..Settings::default()
        };
        let h = harness_with(settings, RecordingClient::new()).await;
        let consumer = RecordingConsumer::new();
        h.screencast
            .start(
                ScreencastOptions::new(),
                Arc::clone(&consumer) as Arc<dyn ScreencastConsumer>,
            )
            .await
            .unwrap();
        h.transport.reply("IO.read", chunk(b"[]", true));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-2"}));
        h.wait_idle().await;

        assert!(!h.screencast.is_active());
        assert_eq!(h.transport.sent_with("Page.startScreencast").len(), 1);
    }

    #[tokio::test]
    async fn test_completion_without_stream_fails() {
        let h = harness().await;
        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();

        h.emit("Tracing.tracingComplete", json!({}));
        h.wait_idle().await;

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].success);
        assert!(h.transport.sent_with("IO.read").is_empty());
        assert_eq!(h.transport.sent_with("Page.reload").len(), 1);
    }

    #[tokio::test]
    async fn test_conversion_failure_finishes_unsuccessfully() {
        let h = harness().await;
        h.transport.reply("IO.read", chunk(b"not a trace", true));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-3"}));
        h.wait_idle().await;

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].success);
        assert_eq!(h.client.notices().last(), Some(&Notice::NeedConversion(false)));
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let h = harness().await;
        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();

        h.manager.reset();
        assert_eq!(h.manager.phase(), CapturePhase::Idle);
        assert!(!h.manager.is_active());

        h.emit("Tracing.tracingComplete", json!({"stream": "stale"}));
        tokio::task::yield_now().await;
        assert!(h.transport.sent_with("IO.read").is_empty());

        h.manager.start(h.client(), "", "").await.unwrap();
        assert_eq!(h.manager.phase(), CapturePhase::Recording);
    }

    #[tokio::test]
    async fn test_reset_restores_remote_state() {
        let h = harness().await;
        h.start_screencast().await;
        h.manager.start(h.client(), "", "").await.unwrap();
        assert!(!h.screencast.is_active());

        h.manager.reset();
        h.wait_until(|h| h.transport.sent_with("Devtool.setTraceMode").len() == 2)
            .await;

        let end = h.transport.sent_with("Tracing.end");
        assert_eq!(end.len(), 1);
        assert_eq!(end[0].route(), BROWSER);
        assert_eq!(
            h.transport.params_of("Devtool.setTraceMode"),
            vec![json!({"enabled": true}), json!({"enabled": false})]
        );
        assert!(h.screencast.is_active());
        assert_eq!(h.transport.sent_with("Page.startScreencast").len(), 2);
        assert!(h.transport.sent_with("IO.close").is_empty());

        h.manager.start(h.client(), "", "").await.unwrap();
        assert_eq!(h.manager.phase(), CapturePhase::Recording);
        assert_eq!(
            h.transport.params_of("Devtool.setTraceMode").last(),
            Some(&json!({"enabled": true}))
        );
        assert_eq!(h.transport.sent_with("Page.stopScreencast").len(), 2);
    }

    #[tokio::test]
    async fn test_reset_while_draining_closes_stream() {
        let h = harness().await;
        h.transport.reply("IO.read", Reply::Hang);
        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-9"}));
        h.wait_until(|h| !h.transport.sent_with("IO.read").is_empty())
            .await;
        assert_eq!(h.manager.phase(), CapturePhase::Draining);

        h.manager.reset();
        h.wait_until(|h| h.transport.sent_with("Devtool.setTraceMode").len() == 2)
            .await;

        assert_eq!(
            h.transport.params_of("IO.close"),
            vec![json!({"handle": "trace-9"})]
        );
        assert_eq!(h.transport.sent_with("Tracing.end").len(), 1);
        assert!(h.client.finished().is_empty());
        assert_eq!(h.manager.phase(), CapturePhase::Idle);
    }

    #[tokio::test]
    async fn test_read_error_converts_partial_trace() {
        let h = harness().await;
        let partial = br#"[{"name":"a"}]"#;
        h.transport.reply("IO.read", chunk(partial, false));
        h.transport
            .reply("IO.read", Reply::RemoteError(-32000, "stream gone"));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-4"}));
        h.wait_idle().await;

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].success);
        assert_eq!(
            finished[0].result,
            Some(json!({"traceEvents": [{"name": "a"}]}))
        );
        assert_eq!(h.transport.sent_with("IO.read").len(), 2);
        assert!(h.transport.sent_with("IO.close").is_empty());
        assert!(h.telemetry.events().iter().any(|e| matches!(
            e,
            TelemetryEvent::CaptureTransmitted { bytes, .. } if *bytes == partial.len()
        )));
    }

    #[tokio::test]
    async fn test_read_error_with_truncated_trace_fails() {
        let h = harness().await;
        h.transport.reply("IO.read", chunk(br#"[{"na"#, false));
        h.transport
            .reply("IO.read", Reply::RemoteError(-32000, "stream gone"));

        h.manager.start(h.client(), "", "").await.unwrap();
        h.manager.stop().await.unwrap();
        h.emit("Tracing.tracingComplete", json!({"stream": "trace-5"}));
        h.wait_idle().await;

        let finished = h.client.finished();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].success);
        assert!(h.client.notices().contains(&Notice::Complete));
        assert_eq!(h.client.notices().last(), Some(&Notice::NeedConversion(false)));
    }
}
