//! Screencast flow control.
//!
//! Frames are delivered to the consumer as they arrive, but only one
//! acknowledgment is ever pending. Each frame cancels the pending ack timer
//! and starts a new one, so when frames outpace the consumer's frame rate
//! only the newest frame is acknowledged and the producer slows down to the
//! consumer.
//!
//! ```text
//! frame 1 ──► on_frame ──► timer(1000/fps) ─┐ cancelled
//! frame 2 ──► on_frame ──► timer(1000/fps) ─┼─ cancelled
//! frame 3 ──► on_frame ──► timer(1000/fps) ─┴──► Page.screencastFrameAck(3)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::SharedSettings;
use crate::error::Result;
use crate::identifiers::RouteKey;
use crate::protocol::{Envelope, FrameMetadata, PageCommand, ParsedEvent};
use crate::transport::Bootstrapper;

// ============================================================================
// Constants
// ============================================================================

/// Default compression quality.
pub const DEFAULT_QUALITY: u8 = 80;

// ============================================================================
// ScreencastConsumer
// ============================================================================

/// Receives the frame feed.
pub trait ScreencastConsumer: Send + Sync {
    /// Called for every delivered frame, including a redelivered cached one.
    fn on_frame(&self, data: &str, metadata: &FrameMetadata);

    /// Called when the inspected page becomes visible or hidden.
    fn on_visibility_changed(&self, _visible: bool) {}
}

// ============================================================================
// ScreencastOptions
// ============================================================================

/// Frame image encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// JPEG frames.
    #[default]
    Jpeg,
    /// PNG frames.
    Png,
}

impl ImageFormat {
    /// Returns the protocol string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// Parameters of the frame stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastOptions {
    /// Image encoding.
    pub format: ImageFormat,
    /// Compression quality (0-100).
    pub quality: u8,
    /// Maximum frame width.
    pub max_width: Option<u32>,
    /// Maximum frame height.
    pub max_height: Option<u32>,
    /// Send every n-th frame.
    pub every_nth_frame: Option<u32>,
}

impl Default for ScreencastOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            quality: DEFAULT_QUALITY,
            max_width: None,
            max_height: None,
            every_nth_frame: None,
        }
    }
}

impl ScreencastOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image format.
    #[must_use]
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the compression quality, clamped to 100.
    #[must_use]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    /// Sets the maximum frame size.
    #[must_use]
    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_width = Some(width);
        self.max_height = Some(height);
        self
    }

    /// Sends only every n-th frame.
    #[must_use]
    pub fn with_every_nth_frame(mut self, n: u32) -> Self {
        self.every_nth_frame = Some(n.max(1));
        self
    }

    fn to_command(&self, display_mode: &str) -> PageCommand {
        PageCommand::StartScreencast {
            format: self.format.as_str().to_string(),
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
            every_nth_frame: self.every_nth_frame,
            display_mode: display_mode.to_string(),
        }
    }
}

// ============================================================================
// ScreencastFrame
// ============================================================================

/// One received frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastFrame {
    /// Base64-encoded image.
    pub data: String,
    /// Frame geometry.
    pub metadata: FrameMetadata,
    /// Frame number the ack refers to.
    pub session_id: u64,
    /// Route the frame arrived on.
    pub route: RouteKey,
}

// ============================================================================
// State
// ============================================================================

/// The single outstanding ack timer.
struct PendingAck {
    token: u64,
    handle: JoinHandle<()>,
}

/// Feed parameters kept while a capture holds the renderer.
struct Suspended {
    options: ScreencastOptions,
    consumer: Arc<dyn ScreencastConsumer>,
}

#[derive(Default)]
struct ScreencastState {
    options: Option<ScreencastOptions>,
    consumer: Option<Arc<dyn ScreencastConsumer>>,
    last_frame: Option<ScreencastFrame>,
    ack: Option<PendingAck>,
    next_ack: u64,
    suspended: Option<Suspended>,
}

impl ScreencastState {
    fn is_active(&self) -> bool {
        self.consumer.is_some()
    }

    fn cancel_ack(&mut self) {
        if let Some(pending) = self.ack.take() {
            pending.handle.abort();
        }
    }
}

struct ScreencastInner {
    bootstrapper: Bootstrapper,
    route: RouteKey,
    settings: SharedSettings,
    state: Mutex<ScreencastState>,
}

// ============================================================================
// ScreencastController
// ============================================================================

/// Drives the frame feed of one page route.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScreencastController {
    inner: Arc<ScreencastInner>,
}

impl fmt::Debug for ScreencastController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreencastController")
            .field("route", &self.inner.route)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ScreencastController {
    /// Creates a stopped controller and subscribes to `route`.
    pub fn new(bootstrapper: Bootstrapper, route: RouteKey, settings: SharedSettings) -> Self {
        let inner = Arc::new(ScreencastInner {
            bootstrapper,
            route,
            settings,
            state: Mutex::new(ScreencastState::default()),
        });

        let weak = Arc::downgrade(&inner);
        let mut backlog = inner
            .bootstrapper
            .dispatcher()
            .listen(route, move |envelope| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_envelope(envelope);
                }
            });
        for envelope in backlog.take() {
            inner.handle_envelope(envelope);
        }
        backlog.release();

        Self { inner }
    }

    /// Returns the page route.
    #[inline]
    #[must_use]
    pub fn route(&self) -> RouteKey {
        self.inner.route
    }

    /// Returns `true` while the feed is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().is_active()
    }

    /// Returns the most recently delivered frame.
    #[must_use]
    pub fn last_frame(&self) -> Option<ScreencastFrame> {
        self.inner.state.lock().last_frame.clone()
    }

    /// Starts the feed.
    ///
    /// A cached frame from an earlier run is delivered to `consumer` before
    /// the start request goes out. Starting while active replaces the
    /// consumer and restarts the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no connection or the start request
    /// fails; the controller stays stopped.
    pub async fn start(
        &self,
        options: ScreencastOptions,
        consumer: Arc<dyn ScreencastConsumer>,
    ) -> Result<()> {
        let cached = {
            let mut state = self.inner.state.lock();
            state.options = Some(options.clone());
            state.consumer = Some(Arc::clone(&consumer));
            state.suspended = None;
            state.last_frame.clone()
        };

        if let Some(frame) = cached {
            trace!(session_id = frame.session_id, "Redelivering cached frame");
            consumer.on_frame(&frame.data, &frame.metadata);
        }

        let display_mode = self.inner.settings.read().screencast_display_mode;
        let command = options.to_command(display_mode.as_str());

        let outcome = match self.inner.bootstrapper.current().await {
            Ok(connection) => connection.execute(self.inner.route, command).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!(route = %self.inner.route, error = %e, "Screencast start failed");
            let mut state = self.inner.state.lock();
            state.options = None;
            state.consumer = None;
            state.cancel_ack();
            return Err(e);
        }

        debug!(
            route = %self.inner.route,
            format = options.format.as_str(),
            quality = options.quality,
            display_mode = display_mode.as_str(),
            "Screencast started"
        );
        Ok(())
    }

    /// Stops the feed. The cached frame is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request fails.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.suspended = None;
            if !state.is_active() {
                return Ok(());
            }
            state.options = None;
            state.consumer = None;
            state.cancel_ack();
        }

        self.send_stop().await
    }

    /// Stops the feed but remembers its options and consumer.
    ///
    /// Returns `true` if a running feed was suspended.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request fails.
    pub async fn suspend(&self) -> Result<bool> {
        {
            let mut state = self.inner.state.lock();
            let (Some(options), Some(consumer)) = (state.options.take(), state.consumer.take())
            else {
                return Ok(false);
            };
            state.cancel_ack();
            state.suspended = Some(Suspended { options, consumer });
        }

        debug!(route = %self.inner.route, "Screencast suspended");
        self.send_stop().await?;
        Ok(true)
    }

    /// Restarts a suspended feed.
    ///
    /// Returns `true` if a feed was restarted.
    ///
    /// # Errors
    ///
    /// Returns an error if the start request fails.
    pub async fn resume(&self) -> Result<bool> {
        let suspended = self.inner.state.lock().suspended.take();
        let Some(Suspended { options, consumer }) = suspended else {
            return Ok(false);
        };

        debug!(route = %self.inner.route, "Screencast resumed");
        self.start(options, consumer).await?;
        Ok(true)
    }

    /// Stops the feed and unsubscribes from the route.
    pub(crate) fn detach(&self) {
        let mut state = self.inner.state.lock();
        state.options = None;
        state.consumer = None;
        state.suspended = None;
        state.cancel_ack();
        drop(state);

        self.inner.bootstrapper.dispatcher().remove(self.inner.route);
    }

    async fn send_stop(&self) -> Result<()> {
        let connection = self.inner.bootstrapper.current().await?;
        connection
            .execute(self.inner.route, PageCommand::StopScreencast)
            .await?;
        debug!(route = %self.inner.route, "Screencast stopped");
        Ok(())
    }
}

// ============================================================================
// Frame handling
// ============================================================================

impl ScreencastInner {
    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let route = envelope.route().unwrap_or(self.route);

        match envelope.parse() {
            ParsedEvent::ScreencastFrame {
                data,
                metadata,
                session_id,
            } => self.on_frame(ScreencastFrame {
                data,
                metadata,
                session_id,
                route,
            }),

            ParsedEvent::ScreencastVisibilityChanged { visible } => {
                let consumer = self.state.lock().consumer.clone();
                if let Some(consumer) = consumer {
                    consumer.on_visibility_changed(visible);
                }
            }

            other => trace!(route = %route, event = ?other, "Ignoring page event"),
        }
    }

    fn on_frame(self: &Arc<Self>, frame: ScreencastFrame) {
        let consumer = {
            let mut state = self.state.lock();
            let Some(consumer) = state.consumer.clone() else {
                trace!(session_id = frame.session_id, "Dropping frame while stopped");
                return;
            };
            state.last_frame = Some(frame.clone());
            consumer
        };

        consumer.on_frame(&frame.data, &frame.metadata);
        self.schedule_ack(frame.route, frame.session_id);
    }

    /// Replaces the pending ack timer with one for `session_id`.
    fn schedule_ack(self: &Arc<Self>, route: RouteKey, session_id: u64) {
        let interval = self.settings.read().ack_interval();

        let mut state = self.state.lock();
        if !state.is_active() {
            return;
        }
        state.cancel_ack();
        state.next_ack += 1;
        let token = state.next_ack;

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if !state.ack.as_ref().is_some_and(|ack| ack.token == token) {
                    return;
                }
                state.ack = None;
            }
            inner.send_ack(route, session_id).await;
        });

        state.ack = Some(PendingAck { token, handle });
    }

    async fn send_ack(&self, route: RouteKey, session_id: u64) {
        let Some(connection) = self.bootstrapper.connection() else {
            debug!(session_id, "No connection for screencast ack");
            return;
        };

        match connection
            .execute(route, PageCommand::ScreencastFrameAck { session_id })
            .await
        {
            Ok(_) => trace!(route = %route, session_id, "Screencast ack sent"),
            Err(e) => warn!(route = %route, session_id, error = %e, "Screencast ack failed"),
        }
    }
}

impl Drop for ScreencastInner {
    fn drop(&mut self) {
        self.state.get_mut().cancel_ack();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use crate::config::{DisplayMode, Settings};
    use crate::dispatcher::Dispatcher;
    use crate::error::Error;
    use crate::testing::{FakeConnector, FakeTransport, RecordingConsumer, Reply, init_tracing};
    use crate::transport::Connector;

    const PAGE: RouteKey = RouteKey::from_raw(1, 7);

    struct Harness {
        transport: Arc<FakeTransport>,
        controller: ScreencastController,
        consumer: Arc<RecordingConsumer>,
    }

    async fn harness(settings: Settings) -> Harness {
        init_tracing();
        let connector = FakeConnector::new();
        let bootstrapper = Bootstrapper::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Dispatcher::default(),
        );
        bootstrapper.connect("ws://device", None).await.unwrap();

        Harness {
            transport: connector.transport("ws://device").unwrap(),
            controller: ScreencastController::new(bootstrapper, PAGE, settings.shared()),
            consumer: RecordingConsumer::new(),
        }
    }

    fn frame(n: u64) -> Envelope {
        Envelope::new(
            PAGE,
            "Page.screencastFrame",
            json!({"data": format!("frame-{n}"), "sessionId": n, "metadata": {"deviceWidth": 390.0}}),
        )
    }

    fn consumer(h: &Harness) -> Arc<dyn ScreencastConsumer> {
        Arc::clone(&h.consumer) as Arc<dyn ScreencastConsumer>
    }

    #[tokio::test]
    async fn test_start_sends_request_with_display_mode() {
        let settings = Settings {
            screencast_display_mode: DisplayMode::Fill,
            ..Settings::default()
        };
        let h = harness(settings).await;

        let options = ScreencastOptions::new()
            .with_format(ImageFormat::Png)
            .with_quality(150)
            .with_max_size(800, 600);
        h.controller.start(options, consumer(&h)).await.unwrap();

        assert!(h.controller.is_active());
        let params = h.transport.params_of("Page.startScreencast");
        assert_eq!(
            params,
            vec![json!({
                "format": "png",
                "quality": 100,
                "maxWidth": 800,
                "maxHeight": 600,
                "displayMode": "fill"
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_frames_acknowledged_once() {
        let h = harness(Settings::default()).await;
        h.controller
            .start(ScreencastOptions::new(), consumer(&h))
            .await
            .unwrap();

        for n in 1..=5 {
            h.transport.emit(frame(n));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.consumer.frame_data().len(), 5);
        assert_eq!(
            h.transport.params_of("Page.screencastFrameAck"),
            vec![json!({"sessionId": 5})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_frames_each_acknowledged() {
        let settings = Settings {
            screencast_fps: 10,
            ..Settings::default()
        };
        let h = harness(settings).await;
        h.controller
            .start(ScreencastOptions::new(), consumer(&h))
            .await
            .unwrap();

        for n in 1..=3 {
            h.transport.emit(frame(n));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        assert_eq!(
            h.transport.params_of("Page.screencastFrameAck"),
            vec![
                json!({"sessionId": 1}),
                json!({"sessionId": 2}),
                json!({"sessionId": 3})
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_cached_frame_for_restart() {
        let h = harness(Settings::default()).await;
        h.controller
            .start(ScreencastOptions::new(), consumer(&h))
            .await
            .unwrap();
        h.transport.emit(frame(1));

        h.controller.stop().await.unwrap();
        assert!(!h.controller.is_active());
        assert_eq!(h.transport.sent_with("Page.stopScreencast").len(), 1);

        h.transport.emit(frame(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.transport.sent_with("Page.screencastFrameAck").is_empty());
        assert_eq!(h.controller.last_frame().unwrap().session_id, 1);

        let restarted = RecordingConsumer::new();
        h.controller
            .start(
                ScreencastOptions::new(),
                Arc::clone(&restarted) as Arc<dyn ScreencastConsumer>,
            )
            .await
            .unwrap();
        assert_eq!(restarted.frame_data(), vec!["frame-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let h = harness(Settings::default()).await;
        h.controller.stop().await.unwrap();
        assert!(h.transport.sent_with("Page.stopScreencast").is_empty());
    }

    #[tokio::test]
    async fn test_visibility_forwarded_while_active() {
        let h = harness(Settings::default()).await;
        let visibility = |visible: bool| {
            Envelope::new(
                PAGE,
                "Page.screencastVisibilityChanged",
                json!({"visible": visible}),
            )
        };

        h.transport.emit(visibility(false));
        h.controller
            .start(ScreencastOptions::new(), consumer(&h))
            .await
            .unwrap();
        h.transport.emit(visibility(true));

        assert_eq!(*h.consumer.visibility.lock(), vec![true]);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_stopped() {
        let h = harness(Settings::default()).await;
        h.transport
            .reply("Page.startScreencast", Reply::RemoteError(-32000, "no page"));

        let err = h
            .controller
            .start(ScreencastOptions::new(), consumer(&h))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { code: -32000, .. }));
        assert!(!h.controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_and_resume() {
        let h = harness(Settings::default()).await;
        let options = ScreencastOptions::new().with_every_nth_frame(2);
        h.controller.start(options, consumer(&h)).await.unwrap();
        h.transport.emit(frame(1));

        assert!(h.controller.suspend().await.unwrap());
        assert!(!h.controller.is_active());
        assert!(!h.controller.suspend().await.unwrap());

        assert!(h.controller.resume().await.unwrap());
        assert!(h.controller.is_active());
        assert!(!h.controller.resume().await.unwrap());

        let starts = h.transport.params_of("Page.startScreencast");
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1]["everyNthFrame"], json!(2));
        assert_eq!(h.consumer.frame_data(), vec!["frame-1", "frame-1"]);
    }

    #[test]
    fn test_options_defaults() {
        let options = ScreencastOptions::default();
        assert_eq!(options.format, ImageFormat::Jpeg);
        assert_eq!(options.quality, DEFAULT_QUALITY);
        assert_eq!(options.max_width, None);
        assert_eq!(ScreencastOptions::new().with_every_nth_frame(0).every_nth_frame, Some(1));
    }
}
