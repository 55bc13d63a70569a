//! Device session facade.
//!
//! Wires the bootstrapper, dispatcher, screencast and capture manager for
//! one inspected page.
//!
//! # Example
//!
//! ```no_run
//! use devtools_session::{DeviceSession, Result, RouteKey};
//!
//! # async fn example() -> Result<()> {
//! let session = DeviceSession::builder()
//!     .address("ws://127.0.0.1:8097")
//!     .room("simulator-1")
//!     .page(RouteKey::from_raw(1, 3))
//!     .build()?;
//!
//! session.connect().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::capture::{CaptureManager, JsonTraceConverter, TraceConverter};
use crate::config::{SessionConfig, Settings, SharedSettings};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::identifiers::RouteKey;
use crate::screencast::ScreencastController;
use crate::telemetry::{LogTelemetry, Telemetry};
use crate::transport::{Bootstrapper, Connection, Connector, WsConnector};

// ============================================================================
// DeviceSessionBuilder
// ============================================================================

/// Builder for [`DeviceSession`].
///
/// Use [`DeviceSession::builder()`] to create a new builder.
#[derive(Default)]
pub struct DeviceSessionBuilder {
    /// Debug server address.
    address: Option<String>,
    /// Room discriminator.
    room: Option<String>,
    /// Route of the inspected page.
    page: Option<RouteKey>,
    config: SessionConfig,
    settings: Option<SharedSettings>,
    connector: Option<Arc<dyn Connector>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    converter: Option<Arc<dyn TraceConverter>>,
}

impl fmt::Debug for DeviceSessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSessionBuilder")
            .field("address", &self.address)
            .field("room", &self.room)
            .field("page", &self.page)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceSessionBuilder {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the debug server address.
    #[inline]
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the room discriminator.
    #[inline]
    #[must_use]
    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Sets the route of the inspected page.
    #[inline]
    #[must_use]
    pub fn page(mut self, route: RouteKey) -> Self {
        self.page = Some(route);
        self
    }

    /// Sets timeouts, chunk size, buffer budget and pool bound.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the shared settings map.
    #[inline]
    #[must_use]
    pub fn settings(mut self, settings: SharedSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Replaces the WebSocket connector.
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the telemetry sink.
    #[inline]
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets the trace converter.
    #[inline]
    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn TraceConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Builds the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address or page route is missing.
    pub fn build(self) -> Result<DeviceSession> {
        let address = self
            .address
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| Error::config("debug server address is required"))?;
        let page = self
            .page
            .ok_or_else(|| Error::config("page route is required"))?;

        let config = self.config;
        let settings = self.settings.unwrap_or_else(|| Settings::default().shared());
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(config.request_timeout)));

        let dispatcher = Dispatcher::new(config.max_pending_per_route);
        let bootstrapper =
            Bootstrapper::with_timeout(connector, dispatcher, config.connect_timeout);

        let screencast = ScreencastController::new(bootstrapper.clone(), page, settings.clone());
        let capture = CaptureManager::builder(bootstrapper.clone(), page)
            .config(config.clone())
            .settings(settings.clone())
            .screencast(screencast.clone())
            .telemetry(self.telemetry.unwrap_or_else(|| Arc::new(LogTelemetry)))
            .converter(
                self.converter
                    .unwrap_or_else(|| Arc::new(JsonTraceConverter)),
            )
            .build();

        debug!(%address, room = ?self.room, %page, "Device session built");

        Ok(DeviceSession {
            address,
            room: self.room,
            page,
            settings,
            bootstrapper,
            screencast,
            capture,
        })
    }
}

// ============================================================================
// DeviceSession
// ============================================================================

/// Protocol layer for one inspected page.
pub struct DeviceSession {
    address: String,
    room: Option<String>,
    page: RouteKey,
    settings: SharedSettings,
    bootstrapper: Bootstrapper,
    screencast: ScreencastController,
    capture: CaptureManager,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("room", &self.room)
            .field("page", &self.page)
            .field("bootstrapper", &self.bootstrapper)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> DeviceSessionBuilder {
        DeviceSessionBuilder::new()
    }

    /// Connects to the configured address, replacing any current connection.
    ///
    /// # Errors
    ///
    /// See [`Bootstrapper::connect`].
    pub async fn connect(&self) -> Result<Connection> {
        self.bootstrapper
            .connect(&self.address, self.room.as_deref())
            .await
    }

    /// Returns the page route.
    #[inline]
    #[must_use]
    pub fn page(&self) -> RouteKey {
        self.page
    }

    /// Returns the settings map.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Returns the bootstrapper.
    #[inline]
    #[must_use]
    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.bootstrapper
    }

    /// Returns the dispatcher.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.bootstrapper.dispatcher()
    }

    /// Returns the screencast controller.
    #[inline]
    #[must_use]
    pub fn screencast(&self) -> &ScreencastController {
        &self.screencast
    }

    /// Returns the capture manager.
    #[inline]
    #[must_use]
    pub fn capture(&self) -> &CaptureManager {
        &self.capture
    }

    /// Stops the screencast, drops any capture and disconnects.
    pub async fn shutdown(&self) {
        if self.bootstrapper.connection().is_some()
            && let Err(e) = self.screencast.stop().await
        {
            debug!(error = %e, "Screencast stop during shutdown failed");
        }

        self.capture.detach();
        self.screencast.detach();
        self.bootstrapper.disconnect();
        info!(address = %self.address, "Device session shut down");
    }
}

// ============================================================================
// Tests
// ============================================================================
