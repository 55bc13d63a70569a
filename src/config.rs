//! Session configuration and injected settings.
//!
//! Two kinds of configuration reach the core:
//!
//! - [`SessionConfig`] - tunables owned by the embedder (timeouts, chunk
//!   sizes, pool bounds), set through `with_*` builder methods.
//! - [`Settings`] - the user-facing settings map owned by the UI layer.
//!   The core only ever reads it.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use devtools_session::{SessionConfig, Settings};
//!
//! let config = SessionConfig::new()
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_read_chunk_size(512 * 1024);
//!
//! let settings = Settings::from_json(r#"{"screencastFps": 15}"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Deadline for a connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes requested per stream read while draining a trace.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Trace buffer budget handed to the remote end, in KiB.
pub const DEFAULT_TRACE_BUFFER_SIZE_KB: u64 = 200 * 1024;

/// Interval between buffer usage notifications.
pub const DEFAULT_BUFFER_USAGE_INTERVAL: Duration = Duration::from_millis(500);

/// Envelopes kept per route while no listener is registered.
pub const DEFAULT_MAX_PENDING_PER_ROUTE: usize = 1024;

/// Screencast frame rate used when settings do not provide one.
pub const DEFAULT_SCREENCAST_FPS: u32 = 30;

// ============================================================================
// SessionConfig
// ============================================================================

/// Tunables for the session protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for a connect attempt.
    pub connect_timeout: Duration,

    /// Deadline for a single request.
    pub request_timeout: Duration,

    /// Bytes requested per stream read.
    pub read_chunk_size: usize,

    /// Trace buffer budget in KiB.
    pub trace_buffer_size_kb: u64,

    /// Interval between buffer usage notifications.
    pub buffer_usage_interval: Duration,

    /// Pending-message pool bound per route.
    pub max_pending_per_route: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            trace_buffer_size_kb: DEFAULT_TRACE_BUFFER_SIZE_KB,
            buffer_usage_interval: DEFAULT_BUFFER_USAGE_INTERVAL,
            max_pending_per_route: DEFAULT_MAX_PENDING_PER_ROUTE,
        }
    }

    /// Sets the connect deadline.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the request deadline.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the stream read chunk size. Zero is clamped to one byte.
    #[inline]
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Sets the trace buffer budget in KiB.
    #[inline]
    #[must_use]
    pub fn with_trace_buffer_size_kb(mut self, size_kb: u64) -> Self {
        self.trace_buffer_size_kb = size_kb;
        self
    }

    /// Sets the buffer usage reporting interval.
    #[inline]
    #[must_use]
    pub fn with_buffer_usage_interval(mut self, interval: Duration) -> Self {
        self.buffer_usage_interval = interval;
        self
    }

    /// Sets the per-route pool bound. Zero is clamped to one envelope.
    #[inline]
    #[must_use]
    pub fn with_max_pending_per_route(mut self, max: usize) -> Self {
        self.max_pending_per_route = max.max(1);
        self
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Screencast display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Scale the frame to fit the viewport.
    #[default]
    Fit,
    /// Render at device pixel size.
    Actual,
    /// Fill the viewport, cropping overflow.
    Fill,
}

impl DisplayMode {
    /// Returns the protocol string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Actual => "actual",
            Self::Fill => "fill",
        }
    }
}

/// User settings read by the core.
///
/// Every key is optional in the injected JSON map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Include screenshots in captured traces.
    pub capture_screenshots: bool,

    /// Include system trace categories.
    pub enable_system_trace: bool,

    /// Screencast preview is enabled.
    pub screencast_enabled: bool,

    /// Frames per second the consumer can display.
    pub screencast_fps: u32,

    /// Screencast display mode.
    pub screencast_display_mode: DisplayMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capture_screenshots: false,
            enable_system_trace: false,
            screencast_enabled: true,
            screencast_fps: DEFAULT_SCREENCAST_FPS,
            screencast_display_mode: DisplayMode::Fit,
        }
    }
}

impl Settings {
    /// Parses settings from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the text is not a valid settings map.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the acknowledgment interval derived from the frame rate.
    ///
    /// A zero frame rate falls back to the default rate.
    #[must_use]
    pub fn ack_interval(&self) -> Duration {
        let fps = if self.screencast_fps == 0 {
            DEFAULT_SCREENCAST_FPS
        } else {
            self.screencast_fps
        };
        Duration::from_millis(1000 / u64::from(fps))
    }

    /// Wraps settings for sharing with the core.
    #[must_use]
    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }
}

/// Settings shared between the UI layer (writer) and the core (reader).
pub type SharedSettings = Arc<RwLock<Settings>>;

// ============================================================================
// Tests
// ============================================================================
