//! Inbound envelope types.
//!
//! Envelopes are notifications pushed by the remote debug server. Each
//! carries the route (client and session) it belongs to.
//!
//! # Event Types
//!
//! | Domain | Events |
//! |--------|--------|
//! | `Page` | `screencastFrame`, `screencastVisibilityChanged` |
//! | `Tracing` | `bufferUsage`, `dataCollected`, `tracingComplete` |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::RouteKey;

// ============================================================================
// Envelope
// ============================================================================

/// One inbound protocol message, before demultiplexing.
///
/// # Format
///
/// ```json
/// {
///   "clientId": 1,
///   "sessionId": 3,
///   "method": "Domain.eventName",
///   "params": { ... }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Originating client, if present.
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u32>,

    /// Originating session, if present.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,

    /// Event name in `Domain.eventName` format.
    pub method: String,

    /// Event-specific data.
    #[serde(default)]
    pub params: Value,
}

impl Envelope {
    /// Creates an envelope for a route.
    #[must_use]
    pub fn new(route: RouteKey, method: impl Into<String>, params: Value) -> Self {
        Self {
            client_id: Some(route.client_id.as_u32()),
            session_id: Some(route.session_id.as_u32()),
            method: method.into(),
            params,
        }
    }

    /// Resolves the route key.
    ///
    /// Returns `None` when either identifier is missing.
    #[inline]
    #[must_use]
    pub fn route(&self) -> Option<RouteKey> {
        Some(RouteKey::from_raw(self.client_id?, self.session_id?))
    }

    /// Returns the domain name from the method.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }

    /// Parses the envelope into a typed variant.
    #[must_use]
    pub fn parse(&self) -> ParsedEvent {
        match self.method.as_str() {
            "Page.screencastFrame" => ParsedEvent::ScreencastFrame {
                data: self.get_string("data"),
                metadata: self
                    .params
                    .get("metadata")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default(),
                session_id: self.get_u64("sessionId"),
            },

            "Page.screencastVisibilityChanged" => ParsedEvent::ScreencastVisibilityChanged {
                visible: self
                    .params
                    .get("visible")
                    .and_then(|v| v.as_bool())
                    .unwrap_or_default(),
            },

            "Tracing.bufferUsage" => ParsedEvent::TracingBufferUsage {
                percent_full: self.get_f64("percentFull"),
                event_count: self.params.get("eventCount").and_then(|v| v.as_u64()),
                value: self.get_f64("value"),
            },

            "Tracing.dataCollected" => ParsedEvent::TracingDataCollected {
                events: self
                    .params
                    .get("value")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
            },

            "Tracing.tracingComplete" => ParsedEvent::TracingComplete {
                stream: self
                    .params
                    .get("stream")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                data_loss_occurred: self
                    .params
                    .get("dataLossOccurred")
                    .and_then(|v| v.as_bool())
                    .unwrap_or_default(),
            },

            _ => ParsedEvent::Unknown {
                method: self.method.clone(),
                params: self.params.clone(),
            },
        }
    }

    /// Gets a string from params.
    #[inline]
    fn get_string(&self, key: &str) -> String {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Gets a u64 from params.
    #[inline]
    fn get_u64(&self, key: &str) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or_default()
    }

    /// Gets an optional f64 from params.
    #[inline]
    fn get_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| v.as_f64())
    }
}

// ============================================================================
// FrameMetadata
// ============================================================================

/// Geometry attached to a screencast frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameMetadata {
    /// Top offset in DIP.
    pub offset_top: f64,
    /// Page scale factor.
    pub page_scale_factor: f64,
    /// Device screen width in DIP.
    pub device_width: f64,
    /// Device screen height in DIP.
    pub device_height: f64,
    /// Horizontal scroll offset.
    pub scroll_offset_x: f64,
    /// Vertical scroll offset.
    pub scroll_offset_y: f64,
    /// Frame timestamp in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

// ============================================================================
// ParsedEvent
// ============================================================================

/// Parsed event types for type-safe handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// A rendered frame.
    ScreencastFrame {
        /// Base64-encoded image.
        data: String,
        /// Frame geometry.
        metadata: FrameMetadata,
        /// Frame number to acknowledge.
        session_id: u64,
    },

    /// The page became visible or hidden.
    ScreencastVisibilityChanged {
        /// New visibility.
        visible: bool,
    },

    /// Trace buffer fill report.
    TracingBufferUsage {
        /// Buffer fullness in [0, 1].
        percent_full: Option<f64>,
        /// Approximate events recorded so far.
        event_count: Option<u64>,
        /// Legacy fullness scalar.
        value: Option<f64>,
    },

    /// A batch of trace events.
    TracingDataCollected {
        /// Raw trace events.
        events: Vec<Value>,
    },

    /// Capture finished; the trace is ready to drain.
    TracingComplete {
        /// Stream handle holding the trace.
        stream: Option<String>,
        /// The remote buffer overflowed.
        data_loss_occurred: bool,
    },

    /// Unknown event type.
    Unknown {
        /// Event method.
        method: String,
        /// Event params.
        params: Value,
    },
}

// ============================================================================
// Tests
// ============================================================================
