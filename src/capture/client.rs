//! Capture client boundary.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

// ============================================================================
// ClientCapabilities
// ============================================================================

/// Optional notifications a capture client accepts.
///
/// The manager only calls an optional method when the matching capability
/// is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientCapabilities {
    /// Accepts [`CaptureClient::tracing_finished`].
    pub tracing_finished: bool,
    /// Accepts [`CaptureClient::trace_need_conversion`].
    pub trace_need_conversion: bool,
}

impl ClientCapabilities {
    /// Only the required notifications.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            tracing_finished: false,
            trace_need_conversion: false,
        }
    }

    /// Every optional notification.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            tracing_finished: true,
            trace_need_conversion: true,
        }
    }

    /// Declares [`CaptureClient::tracing_finished`].
    #[must_use]
    pub const fn with_tracing_finished(mut self) -> Self {
        self.tracing_finished = true;
        self
    }

    /// Declares [`CaptureClient::trace_need_conversion`].
    #[must_use]
    pub const fn with_trace_need_conversion(mut self) -> Self {
        self.trace_need_conversion = true;
        self
    }
}

// ============================================================================
// FinishOutcome
// ============================================================================

/// Final result of one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishOutcome {
    /// Whether a converted trace was produced.
    pub success: bool,
    /// Converted trace on success, error payload on failure.
    pub result: Option<Value>,
}

impl FinishOutcome {
    /// Successful finish carrying the converted trace.
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
        }
    }

    /// Failed finish with an optional error payload.
    #[must_use]
    pub fn failure(result: Option<Value>) -> Self {
        Self {
            success: false,
            result,
        }
    }
}

// ============================================================================
// CaptureClient
// ============================================================================

/// Consumer of one capture run.
pub trait CaptureClient: Send + Sync {
    /// Declares which optional notifications this client accepts.
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::none()
    }

    /// A batch of raw trace events arrived.
    fn trace_events_collected(&self, events: &[Value]);

    /// The trace stream was fully drained.
    fn tracing_complete(&self);

    /// Remote buffer fullness in [0, 1].
    fn tracing_buffer_usage(&self, ratio: f64);

    /// Retrieval progress: a ratio without label, or a status label.
    fn events_retrieval_progress(&self, value: f64, label: Option<&str>);

    /// The capture finished.
    fn tracing_finished(&self, _outcome: FinishOutcome) {}

    /// Conversion started (`true`) or ended (`false`).
    fn trace_need_conversion(&self, _pending: bool) {}
}
