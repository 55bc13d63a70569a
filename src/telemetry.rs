//! Capture telemetry.
//!
//! The capture manager reports lifecycle milestones through a [`Telemetry`]
//! sink. The default [`LogTelemetry`] sink emits them as structured
//! `tracing` events under the `devtools_session::telemetry` target.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tracing::{info, warn};

// ============================================================================
// TelemetryEvent
// ============================================================================

/// A telemetry milestone.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// The remote end accepted a capture start.
    CaptureStarted {
        /// Number of categories requested.
        category_count: usize,
    },

    /// The capture start request failed.
    CaptureStartFailed {
        /// Failure description.
        error: String,
    },

    /// The trace stream finished draining.
    CaptureTransmitted {
        /// Bytes received.
        bytes: usize,
        /// Time spent draining.
        duration: Duration,
    },

    /// The trace finished converting.
    CaptureConverted {
        /// Bytes handed to the converter.
        bytes: usize,
        /// Time spent converting.
        duration: Duration,
    },
}

impl TelemetryEvent {
    /// Returns throughput in bytes per second, if the event carries one.
    #[must_use]
    pub fn throughput(&self) -> Option<f64> {
        match self {
            Self::CaptureTransmitted { bytes, duration }
            | Self::CaptureConverted { bytes, duration } => {
                let secs = duration.as_secs_f64();
                if secs > 0.0 {
                    Some(*bytes as f64 / secs)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Sink for telemetry milestones.
pub trait Telemetry: Send + Sync {
    /// Records one milestone.
    fn record(&self, event: TelemetryEvent);
}

/// Telemetry sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn record(&self, event: TelemetryEvent) {
        let throughput = event.throughput();
        match event {
            TelemetryEvent::CaptureStarted { category_count } => {
                info!(target: "devtools_session::telemetry", category_count, "capture started");
            }
            TelemetryEvent::CaptureStartFailed { error } => {
                warn!(target: "devtools_session::telemetry", %error, "capture start failed");
            }
            TelemetryEvent::CaptureTransmitted { bytes, duration } => {
                info!(
                    target: "devtools_session::telemetry",
                    bytes,
                    duration_ms = duration.as_millis() as u64,
                    throughput = throughput.unwrap_or_default(),
                    "capture transmitted"
                );
            }
            TelemetryEvent::CaptureConverted { bytes, duration } => {
                info!(
                    target: "devtools_session::telemetry",
                    bytes,
                    duration_ms = duration.as_millis() as u64,
                    throughput = throughput.unwrap_or_default(),
                    "capture converted"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
