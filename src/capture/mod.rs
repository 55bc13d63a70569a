//! Trace capture.
//!
//! A capture records on the remote end, returns the trace as a stream
//! handle, drains that stream in bounded chunks and converts the drained
//! bytes on a background worker.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Capture client boundary and capabilities |
//! | `drain` | Chunked stream reads |
//! | `manager` | Capture lifecycle |
//! | `state` | Capture session, phases and progress math |
//! | `worker` | Background trace conversion |

// ============================================================================
// Submodules
// ============================================================================

/// Capture client boundary.
pub mod client;

/// Chunked stream reads.
mod drain;

/// Capture lifecycle.
pub mod manager;

/// Capture session state and pure helpers.
pub mod state;

/// Background trace conversion.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{CaptureClient, ClientCapabilities, FinishOutcome};
pub use manager::{CaptureManager, CaptureManagerBuilder, RECORD_MODE};
pub use state::{CapturePhase, buffer_usage_ratio, included_categories, progress_ratio};
pub use worker::{ConversionWorker, JsonTraceConverter, TraceConverter, WorkerMessage};
