//! Capture session state and pure helpers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::identifiers::CaptureToken;

use super::client::CaptureClient;

// ============================================================================
// Categories
// ============================================================================

/// Categories every capture records.
pub const REQUIRED_CATEGORIES: &[&str] = &[
    "-*",
    "devtools.timeline",
    "disabled-by-default-devtools.timeline",
    "disabled-by-default-devtools.timeline.frame",
    "disabled-by-default-devtools.timeline.stack",
    "v8.execute",
    "blink.console",
    "blink.user_timing",
    "latencyInfo",
    "toplevel",
];

/// Added when screenshots are enabled.
pub const SCREENSHOT_CATEGORY: &str = "disabled-by-default-devtools.screenshot";

/// Added when system tracing is enabled.
pub const SYSTRACE_CATEGORY: &str = "disabled-by-default-systrace";

/// Merges required, filter and opt-in categories.
///
/// `filter` is a comma separated category list. Order is preserved and
/// duplicates are dropped.
#[must_use]
pub fn included_categories(filter: &str, settings: &Settings) -> Vec<String> {
    let opt_in = [
        settings.capture_screenshots.then_some(SCREENSHOT_CATEGORY),
        settings.enable_system_trace.then_some(SYSTRACE_CATEGORY),
    ];

    let mut categories: Vec<String> = Vec::new();
    let candidates = REQUIRED_CATEGORIES
        .iter()
        .copied()
        .chain(filter.split(',').map(str::trim))
        .chain(opt_in.into_iter().flatten());

    for category in candidates {
        if !category.is_empty() && !categories.iter().any(|c| c == category) {
            categories.push(category.to_string());
        }
    }
    categories
}

// ============================================================================
// Ratios
// ============================================================================

/// Retrieval progress in [0, 1].
///
/// Retrieved counts above the budget clamp to 1. An unknown or zero budget
/// reports 0.
#[must_use]
pub fn progress_ratio(retrieved: u64, budget: Option<u64>) -> f64 {
    match budget {
        Some(budget) if budget > 0 => retrieved.min(budget) as f64 / budget as f64,
        _ => 0.0,
    }
}

/// Buffer fullness from a usage report.
///
/// Prefers `percent_full`, then `value`, then 0.
#[must_use]
pub fn buffer_usage_ratio(percent_full: Option<f64>, value: Option<f64>) -> f64 {
    percent_full.or(value).unwrap_or(0.0).clamp(0.0, 1.0)
}

/// Human readable drain progress.
#[must_use]
pub fn progress_label(bytes: usize) -> String {
    format!(
        "Retrieving trace data: {:.1} MB",
        bytes as f64 / (1024.0 * 1024.0)
    )
}

// ============================================================================
// CapturePhase
// ============================================================================

/// Lifecycle phase of the capture manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePhase {
    /// No capture.
    #[default]
    Idle,
    /// Start request in flight.
    Starting,
    /// Recording on the remote end.
    Recording,
    /// End request sent, waiting for completion.
    Stopping,
    /// Reading the trace stream.
    Draining,
    /// Background conversion running.
    Converting,
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Draining => "draining",
            Self::Converting => "converting",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CaptureSession
// ============================================================================

/// One capture run.
pub(crate) struct CaptureSession {
    pub(crate) token: CaptureToken,
    pub(crate) client: Arc<dyn CaptureClient>,
    pub(crate) phase: CapturePhase,
    /// Estimated event count of the remote buffer; `None` until reported.
    pub(crate) buffer_budget: Option<u64>,
    pub(crate) events_retrieved: u64,
    pub(crate) payload_bytes: usize,
    /// Set by `stop`; blocks overlapping stops.
    pub(crate) finishing: bool,
    /// Screencast setting when the capture began.
    pub(crate) screencast_enabled: bool,
    /// Stream handle from the completion event.
    pub(crate) stream: Option<String>,
    pub(crate) started_at: Instant,
}

impl CaptureSession {
    pub(crate) fn new(client: Arc<dyn CaptureClient>, screencast_enabled: bool) -> Self {
        Self {
            token: CaptureToken::next(),
            client,
            phase: CapturePhase::Starting,
            buffer_budget: None,
            events_retrieved: 0,
            payload_bytes: 0,
            finishing: false,
            screencast_enabled,
            stream: None,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
