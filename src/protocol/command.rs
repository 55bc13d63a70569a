//! Command definitions organized by domain.
//!
//! Commands follow `Domain.method` format.
//!
//! # Command Domains
//!
//! | Domain | Commands |
//! |--------|----------|
//! | `Page` | Screencast control, frame acknowledgment, reload |
//! | `Tracing` | Capture start and end |
//! | `IO` | Stream reads and close |
//! | `Devtool` | Remote runtime trace mode |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Command Wrapper
// ============================================================================

/// All protocol commands organized by domain.
///
/// This enum wraps domain-specific command enums for unified serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// Page domain commands.
    Page(PageCommand),
    /// Tracing domain commands.
    Tracing(TracingCommand),
    /// IO domain commands.
    Io(IoCommand),
    /// Devtool domain commands.
    Devtool(DevtoolCommand),
}

impl Command {
    /// Returns the wire method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Page(PageCommand::StartScreencast { .. }) => "Page.startScreencast",
            Self::Page(PageCommand::StopScreencast) => "Page.stopScreencast",
            Self::Page(PageCommand::ScreencastFrameAck { .. }) => "Page.screencastFrameAck",
            Self::Page(PageCommand::Reload { .. }) => "Page.reload",
            Self::Tracing(TracingCommand::Start { .. }) => "Tracing.start",
            Self::Tracing(TracingCommand::End) => "Tracing.end",
            Self::Io(IoCommand::Read { .. }) => "IO.read",
            Self::Io(IoCommand::Close { .. }) => "IO.close",
            Self::Devtool(DevtoolCommand::SetTraceMode { .. }) => "Devtool.setTraceMode",
        }
    }
}

impl From<PageCommand> for Command {
    fn from(command: PageCommand) -> Self {
        Self::Page(command)
    }
}

impl From<TracingCommand> for Command {
    fn from(command: TracingCommand) -> Self {
        Self::Tracing(command)
    }
}

impl From<IoCommand> for Command {
    fn from(command: IoCommand) -> Self {
        Self::Io(command)
    }
}

impl From<DevtoolCommand> for Command {
    fn from(command: DevtoolCommand) -> Self {
        Self::Devtool(command)
    }
}

// ============================================================================
// Page Commands
// ============================================================================

/// Page domain commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum PageCommand {
    /// Start the frame stream.
    #[serde(rename = "Page.startScreencast")]
    StartScreencast {
        /// Image format (`jpeg` or `png`).
        format: String,
        /// Compression quality (0-100).
        quality: u8,
        /// Maximum frame width.
        #[serde(rename = "maxWidth", skip_serializing_if = "Option::is_none")]
        max_width: Option<u32>,
        /// Maximum frame height.
        #[serde(rename = "maxHeight", skip_serializing_if = "Option::is_none")]
        max_height: Option<u32>,
        /// Send every n-th frame.
        #[serde(rename = "everyNthFrame", skip_serializing_if = "Option::is_none")]
        every_nth_frame: Option<u32>,
        /// Resolved display mode.
        #[serde(rename = "displayMode")]
        display_mode: String,
    },

    /// Stop the frame stream.
    #[serde(rename = "Page.stopScreencast")]
    StopScreencast,

    /// Acknowledge a delivered frame.
    #[serde(rename = "Page.screencastFrameAck")]
    ScreencastFrameAck {
        /// Frame session number being acknowledged.
        #[serde(rename = "sessionId")]
        session_id: u64,
    },

    /// Reload the inspected page.
    #[serde(rename = "Page.reload")]
    Reload {
        /// Bypass the cache.
        #[serde(rename = "ignoreCache", default)]
        ignore_cache: bool,
    },
}

// ============================================================================
// Tracing Commands
// ============================================================================

/// Tracing domain commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum TracingCommand {
    /// Begin a capture.
    #[serde(rename = "Tracing.start")]
    Start {
        /// Category and buffer configuration.
        #[serde(rename = "traceConfig")]
        trace_config: TraceConfig,
        /// How the trace is handed back.
        #[serde(rename = "transferMode")]
        transfer_mode: TransferMode,
        /// Buffer usage reporting interval in milliseconds.
        #[serde(rename = "bufferUsageReportingInterval")]
        buffer_usage_reporting_interval: u64,
        /// Free-form trace options passed through to the remote end.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<String>,
    },

    /// End the capture.
    #[serde(rename = "Tracing.end")]
    End,
}

/// Capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceConfig {
    /// Categories to record.
    pub included_categories: Vec<String>,
    /// Recording mode.
    pub record_mode: String,
    /// Byte budget of the remote buffer in KiB.
    #[serde(rename = "traceBufferSizeInKb")]
    pub trace_buffer_size_kb: u64,
}

/// Trace transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Events are pushed through data-collected notifications.
    ReportEvents,
    /// The trace is returned as a stream handle.
    ReturnAsStream,
}

// ============================================================================
// IO Commands
// ============================================================================

/// IO domain commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum IoCommand {
    /// Read a bounded chunk from a stream.
    #[serde(rename = "IO.read")]
    Read {
        /// Stream handle.
        handle: String,
        /// Maximum bytes to read.
        size: usize,
    },

    /// Close a stream.
    #[serde(rename = "IO.close")]
    Close {
        /// Stream handle.
        handle: String,
    },
}

// ============================================================================
// Devtool Commands
// ============================================================================

/// Devtool domain commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DevtoolCommand {
    /// Toggle the remote runtime trace mode.
    #[serde(rename = "Devtool.setTraceMode")]
    SetTraceMode {
        /// New trace mode.
        enabled: bool,
    },
}

// ============================================================================
// Tests
// ============================================================================
