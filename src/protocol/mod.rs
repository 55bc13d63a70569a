//! Remote debug protocol message types.
//!
//! This module defines the message format for communication between
//! the local end and the remote debug server.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Local → Remote | Command request |
//! | `Response` | Remote → Local | Command response |
//! | `Envelope` | Remote → Local | Routed notification |
//!
//! # Command Naming
//!
//! Commands follow `Domain.method` format:
//!
//! - `Page.startScreencast`
//! - `Tracing.start`
//! - `IO.read`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command definitions by domain |
//! | `event` | Envelope and parsed event types |
//! | `request` | Request and Response types |

// ============================================================================
// Submodules
// ============================================================================

/// Command definitions organized by domain.
pub mod command;

/// Inbound envelope types.
pub mod event;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{
    Command, DevtoolCommand, IoCommand, PageCommand, TraceConfig, TracingCommand, TransferMode,
};
pub use event::{Envelope, FrameMetadata, ParsedEvent};
pub use request::{ProtocolError, Request, Response};
