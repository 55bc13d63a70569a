//! Devtools Session - protocol layer for inspecting a remote device runtime.
//!
//! This library owns the live connection to a remote debug server and the
//! protocol flows that run over it.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────┐
//!              │ Bootstrapper │  one current Connection, generation-checked
//!              └──────┬───────┘
//!                     │ inbound envelopes
//!              ┌──────▼───────┐
//!              │  Dispatcher  │  (client id, session id) → listener
//!              └──┬────────┬──┘
//!      page route │        │ browser route
//!   ┌─────────────▼──┐  ┌──▼─────────────┐
//!   │   Screencast   │  │ CaptureManager │──► ConversionWorker
//!   └────────────────┘  └────────────────┘
//! ```
//!
//! Key design principles:
//!
//! - A newer connect attempt always wins; stale transports are stopped
//! - Envelopes that arrive before their listener are pooled, then handed
//!   over exactly once and in order
//! - Screencast acknowledgments follow the consumer's frame rate
//! - Capture state is guarded by a session token
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devtools_session::{
//!     DeviceSession, FrameMetadata, Result, RouteKey, ScreencastConsumer, ScreencastOptions,
//! };
//!
//! struct Preview;
//!
//! impl ScreencastConsumer for Preview {
//!     fn on_frame(&self, data: &str, metadata: &FrameMetadata) {
//!         println!("{} bytes at {}x{}", data.len(), metadata.device_width, metadata.device_height);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = DeviceSession::builder()
//!         .address("ws://127.0.0.1:8097")
//!         .page(RouteKey::from_raw(1, 3))
//!         .build()?;
//!
//!     session.connect().await?;
//!     session
//!         .screencast()
//!         .start(ScreencastOptions::new(), Arc::new(Preview))
//!         .await?;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`capture`] | Trace capture lifecycle |
//! | [`config`] | Session tunables and injected settings |
//! | [`dispatcher`] | Envelope routing by (client, session) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire message types |
//! | [`screencast`] | Frame feed and acknowledgment throttling |
//! | [`session`] | [`DeviceSession`] facade |
//! | [`telemetry`] | Capture telemetry sink |
//! | [`transport`] | Connection bootstrap and WebSocket transport |

// ============================================================================
// Modules
// ============================================================================

/// Trace capture lifecycle.
pub mod capture;

/// Session tunables and injected settings.
pub mod config;

/// Envelope routing.
pub mod dispatcher;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire message types.
pub mod protocol;

/// Frame feed and acknowledgment throttling.
pub mod screencast;

/// Device session facade.
pub mod session;

/// Capture telemetry.
pub mod telemetry;

/// Connection bootstrap and transport.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Capture types
pub use capture::{
    CaptureClient, CaptureManager, CapturePhase, ClientCapabilities, ConversionWorker,
    FinishOutcome, JsonTraceConverter, TraceConverter,
};

// Configuration
pub use config::{DisplayMode, SessionConfig, Settings, SharedSettings};

// Dispatcher types
pub use dispatcher::{Backlog, Dispatcher};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CaptureToken, ClientId, Generation, RequestId, RouteKey, SessionId};

// Protocol types
pub use protocol::{Envelope, FrameMetadata, ParsedEvent};

// Screencast types
pub use screencast::{
    ImageFormat, ScreencastConsumer, ScreencastController, ScreencastFrame, ScreencastOptions,
};

// Session types
pub use session::{DeviceSession, DeviceSessionBuilder};

// Telemetry types
pub use telemetry::{LogTelemetry, Telemetry, TelemetryEvent};

// Transport types
pub use transport::{Bootstrapper, Connection, Connector, Transport, WsConnector};
