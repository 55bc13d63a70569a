//! Transport layer.
//!
//! This module owns the link between the local end and a remote debug
//! server, and the rules for replacing it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect   ┌─────────────┐   WebSocket   ┌──────────────┐
//! │ Bootstrapper │───────────►│  Connector  │──────────────►│ Debug server │
//! │ (generation) │            └─────────────┘               └──────────────┘
//! │              │  Connection      ▲                              │
//! │   current ───┼──────────────────┘   envelopes                  │
//! └──────────────┘◄─────────────────────────────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Bootstrapper::connect` - Bump generation, stop the current connection
//! 2. `Connector::connect` - Open a transport, raced against the connect timeout
//! 3. Generation check - A stale transport is stopped and discarded
//! 4. `Dispatcher::attach` - Route inbound envelopes
//! 5. `Bootstrapper::disconnect` - Stop and forget the connection
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bootstrap` | Generation-checked connection replacement |
//! | `connection` | Transport seams and the connection handle |
//! | `websocket` | WebSocket transport and connector |

// ============================================================================
// Submodules
// ============================================================================

/// Generation-checked connection replacement.
pub mod bootstrap;

/// Transport seams and the connection handle.
pub mod connection;

/// WebSocket transport and connector.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use bootstrap::Bootstrapper;
pub use connection::{Connection, Connector, EnvelopeHandler, Transport};
pub use websocket::{WsConnector, WsTransport};
