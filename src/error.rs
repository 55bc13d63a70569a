//! Error types for the device session layer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devtools_session::{CaptureClient, DeviceSession, Error, Result};
//!
//! async fn example(session: &DeviceSession, client: Arc<dyn CaptureClient>) -> Result<()> {
//!     session.connect().await?;
//!     match session.capture().start(client, "", "").await {
//!         Err(Error::AlreadyActive { .. }) => Ok(()),
//!         other => other.map(drop),
//!     }
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Contract | [`Error::AlreadyActive`], [`Error::NotActive`], [`Error::AlreadyFinishing`] |
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::Superseded`], [`Error::NotConnected`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Transport`], [`Error::Protocol`], [`Error::RequestTimeout`] |
//! | Capture | [`Error::StreamRead`], [`Error::Conversion`], [`Error::WorkerStopped`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{Generation, RequestId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Contract Errors
    // ========================================================================
    /// An operation was started twice without an intervening stop.
    #[error("{operation} already started")]
    AlreadyActive {
        /// The operation that is already running.
        operation: &'static str,
    },

    /// An operation was stopped without having been started.
    #[error("{operation} not started")]
    NotActive {
        /// The operation that is not running.
        operation: &'static str,
    },

    /// A stop was requested while a previous stop is still finishing.
    #[error("{operation} already stopping")]
    AlreadyFinishing {
        /// The operation that is finishing.
        operation: &'static str,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when session configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The connect attempt lost the race against its deadline.
    #[error("connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The connect attempt was outraced by a newer one.
    #[error("superseded by a newer connection (generation {generation})")]
    Superseded {
        /// Generation of the discarded attempt.
        generation: Generation,
    },

    /// No connection is installed and none is in flight.
    #[error("not connected")]
    NotConnected,

    /// Transport connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The remote end reported a protocol-level failure.
    #[error("Transport error {code}: {message}")]
    Transport {
        /// Remote error code.
        code: i64,
        /// Remote error message.
        message: String,
    },

    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Command request timeout.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Capture Errors
    // ========================================================================
    /// A read against a trace stream handle failed.
    #[error("Stream read failed on {handle}: {message}")]
    StreamRead {
        /// Stream handle being drained.
        handle: String,
        /// Description of the failure.
        message: String,
    },

    /// Trace conversion failed.
    #[error("Conversion failed: {message}")]
    Conversion {
        /// Description of the conversion failure.
        message: String,
    },

    /// The background conversion worker is no longer running.
    #[error("Conversion worker stopped")]
    WorkerStopped,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an already-active error.
    #[inline]
    pub fn already_active(operation: &'static str) -> Self {
        Self::AlreadyActive { operation }
    }

    /// Creates a not-active error.
    #[inline]
    pub fn not_active(operation: &'static str) -> Self {
        Self::NotActive { operation }
    }

    /// Creates an already-finishing error.
    #[inline]
    pub fn already_finishing(operation: &'static str) -> Self {
        Self::AlreadyFinishing { operation }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a superseded error.
    #[inline]
    pub fn superseded(generation: Generation) -> Self {
        Self::Superseded { generation }
    }

    /// Creates a transport error from a remote error payload.
    #[inline]
    pub fn transport(code: i64, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a stream read error.
    #[inline]
    pub fn stream_read(handle: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StreamRead {
            handle: handle.into(),
            message: message.into(),
        }
    }

    /// Creates a conversion error.
    #[inline]
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    /// Rebuilds an error handed out to several waiters of a shared result.
    ///
    /// The last waiter takes the original; the others get a copy that keeps
    /// the variant for timeout, superseded and transport failures.
    pub(crate) fn from_shared(shared: Arc<Error>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(|shared| match &*shared {
            Self::ConnectionTimeout { timeout_ms } => Self::connection_timeout(*timeout_ms),
            Self::Superseded { generation } => Self::superseded(*generation),
            Self::NotConnected => Self::NotConnected,
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Transport { code, message } => Self::transport(*code, message.clone()),
            Self::Config { message } => Self::config(message.clone()),
            other => Self::connection(other.to_string()),
        })
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::Superseded { .. }
                | Self::NotConnected
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the caller violated an operation contract.
    ///
    /// These are surfaced synchronously and never retried.
    #[inline]
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyActive { .. } | Self::NotActive { .. } | Self::AlreadyFinishing { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::Superseded { .. }
                | Self::RequestTimeout { .. }
                | Self::Transport { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
