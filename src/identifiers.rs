//! Type-safe identifiers for protocol entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Wraps | Purpose |
//! |------|-------|---------|
//! | [`ClientId`] | `u32` | Remote debug client (one device app) |
//! | [`SessionId`] | `u32` | Debug session within a client |
//! | [`RouteKey`] | `(ClientId, SessionId)` | Demultiplexing key |
//! | [`RequestId`] | `Uuid` | Request/response correlation |
//! | [`Generation`] | `u64` | Connect attempt epoch |
//! | [`CaptureToken`] | `u64` | Capture session handle |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ClientId
// ============================================================================

/// Identifier of a remote debug client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u32);

impl ClientId {
    /// Creates a client ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Identifier of a debug session within a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    /// Browser-level session reserved for tracing.
    pub const BROWSER: Self = Self(0);

    /// Creates a session ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns `true` for the reserved browser-level session.
    #[inline]
    #[must_use]
    pub const fn is_browser(&self) -> bool {
        self.0 == Self::BROWSER.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RouteKey
// ============================================================================

/// The (client, session) pair identifying one remote debug target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    /// Remote client.
    pub client_id: ClientId,
    /// Session within the client.
    pub session_id: SessionId,
}

impl RouteKey {
    /// Creates a route key.
    #[inline]
    #[must_use]
    pub const fn new(client_id: ClientId, session_id: SessionId) -> Self {
        Self {
            client_id,
            session_id,
        }
    }

    /// Creates a route key from raw values.
    #[inline]
    #[must_use]
    pub const fn from_raw(client_id: u32, session_id: u32) -> Self {
        Self::new(ClientId::new(client_id), SessionId::new(session_id))
    }

    /// Returns the browser-level route of the same client.
    #[inline]
    #[must_use]
    pub const fn browser(&self) -> Self {
        Self::new(self.client_id, SessionId::BROWSER)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.session_id)
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Request/response correlation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Epoch of a connect attempt.
///
/// Monotonically increasing; the most recent generation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    /// Creates a generation.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// CaptureToken
// ============================================================================

/// Global counter for capture tokens.
static NEXT_CAPTURE_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Handle of one capture session.
///
/// Completion handlers carry the token of the session they belong to and
/// are ignored once that session is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureToken(u64);

impl CaptureToken {
    /// Allocates the next token.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CAPTURE_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
