//! Trace stream draining.
//!
//! Reads a remote stream handle in bounded chunks until end-of-file or an
//! empty chunk, decoding each base64 chunk into one contiguous buffer.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::identifiers::RouteKey;
use crate::protocol::IoCommand;
use crate::transport::Connection;

// ============================================================================
// Drained
// ============================================================================

/// Result of a drain.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    /// Concatenated chunks in arrival order.
    pub(crate) bytes: Vec<u8>,
    /// Chunks that carried data.
    pub(crate) chunks: usize,
    /// Whether end-of-file was reached and the handle closed.
    pub(crate) eof: bool,
    /// The read error that ended the loop early.
    pub(crate) error: Option<Error>,
}

// ============================================================================
// Drain
// ============================================================================

/// Drains `handle` over `connection`.
///
/// `on_chunk` receives the cumulative byte count after each non-empty
/// chunk. A failed read ends the loop; bytes read so far are kept.
pub(crate) async fn drain_stream<F>(
    connection: &Connection,
    route: RouteKey,
    handle: &str,
    chunk_size: usize,
    mut on_chunk: F,
) -> Drained
where
    F: FnMut(usize),
{
    let mut drained = Drained::default();

    loop {
        let read = IoCommand::Read {
            handle: handle.to_string(),
            size: chunk_size,
        };

        let result = match connection.execute(route, read).await {
            Ok(result) => result,
            Err(e) => {
                warn!(handle, error = %e, bytes = drained.bytes.len(), "Stream read failed");
                drained.error = Some(Error::stream_read(handle, e.to_string()));
                break;
            }
        };

        let chunk = match decode_chunk(&result) {
            Ok(chunk) => chunk,
            Err(message) => {
                warn!(handle, %message, "Stream chunk undecodable");
                drained.error = Some(Error::stream_read(handle, message));
                break;
            }
        };
        let eof = result.get("eof").and_then(Value::as_bool).unwrap_or(false);

        if !chunk.is_empty() {
            drained.bytes.extend_from_slice(&chunk);
            drained.chunks += 1;
            debug!(handle, chunk = chunk.len(), total = drained.bytes.len(), "Stream chunk read");
            on_chunk(drained.bytes.len());
        }

        if eof {
            drained.eof = true;
            close_stream(connection, route, handle).await;
            break;
        }

        if chunk.is_empty() {
            debug!(handle, "Empty chunk before end-of-file, stopping");
            break;
        }
    }

    drained
}

/// Decodes the `data` field of an `IO.read` result.
fn decode_chunk(result: &Value) -> Result<Vec<u8>, String> {
    let data = result.get("data").and_then(Value::as_str).unwrap_or_default();
    let base64_encoded = result
        .get("base64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    if !base64_encoded {
        return Ok(data.as_bytes().to_vec());
    }

    STANDARD.decode(data).map_err(|e| e.to_string())
}

pub(crate) async fn close_stream(connection: &Connection, route: RouteKey, handle: &str) {
    let close = IoCommand::Close {
        handle: handle.to_string(),
    };
    if let Err(e) = connection.execute(route, close).await {
        warn!(handle, error = %e, "Stream close failed");
    }
}

// ============================================================================
// Tests
// ============================================================================
