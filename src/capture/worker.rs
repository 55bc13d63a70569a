//! Background trace conversion.
//!
//! The worker is an owned task started on first use and reused for every
//! later capture. Jobs arrive over a channel; each job answers on its own
//! channel with any number of [`WorkerMessage::Progress`] messages and one
//! final [`WorkerMessage::Done`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ============================================================================
// TraceConverter
// ============================================================================

/// Converts a raw drained trace into the client's format.
///
/// Runs on a blocking thread.
pub trait TraceConverter: Send + Sync + 'static {
    /// Converts `raw`, reporting status through `progress`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] if `raw` cannot be converted.
    fn convert(&self, raw: &[u8], progress: &dyn Fn(&str)) -> Result<Value>;
}

/// Converter for JSON traces.
///
/// Accepts either a bare event array or an object with `traceEvents`, and
/// always produces an object with `traceEvents`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTraceConverter;

impl TraceConverter for JsonTraceConverter {
    fn convert(&self, raw: &[u8], progress: &dyn Fn(&str)) -> Result<Value> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(json!({ "traceEvents": [] }));
        }

        progress("Parsing trace");
        let parsed: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::conversion(format!("invalid trace JSON: {e}")))?;

        let converted = match parsed {
            Value::Array(events) => json!({ "traceEvents": events }),
            Value::Object(map) if map.get("traceEvents").is_some_and(Value::is_array) => {
                Value::Object(map)
            }
            _ => return Err(Error::conversion("trace has no event array")),
        };

        let count = converted["traceEvents"].as_array().map_or(0, Vec::len);
        progress(&format!("Converted {count} events"));
        Ok(converted)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message from the worker about one job.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Status update.
    Progress(String),
    /// Final result.
    Done(Result<Value>),
}

struct Job {
    raw: Vec<u8>,
    reply: mpsc::UnboundedSender<WorkerMessage>,
}

struct WorkerHandle {
    jobs: mpsc::UnboundedSender<Job>,
    task: JoinHandle<()>,
}

// ============================================================================
// ConversionWorker
// ============================================================================

/// Lazily started conversion task.
pub struct ConversionWorker {
    converter: Arc<dyn TraceConverter>,
    handle: Mutex<Option<WorkerHandle>>,
}

impl fmt::Debug for ConversionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionWorker")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Default for ConversionWorker {
    fn default() -> Self {
        Self::new(Arc::new(JsonTraceConverter))
    }
}

impl ConversionWorker {
    /// Creates a worker around `converter`. No task starts until the first job.
    #[must_use]
    pub fn new(converter: Arc<dyn TraceConverter>) -> Self {
        Self {
            converter,
            handle: Mutex::new(None),
        }
    }

    /// Returns `true` while the worker task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Hands `raw` to the worker, starting it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerStopped`] if the job cannot be queued.
    pub fn submit(&self, raw: Vec<u8>) -> Result<mpsc::UnboundedReceiver<WorkerMessage>> {
        let (reply, messages) = mpsc::unbounded_channel();
        let mut job = Job { raw, reply };

        let mut handle = self.handle.lock();
        for _ in 0..2 {
            let worker = handle.get_or_insert_with(|| self.spawn());
            match worker.jobs.send(job) {
                Ok(()) => return Ok(messages),
                Err(mpsc::error::SendError(returned)) => {
                    debug!("Conversion worker gone, restarting");
                    job = returned;
                    *handle = None;
                }
            }
        }

        Err(Error::WorkerStopped)
    }

    /// Stops the worker task. A later job starts a new one.
    pub fn shutdown(&self) {
        if let Some(worker) = self.handle.lock().take() {
            worker.task.abort();
            debug!("Conversion worker stopped");
        }
    }

    fn spawn(&self) -> WorkerHandle {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(Arc::clone(&self.converter), receiver));
        info!("Conversion worker started");
        WorkerHandle { jobs, task }
    }
}

impl Drop for ConversionWorker {
    fn drop(&mut self) {
        if let Some(worker) = self.handle.get_mut().take() {
            worker.task.abort();
        }
    }
}

async fn run_worker(converter: Arc<dyn TraceConverter>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job { raw, reply }) = jobs.recv().await {
        let converter = Arc::clone(&converter);
        let progress_reply = reply.clone();
        let bytes = raw.len();

        let outcome = tokio::task::spawn_blocking(move || {
            let progress = |message: &str| {
                let _ = progress_reply.send(WorkerMessage::Progress(message.to_string()));
            };
            converter.convert(&raw, &progress)
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => Err(Error::conversion(format!("converter task failed: {e}"))),
        };
        debug!(bytes, ok = result.is_ok(), "Conversion job finished");
        let _ = reply.send(WorkerMessage::Done(result));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut messages: mpsc::UnboundedReceiver<WorkerMessage>) -> (Vec<String>, Result<Value>) {
        let mut progress = Vec::new();
        while let Some(message) = messages.recv().await {
            match message {
                WorkerMessage::Progress(text) => progress.push(text),
                WorkerMessage::Done(result) => return (progress, result),
            }
        }
        (progress, Err(Error::WorkerStopped))
    }

    #[test]
    fn test_json_converter_shapes() {
        let converter = JsonTraceConverter;
        let noop = |_: &str| {};

        let from_array = converter.convert(br#"[{"name":"a"}]"#, &noop).unwrap();
        assert_eq!(from_array, json!({"traceEvents": [{"name": "a"}]}));

        let from_object = converter
            .convert(br#"{"traceEvents":[],"metadata":{}}"#, &noop)
            .unwrap();
        assert_eq!(from_object["metadata"], json!({}));

        assert_eq!(
            converter.convert(b"  ", &noop).unwrap(),
            json!({"traceEvents": []})
        );
        assert!(matches!(
            converter.convert(b"{\"x\":1}", &noop),
            Err(Error::Conversion { .. })
        ));
        assert!(converter.convert(b"not json", &noop).is_err());
    }

    #[tokio::test]
    async fn test_worker_starts_lazily_and_is_reused() {
        let worker = ConversionWorker::default();
        assert!(!worker.is_running());

        let (progress, result) = collect(worker.submit(b"[]".to_vec()).unwrap()).await;
        assert_eq!(result.unwrap(), json!({"traceEvents": []}));
        assert_eq!(progress, vec!["Parsing trace", "Converted 0 events"]);
        assert!(worker.is_running());

        let (_, second) = collect(worker.submit(br#"[1,2]"#.to_vec()).unwrap()).await;
        assert_eq!(second.unwrap()["traceEvents"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_worker_restarts_after_shutdown() {
        let worker = ConversionWorker::default();
        let _ = collect(worker.submit(b"[]".to_vec()).unwrap()).await;

        worker.shutdown();
        assert!(!worker.is_running());

        let (_, result) = collect(worker.submit(b"[]".to_vec()).unwrap()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_conversion_error_reported() {
        let worker = ConversionWorker::default();
        let (_, result) = collect(worker.submit(b"oops".to_vec()).unwrap()).await;
        assert!(matches!(result, Err(Error::Conversion { .. })));
    }
}
