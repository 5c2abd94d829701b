use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};

/// Hard cap on a single emitted line. Oversized events are dropped and
/// counted rather than truncated into invalid JSON.
const MAX_LINE_BYTES: usize = 8 * 1024;
const CHANNEL_CAPACITY: usize = 1024;

/// One business operation, rendered as a JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct OpsEvent {
    pub ts: String,
    pub op: &'static str,
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub latency_ms: f64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

impl OpsEvent {
    pub fn new(op: &'static str, tenant: &str) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            op,
            tenant: tenant.to_string(),
            collection: None,
            latency_ms: 0.0,
            status: "ok",
            k: None,
            hits: None,
            docid: None,
            chunks: None,
            new_name: None,
            request_id: None,
            error_code: None,
        }
    }

    pub fn collection(mut self, name: &str) -> Self {
        self.collection = Some(name.to_string());
        self
    }

    pub fn failed(mut self, code: &'static str) -> Self {
        self.status = "error";
        self.error_code = Some(code);
        self
    }
}

/// Non-blocking JSON-lines stream of business operations.
///
/// Events go through a bounded channel to a writer task; when the channel is
/// full (or a line exceeds the size cap) the event is dropped and counted.
/// Business operations never block on logging.
pub struct OpsLog {
    tx: Option<mpsc::Sender<String>>,
    dropped: Arc<AtomicU64>,
}

impl OpsLog {
    /// A disabled stream: every emit is a no-op.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the writer task for `stdout` or an append-mode file target.
    pub fn start(target: &str) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        match target {
            "stdout" => {
                tokio::spawn(write_loop(rx, std::io::stdout(), dropped.clone()));
            }
            path => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open ops log '{path}'"))
                    .map_err(EngineError::Internal)?;
                tokio::spawn(write_loop(rx, file, dropped.clone()));
            }
        }

        Ok(Self {
            tx: Some(tx),
            dropped,
        })
    }

    pub fn emit(&self, event: OpsEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize ops event");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if line.len() > MAX_LINE_BYTES || tx.try_send(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events lost to backpressure, size caps, or write errors.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn write_loop<W: Write + Send + 'static>(
    mut rx: mpsc::Receiver<String>,
    mut sink: W,
    dropped: Arc<AtomicU64>,
) {
    while let Some(line) = rx.recv().await {
        if writeln!(sink, "{line}").is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_shape_is_compact() {
        let event = OpsEvent::new("search", "demo").collection("books");
        let line = serde_json::to_string(&event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["op"], "search");
        assert_eq!(parsed["tenant"], "demo");
        assert_eq!(parsed["collection"], "books");
        assert_eq!(parsed["status"], "ok");
        // unset conditional fields are omitted entirely
        assert!(parsed.get("docid").is_none());
        assert!(parsed.get("error_code").is_none());
        // ts is ISO-8601 UTC with millisecond precision
        assert!(parsed["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn failed_events_carry_the_code() {
        let event = OpsEvent::new("ingest", "demo").failed("too_large");
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["error_code"], "too_large");
    }

    #[test]
    fn disabled_log_counts_nothing() {
        let log = OpsLog::disabled();
        log.emit(OpsEvent::new("search", "demo"));
        assert_eq!(log.dropped(), 0);
    }

    #[tokio::test]
    async fn file_target_receives_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ops.jsonl");
        let log = OpsLog::start(path.to_str().unwrap()).unwrap();

        log.emit(OpsEvent::new("create_collection", "demo").collection("books"));
        log.emit(OpsEvent::new("search", "demo").collection("books"));

        // give the writer task a moment to drain
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if std::fs::read_to_string(&path)
                .map(|s| s.lines().count() >= 2)
                .unwrap_or(false)
            {
                break;
            }
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["op"], "create_collection");
        assert_eq!(log.dropped(), 0);
    }

    #[tokio::test]
    async fn oversized_events_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ops.jsonl");
        let log = OpsLog::start(path.to_str().unwrap()).unwrap();

        let mut event = OpsEvent::new("ingest", "demo");
        event.docid = Some("x".repeat(MAX_LINE_BYTES));
        log.emit(event);
        assert_eq!(log.dropped(), 1);
    }
}
