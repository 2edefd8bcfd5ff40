use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub type EventPayload = Map<String, Value>;

/// Why a page (or a whole stream) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    ProviderError,
    ValidationError,
    StorageError,
    WorkerCrash,
}

impl PageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PageErrorKind::ProviderError => "provider_error",
            PageErrorKind::ValidationError => "validation_error",
            PageErrorKind::StorageError => "storage_error",
            PageErrorKind::WorkerCrash => "worker_crash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub task_id: String,
    pub images: Vec<String>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Progress notification produced by the generation pipeline.
///
/// Page-scoped variants carry the page index; task-scoped ones carry `None`,
/// which goes out on the wire as `-1`.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Progress {
        index: Option<usize>,
        current: usize,
        total: usize,
        message: String,
    },
    Success {
        index: usize,
        image_url: String,
        message: String,
    },
    Error {
        index: Option<usize>,
        kind: PageErrorKind,
        message: String,
        retryable: bool,
    },
    Heartbeat,
    Finish(RunSummary),
}

impl GenerationEvent {
    pub fn page_error(
        index: usize,
        kind: PageErrorKind,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        GenerationEvent::Error {
            index: Some(index),
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn task_error(kind: PageErrorKind, message: impl Into<String>) -> Self {
        GenerationEvent::Error {
            index: None,
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            GenerationEvent::Progress { .. } => "progress",
            GenerationEvent::Success { .. } => "success",
            GenerationEvent::Error { .. } => "error",
            GenerationEvent::Heartbeat => "heartbeat",
            GenerationEvent::Finish(_) => "finish",
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            GenerationEvent::Progress { .. } => "generating",
            GenerationEvent::Success { .. } => "done",
            GenerationEvent::Error { .. } => "error",
            GenerationEvent::Heartbeat => "heartbeat",
            GenerationEvent::Finish(_) => "finish",
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            GenerationEvent::Progress { index, .. } | GenerationEvent::Error { index, .. } => *index,
            GenerationEvent::Success { index, .. } => Some(*index),
            GenerationEvent::Heartbeat | GenerationEvent::Finish(_) => None,
        }
    }

    /// Terminal per-page outcome (exactly one per attempted page).
    pub fn is_page_outcome(&self) -> bool {
        match self {
            GenerationEvent::Success { .. } => true,
            GenerationEvent::Error { index, .. } => index.is_some(),
            _ => false,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, GenerationEvent::Error { retryable: true, .. })
    }

    /// Wire payload. Always carries `index`, `status`, `message`, `retryable`.
    pub fn payload(&self) -> EventPayload {
        let mut payload = Map::new();
        payload.insert("index".to_string(), wire_index(self.index()));
        payload.insert(
            "status".to_string(),
            Value::String(self.status().to_string()),
        );
        payload.insert("retryable".to_string(), Value::Bool(self.retryable()));
        match self {
            GenerationEvent::Progress {
                current,
                total,
                message,
                ..
            } => {
                payload.insert("message".to_string(), json!(message));
                payload.insert("current".to_string(), json!(current));
                payload.insert("total".to_string(), json!(total));
            }
            GenerationEvent::Success {
                image_url, message, ..
            } => {
                payload.insert("message".to_string(), json!(message));
                payload.insert("image_url".to_string(), json!(image_url));
            }
            GenerationEvent::Error { kind, message, .. } => {
                payload.insert("message".to_string(), json!(message));
                payload.insert("kind".to_string(), json!(kind.as_str()));
            }
            GenerationEvent::Heartbeat => {
                payload.insert("message".to_string(), json!("keep-alive"));
            }
            GenerationEvent::Finish(summary) => {
                payload.insert(
                    "message".to_string(),
                    json!(format!(
                        "{} of {} pages generated",
                        summary.completed, summary.total
                    )),
                );
                payload.insert("success".to_string(), json!(summary.failed == 0));
                payload.insert("task_id".to_string(), json!(summary.task_id));
                payload.insert("images".to_string(), json!(summary.images));
                payload.insert("total".to_string(), json!(summary.total));
                payload.insert("completed".to_string(), json!(summary.completed));
                payload.insert("failed".to_string(), json!(summary.failed));
            }
        }
        payload
    }
}

fn wire_index(index: Option<usize>) -> Value {
    match index {
        Some(index) => json!(index),
        None => json!(-1),
    }
}

/// Append-only writer for a task's `events.jsonl`.
///
/// - default fields are `type`, `task_id`, `ts`
/// - the event payload is merged last
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    task_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, task_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                task_id: task_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn emit(&self, event: &GenerationEvent) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert(
            "type".to_string(),
            Value::String(event.event_type().to_string()),
        );
        row.insert(
            "task_id".to_string(),
            Value::String(self.inner.task_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in event.payload() {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn every_payload_carries_the_common_fields() {
        let events = vec![
            GenerationEvent::Progress {
                index: Some(0),
                current: 1,
                total: 2,
                message: "generating".to_string(),
            },
            GenerationEvent::Success {
                index: 0,
                image_url: "/api/images/t/0.png".to_string(),
                message: "ok".to_string(),
            },
            GenerationEvent::page_error(1, PageErrorKind::ProviderError, "boom", true),
            GenerationEvent::Heartbeat,
            GenerationEvent::Finish(RunSummary {
                task_id: "t".to_string(),
                images: vec!["0.png".to_string()],
                total: 2,
                completed: 1,
                failed: 1,
            }),
        ];
        for event in events {
            let payload = event.payload();
            for key in ["index", "status", "message", "retryable"] {
                assert!(
                    payload.contains_key(key),
                    "{} payload missing {key}",
                    event.event_type()
                );
            }
        }
    }

    #[test]
    fn task_level_events_use_negative_index() {
        let payload = GenerationEvent::task_error(PageErrorKind::WorkerCrash, "died").payload();
        assert_eq!(payload["index"], json!(-1));
        assert_eq!(payload["retryable"], json!(false));
        assert_eq!(payload["kind"], json!("worker_crash"));
        assert_eq!(GenerationEvent::Heartbeat.payload()["index"], json!(-1));
    }

    #[test]
    fn page_outcomes_are_success_and_page_errors_only() {
        assert!(GenerationEvent::Success {
            index: 0,
            image_url: String::new(),
            message: String::new(),
        }
        .is_page_outcome());
        assert!(
            GenerationEvent::page_error(2, PageErrorKind::StorageError, "disk", true)
                .is_page_outcome()
        );
        assert!(!GenerationEvent::task_error(PageErrorKind::WorkerCrash, "x").is_page_outcome());
        assert!(!GenerationEvent::Heartbeat.is_page_outcome());
    }

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("task-1").join("events.jsonl");
        let writer = EventWriter::new(&path, "task-1");

        let emitted = writer.emit(&GenerationEvent::page_error(
            4,
            PageErrorKind::ValidationError,
            "page 4 has no content",
            false,
        ))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("error"));
        assert_eq!(parsed["task_id"], json!("task-1"));
        assert_eq!(parsed["index"], json!(4));
        assert_eq!(parsed["kind"], json!("validation_error"));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn emit_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "task-1");

        writer.emit(&GenerationEvent::Heartbeat)?;
        writer.emit(&GenerationEvent::Success {
            index: 1,
            image_url: "/api/images/task-1/1.png".to_string(),
            message: "done".to_string(),
        })?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["type"], json!("success"));
        assert_eq!(second["image_url"], json!("/api/images/task-1/1.png"));
        Ok(())
    }
}
