//! Append-only `trace.jsonl` writer. This is the product event stream the
//! dashboard and the verifier read; operational logging goes through
//! `tracing` instead.

use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::llm::ChatMessage;
use vera_core::config::{clip_text, MAX_MODEL_IO_CHARS, MAX_MODEL_IO_MESSAGES};

pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct TraceWriter {
    path: PathBuf,
}

impl TraceWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, stamping `ts` when the caller did not.
    pub fn event(&self, event: Value) {
        let mut event = event;
        if let Some(obj) = event.as_object_mut() {
            obj.entry("ts").or_insert_with(|| json!(now_ts()));
        }
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("Unserializable trace event: {e}");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!("Failed to append trace event: {e}");
        }
    }
}

/// Compact a message list for the `model_io` trace event: keep the tail,
/// clip each content, and note how many earlier messages were dropped.
pub fn compact_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let total = messages.len();
    let mut out: Vec<Value> = Vec::new();
    if total > MAX_MODEL_IO_MESSAGES {
        out.push(json!({
            "role": "system",
            "content": format!("[omitted {} earlier messages]", total - MAX_MODEL_IO_MESSAGES),
        }));
    }
    let start = total.saturating_sub(MAX_MODEL_IO_MESSAGES);
    for m in &messages[start..] {
        out.push(json!({
            "role": m.role,
            "content": clip_text(&m.content, MAX_MODEL_IO_CHARS),
        }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_appends_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let tw = TraceWriter::new(&path);
        tw.event(json!({"type": "task", "task": "t"}));
        tw.event(json!({"type": "heartbeat", "ts": 1.0}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0]["ts"].as_f64().unwrap() > 0.0);
        assert_eq!(lines[1]["ts"], 1.0);
    }

    #[test]
    fn test_compact_messages_elides_head() {
        let messages: Vec<ChatMessage> = (0..20)
            .map(|i| ChatMessage::user(format!("m{i}")))
            .collect();
        let compact = compact_messages(&messages);
        assert_eq!(compact.len(), MAX_MODEL_IO_MESSAGES + 1);
        assert!(compact[0]["content"]
            .as_str()
            .unwrap()
            .contains("omitted 8 earlier messages"));
        assert_eq!(compact[1]["content"], "m8");
    }

    #[test]
    fn test_compact_messages_clips_content() {
        let messages = vec![ChatMessage::user("x".repeat(MAX_MODEL_IO_CHARS + 10))];
        let compact = compact_messages(&messages);
        assert!(compact[0]["content"].as_str().unwrap().contains("truncated"));
    }
}
