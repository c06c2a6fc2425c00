//! Daemon streamers: two fire-and-forget tasks per sandbox that tail the
//! container's merged stdout/stderr into `container.log` and the backend's
//! event feed into `container_events.log` (and the trace). Errors are
//! captured into the event log; the tasks exit silently. The loop never
//! awaits them — container teardown ends the underlying streams.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::sandbox::{Sandbox, SandboxBackend};
use crate::trace::{now_ts, TraceWriter};

async fn append_event_record(path: &PathBuf, record: Value) {
    let line = format!("{record}\n");
    if let Ok(mut f) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        let _ = f.write_all(line.as_bytes()).await;
    }
}

async fn stream_container_logs(
    backend: Arc<dyn SandboxBackend>,
    sandbox: Sandbox,
    log_path: PathBuf,
    events_path: PathBuf,
) {
    let result: anyhow::Result<()> = async {
        let mut stream = backend.logs_stream(&sandbox).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        append_event_record(
            &events_path,
            json!({"ts": now_ts(), "type": "log_stream_error", "error": e.to_string()}),
        )
        .await;
    }
}

async fn stream_container_events(
    backend: Arc<dyn SandboxBackend>,
    sandbox: Sandbox,
    events_path: PathBuf,
    trace: TraceWriter,
) {
    let result: anyhow::Result<()> = async {
        let stream = backend.events_stream(&sandbox).await?;
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let event: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            append_event_record(&events_path, event.clone()).await;
            trace.event(json!({"type": "container_event", "event": event}));
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        append_event_record(
            &events_path,
            json!({"ts": now_ts(), "type": "event_stream_error", "error": e.to_string()}),
        )
        .await;
    }
}

/// Spawn both streamers for the lifetime of the task. Best effort: the
/// returned handles are dropped by the caller.
pub fn spawn_streamers(
    backend: Arc<dyn SandboxBackend>,
    sandbox: &Sandbox,
    container_log_path: PathBuf,
    container_events_path: PathBuf,
    trace: TraceWriter,
) {
    tokio::spawn(stream_container_logs(
        backend.clone(),
        sandbox.clone(),
        container_log_path,
        container_events_path.clone(),
    ));
    tokio::spawn(stream_container_events(
        backend,
        sandbox.clone(),
        container_events_path,
        trace,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ByteStream, ExecOutput};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;

    /// Backend whose streams replay canned bytes.
    struct ReplayBackend {
        logs: Vec<u8>,
        events: Vec<u8>,
    }

    #[async_trait]
    impl SandboxBackend for ReplayBackend {
        async fn start(&self, _i: Option<&Path>, _w: &Path, _n: bool) -> Result<Sandbox> {
            unimplemented!()
        }
        async fn exec(&self, _s: &Sandbox, _a: &[String], _t: u64) -> Result<ExecOutput> {
            unimplemented!()
        }
        async fn logs_stream(&self, _s: &Sandbox) -> Result<ByteStream> {
            Ok(Box::new(std::io::Cursor::new(self.logs.clone())))
        }
        async fn events_stream(&self, _s: &Sandbox) -> Result<ByteStream> {
            Ok(Box::new(std::io::Cursor::new(self.events.clone())))
        }
        async fn stop(&self, _s: &Sandbox) -> Result<()> {
            Ok(())
        }
    }

    fn sandbox() -> Sandbox {
        Sandbox {
            container_id: "cid".into(),
            name: "n".into(),
            mem_limit: None,
            nano_cpus: None,
            pids_limit: None,
            privileged: true,
            network_mode: "bridge".into(),
        }
    }

    #[tokio::test]
    async fn test_log_streamer_appends_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ReplayBackend {
            logs: b"line one\nline two\n".to_vec(),
            events: Vec::new(),
        });
        let log_path = dir.path().join("container.log");
        stream_container_logs(
            backend,
            sandbox(),
            log_path.clone(),
            dir.path().join("container_events.log"),
        )
        .await;
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_event_streamer_writes_jsonl_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let events = b"{\"status\":\"start\"}\nnot json\n{\"status\":\"die\"}\n".to_vec();
        let backend = Arc::new(ReplayBackend { logs: Vec::new(), events });
        let events_path = dir.path().join("container_events.log");
        let trace_path = dir.path().join("trace.jsonl");
        stream_container_events(
            backend,
            sandbox(),
            events_path.clone(),
            TraceWriter::new(&trace_path),
        )
        .await;

        let content = std::fs::read_to_string(&events_path).unwrap();
        let lines: Vec<Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "start");

        let trace_content = std::fs::read_to_string(&trace_path).unwrap();
        let trace_lines: Vec<Value> =
            trace_content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(trace_lines.len(), 2);
        assert_eq!(trace_lines[1]["type"], "container_event");
        assert_eq!(trace_lines[1]["event"]["status"], "die");
    }
}
