//! Read-only dashboard over a base directory of session work dirs: tails of
//! every artifact file, run status, metrics, and a live SSE feed of the
//! trace. The only file it ever writes is `session.log` (control actions).

pub mod metrics;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const MAX_SESSIONS: usize = 200;
const DEFAULT_TAIL: usize = 200;

pub struct DashboardState {
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct TailParams {
    session: Option<String>,
    tail: Option<usize>,
}

/// Work dirs under the base dir that contain a trace, newest first.
pub fn list_sessions(base_dir: &Path) -> Vec<String> {
    let mut sessions: Vec<(String, std::time::SystemTime)> = Vec::new();
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let trace = path.join("trace.jsonl");
        let Ok(meta) = std::fs::metadata(&trace) else {
            continue;
        };
        let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            sessions.push((name.to_string(), mtime));
        }
    }
    sessions.sort_by(|a, b| b.1.cmp(&a.1));
    sessions.truncate(MAX_SESSIONS);
    sessions.into_iter().map(|(name, _)| name).collect()
}

/// Resolve a session name (or the most recent one) to its work dir,
/// refusing path traversal out of the base dir.
fn resolve_session(base_dir: &Path, session: Option<&str>) -> Option<PathBuf> {
    match session {
        Some(name) => {
            if name.contains("..") || name.contains('/') || name.contains('\\') {
                return None;
            }
            let dir = base_dir.join(name);
            dir.is_dir().then_some(dir)
        }
        None => list_sessions(base_dir).first().map(|name| base_dir.join(name)),
    }
}

pub fn read_tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

fn tail_jsonl(path: &Path, n: usize) -> Vec<Value> {
    read_tail_lines(path, n)
        .into_iter()
        .filter_map(|l| serde_json::from_str(&l).ok())
        .collect()
}

fn artifact_tail(state: &DashboardState, params: &TailParams, file: &str) -> Json<Value> {
    let tail = params.tail.unwrap_or(DEFAULT_TAIL);
    let Some(dir) = resolve_session(&state.base_dir, params.session.as_deref()) else {
        return Json(json!({"error": "session not found"}));
    };
    let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
    let path = dir.join(file);
    if file.ends_with(".jsonl") || file == "container_events.log" {
        Json(json!({"session": name, "entries": tail_jsonl(&path, tail)}))
    } else {
        Json(json!({"session": name, "lines": read_tail_lines(&path, tail)}))
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn sessions_handler(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!({"sessions": list_sessions(&state.base_dir)}))
}

async fn run_status_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<TailParams>,
) -> Json<Value> {
    let Some(dir) = resolve_session(&state.base_dir, params.session.as_deref()) else {
        return Json(json!({"error": "session not found"}));
    };
    let entries = tail_jsonl(&dir.join("trace.jsonl"), 50);
    let last = entries.last().cloned().unwrap_or(Value::Null);
    let last_step = entries
        .iter()
        .rev()
        .find_map(|e| e.get("step").and_then(|v| v.as_u64()))
        .unwrap_or(0);
    let last_score = entries
        .iter()
        .rev()
        .find(|e| e.get("type").and_then(|v| v.as_str()) == Some("verifier"))
        .and_then(|e| e["decision"].get("score").cloned());
    Json(json!({
        "session": dir.file_name().and_then(|n| n.to_str()),
        "last_ts": last.get("ts"),
        "last_type": last.get("type"),
        "last_step": last_step,
        "last_verifier_score": last_score,
    }))
}

async fn metrics_json_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<TailParams>,
) -> Json<Value> {
    let Some(dir) = resolve_session(&state.base_dir, params.session.as_deref()) else {
        return Json(json!({"error": "session not found"}));
    };
    let m = metrics::compute(&dir.join("trace.jsonl"));
    Json(serde_json::to_value(m).unwrap_or(Value::Null))
}

async fn metrics_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let Some(dir) = resolve_session(&state.base_dir, params.session.as_deref()) else {
        return (axum::http::StatusCode::NOT_FOUND, "session not found".to_string());
    };
    let m = metrics::compute(&dir.join("trace.jsonl"));
    (axum::http::StatusCode::OK, metrics::render_prometheus(&m))
}

/// SSE feed of new trace lines: poll the file and stream appended events.
async fn events_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<TailParams>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let dir = resolve_session(&state.base_dir, params.session.as_deref());
    let stream = async_stream::stream! {
        let Some(dir) = dir else {
            yield Ok(Event::default().event("error").data("session not found"));
            return;
        };
        let trace_path = dir.join("trace.jsonl");
        let mut offset: u64 = std::fs::metadata(&trace_path).map(|m| m.len()).unwrap_or(0);
        let mut last_emit = std::time::Instant::now();
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let len = std::fs::metadata(&trace_path).map(|m| m.len()).unwrap_or(0);
            if len < offset {
                offset = 0;
            }
            if len == offset {
                // Idle heartbeat so clients can tell the feed is alive.
                if last_emit.elapsed() > Duration::from_secs(5) {
                    let ts = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0);
                    yield Ok(Event::default().data(json!({"type": "heartbeat", "ts": ts}).to_string()));
                    last_emit = std::time::Instant::now();
                }
                continue;
            }
            last_emit = std::time::Instant::now();
            let Ok(content) = std::fs::read_to_string(&trace_path) else {
                continue;
            };
            let end = content.len().min(len as usize);
            let start = (offset as usize).min(end);
            let new = &content[start..end];
            offset = len;
            for line in new.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    yield Ok(Event::default().data(line.to_string()));
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Control actions land in `session.log`; nothing else is writable.
async fn new_session_handler(
    State(state): State<Arc<DashboardState>>,
    Query(params): Query<TailParams>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let Some(dir) = resolve_session(&state.base_dir, params.session.as_deref()) else {
        return Json(json!({"error": "session not found"}));
    };
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let record = json!({"ts": ts, "type": "new_session", "request": body});
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("session.log"))
        .and_then(|mut f| writeln!(f, "{record}"));
    match result {
        Ok(()) => Json(json!({"ok": true})),
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

pub fn router(state: Arc<DashboardState>) -> Router {
    macro_rules! tail_route {
        ($file:expr) => {
            get(move |State(state): State<Arc<DashboardState>>, Query(params): Query<TailParams>| async move {
                artifact_tail(&state, &params, $file)
            })
        };
    }
    Router::new()
        .route("/", get(index_handler))
        .route("/sessions", get(sessions_handler))
        .route("/notes", tail_route!("notes.md"))
        .route("/evidence", tail_route!("evidence.jsonl"))
        .route("/move_ledger", tail_route!("move_ledger.jsonl"))
        .route("/query_ledger", tail_route!("query_ledger.jsonl"))
        .route("/container_log", tail_route!("container.log"))
        .route("/container_events", tail_route!("container_events.log"))
        .route("/run_status", get(run_status_handler))
        .route("/metrics_json", get(metrics_json_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", get(events_handler))
        .route("/new_session", post(new_session_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(base_dir: PathBuf, host: &str, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(DashboardState { base_dir });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Dashboard listening on http://{host}:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_session(base: &Path, name: &str, trace_lines: &[Value]) -> PathBuf {
        let dir = base.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let content: String = trace_lines.iter().map(|l| format!("{l}\n")).collect();
        std::fs::write(dir.join("trace.jsonl"), content).unwrap();
        dir
    }

    #[test]
    fn test_list_sessions_requires_trace() {
        let base = tempfile::tempdir().unwrap();
        seed_session(base.path(), "run-a", &[json!({"type": "task"})]);
        std::fs::create_dir_all(base.path().join("no-trace")).unwrap();
        let sessions = list_sessions(base.path());
        assert_eq!(sessions, vec!["run-a"]);
    }

    #[test]
    fn test_resolve_session_rejects_traversal() {
        let base = tempfile::tempdir().unwrap();
        seed_session(base.path(), "run-a", &[json!({"type": "task"})]);
        assert!(resolve_session(base.path(), Some("../etc")).is_none());
        assert!(resolve_session(base.path(), Some("a/b")).is_none());
        assert!(resolve_session(base.path(), Some("run-a")).is_some());
        // Default resolves to the newest session.
        assert!(resolve_session(base.path(), None).is_some());
    }

    #[test]
    fn test_read_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(read_tail_lines(&path, 2), vec!["c", "d"]);
        assert_eq!(read_tail_lines(&path, 10).len(), 4);
        assert!(read_tail_lines(Path::new("/missing"), 3).is_empty());
    }

    #[test]
    fn test_artifact_tail_jsonl_parses_entries() {
        let base = tempfile::tempdir().unwrap();
        let dir = seed_session(base.path(), "run-a", &[json!({"type": "task"})]);
        std::fs::write(
            dir.join("evidence.jsonl"),
            format!("{}\nnot json\n{}\n", json!({"id": "ev_0001"}), json!({"id": "ev_0002"})),
        )
        .unwrap();
        let state = DashboardState { base_dir: base.path().to_path_buf() };
        let params = TailParams { session: Some("run-a".to_string()), tail: None };
        let Json(v) = artifact_tail(&state, &params, "evidence.jsonl");
        let entries = v["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["id"], "ev_0002");
    }
}
