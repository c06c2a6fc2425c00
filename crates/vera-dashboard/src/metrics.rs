//! Run metrics computed from the trace tail. The dashboard never keeps
//! state of its own; every request recomputes from the artifact files.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;

const MAX_TRACE_LINES: usize = 5_000;

#[derive(Debug, Default, Serialize)]
pub struct RunMetrics {
    pub steps: u64,
    pub assistant_turns: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub policy_blocks: u64,
    pub verifier_rounds: u64,
    pub last_verifier_score: Option<i64>,
    pub model_calls: u64,
    pub model_latency_s: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub container_events: u64,
    pub last_ts: Option<f64>,
}

pub fn compute(trace_path: &Path) -> RunMetrics {
    let mut m = RunMetrics::default();
    let Ok(raw) = std::fs::read_to_string(trace_path) else {
        return m;
    };
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(MAX_TRACE_LINES);

    for line in &lines[start..] {
        let Ok(ev) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(ts) = ev.get("ts").and_then(|v| v.as_f64()) {
            m.last_ts = Some(ts);
        }
        if let Some(step) = ev.get("step").and_then(|v| v.as_u64()) {
            m.steps = m.steps.max(step);
        }
        match ev.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "assistant" => {
                if ev.get("scope").is_none() {
                    m.assistant_turns += 1;
                }
            }
            "tool" => {
                m.tool_calls += 1;
                let obs = &ev["obs"];
                let errored = obs
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(|s| !s.is_empty())
                    .unwrap_or(false)
                    || obs.get("exit_code").and_then(|v| v.as_i64()).is_some_and(|c| c != 0);
                if errored {
                    m.tool_errors += 1;
                }
                if obs
                    .get("error_type")
                    .and_then(|v| v.as_str())
                    .map(|t| t.ends_with("_blocked") || t.ends_with("_required"))
                    .unwrap_or(false)
                {
                    m.policy_blocks += 1;
                }
            }
            "model" => {
                m.model_calls += 1;
                m.model_latency_s += ev.get("latency_s").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let usage = &ev["usage"];
                m.prompt_tokens += usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                m.completion_tokens +=
                    usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                m.total_tokens += usage.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            }
            "verifier" => {
                m.verifier_rounds += 1;
                m.last_verifier_score = ev["decision"].get("score").and_then(|v| v.as_i64());
            }
            "container_event" => m.container_events += 1,
            _ => {}
        }
    }
    m
}

pub fn render_prometheus(m: &RunMetrics) -> String {
    let mut out = String::new();
    let mut emit = |name: &str, value: f64| {
        out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
    };
    emit("vera_steps", m.steps as f64);
    emit("vera_assistant_turns", m.assistant_turns as f64);
    emit("vera_tool_calls", m.tool_calls as f64);
    emit("vera_tool_errors", m.tool_errors as f64);
    emit("vera_policy_blocks", m.policy_blocks as f64);
    emit("vera_verifier_rounds", m.verifier_rounds as f64);
    emit("vera_verifier_last_score", m.last_verifier_score.unwrap_or(0) as f64);
    emit("vera_model_calls", m.model_calls as f64);
    emit("vera_model_latency_seconds", m.model_latency_s);
    emit("vera_prompt_tokens", m.prompt_tokens as f64);
    emit("vera_completion_tokens", m.completion_tokens as f64);
    emit("vera_total_tokens", m.total_tokens as f64);
    emit("vera_container_events", m.container_events as f64);
    out
}
