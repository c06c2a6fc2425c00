//! Adversarial verification: decompose the candidate answer into a few
//! yes/no checks, audit each with a small tool-using loop in the same
//! sandbox, judge the results into a structured gradient, then apply the
//! SCOUT cap (Scope → Candidates → Outcomes) so a confident negative answer
//! cannot pass without coverage proof and independent citations.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::llm::{ChatClient, ChatMessage};
use crate::shell::ShellSession;
use crate::trace::TraceWriter;
use vera_core::parse::{extract_first_json, try_parse_tool_call};

pub const AUDITOR_SYSTEM_PROMPT: &str = r#"You are an adversarial auditor. You do not care about the agent's thought process.
You only care about safety, evidence quality, and whether claims are supported.

###PROTOCOL: STRICT DATA PROVENANCE (THE "MAGIC CONSTANT" RULE)
You are the guardian of TRUTH against HALLUCINATION. The Agent is prone to inventing complex data (parametric memory hallucination).

**1. Definition of "Magic Constants" (High-Entropy Data):**
Any specific, complex string used as a critical input parameter that is NOT common knowledge. Examples:
- Chemical identifiers (SMILES, InChI, complex IUPAC names).
- Hash sums (SHA, MD5), UUIDs, or specific API Keys/IDs.
- Mathematical constants that are non-standard (e.g., specific coefficients).
- IP addresses or specific non-public URLs.
- Any other domain-specific complex identifier.

**2. The Verification Algorithm:**
When the Agent proposes an Action using a "Magic Constant":
- **SEARCH** the `OBS` (Observation/Tool Output) history.
- **IF** the constant appears verbatim in a previous successful tool output:
  -> **PASS** (Grounding confirmed).
- **IF** the constant appears ONLY in `THOUGHT`, `NOTES`, or the Action itself (and was never returned by a tool):
  -> **FAIL / REJECT**.

**3. Rejection Template:**
If you trigger this rule, your explanation MUST follow this pattern:
"SECURITY ALERT: You are using a complex parameter ('{VALUE}') derived solely from internal memory/training data. This violates Epistemic Security. You must first retrieve/verify this value against the environment (e.g., using grep, curl, or a script) before using it in a critical step."

**EXCEPTION:** Do not flag simple filenames (e.g., "script.py"), standard paths ("/work"), or common sense values. Focus on High-Entropy technical data.

Be strict, skeptical, and concise. Do not assume missing facts."#;

const FAILURE_TAXONOMY: &[&str] = &[
    "Source acquisition failure (wrong/low-quality/outdated source)",
    "Evidence extraction failure (misquote/wrong number/wrong section)",
    "Reasoning/aggregation failure (jump to conclusion/mix jurisdictions/entities)",
    "Tool execution failure (ignored errors/wrong path/partial extraction)",
    "Safety/ops failure (destructive commands/data leakage)",
];

/// One verification check proposed by the decomposition step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Check {
    pub kind: String,
    pub claim: String,
    pub question: String,
    pub source_hint: String,
    pub taxonomy: String,
}

/// Structured judge output. Inner collections stay loosely typed so a
/// sloppy model reply still decodes; absent fields default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Gradient {
    pub score: Option<i64>,
    pub explanation: Option<String>,
    pub missing: Vec<Value>,
    pub wrong: Vec<Value>,
    pub next_actions: Vec<Value>,
    pub stop_when: Vec<Value>,
    pub tool_waste: Vec<Value>,
    pub preferred_source: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct VerifierDecision {
    pub score: i64,
    pub explanation: String,
    pub instructions: Vec<String>,
    pub checks: Vec<Value>,
    pub meta: Map<String, Value>,
}

impl VerifierDecision {
    pub fn to_value(&self) -> Value {
        json!({
            "score": self.score,
            "explanation": self.explanation,
            "instructions": self.instructions,
            "checks": self.checks,
            "meta": self.meta,
        })
    }

    pub fn gradient(&self) -> Option<&Value> {
        self.meta.get("gradient").filter(|g| g.is_object())
    }

    pub fn cap_reasons(&self) -> Vec<String> {
        self.meta
            .get("cap_reasons")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default()
    }
}

/// Suggested `(tool, cmd)` pairs from a gradient's next_actions; the loop
/// matches the agent's next tool call against these (observational metric).
pub fn gradient_suggested_cmds(gradient: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Some(actions) = gradient.get("next_actions").and_then(|v| v.as_array()) else {
        return out;
    };
    for item in actions {
        let Some(tools) = item.get("suggested_tools").and_then(|v| v.as_array()) else {
            continue;
        };
        for t in tools {
            let tool = t.get("tool").and_then(|v| v.as_str()).unwrap_or_default();
            let cmd = t.get("cmd").and_then(|v| v.as_str()).unwrap_or_default();
            if !tool.is_empty() && !cmd.is_empty() {
                out.push((tool.to_string(), cmd.to_string()));
            }
        }
    }
    out
}

pub fn is_negative_answer(answer: &str) -> bool {
    let first = answer.trim().to_lowercase();
    let first = first.lines().next().unwrap_or("");
    Regex::new(r"^(none|no one|nobody|no member|no members)\b")
        .expect("negative regex")
        .is_match(first)
}

/// Tasks implying a complete candidate set require a coverage check.
pub fn needs_coverage(task: &str) -> bool {
    let t = task.to_lowercase();
    let patterns = [
        r"\bwhich\b.*\bmember\b",
        r"\bwhich\b.*\bperson\b",
        r"\bwho\b.*\bmember\b",
        r"\bwho\b",
        r"\bany\b.*\bmember\b",
        r"\bever\b",
        r"\bnever\b",
        r"\bno one\b",
        r"\bnobody\b",
        r"\bnone\b",
        r"\bearliest\b",
        r"\blatest\b",
        r"\bonly\b",
        r"\ball\b.*\bmembers\b",
        r"\btouring member\b",
        r"\bgig\b",
        r"\bsession musician\b",
    ];
    patterns
        .iter()
        .any(|p| Regex::new(p).expect("coverage regex").is_match(&t))
}

/// Replace 'formula' with 'composition' in every key and string value.
pub fn sanitize_no_formula(value: &Value) -> Value {
    let re = Regex::new(r"(?i)formula").expect("formula regex");
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(re.replace_all(k, "composition").to_string(), sanitize_no_formula(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_no_formula).collect()),
        Value::String(s) => Value::String(re.replace_all(s, "composition").to_string()),
        other => other.clone(),
    }
}

fn parse_judge_score(text: &str) -> i64 {
    if let Some(cap) = Regex::new(r"\bScore\s*:\s*([1-4])\b").expect("score regex").captures(text) {
        return cap[1].parse().unwrap_or(2);
    }
    if let Some(cap) = Regex::new(r"\b([1-4])\b").expect("digit regex").captures(text.trim()) {
        return cap[1].parse().unwrap_or(2);
    }
    2
}

fn parse_instructions(text: &str, limit: usize) -> Vec<String> {
    let numbered = Regex::new(r"(?i)^Instruction\s*\d+:\s*(.*)$").expect("instruction regex");
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(cap) = numbered.captures(line) {
            out.push(cap[1].trim().to_string());
        } else if let Some(rest) = line.strip_prefix("- ") {
            out.push(rest.trim().to_string());
        }
        if out.len() >= limit {
            break;
        }
    }
    out.retain(|i| !i.is_empty());
    out.truncate(limit);
    out
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Summarize the tool trajectory from the trace tail, plus a notes tail,
/// without replaying the whole run.
pub fn summarize_trace(trace_path: &Path, max_chars: usize, notes_max_chars: usize) -> String {
    let Ok(raw) = std::fs::read_to_string(trace_path) else {
        return "(no trace available)".to_string();
    };
    let raw_lines: Vec<&str> = raw.lines().collect();
    let start = raw_lines.len().saturating_sub(200);

    let mut lines: Vec<String> = Vec::new();
    for raw_line in &raw_lines[start..] {
        let Ok(ev) = serde_json::from_str::<Value>(raw_line) else {
            continue;
        };
        match ev.get("type").and_then(|v| v.as_str()) {
            Some("tool") => {
                let step = &ev["step"];
                let tool = ev.get("tool").and_then(|v| v.as_str()).unwrap_or("");
                if tool == "shell" {
                    let cmd = ev["args"].get("cmd").and_then(|v| v.as_str()).unwrap_or("");
                    lines.push(format!(
                        "Step {step}: shell cmd={cmd:?} exit={}",
                        ev["obs"]["exit_code"]
                    ));
                } else {
                    lines.push(format!("Step {step}: {tool} args={}", ev["args"]));
                }
            }
            Some("assistant") => {
                // Keep only a small hint; do not leak the full answer back.
                let step = &ev["step"];
                let snippet = ev
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .replace('\n', " ");
                if !snippet.is_empty() {
                    lines.push(format!("Step {step}: assistant said ~{:?}", head_chars(&snippet, 140)));
                }
            }
            _ => {}
        }
    }
    let trace_out = lines.join("\n");

    let notes_path = trace_path.with_file_name("notes.md");
    let notes_out = std::fs::read_to_string(&notes_path)
        .map(|content| {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(120);
            tail_chars(lines[start..].join("\n").trim(), notes_max_chars)
        })
        .unwrap_or_default();

    let combined = if notes_out.is_empty() {
        trace_out
    } else {
        format!("{trace_out}\n\nNOTES_TAIL:\n{notes_out}")
    };
    tail_chars(&combined, max_chars)
}

pub fn summarize_evidence_log(evidence_path: &Path, max_chars: usize, max_lines: usize) -> String {
    let Ok(raw) = std::fs::read_to_string(evidence_path) else {
        return String::new();
    };
    let raw_lines: Vec<&str> = raw.lines().collect();
    let start = raw_lines.len().saturating_sub(max_lines);
    let mut summaries: Vec<String> = Vec::new();
    for raw_line in &raw_lines[start..] {
        let Ok(obj) = serde_json::from_str::<Value>(raw_line) else {
            continue;
        };
        let urls: Vec<Value> = obj
            .get("urls")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().take(3).cloned().collect())
            .unwrap_or_default();
        let snippet = json!({
            "step": obj.get("step"),
            "tool": obj.get("tool"),
            "exit_code": obj["obs"].get("exit_code"),
            "failure_type": obj.get("failure_type"),
            "urls": urls,
        });
        summaries.push(snippet.to_string());
    }
    head_chars(&summaries.join("\n"), max_chars)
}

fn build_payload(task: &str, answer: &str, notes_snapshot: &str, evidence_snapshot: &str) -> String {
    let notes = if notes_snapshot.is_empty() { "(notes empty)" } else { notes_snapshot };
    let mut payload = format!(
        "TASK:\n{task}\n\nPROPOSED_ACTION:\n{}\n\nNOTES:\n{notes}",
        json!({ "answer": answer })
    );
    if !evidence_snapshot.is_empty() {
        payload.push_str(&format!("\n\nEVIDENCE_LOG:\n{evidence_snapshot}"));
    }
    payload
}

/// Signature of one mini-agent tool step, for loop-killing.
fn tool_signature(tool: &str, args: &Value, obs: &Value) -> String {
    let key = if tool == "shell" {
        args.get("cmd").and_then(|v| v.as_str()).unwrap_or("").to_string()
    } else {
        args.to_string()
    };
    let status = if tool == "shell" {
        obs.get("exit_code").map(|v| v.to_string()).unwrap_or_default()
    } else {
        obs.get("status").map(|v| v.to_string()).unwrap_or_default()
    };
    let soft = obs.get("soft_error").map(|v| v.to_string()).unwrap_or_default();
    let err = format!(
        "{}:{}",
        obs.get("error_type").and_then(|v| v.as_str()).unwrap_or(""),
        obs.get("error").and_then(|v| v.as_str()).unwrap_or(""),
    );
    format!("{tool}\u{1}{key}\u{1}{status}\u{1}{soft}|{}", err.trim_matches(':'))
}

fn obs_is_failed(obs: &Value) -> bool {
    let error = obs.get("error").and_then(|v| v.as_str()).unwrap_or("");
    let soft = obs.get("soft_error");
    !error.is_empty() || soft.map(|v| !v.is_null() && v != false).unwrap_or(false)
}

/// Did a check fail to produce a usable answer with evidence?
pub fn check_unknown(res: &Value) -> bool {
    let ans = res
        .get("answer")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if ans.is_empty() || ans == "unknown" || ans == "n/a" {
        return true;
    }
    if let Some(tool_log) = res.get("tool_log").and_then(|v| v.as_array()) {
        for item in tool_log {
            let obs = &item["obs"];
            if !obs.is_object() {
                continue;
            }
            if obs_is_failed(obs) {
                return true;
            }
            if item.get("tool").and_then(|v| v.as_str()) == Some("shell") {
                let exit = obs.get("exit_code");
                let ok = matches!(exit, None | Some(Value::Null))
                    || exit == Some(&json!(0))
                    || exit == Some(&json!("0"));
                if !ok {
                    return true;
                }
            }
        }
    }
    match res.get("evidence").and_then(|v| v.as_array()) {
        Some(ev) if !ev.is_empty() => false,
        _ => true,
    }
}

fn evidence_urls(checks_with_results: &[Value]) -> Vec<String> {
    let mut urls = Vec::new();
    for item in checks_with_results {
        let Some(ev) = item["result"].get("evidence").and_then(|v| v.as_array()) else {
            continue;
        };
        for e in ev {
            if e.get("type").and_then(|v| v.as_str()) != Some("url") {
                continue;
            }
            let r = e.get("ref").and_then(|v| v.as_str()).unwrap_or("").trim();
            if r.starts_with("http://") || r.starts_with("https://") {
                urls.push(r.to_string());
            }
        }
    }
    urls
}

fn distinct_domains(urls: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for u in urls {
        let Some(domain) = vera_core::classify::extract_domain(u) else {
            continue;
        };
        if !domain.is_empty() && seen.insert(domain.clone()) {
            out.push(domain);
        }
    }
    out
}

struct ModelStats {
    calls: u64,
    latency_s: f64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl ModelStats {
    fn new() -> Self {
        Self { calls: 0, latency_s: 0.0, prompt_tokens: 0, completion_tokens: 0, total_tokens: 0 }
    }

    fn to_value(&self) -> Value {
        json!({
            "calls": self.calls,
            "latency_s": self.latency_s,
            "usage": {
                "prompt_tokens": self.prompt_tokens,
                "completion_tokens": self.completion_tokens,
                "total_tokens": self.total_tokens,
            },
        })
    }
}

/// A bounded tool-using loop dedicated to verifying one check. Shares the
/// agent's sandbox and shell session; shell is the only tool.
async fn run_check_mini_agent(
    client: &ChatClient,
    shell: &mut ShellSession,
    trace: &TraceWriter,
    check: &Check,
    max_steps: usize,
    parent_step: usize,
    check_idx: usize,
) -> Result<Value> {
    let sys = "You are a verification agent.\n\
               You must answer the question using tools, and provide evidence hooks.\n\
               Rules:\n\
               - Prefer primary sources; avoid random blogs when possible.\n\
               - If a tool fails, acknowledge it and try an alternative.\n\
               - Do NOT re-solve the whole task. Only answer the check.\n\
               Tooling: there is only ONE tool: a shell command runner.\n\
               If you need the internet, do it from the shell.\n\
               Tool-call format: output EXACTLY ONE single-line JSON object with fields: tool, args.\n\
               When done, output EXACTLY ONE JSON line:\n\
               {\"answer\":\"yes|no|unknown\",\"evidence\":[{\"type\":\"url|file|cmd\",\"ref\":\"...\",\"snippet\":\"...\"}],\"notes\":\"...\"}\n";
    let usr = format!(
        "CLAIM: {}\nQUESTION (yes/no): {}\nSOURCE_HINT: {}\n",
        check.claim, check.question, check.source_hint
    );
    let mut messages = vec![ChatMessage::system(sys), ChatMessage::user(usr)];
    let mut tool_log: Vec<Value> = Vec::new();
    let mut stats = ModelStats::new();
    let mut seen_signatures: HashMap<String, usize> = HashMap::new();

    let tail10 = |log: &[Value]| -> Vec<Value> {
        log.iter().rev().take(10).rev().cloned().collect()
    };

    for _ in 0..max_steps {
        let outcome = client.chat(&messages, 0.0, 800).await?;
        trace.event(json!({
            "type": "model",
            "scope": "verifier_check",
            "parent_step": parent_step,
            "check_idx": check_idx,
            "latency_s": outcome.latency_s,
            "usage": outcome.usage,
        }));
        trace.event(json!({
            "type": "assistant",
            "scope": "verifier_check",
            "parent_step": parent_step,
            "check_idx": check_idx,
            "content": head_chars(&outcome.content, 20_000),
        }));
        stats.calls += 1;
        stats.latency_s += outcome.latency_s;
        stats.prompt_tokens += outcome.usage.prompt_tokens;
        stats.completion_tokens += outcome.usage.completion_tokens;
        stats.total_tokens += outcome.usage.total_tokens;

        let resp = outcome.content;
        let Some(call) = try_parse_tool_call(&resp) else {
            if let Some(mut data) = extract_first_json(&resp) {
                let has_answer = data.get("answer").is_some();
                if let Some(obj) = data.as_object_mut() {
                    if has_answer {
                        obj.entry("tool_log").or_insert_with(|| json!(tail10(&tool_log)));
                        obj.entry("model_stats").or_insert_with(|| stats.to_value());
                        return Ok(data);
                    }
                }
            }
            return Ok(json!({
                "answer": "unknown",
                "evidence": [],
                "notes": "Verifier returned unstructured output.",
                "raw": head_chars(&resp, 2_000),
                "tool_log": tail10(&tool_log),
                "model_stats": stats.to_value(),
            }));
        };

        let tool = call.tool.clone();
        let args = call.args.clone();
        let obs: Value = if tool != "shell" {
            json!({
                "error": format!("Tool not allowed in verifier (shell-only mode): {tool}"),
                "hint": "Use the shell tool only. If you need the internet, do it from the shell.",
            })
        } else {
            let cmd = args.get("cmd").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            serde_json::to_value(shell.shell(&cmd).await)?
        };

        let sig = tool_signature(&tool, &args, &obs);
        let count = seen_signatures.entry(sig.clone()).or_insert(0);
        *count += 1;
        if *count >= 3 && obs_is_failed(&obs) {
            let mut log = tail10(&tool_log);
            log.push(json!({"tool": tool, "args": args, "obs": obs}));
            return Ok(json!({
                "answer": "unknown",
                "evidence": [],
                "notes": "Stopped verification early due to repeated identical failures (loop-killer).",
                "tool_log": log,
                "model_stats": stats.to_value(),
                "loop_killer": {"signature": sig, "count": *count},
            }));
        }

        trace.event(json!({
            "type": "tool",
            "scope": "verifier",
            "parent_step": parent_step,
            "check_idx": check_idx,
            "tool": tool,
            "args": args,
            "obs": obs,
        }));

        tool_log.push(json!({"tool": tool, "args": args, "obs": obs}));
        messages.push(ChatMessage::assistant(resp));
        let observation = json!({"tool": tool, "obs": obs}).to_string();
        messages.push(ChatMessage::user(format!(
            "OBSERVATION:\n{}",
            head_chars(&observation, 12_000)
        )));
    }

    Ok(json!({
        "answer": "unknown",
        "evidence": [],
        "notes": "Verifier hit step limit.",
        "tool_log": tail10(&tool_log),
        "model_stats": stats.to_value(),
    }))
}

fn parse_checks(data: &Value) -> Vec<Check> {
    let Some(items) = data.as_array() else {
        return Vec::new();
    };
    let mut checks = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let get = |k: &str| obj.get(k).and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        let claim = get("claim");
        let question = get("question");
        if claim.is_empty() || question.is_empty() {
            continue;
        }
        let mut kind = get("kind").to_lowercase();
        if kind != "coverage" && kind != "support" {
            kind = "support".to_string();
        }
        checks.push(Check {
            kind,
            claim,
            question,
            source_hint: get("source_hint"),
            taxonomy: get("taxonomy"),
        });
        if checks.len() >= 3 {
            break;
        }
    }
    checks
}

fn coverage_check() -> Check {
    Check {
        kind: "coverage".to_string(),
        claim: "The task requires reasoning over a complete candidate set under a stated scope/time window."
            .to_string(),
        question: "Does the source explicitly enumerate the complete candidate set under the relevant \
                   scope/time window for the task (so a 'none' or selection claim is justified)?"
            .to_string(),
        source_hint: "authoritative complete list of candidates for the entity in the task".to_string(),
        taxonomy: "Problem understanding / decomposition failure".to_string(),
    }
}

async fn judge(
    client: &ChatClient,
    trace: &TraceWriter,
    task: &str,
    answer: &str,
    notes_snapshot: &str,
    evidence_snapshot: &str,
    checks_with_results: &[Value],
    parent_step: usize,
) -> Result<VerifierDecision> {
    let sys = format!(
        "{AUDITOR_SYSTEM_PROMPT}\n\
         You are a judge module for a Deep Research Agent verifier.\n\
         You receive: task, unverified answer, notes snapshot, and results of targeted verification checks.\n\
         Score 1-4: 1=entirely incorrect, 2=mostly incorrect, 3=mostly correct, 4=entirely correct.\n\
         Return a single-line JSON object called a 'gradient' with this minimal schema:\n\
         {{\n\
           \"score\": 1,\n\
           \"explanation\": \"...\",\n\
           \"missing\": [\"...\"],\n\
           \"wrong\": [{{\"item\":\"...\",\"why\":\"...\"}}],\n\
           \"next_actions\": [\n\
              {{\"goal\":\"...\",\"suggested_tools\":[{{\"tool\":\"shell\",\"cmd\":\"...\"}}],\"success_criteria\":\"...\"}}\n\
           ],\n\
           \"stop_when\": [\"...\"],\n\
           \"tool_waste\": [\"...\"],\n\
           \"preferred_source\": [\"...\"]\n\
         }}\n\
         Important: do NOT use the word 'formula' anywhere in the JSON keys or values.\n\
         Do NOT add extra text outside the JSON.\n"
    );
    let checks_json = serde_json::to_string(checks_with_results).unwrap_or_default();
    let usr = format!(
        "{}\n\nUNVERIFIED_ANSWER:\n{answer}\n\nCHECK_RESULTS:\n{}\n",
        build_payload(task, answer, notes_snapshot, evidence_snapshot),
        head_chars(&checks_json, 12_000),
    );

    let outcome = client
        .chat(&[ChatMessage::system(sys), ChatMessage::user(usr)], 0.0, 700)
        .await?;
    trace.event(json!({
        "type": "model",
        "scope": "verifier_judge",
        "parent_step": parent_step,
        "latency_s": outcome.latency_s,
        "usage": outcome.usage,
    }));
    trace.event(json!({
        "type": "assistant",
        "scope": "verifier_judge",
        "parent_step": parent_step,
        "content": head_chars(&outcome.content, 20_000),
    }));

    let resp = outcome.content;
    let data = extract_first_json(&resp);
    let mut score = parse_judge_score(&resp);
    let mut explanation = String::new();
    let mut instructions: Vec<String> = Vec::new();
    let mut gradient_value: Option<Value> = None;

    if let Some(data) = data.filter(|d| d.is_object()) {
        let sanitized = sanitize_no_formula(&data);
        let gradient: Gradient = serde_json::from_value(sanitized.clone()).unwrap_or_else(|_| Gradient {
            score: sanitized.get("score").and_then(|v| v.as_i64()),
            explanation: sanitized
                .get("explanation")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            ..Gradient::default()
        });
        if let Some(s) = gradient.score {
            score = s;
        }
        explanation = gradient.explanation.unwrap_or_default().trim().to_string();
        if score <= 2 {
            for item in gradient.next_actions.iter().take(3) {
                let goal = item.get("goal").and_then(|v| v.as_str()).unwrap_or("").trim();
                let success = item
                    .get("success_criteria")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim();
                if !goal.is_empty() || !success.is_empty() {
                    instructions.push(
                        format!("{goal} | success: {success}")
                            .trim_matches([' ', '|'])
                            .to_string(),
                    );
                }
            }
        }
        instructions.retain(|i| !i.is_empty());
        instructions.truncate(3);
        gradient_value = Some(sanitized);
    } else {
        if let Some(cap) = Regex::new(r"Explanation\s*:\s*(.+)")
            .expect("explanation regex")
            .captures(&resp)
        {
            explanation = cap[1].trim().to_string();
        } else if let Some(first) = resp.trim().lines().next() {
            explanation = head_chars(first, 500);
        }
        if score <= 2 {
            instructions = parse_instructions(&resp, 3);
        }
    }

    let mut meta = Map::new();
    if let Some(g) = gradient_value {
        if g.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            meta.insert("gradient".to_string(), g);
        }
    }

    Ok(VerifierDecision {
        score,
        explanation,
        instructions,
        checks: checks_with_results.to_vec(),
        meta,
    })
}

pub struct VerifyArgs<'a> {
    pub task: &'a str,
    pub answer: &'a str,
    pub notes_snapshot: &'a str,
    pub trace_path: &'a Path,
    pub evidence_path: &'a Path,
    pub max_tool_steps_per_check: usize,
    pub parent_step: usize,
}

/// Test-time verification: decompose into ≤3 yes/no checks, verify each
/// with a small tool-using loop, judge 1-4, then apply the SCOUT cap.
pub async fn deep_verify(
    client: &ChatClient,
    shell: &mut ShellSession,
    trace: &TraceWriter,
    args: VerifyArgs<'_>,
) -> Result<VerifierDecision> {
    let trace_summary = summarize_trace(args.trace_path, 6_000, 2_000);
    let evidence_summary = summarize_evidence_log(args.evidence_path, 3_000, 40);

    // Decompose.
    let decomp_sys = format!(
        "{AUDITOR_SYSTEM_PROMPT}\n\
         You are a decomposition module for a Deep Research Agent verifier.\n\
         Your job: propose the fewest high-leverage verification checks.\n\
         Use the failure taxonomy to look for risk.\n\
         Do NOT re-solve the task.\n\
         Return EXACTLY ONE LINE: a JSON array of up to 3 check objects.\n\
         Each check must be answerable via tools and must be yes/no.\n\
         Schema: [{{\"kind\":\"coverage|support\",\"claim\":\"...\",\"question\":\"...\",\"source_hint\":\"(url or file path or search query)\",\"taxonomy\":\"...\"}}]\n\
         Failure taxonomy: {FAILURE_TAXONOMY:?}\n"
    );
    let payload = build_payload(args.task, args.answer, args.notes_snapshot, &evidence_summary);
    let decomp_usr = format!("{payload}\n\nTRAJECTORY_SUMMARY:\n{trace_summary}\n\nGenerate checks now.");
    let outcome = client
        .chat(
            &[ChatMessage::system(decomp_sys), ChatMessage::user(decomp_usr)],
            0.0,
            600,
        )
        .await?;
    trace.event(json!({
        "type": "model",
        "scope": "verifier_decompose",
        "parent_step": args.parent_step,
        "latency_s": outcome.latency_s,
        "usage": outcome.usage,
    }));
    trace.event(json!({
        "type": "assistant",
        "scope": "verifier_decompose",
        "parent_step": args.parent_step,
        "content": head_chars(&outcome.content, 20_000),
    }));

    let mut checks = extract_first_json(&outcome.content)
        .map(|d| parse_checks(&d))
        .unwrap_or_default();

    let negative = is_negative_answer(args.answer);
    let need_coverage = negative || needs_coverage(args.task);
    if need_coverage && !checks.iter().any(|c| c.kind == "coverage") {
        checks.insert(0, coverage_check());
        checks.truncate(3);
    }

    // Per-check mini-agents.
    let mut checks_with_results: Vec<Value> = Vec::new();
    let mut verifier_model_calls: u64 = 0;
    let mut verifier_model_latency_s: f64 = 0.0;
    let mut verifier_usage = json!({"prompt_tokens": 0u64, "completion_tokens": 0u64, "total_tokens": 0u64});
    let mut verifier_tool_calls: u64 = 0;
    let mut verifier_tool_errors: u64 = 0;

    for (idx, check) in checks.iter().take(3).enumerate() {
        let result = run_check_mini_agent(
            client,
            shell,
            trace,
            check,
            args.max_tool_steps_per_check,
            args.parent_step,
            idx + 1,
        )
        .await?;

        if let Some(ms) = result.get("model_stats").and_then(|v| v.as_object()) {
            verifier_model_calls += ms.get("calls").and_then(|v| v.as_u64()).unwrap_or(0);
            verifier_model_latency_s += ms.get("latency_s").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if let Some(u) = ms.get("usage").and_then(|v| v.as_object()) {
                for k in ["prompt_tokens", "completion_tokens", "total_tokens"] {
                    let add = u.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
                    verifier_usage[k] = json!(verifier_usage[k].as_u64().unwrap_or(0) + add);
                }
            }
        }
        if let Some(tl) = result.get("tool_log").and_then(|v| v.as_array()) {
            for item in tl {
                verifier_tool_calls += 1;
                let obs = &item["obs"];
                if obs.get("error").and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false) {
                    verifier_tool_errors += 1;
                }
                if obs.get("exit_code").and_then(|v| v.as_i64()).is_some_and(|c| c != 0) {
                    verifier_tool_errors += 1;
                }
            }
        }
        checks_with_results.push(json!({"check": check, "result": result}));
    }

    let mut decision = judge(
        client,
        trace,
        args.task,
        args.answer,
        args.notes_snapshot,
        &evidence_summary,
        &checks_with_results,
        args.parent_step,
    )
    .await?;
    if decision.explanation.is_empty() {
        decision.explanation = "No explanation.".to_string();
    }

    // Simple, auditable concreteness proxies for the instructions.
    let instr_text = decision.instructions.join("\n");
    let has_url = Regex::new(r"https?://").expect("url regex").is_match(&instr_text);
    let has_cmd = Regex::new(r"\b(rg|grep|curl|python3|pip|jq)\b")
        .expect("cmd regex")
        .is_match(&instr_text);
    decision.meta.extend([
        ("n_checks".to_string(), json!(checks_with_results.len())),
        ("verifier_model_calls".to_string(), json!(verifier_model_calls)),
        ("verifier_model_latency_s".to_string(), json!(verifier_model_latency_s)),
        ("verifier_usage".to_string(), verifier_usage),
        ("verifier_tool_calls".to_string(), json!(verifier_tool_calls)),
        ("verifier_tool_errors".to_string(), json!(verifier_tool_errors)),
        ("instruction_count".to_string(), json!(decision.instructions.len())),
        ("instruction_chars".to_string(), json!(instr_text.chars().count())),
        ("instruction_has_url".to_string(), json!(has_url)),
        (
            "instruction_has_path".to_string(),
            json!(instr_text.contains("/input/") || instr_text.contains("/work/")),
        ),
        ("instruction_has_cmd".to_string(), json!(has_cmd)),
        ("negative_claim".to_string(), json!(negative)),
        ("needs_coverage".to_string(), json!(need_coverage)),
    ]);

    apply_scout_cap(&mut decision, need_coverage);
    Ok(decision)
}

/// SCOUT gating: an otherwise high score is capped at 2 when any check is
/// unknown, citations span fewer than two domains, or a required coverage
/// proof is missing. Each cap reason appends a canned instruction.
pub fn apply_scout_cap(decision: &mut VerifierDecision, need_coverage: bool) {
    let mut unknown_checks = 0usize;
    let mut coverage_ok: Option<bool> = None;
    for item in &decision.checks {
        let chk = &item["check"];
        let res = &item["result"];
        if !chk.is_object() || !res.is_object() {
            continue;
        }
        if check_unknown(res) {
            unknown_checks += 1;
        }
        if chk.get("kind").and_then(|v| v.as_str()) == Some("coverage") {
            let yes = res
                .get("answer")
                .and_then(|v| v.as_str())
                .map(|a| a.trim().eq_ignore_ascii_case("yes"))
                .unwrap_or(false);
            coverage_ok = Some(yes && !check_unknown(res));
        }
    }

    let urls = evidence_urls(&decision.checks);
    let domains = distinct_domains(&urls);

    let mut cap_reasons: Vec<&str> = Vec::new();
    let score_before = decision.score;
    if unknown_checks > 0 {
        cap_reasons.push("unknown_checks_present");
    }
    if domains.len() < 2 {
        cap_reasons.push("insufficient_independent_citations");
    }
    if need_coverage && !coverage_ok.unwrap_or(false) {
        cap_reasons.push("missing_coverage_proof");
    }

    decision.meta.extend([
        ("unknown_checks".to_string(), json!(unknown_checks)),
        ("evidence_url_count".to_string(), json!(urls.len())),
        ("distinct_domain_count".to_string(), json!(domains.len())),
        ("distinct_domains".to_string(), json!(domains)),
        ("coverage_ok".to_string(), json!(coverage_ok)),
    ]);

    if cap_reasons.is_empty() {
        return;
    }
    decision.meta.insert("score_before_cap".to_string(), json!(score_before));
    decision.meta.insert("score_capped".to_string(), json!(true));
    decision.meta.insert("cap_reasons".to_string(), json!(cap_reasons));
    decision.score = decision.score.min(2);
    if cap_reasons.contains(&"insufficient_independent_citations") {
        decision.instructions.push(
            "Add at least two independent citations from different domains that directly support the key claim."
                .to_string(),
        );
    }
    if cap_reasons.contains(&"missing_coverage_proof") {
        decision.instructions.push(
            "State the scope (what counts as a candidate) and cite a source that enumerates the \
             complete candidate set under that scope; then verify the predicate for all candidates."
                .to_string(),
        );
    }
    if cap_reasons.contains(&"unknown_checks_present") {
        decision.instructions.push(
            "Resolve unknown checks by retrying with alternative sources/tools; do not claim high \
             confidence while a load-bearing check is unknown."
                .to_string(),
        );
    }
    decision.instructions.truncate(3);
    decision.explanation = format!(
        "{} [SCOUT gating applied: score capped due to {}]",
        decision.explanation,
        cap_reasons.join(", ")
    );
}

/// Format a decision as the user message pushed back into the agent's
/// history: the gradient JSON when present, else a readable block.
pub fn format_verifier_feedback(decision: &VerifierDecision) -> String {
    if let Some(gradient) = decision.gradient() {
        let payload = sanitize_no_formula(gradient);
        return format!(
            "VERIFIER_GRADIENT_JSON:\n{}\n\
             Use this as coaching. Make progress with tools now. Prefer next_actions when helpful, but they are not mandatory.",
            payload
        );
    }

    let mut parts = vec![
        format!("VERIFICATION SCORE: {}/4", decision.score),
        format!("EXPLANATION: {}", decision.explanation),
    ];
    if decision.instructions.is_empty() {
        parts.push("INSTRUCTIONS: (none)".to_string());
    } else {
        parts.push("INSTRUCTIONS (follow strictly; max 3):".to_string());
        for (i, ins) in decision.instructions.iter().enumerate() {
            parts.push(format!("{}. {ins}", i + 1));
        }
    }
    parts.push("CHECK RESULTS (evidence hooks):".to_string());
    let checks_json = serde_json::to_string(&decision.checks).unwrap_or_default();
    parts.push(head_chars(&checks_json, 8_000));
    parts.push(
        "Now revise the answer. Add concrete evidence hooks (URLs with short quotes, or /input|/work paths + commands). \
         Call tools if needed."
            .to_string(),
    );
    parts.join("\n")
}
