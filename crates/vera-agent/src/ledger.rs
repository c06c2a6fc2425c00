//! Append-only JSONL ledgers: evidence, moves, queries. Ids are dense,
//! monotonic, and four-digit zero-padded; the evidence id set backs the
//! EVIDENCE_USED citation contract. Policy-blocked calls still allocate
//! evidence ids — every call the model makes is citable, and the record's
//! `error_type` marks the block.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::shell::Observation;
use crate::trace::now_ts;
use vera_core::classify::{extract_urls, MoveType, SourceClass};
use vera_core::config::{clip_text, EVIDENCE_MAX_URLS, EVIDENCE_OUTPUT_CLIP_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Failed,
    Blocked,
}

/// Derive the failure kind of an observation. `notes_*` policy blocks are
/// not failures; explicit errors win over exit codes; output patterns fill
/// in the acquisition-level kinds the policy engine escalates on.
pub fn classify_failure(tool: &str, cmd: &str, obs: &Observation) -> Option<String> {
    let error_type = obs.error_type.as_deref().unwrap_or("");
    let error_msg = obs.error.as_deref().unwrap_or("");
    if error_type.starts_with("notes_") {
        return None;
    }

    let mut failure: Option<String> = if !error_type.is_empty() || !error_msg.is_empty() {
        Some(if error_type.is_empty() {
            "tool_error".to_string()
        } else {
            error_type.to_string()
        })
    } else if obs.exit_code.is_some_and(|c| c != 0) {
        Some("tool_error".to_string())
    } else {
        None
    };

    if tool == "shell" && !cmd.is_empty() {
        let output = obs.output.as_deref().unwrap_or("");
        let access = Regex::new(r"(?i)\b(403|forbidden|access denied|captcha|cloudflare)\b")
            .expect("access regex");
        let auth = Regex::new(r"(?i)\b(401|unauthorized)\b").expect("auth regex");
        let rate = Regex::new(r"(?i)\b(429|rate limit|too many requests)\b").expect("rate regex");
        if failure.is_none() && access.is_match(output) {
            failure = Some("access_blocked".to_string());
        }
        if failure.is_none() && auth.is_match(output) {
            failure = Some("auth_required".to_string());
        }
        if failure.is_none() && rate.is_match(output) {
            failure = Some("rate_limited".to_string());
        }
        let fetches = cmd.contains("curl") || cmd.contains("wget");
        if failure.is_none() && fetches && output.trim().is_empty() {
            failure = Some("empty_response".to_string());
        }
    }
    failure
}

/// The dimensions of one classified tool call, shared by the move and query
/// ledgers.
#[derive(Debug, Clone)]
pub struct MoveInfo {
    pub tool: String,
    pub cmd: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub query: Option<String>,
    pub query_family: Option<String>,
    pub source_class: SourceClass,
    pub move_type: MoveType,
    pub move_sig: String,
    pub failure_type: Option<String>,
}

pub struct Ledgers {
    evidence_path: PathBuf,
    move_path: PathBuf,
    query_path: PathBuf,
    evidence_counter: usize,
    move_counter: usize,
    query_counter: usize,
    evidence_ids: HashSet<String>,
}

fn append_jsonl(path: &Path, payload: &Value) {
    let line = match serde_json::to_string(payload) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("Unserializable ledger record: {e}");
            return;
        }
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        tracing::warn!("Failed to append ledger record to {}: {e}", path.display());
    }
}

impl Ledgers {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            evidence_path: work_dir.join("evidence.jsonl"),
            move_path: work_dir.join("move_ledger.jsonl"),
            query_path: work_dir.join("query_ledger.jsonl"),
            evidence_counter: 0,
            move_counter: 0,
            query_counter: 0,
            evidence_ids: HashSet::new(),
        }
    }

    pub fn evidence_path(&self) -> &Path {
        &self.evidence_path
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence_ids.len()
    }

    pub fn has_evidence_id(&self, id: &str) -> bool {
        self.evidence_ids.contains(id)
    }

    pub fn record_evidence(
        &mut self,
        step: usize,
        tool: &str,
        args: &Value,
        obs: &Observation,
        failure_type: Option<&str>,
    ) -> String {
        self.evidence_counter += 1;
        let ev_id = format!("ev_{:04}", self.evidence_counter);

        let cmd = if tool == "shell" {
            args.get("cmd").and_then(|v| v.as_str()).unwrap_or("")
        } else {
            ""
        };
        let output = obs.output.as_deref().unwrap_or("");
        let mut urls = extract_urls(&format!("{cmd}\n{output}"));
        urls.truncate(EVIDENCE_MAX_URLS);

        let record = json!({
            "id": ev_id,
            "ts": now_ts(),
            "step": step,
            "tool": tool,
            "args": args,
            "obs": {
                "exit_code": obs.exit_code,
                "error_type": obs.error_type,
                "error": obs.error,
                "output": clip_text(output, EVIDENCE_OUTPUT_CLIP_CHARS),
            },
            "urls": urls,
            "failure_type": failure_type,
        });
        append_jsonl(&self.evidence_path, &record);
        self.evidence_ids.insert(ev_id.clone());
        ev_id
    }

    pub fn record_move(&mut self, step: usize, info: &MoveInfo, outcome: Outcome) -> String {
        self.move_counter += 1;
        let mv_id = format!("mv_{:04}", self.move_counter);
        let record = json!({
            "id": mv_id,
            "ts": now_ts(),
            "step": step,
            "tool": info.tool,
            "cmd": info.cmd,
            "url": info.url,
            "domain": info.domain,
            "query": info.query,
            "query_family": info.query_family,
            "source_class": info.source_class,
            "move_type": info.move_type,
            "move_sig": info.move_sig,
            "failure_type": info.failure_type,
            "outcome": outcome,
        });
        append_jsonl(&self.move_path, &record);
        mv_id
    }

    pub fn record_query(&mut self, step: usize, info: &MoveInfo, outcome: Outcome) -> String {
        self.query_counter += 1;
        let q_id = format!("q_{:04}", self.query_counter);
        let record = json!({
            "id": q_id,
            "ts": now_ts(),
            "step": step,
            "url": info.url,
            "domain": info.domain,
            "query": info.query,
            "query_family": info.query_family,
            "source_class": info.source_class,
            "move_type": info.move_type,
            "outcome": outcome,
        });
        append_jsonl(&self.query_path, &record);
        q_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs_ok(output: &str) -> Observation {
        Observation {
            exit_code: Some(0),
            output: Some(output.to_string()),
            cwd: Some("/work".to_string()),
            ..Observation::default()
        }
    }

    #[test]
    fn test_classify_failure_notes_blocks_are_not_failures() {
        let obs = Observation::blocked("Action Blocked", "notes_overwrite_blocked");
        assert_eq!(classify_failure("shell", "cat > notes.md", &obs), None);
    }

    #[test]
    fn test_classify_failure_error_type_wins() {
        let obs = Observation::blocked("blocked", "query_mutation_required");
        assert_eq!(
            classify_failure("shell", "curl https://x.com", &obs).as_deref(),
            Some("query_mutation_required")
        );
    }

    #[test]
    fn test_classify_failure_exit_code() {
        let obs = Observation {
            exit_code: Some(1),
            output: Some("boom".to_string()),
            ..Observation::default()
        };
        assert_eq!(classify_failure("shell", "false", &obs).as_deref(), Some("tool_error"));
    }

    #[test]
    fn test_classify_failure_output_patterns() {
        assert_eq!(
            classify_failure("shell", "curl https://x.com", &obs_ok("HTTP 403 Forbidden")).as_deref(),
            Some("access_blocked")
        );
        assert_eq!(
            classify_failure("shell", "curl https://x.com", &obs_ok("401 Unauthorized")).as_deref(),
            Some("auth_required")
        );
        assert_eq!(
            classify_failure("shell", "curl https://x.com", &obs_ok("429 Too Many Requests")).as_deref(),
            Some("rate_limited")
        );
        assert_eq!(
            classify_failure("shell", "curl https://x.com", &obs_ok("   ")).as_deref(),
            Some("empty_response")
        );
        assert_eq!(classify_failure("shell", "ls", &obs_ok("")), None);
        assert_eq!(classify_failure("shell", "echo hi", &obs_ok("hi")), None);
    }

    fn sample_move(failure: Option<&str>) -> MoveInfo {
        MoveInfo {
            tool: "shell".to_string(),
            cmd: "curl -sL https://example.com/?q=foo".to_string(),
            url: Some("https://example.com/?q=foo".to_string()),
            domain: Some("example.com".to_string()),
            query: Some("foo".to_string()),
            query_family: Some("foo".to_string()),
            source_class: SourceClass::Commentary,
            move_type: MoveType::Initial,
            move_sig: "initial:example.com:foo".to_string(),
            failure_type: failure.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_evidence_ids_are_dense_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledgers = Ledgers::new(dir.path());
        let obs = obs_ok("out");
        let a = ledgers.record_evidence(1, "shell", &json!({"cmd":"ls"}), &obs, None);
        let b = ledgers.record_evidence(2, "shell", &json!({"cmd":"ls"}), &obs, None);
        assert_eq!(a, "ev_0001");
        assert_eq!(b, "ev_0002");
        assert!(ledgers.has_evidence_id("ev_0001"));
        assert!(!ledgers.has_evidence_id("ev_0003"));
        assert_eq!(ledgers.evidence_count(), 2);
    }

    #[test]
    fn test_evidence_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledgers = Ledgers::new(dir.path());
        let obs = obs_ok("fetched https://example.com/page ok");
        ledgers.record_evidence(
            3,
            "shell",
            &json!({"cmd": "curl -sL https://example.com/page"}),
            &obs,
            Some("access_blocked"),
        );
        let content = std::fs::read_to_string(dir.path().join("evidence.jsonl")).unwrap();
        let rec: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(rec["id"], "ev_0001");
        assert_eq!(rec["step"], 3);
        assert_eq!(rec["failure_type"], "access_blocked");
        assert_eq!(rec["urls"][0], "https://example.com/page");
        assert_eq!(rec["obs"]["exit_code"], 0);
    }

    #[test]
    fn test_evidence_output_clipped_and_urls_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledgers = Ledgers::new(dir.path());
        let mut big = String::new();
        for i in 0..30 {
            big.push_str(&format!("https://site{i}.com/x "));
        }
        big.push_str(&"y".repeat(5000));
        let obs = obs_ok(&big);
        ledgers.record_evidence(1, "shell", &json!({"cmd":"curl https://a.com"}), &obs, None);
        let content = std::fs::read_to_string(dir.path().join("evidence.jsonl")).unwrap();
        let rec: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(rec["urls"].as_array().unwrap().len(), EVIDENCE_MAX_URLS);
        assert!(rec["obs"]["output"].as_str().unwrap().contains("truncated"));
    }

    #[test]
    fn test_move_and_query_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledgers = Ledgers::new(dir.path());
        let info = sample_move(None);
        assert_eq!(ledgers.record_move(1, &info, Outcome::Ok), "mv_0001");
        assert_eq!(ledgers.record_query(1, &info, Outcome::Blocked), "q_0001");

        let mv: Value = serde_json::from_str(
            std::fs::read_to_string(dir.path().join("move_ledger.jsonl"))
                .unwrap()
                .lines()
                .next()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(mv["outcome"], "ok");
        assert_eq!(mv["move_type"], "initial");
        assert_eq!(mv["source_class"], "commentary");
        assert_eq!(mv["move_sig"], "initial:example.com:foo");

        let q: Value = serde_json::from_str(
            std::fs::read_to_string(dir.path().join("query_ledger.jsonl"))
                .unwrap()
                .lines()
                .next()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(q["outcome"], "blocked");
        assert_eq!(q["query_family"], "foo");
        // Query records are a projection: no cmd, no move_sig.
        assert!(q.get("cmd").is_none());
        assert!(q.get("move_sig").is_none());
    }
}
