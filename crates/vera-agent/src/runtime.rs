//! The supervisory control loop: per-turn orchestration, policy gating,
//! ledger writes, verifier invocation, and termination.

use anyhow::Result;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{build_context, total_chars};
use crate::ledger::{classify_failure, Ledgers, MoveInfo, Outcome};
use crate::llm::{ChatClient, ChatMessage};
use crate::notes::{runtime_shell, NotesWriter};
use crate::policy::{Block, CallDims, PolicyEngine};
use crate::prompts::load_system_prompt;
use crate::sandbox::{Sandbox, SandboxBackend};
use crate::shell::{Observation, ShellSession};
use crate::streamers::spawn_streamers;
use crate::trace::{compact_messages, TraceWriter};
use crate::verifier::{
    deep_verify, format_verifier_feedback, gradient_suggested_cmds, VerifyArgs,
};
use vera_core::config::{
    clip_text, Config, FINALIZATION_STOP_HITS, LENGTH_NUDGE_LIMIT, MAX_MODEL_IO_RESPONSE_CHARS,
    MAX_MODEL_NOTE_CHARS, MAX_VERIFIER_ROUNDS, OBSERVATION_CLIP_CHARS, PARSE_ERROR_LIMIT,
    PRE_TOOL_MIN_CALLS, VERIFIER_CHECK_STEPS,
};
use vera_core::epistemic::{EpistemicState, Status};
use vera_core::parse::{extract_tool_calls, parse_with_thought, ToolCall};

pub struct RunOptions {
    pub task: String,
    pub input_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub brave_api_key: Option<String>,
    pub temperature: f64,
}

fn extract_status_update(text: &str) -> Option<String> {
    let re = Regex::new(r"(?i)\bSTATUS_UPDATE\s*:\s*(.+)").expect("status regex");
    re.captures(text).map(|c| c[1].trim().to_string())
}

fn extract_evidence_used(text: &str) -> Vec<String> {
    let re = Regex::new(r"(?i)\bEVIDENCE_USED\s*:\s*(.+)").expect("evidence regex");
    let Some(cap) = re.captures(text) else {
        return Vec::new();
    };
    let blob = cap[1].trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(blob) {
        return items
            .iter()
            .map(|x| match x {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect();
    }
    blob.split(|c: char| c == ',' || c.is_whitespace())
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

fn finalization_intent(text: &str) -> bool {
    let t = text.to_lowercase();
    [
        "final answer",
        "final output",
        "final deliverable",
        "final deliverables",
        "final report",
        "final summary",
        "all the information i need",
        "complete final",
        "deliverables as requested",
    ]
    .iter()
    .any(|m| t.contains(m))
}

fn writes_final_like_file(cmd: &str) -> bool {
    let c = cmd.to_lowercase();
    if !c.contains('>') && !c.contains("tee") {
        return false;
    }
    if !c.contains("/work") && !c.contains("cd /work") {
        return false;
    }
    ["final", "deliverable", "answer", "summary", "report", "output", "visual", "stability"]
        .iter()
        .any(|k| c.contains(k))
}

/// Finalization contract: a no-tool answer must carry a STATUS_UPDATE and
/// cite only known evidence ids; violations force UNRESOLVED.
fn enforce_citation_contract(
    resp: &str,
    has_evidence_id: impl Fn(&str) -> bool,
    epistemic: &mut EpistemicState,
) {
    match extract_status_update(resp) {
        None => {
            epistemic.status = Status::Unresolved;
            epistemic.add_constraint("Missing STATUS_UPDATE");
        }
        Some(status_update) => {
            let upper = status_update.to_uppercase();
            if upper.contains("UNRESOLVED") {
                epistemic.status = Status::Unresolved;
                epistemic.add_unresolved(&status_update);
            } else if upper.contains("BLOCKED") {
                epistemic.status = Status::Blocked;
                epistemic.add_blocked(&status_update);
            } else if upper.contains("VERIFIED") && epistemic.constraints.is_empty() {
                epistemic.set_verified();
            }
        }
    }
    let evidence_used = extract_evidence_used(resp);
    if evidence_used.is_empty() {
        epistemic.status = Status::Unresolved;
        epistemic.add_constraint("Missing EVIDENCE_USED");
    } else {
        let missing: Vec<String> =
            evidence_used.into_iter().filter(|e| !has_evidence_id(e)).collect();
        if !missing.is_empty() {
            epistemic.status = Status::Unresolved;
            epistemic.add_constraint(&format!("Unknown EVIDENCE_USED ids: {}", missing.join(", ")));
        }
    }
}

/// Notes block for a model response that produced no executed tool call.
fn model_output_note(step: usize, resp: &str, tag: &str) -> Option<String> {
    let snippet = resp.trim();
    if snippet.is_empty() {
        return None;
    }
    let snippet = if snippet.chars().count() > MAX_MODEL_NOTE_CHARS {
        let head: String = snippet.chars().take(MAX_MODEL_NOTE_CHARS).collect();
        format!("{head}\n... [truncated]")
    } else {
        snippet.to_string()
    };
    Some(format!("\n\n## Step {step} (model_output:{tag})\n{snippet}\n"))
}

fn observation_message(tool: &str, obs: &Observation) -> ChatMessage {
    let payload = json!({"tool": tool, "obs": obs}).to_string();
    ChatMessage::user(format!("OBSERVATION:\n{}", clip_text(&payload, OBSERVATION_CLIP_CHARS)))
}

fn unresolved_report(epistemic: &EpistemicState) -> String {
    format!(
        "UNRESOLVED: Evidence requirements not satisfied within the step budget.\n\
         Status: {}\n\
         Constraints: {:?}\n\
         Blocked: {:?}\n\
         Unresolved: {:?}\n\
         See /work/notes.md and /work/evidence.jsonl.",
        epistemic.status, epistemic.constraints, epistemic.blocked, epistemic.unresolved
    )
}

fn move_info_for(dims: &CallDims, tool: &str, failure_type: Option<&str>) -> MoveInfo {
    MoveInfo {
        tool: tool.to_string(),
        cmd: dims.cmd.clone(),
        url: dims.primary_url.clone(),
        domain: dims.domain.clone(),
        query: dims.query.clone(),
        query_family: dims.query_family.clone(),
        source_class: dims.source_class,
        move_type: dims.move_type,
        move_sig: dims.move_sig.clone(),
        failure_type: failure_type.map(|s| s.to_string()),
    }
}

/// Drive one task to completion. Returns the accepted answer, or a
/// structured UNRESOLVED / stop report; `Err` only on crashes (I/O, API).
pub async fn run_task(
    cfg: &Config,
    backend: Arc<dyn SandboxBackend>,
    client: &ChatClient,
    opts: &RunOptions,
) -> Result<String> {
    let sandbox = backend
        .start(opts.input_dir.as_deref(), &opts.work_dir, true)
        .await?;
    let result = drive_loop(cfg, backend.clone(), client, opts, &sandbox).await;
    let _ = backend.stop(&sandbox).await;
    result
}

async fn drive_loop(
    cfg: &Config,
    backend: Arc<dyn SandboxBackend>,
    client: &ChatClient,
    opts: &RunOptions,
    sandbox: &Sandbox,
) -> Result<String> {
    let work_dir = &opts.work_dir;
    let trace = TraceWriter::new(work_dir.join("trace.jsonl"));
    let container_log_path = work_dir.join("container.log");
    let container_events_path = work_dir.join("container_events.log");
    let notes = NotesWriter::new(work_dir.join("notes.md"));
    let mut ledgers = Ledgers::new(work_dir);

    let mut shell = ShellSession::new(backend.clone(), sandbox.clone());
    if let Some(key) = opts.brave_api_key.as_deref() {
        shell.set_env("BRAVE_API_KEY", key);
    }

    let system_prompt = load_system_prompt(cfg.prompt_profile.as_deref());
    let system_role = cfg.system_role.trim().to_lowercase();
    let task = opts.task.as_str();

    // Artifact init goes through the shell so /work state is honest.
    notes.reset(&mut shell, &trace, &format!("# Task\n{task}\n\n# Log\n")).await;
    runtime_shell(
        &mut shell,
        &trace,
        "python3 - <<'PY'\n\
         from pathlib import Path\n\
         for name in ('evidence.jsonl','move_ledger.jsonl','query_ledger.jsonl'):\n    \
             p = Path('/work') / name\n    \
             if not p.exists():\n        \
                 p.write_text('', encoding='utf-8', errors='replace')\n\
         print('OK')\n\
         PY",
    )
    .await;

    trace.event(json!({
        "type": "sandbox",
        "container_id": sandbox.container_id,
        "container_name": sandbox.name,
        "mem_limit": sandbox.mem_limit,
        "nano_cpus": sandbox.nano_cpus,
        "pids_limit": sandbox.pids_limit,
        "privileged": sandbox.privileged,
        "network_mode": sandbox.network_mode,
        "work_dir": work_dir.display().to_string(),
        "container_log": container_log_path.display().to_string(),
        "container_events_log": container_events_path.display().to_string(),
    }));
    trace.event(json!({"type": "task", "task": task}));

    spawn_streamers(
        backend.clone(),
        sandbox,
        container_log_path,
        container_events_path,
        trace.clone(),
    );

    let mut epistemic = EpistemicState::default();
    let mut policy = PolicyEngine::new(cfg, task);
    if policy.negative_claim() {
        epistemic.add_constraint(
            "Negative-claim task: require ≥2 official domains and ≥1 independent domain before \
             concluding 'no official announcement found in sources checked'. Do not assert \
             non-launch; explicit denial is optional (only cite it if found).",
        );
    }

    let mut history: Vec<ChatMessage> = Vec::new();
    let mut verifier_rounds = 0usize;
    let mut pending_gradient: Option<Value> = None;
    let mut gradient_reminders = 0usize;
    let mut tool_calls_made = 0usize;
    let mut pre_tool_nudges = 0usize;
    let mut length_nudges = 0usize;
    let mut finalization_hits = 0usize;
    let mut parse_error_hits = 0usize;

    let mut step = 0usize;
    loop {
        step += 1;
        if cfg.max_steps > 0 && step > cfg.max_steps {
            break;
        }

        for advisory in policy.pre_turn_advisories() {
            history.push(ChatMessage::user(advisory));
        }
        if cfg.notes_update_interval > 0 && step % cfg.notes_update_interval == 0 {
            policy.require_notes();
        }

        let notes_content = notes.read();
        let tail_start = history.len().saturating_sub(cfg.action_tail_messages);
        let mut history_tail: Vec<ChatMessage> = history[tail_start..].to_vec();
        let mut context_messages = build_context(
            &system_prompt,
            &system_role,
            task,
            &history_tail,
            &notes_content,
            &epistemic,
            cfg.context_max_chars,
        );
        if policy.notes_required() {
            let intervention = format!(
                "SYSTEM INTERVENTION: It has been {} steps. You must update /work/notes.md with \
                 your latest findings/failures before proceeding.",
                cfg.notes_update_interval
            );
            loop {
                context_messages = build_context(
                    &system_prompt,
                    &system_role,
                    task,
                    &history_tail,
                    &notes_content,
                    &epistemic,
                    cfg.context_max_chars,
                );
                context_messages.push(ChatMessage::user(intervention.clone()));
                if total_chars(&context_messages) <= cfg.context_max_chars || history_tail.is_empty()
                {
                    break;
                }
                history_tail.remove(0);
            }
        }

        let outcome = client.chat(&context_messages, opts.temperature, 1200).await?;
        let resp = outcome.content.clone();
        let finish_reason = outcome.finish_reason.as_deref().unwrap_or("");
        debug!("Step {step}: {} chars, finish_reason={finish_reason}", resp.len());

        trace.event(json!({
            "type": "assistant",
            "step": step,
            "content": clip_text(&resp, 20_000),
        }));
        trace.event(json!({
            "type": "model_io",
            "step": step,
            "request": {
                "messages_total": context_messages.len(),
                "messages": compact_messages(&context_messages),
                "temperature": opts.temperature,
                "max_tokens": 1200,
                "model": outcome.model.as_deref().or(client.model_name()),
                "system_role": system_role,
            },
            "response": {
                "content": clip_text(&resp, MAX_MODEL_IO_RESPONSE_CHARS),
                "finish_reason": outcome.finish_reason,
                "usage": outcome.usage,
            },
        }));
        trace.event(json!({
            "type": "model",
            "step": step,
            "scope": "agent",
            "latency_s": outcome.latency_s,
            "usage": outcome.usage,
            "finish_reason": outcome.finish_reason,
            "n_messages": context_messages.len(),
            "input_chars": total_chars(&context_messages),
        }));

        // Batched extraction first; the THOUGHT/ACTION parser is the
        // fallback that also reports hard format errors.
        let mut tool_calls = extract_tool_calls(&resp);
        let parsed = if tool_calls.is_empty() {
            Some(parse_with_thought(&resp))
        } else {
            None
        };

        if tool_calls.is_empty() {
            if let Some(err) = parsed.as_ref().and_then(|p| p.error.clone()) {
                if finish_reason == "length" {
                    length_nudges += 1;
                    trace.event(json!({
                        "type": "policy_length_nudge",
                        "step": step,
                        "count": length_nudges,
                    }));
                    history.push(ChatMessage::assistant(resp.clone()));
                    history.push(ChatMessage::user(
                        "Your response was truncated due to length limits. Please try again, but \
                         output a shorter response or split the content into multiple steps.",
                    ));
                    if let Some(text) = model_output_note(step, &resp, "length_truncation") {
                        notes.append(&mut shell, &trace, &text).await;
                    }
                    continue;
                }

                parse_error_hits += 1;
                trace.event(json!({
                    "type": "policy_parse_error",
                    "step": step,
                    "error": err,
                    "count": parse_error_hits,
                }));
                history.push(ChatMessage::assistant(resp.clone()));
                history.push(ChatMessage::user(format!("SYSTEM FORMAT ERROR: {err}")));
                if let Some(text) = model_output_note(step, &resp, "parse_error") {
                    notes.append(&mut shell, &trace, &text).await;
                }
                if parse_error_hits >= PARSE_ERROR_LIMIT {
                    return Ok(
                        "Stopped due to repeated format errors (missing THOUGHT/ACTION). See /work/notes.md."
                            .to_string(),
                    );
                }
                continue;
            }
        }

        if tool_calls.is_empty() {
            if let Some(p) = parsed.as_ref() {
                if let Some(tool_name) = p.tool_name.clone() {
                    tool_calls = vec![ToolCall {
                        tool: tool_name,
                        args: p.tool_args.clone().unwrap_or_else(|| json!({})),
                    }];
                }
            }
        }

        if pending_gradient.is_some() && tool_calls.is_empty() {
            gradient_reminders += 1;
            trace.event(json!({
                "type": "policy_reminder",
                "step": step,
                "gradient_reminders": gradient_reminders,
            }));
            if gradient_reminders <= 4 {
                history.push(ChatMessage::assistant(resp.clone()));
                history.push(ChatMessage::user(
                    "You have verifier feedback. Use tools to gather missing evidence and make \
                     progress now. Prefer next_actions when helpful, but you may choose any \
                     sensible action.",
                ));
                continue;
            }
            if gradient_reminders > 6 {
                pending_gradient = None;
            }
        }

        if tool_calls.is_empty() {
            // A final JSON payload takes precedence over the raw response.
            let mut answer_text = resp.clone();
            if let Some(p) = parsed.as_ref() {
                if let Some(final_val) = p.tool_args.as_ref().and_then(|a| a.get("final")) {
                    let rendered = match final_val {
                        Value::String(s) => s.clone(),
                        Value::Null | Value::Bool(false) => String::new(),
                        other => other.to_string(),
                    };
                    if !rendered.is_empty() {
                        answer_text = rendered;
                    }
                }
            }
            if let Some(text) = model_output_note(step, &resp, "no_tool") {
                notes.append(&mut shell, &trace, &text).await;
            }

            let enforce_contract =
                tool_calls_made >= PRE_TOOL_MIN_CALLS || finalization_intent(&resp);
            if enforce_contract {
                enforce_citation_contract(&resp, |id| ledgers.has_evidence_id(id), &mut epistemic);
            }

            if policy.negative_claim()
                && step >= cfg.negative_claim_budget_steps()
                && policy.negative_claim_minima_met()
            {
                epistemic.status = Status::Unresolved;
                epistemic.add_unresolved("negative_claim_evidence_exhausted");
            }

            if let Some(streak) = policy.note_no_tool_turn(&mut epistemic, ledgers.evidence_count())
            {
                trace.event(json!({
                    "type": "policy_stagnation",
                    "step": step,
                    "streak": streak,
                    "limit": cfg.stagnation_limit,
                    "failure_type": policy.last_failure_type(),
                    "failure_streak": policy.last_failure_streak(),
                }));
            }

            // Early-phase gating: no verifier before initial exploration.
            if tool_calls_made < PRE_TOOL_MIN_CALLS {
                pre_tool_nudges += 1;
                trace.event(json!({
                    "type": "policy_pre_tool_nudge",
                    "step": step,
                    "count": pre_tool_nudges,
                }));
                history.push(ChatMessage::assistant(resp.clone()));
                if pre_tool_nudges <= 6 {
                    history.push(ChatMessage::user(
                        "You have not used tools yet. Use the shell now to make concrete progress. \
                         You can chain commands with && to do multiple steps in one tool call.",
                    ));
                } else {
                    history.push(ChatMessage::user(
                        "Stop planning and run a shell command that gathers evidence.",
                    ));
                }
                continue;
            }

            if finish_reason == "length" {
                length_nudges += 1;
                trace.event(json!({
                    "type": "policy_length_nudge",
                    "step": step,
                    "count": length_nudges,
                }));
                if length_nudges <= LENGTH_NUDGE_LIMIT {
                    history.push(ChatMessage::assistant(resp.clone()));
                    history.push(ChatMessage::user(
                        "Your previous response was truncated. Keep it short and run a shell command now.",
                    ));
                    continue;
                }
            }

            verifier_rounds += 1;
            let v_start = Instant::now();
            let mut decision = deep_verify(
                client,
                &mut shell,
                &trace,
                VerifyArgs {
                    task,
                    answer: &answer_text,
                    notes_snapshot: &notes_content,
                    trace_path: trace.path(),
                    evidence_path: ledgers.evidence_path(),
                    max_tool_steps_per_check: VERIFIER_CHECK_STEPS,
                    parent_step: step,
                },
            )
            .await?;
            decision
                .meta
                .insert("duration_s".to_string(), json!(v_start.elapsed().as_secs_f64()));
            trace.event(json!({"type": "verifier", "step": step, "decision": decision.to_value()}));
            info!("Verifier round {verifier_rounds}: score {}/4", decision.score);

            if decision.score < 3 {
                epistemic.status = Status::Unresolved;
                for ins in decision.instructions.iter().take(5) {
                    epistemic.add_constraint(ins);
                }
                for reason in decision.cap_reasons() {
                    epistemic.add_unresolved(&reason);
                }
            }

            if decision.score >= 3 {
                epistemic.set_verified();
                return Ok(resp);
            }
            if verifier_rounds >= MAX_VERIFIER_ROUNDS {
                epistemic.status = Status::Unresolved;
                epistemic.add_unresolved("verification_budget_exhausted");
                return Ok(format!(
                    "Verifier could not confirm correctness within the verification budget. \
                     See /work/trace.jsonl and /work/notes.md.\n\n{resp}"
                ));
            }

            let feedback = format_verifier_feedback(&decision);
            trace.event(json!({
                "type": "verifier_to_agent",
                "step": step,
                "score": decision.score,
                "content": clip_text(&feedback, 20_000),
            }));
            if let Some(gradient) = decision.gradient().cloned() {
                trace.event(json!({"type": "verifier_gradient", "step": step, "gradient": gradient}));
                if decision.score < 3 {
                    epistemic.status = Status::Unresolved;
                    if let Some(missing) = gradient.get("missing").and_then(|v| v.as_array()) {
                        for m in missing {
                            let text = m.as_str().map(|s| s.to_string()).unwrap_or_else(|| m.to_string());
                            epistemic.add_constraint(&text);
                        }
                    }
                    if let Some(wrong) = gradient.get("wrong").and_then(|v| v.as_array()) {
                        for w in wrong {
                            let text = if w.is_object() {
                                w.get("item")
                                    .or_else(|| w.get("why"))
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string()
                            } else {
                                w.as_str().map(|s| s.to_string()).unwrap_or_else(|| w.to_string())
                            };
                            epistemic.add_constraint(&text);
                        }
                    }
                }
                pending_gradient = Some(gradient);
                gradient_reminders = 0;
            }
            history.push(ChatMessage::assistant(resp.clone()));
            history.push(ChatMessage::user(feedback));
            trace.event(json!({
                "type": "agent_from_verifier",
                "step": step,
                "n_messages": history.len(),
            }));
            continue;
        }

        // Tool branch.
        parse_error_hits = 0;
        history.push(ChatMessage::assistant(resp.clone()));

        for call in &tool_calls {
            let tool = call.tool.as_str();
            let args = &call.args;

            if let Some(gradient) = pending_gradient.take() {
                let suggested = gradient_suggested_cmds(&gradient);
                let cmd = args.get("cmd").and_then(|v| v.as_str());
                let matched = cmd.is_some_and(|c| {
                    suggested.iter().any(|(t, sc)| t == tool && sc == c)
                });
                trace.event(json!({
                    "type": "policy_choice",
                    "step": step,
                    "matched": matched,
                    "tool": tool,
                    "args": args,
                }));
                gradient_reminders = 0;
            }

            let dims = policy.classify_call(tool, args);

            if let Some(block) = policy.check(tool, &dims) {
                let obs = Observation::blocked(&block.error(), block.error_type());
                let policy_event = match &block {
                    Block::NotesOverwrite => json!({
                        "type": "policy_notes_guard",
                        "step": step,
                        "required": policy.notes_required(),
                        "allowed": false,
                        "mode": "overwrite",
                        "tool": tool,
                        "args": args,
                    }),
                    Block::NotesUpdateRequired => json!({
                        "type": "policy_notes_gate",
                        "step": step,
                        "required": true,
                        "allowed": false,
                        "mode": dims.notes_mode.map(|m| format!("{m:?}").to_lowercase()),
                        "tool": tool,
                        "args": args,
                    }),
                    Block::QueryMutation { required, seen } => json!({
                        "type": "policy_query_mutation",
                        "step": step,
                        "required": required,
                        "seen": seen,
                        "query_family": dims.query_family,
                        "domain": dims.domain,
                    }),
                    Block::DomainShift => json!({
                        "type": "policy_domain_shift",
                        "step": step,
                        "domain": dims.domain,
                        "official_checked": policy.official_domains_checked(),
                        "independent_checked": policy.independent_domains_checked(),
                        "limit": cfg.domain_shift_limit,
                    }),
                };
                trace.event(policy_event);
                history.push(observation_message(tool, &obs));
                trace.event(json!({"type": "tool", "step": step, "tool": tool, "args": args, "obs": obs}));

                let failure = classify_failure(tool, &dims.cmd, &obs);
                policy.observe_failure(failure.as_deref(), &dims.cmd, &mut epistemic);
                let ev_id = ledgers.record_evidence(step, tool, args, &obs, failure.as_deref());
                if block.records_move() {
                    let info = move_info_for(&dims, tool, policy.last_failure_type());
                    ledgers.record_move(step, &info, Outcome::Blocked);
                    if dims.query_family.is_some() {
                        ledgers.record_query(step, &info, Outcome::Blocked);
                    }
                }
                tool_calls_made += 1;
                let obs_json = serde_json::to_string(&obs).unwrap_or_default();
                notes
                    .append(
                        &mut shell,
                        &trace,
                        &format!(
                            "\n\n## Step {step}\nTOOL: {tool}\nARGS: {args}\nOBS: {}\nEVIDENCE_ID: {ev_id}\n",
                            clip_text(&obs_json, 2_000),
                        ),
                    )
                    .await;
                policy.after_blocked_call(&block, ledgers.evidence_count());
                continue;
            }

            let mut obs = if tool != "shell" {
                Observation {
                    error: Some(format!("Unknown tool (shell-only mode): {tool}")),
                    hint: Some(
                        "Use the shell tool only. If you need the internet, do it from the shell."
                            .to_string(),
                    ),
                    ..Observation::default()
                }
            } else {
                shell.shell(&dims.cmd).await
            };
            if obs.exit_code.is_some_and(|c| c != 0)
                && dims.cmd.contains("echo")
                && dims.cmd.contains('\'')
                && obs.output.as_deref().unwrap_or("").contains("command not found")
            {
                obs.hint = Some(
                    "Check your quotes. You might have an unescaped single quote inside a \
                     single-quoted string."
                        .to_string(),
                );
            }

            history.push(observation_message(tool, &obs));
            trace.event(json!({"type": "tool", "step": step, "tool": tool, "args": args, "obs": obs}));

            let failure = classify_failure(tool, &dims.cmd, &obs);
            policy.observe_failure(failure.as_deref(), &dims.cmd, &mut epistemic);
            let ev_id = ledgers.record_evidence(step, tool, args, &obs, failure.as_deref());
            tool_calls_made += 1;

            let outcome_kind = if policy.last_failure_type().is_some() {
                Outcome::Failed
            } else {
                Outcome::Ok
            };
            let info = move_info_for(&dims, tool, policy.last_failure_type());
            ledgers.record_move(step, &info, outcome_kind);
            if dims.query_family.is_some() {
                ledgers.record_query(step, &info, outcome_kind);
            }

            let obs_json = serde_json::to_string(&obs).unwrap_or_default();
            notes
                .append(
                    &mut shell,
                    &trace,
                    &format!(
                        "\n\n## Step {step}\nTOOL: {tool}\nARGS: {args}\nOBS: {}\nEVIDENCE_ID: {ev_id}\n",
                        clip_text(&obs_json, 2_000),
                    ),
                )
                .await;

            policy.after_exec(&dims, failure.as_deref(), &mut epistemic, ledgers.evidence_count());

            // Stop tool-call loops when the agent keeps "finalizing".
            if tool == "shell" && finalization_intent(&resp) && writes_final_like_file(&dims.cmd) {
                finalization_hits += 1;
                trace.event(json!({
                    "type": "policy_finalization_stop",
                    "step": step,
                    "hits": finalization_hits,
                    "cmd": clip_text(&dims.cmd, 500),
                }));
                if finalization_hits >= FINALIZATION_STOP_HITS {
                    return Ok(
                        "Final deliverables appear to be written under /work. Stopping to prevent a tool loop."
                            .to_string(),
                    );
                }
            }
        }
    }

    warn!("Step budget exhausted after {} steps", cfg.max_steps);
    if epistemic.status != Status::Verified {
        return Ok(unresolved_report(&epistemic));
    }
    Ok("Did not reach a verifiable final answer within the step budget. See /work/notes.md.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_status_update() {
        assert_eq!(
            extract_status_update("blah\nSTATUS_UPDATE: UNRESOLVED — sources blocked").as_deref(),
            Some("UNRESOLVED — sources blocked")
        );
        assert_eq!(
            extract_status_update("status_update:   verified").as_deref(),
            Some("verified")
        );
        assert!(extract_status_update("no marker here").is_none());
    }

    #[test]
    fn test_extract_evidence_used_json_list() {
        let ids = extract_evidence_used("EVIDENCE_USED: [\"ev_0001\", \"ev_0002\"]");
        assert_eq!(ids, vec!["ev_0001", "ev_0002"]);
    }

    #[test]
    fn test_extract_evidence_used_loose_list() {
        let ids = extract_evidence_used("EVIDENCE_USED: ev_0001, ev_0002 ev_0003");
        assert_eq!(ids, vec!["ev_0001", "ev_0002", "ev_0003"]);
        assert!(extract_evidence_used("final answer").is_empty());
    }

    #[test]
    fn test_finalization_intent() {
        assert!(finalization_intent("Here is my FINAL ANSWER: none"));
        assert!(finalization_intent("writing the final deliverables now"));
        assert!(!finalization_intent("let me keep looking"));
    }

    #[test]
    fn test_writes_final_like_file() {
        assert!(writes_final_like_file("echo done > /work/final_report.md"));
        assert!(writes_final_like_file("cat summary | tee /work/summary.txt"));
        assert!(!writes_final_like_file("echo x > /tmp/scratch.txt"));
        assert!(!writes_final_like_file("cat /work/final_report.md"));
    }

    #[test]
    fn test_citation_contract_missing_status() {
        let mut epistemic = EpistemicState::default();
        enforce_citation_contract("Final answer: it is 42.", |_| true, &mut epistemic);
        assert_eq!(epistemic.status, Status::Unresolved);
        assert!(epistemic.constraints.contains(&"Missing STATUS_UPDATE".to_string()));
        assert!(epistemic.constraints.contains(&"Missing EVIDENCE_USED".to_string()));
    }

    #[test]
    fn test_citation_contract_unknown_ids() {
        let mut epistemic = EpistemicState::default();
        enforce_citation_contract(
            "STATUS_UPDATE: VERIFIED\nEVIDENCE_USED: [\"ev_0001\", \"ev_9999\"]\nFinal answer: 42",
            |id| id == "ev_0001",
            &mut epistemic,
        );
        assert_eq!(epistemic.status, Status::Unresolved);
        assert!(epistemic
            .constraints
            .iter()
            .any(|c| c.contains("Unknown EVIDENCE_USED ids: ev_9999")));
    }

    #[test]
    fn test_citation_contract_verified() {
        let mut epistemic = EpistemicState::default();
        enforce_citation_contract(
            "STATUS_UPDATE: VERIFIED\nEVIDENCE_USED: [\"ev_0001\"]\nAnswer: 42",
            |_| true,
            &mut epistemic,
        );
        assert_eq!(epistemic.status, Status::Verified);
        assert!(epistemic.constraints.is_empty());
    }

    #[test]
    fn test_citation_contract_verified_blocked_by_open_constraints() {
        let mut epistemic = EpistemicState::default();
        epistemic.add_constraint("unmet");
        enforce_citation_contract(
            "STATUS_UPDATE: VERIFIED\nEVIDENCE_USED: [\"ev_0001\"]",
            |_| true,
            &mut epistemic,
        );
        // VERIFIED claim with open constraints does not flip the status.
        assert_eq!(epistemic.status, Status::InProgress);
    }

    #[test]
    fn test_citation_contract_unresolved_and_blocked() {
        let mut epistemic = EpistemicState::default();
        enforce_citation_contract(
            "STATUS_UPDATE: UNRESOLVED — need more sources\nEVIDENCE_USED: ev_0001",
            |_| true,
            &mut epistemic,
        );
        assert_eq!(epistemic.status, Status::Unresolved);
        assert!(epistemic.unresolved[0].contains("need more sources"));

        let mut epistemic = EpistemicState::default();
        enforce_citation_contract(
            "STATUS_UPDATE: BLOCKED by captcha\nEVIDENCE_USED: ev_0001",
            |_| true,
            &mut epistemic,
        );
        assert_eq!(epistemic.status, Status::Blocked);
    }

    #[test]
    fn test_unresolved_report_format() {
        let mut epistemic = EpistemicState::default();
        epistemic.status = Status::Unresolved;
        epistemic.add_constraint("c1");
        epistemic.add_unresolved("u1");
        let report = unresolved_report(&epistemic);
        assert!(report.starts_with("UNRESOLVED: Evidence requirements not satisfied"));
        assert!(report.contains("Status: UNRESOLVED"));
        assert!(report.contains("c1"));
        assert!(report.contains("/work/notes.md"));
    }

    #[test]
    fn test_observation_message_clipped() {
        let obs = Observation {
            exit_code: Some(0),
            output: Some("x".repeat(20_000)),
            ..Observation::default()
        };
        let msg = observation_message("shell", &obs);
        assert!(msg.content.starts_with("OBSERVATION:\n"));
        assert!(msg.content.len() < 15_000);
    }
}
