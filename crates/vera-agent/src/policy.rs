//! Stateful per-turn policy gate. Each tool call is classified into its
//! move dimensions, checked before execution (notes invariant, notes
//! cadence, query-mutation window, negative-claim domain shifting), and
//! folded back into the gating state after execution (streaks, domain
//! tallies, force flags for the next turn).

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::notes::{notes_write_mode, NotesMode};
use vera_core::classify::{
    classify_move, extract_domain, extract_query_from_url, extract_urls, is_negative_claim_task,
    is_search_domain, move_sig, normalize_query, DomainLens, MoveContext, MoveType, SourceClass,
};
use vera_core::config::Config;
use vera_core::epistemic::{EpistemicState, Status};

/// Derived dimensions of one tool call, computed before any gating.
#[derive(Debug, Clone)]
pub struct CallDims {
    pub cmd: String,
    pub notes_mode: Option<NotesMode>,
    pub primary_url: Option<String>,
    pub domain: Option<String>,
    pub query: Option<String>,
    pub query_family: Option<String>,
    pub source_class: SourceClass,
    pub move_type: MoveType,
    pub move_sig: String,
}

/// A policy decision to refuse a call before it reaches the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    NotesOverwrite,
    NotesUpdateRequired,
    QueryMutation { required: usize, seen: usize },
    DomainShift,
}

impl Block {
    pub fn error(&self) -> String {
        match self {
            Block::NotesOverwrite => {
                "Action Blocked: Overwriting notes.md is not allowed. Use append (>> or tee -a)."
                    .to_string()
            }
            Block::NotesUpdateRequired => {
                "Action Blocked: You must update notes.md first (append-only).".to_string()
            }
            Block::QueryMutation { required, seen } => format!(
                "Action Blocked: query mutation required before retrying. \
                 Need {required} distinct query families; seen {seen}."
            ),
            Block::DomainShift => {
                "Action Blocked: domain shift required for negative-claim tasks. \
                 Use a different domain to meet official/independent source minimums."
                    .to_string()
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Block::NotesOverwrite => "notes_overwrite_blocked",
            Block::NotesUpdateRequired => "notes_update_required",
            Block::QueryMutation { .. } => "query_mutation_required",
            Block::DomainShift => "domain_shift_required",
        }
    }

    /// Notes blocks only produce evidence; search-shaped blocks also land in
    /// the move/query ledgers.
    pub fn records_move(&self) -> bool {
        matches!(self, Block::QueryMutation { .. } | Block::DomainShift)
    }
}

pub struct PolicyEngine {
    cfg: Config,
    negative_claim: bool,
    pub lens: DomainLens,
    move_ctx: MoveContext,

    // Force flags raised for the next turn; each clears when satisfied.
    pub force_tool_next: bool,
    pub force_query_mutation: bool,
    pub force_move_change: bool,
    pub force_source_shift: bool,
    pub force_domain_shift: bool,
    notes_required: bool,

    stagnation_streak: usize,
    last_failure_type: Option<String>,
    last_failure_streak: usize,
    source_class_failure_streak: usize,

    last_move_sig: Option<String>,
    last_move_type: Option<MoveType>,
    move_repeat_streak: usize,
    last_domain_key: Option<String>,
    domain_same_streak: usize,

    recent_query_families: VecDeque<String>,
    official_domains_checked: HashSet<String>,
    independent_domains_checked: HashSet<String>,
    domain_attempts: HashMap<String, usize>,
    last_evidence_count: usize,
}

impl PolicyEngine {
    pub fn new(cfg: &Config, task: &str) -> Self {
        Self {
            cfg: cfg.clone(),
            negative_claim: is_negative_claim_task(task),
            lens: DomainLens::new(task),
            move_ctx: MoveContext::default(),
            force_tool_next: false,
            force_query_mutation: false,
            force_move_change: false,
            force_source_shift: false,
            force_domain_shift: false,
            notes_required: false,
            stagnation_streak: 0,
            last_failure_type: None,
            last_failure_streak: 0,
            source_class_failure_streak: 0,
            last_move_sig: None,
            last_move_type: None,
            move_repeat_streak: 0,
            last_domain_key: None,
            domain_same_streak: 0,
            recent_query_families: VecDeque::new(),
            official_domains_checked: HashSet::new(),
            independent_domains_checked: HashSet::new(),
            domain_attempts: HashMap::new(),
            last_evidence_count: 0,
        }
    }

    pub fn negative_claim(&self) -> bool {
        self.negative_claim
    }

    pub fn notes_required(&self) -> bool {
        self.notes_required
    }

    pub fn require_notes(&mut self) {
        self.notes_required = true;
    }

    pub fn last_failure_type(&self) -> Option<&str> {
        self.last_failure_type.as_deref()
    }

    pub fn last_failure_streak(&self) -> usize {
        self.last_failure_streak
    }

    pub fn stagnation_streak(&self) -> usize {
        self.stagnation_streak
    }

    pub fn official_domains_checked(&self) -> usize {
        self.official_domains_checked.len()
    }

    pub fn independent_domains_checked(&self) -> usize {
        self.independent_domains_checked.len()
    }

    pub fn recent_query_families(&self) -> usize {
        self.recent_query_families.len()
    }

    /// Negative-claim tasks may conclude UNRESOLVED only once the
    /// source-diversity minima are met.
    pub fn negative_claim_minima_met(&self) -> bool {
        self.official_domains_checked.len() >= self.cfg.negative_claim_min_official
            && self.independent_domains_checked.len() >= self.cfg.negative_claim_min_independent
    }

    /// Compute a call's dimensions from the command string and the previous
    /// move context. Pure with respect to gating state.
    pub fn classify_call(&self, tool: &str, args: &Value) -> CallDims {
        let cmd = if tool == "shell" {
            args.get("cmd").and_then(|v| v.as_str()).unwrap_or("").to_string()
        } else {
            String::new()
        };
        let notes_mode = if tool == "shell" { notes_write_mode(&cmd) } else { None };
        let urls = if tool == "shell" { extract_urls(&cmd) } else { Vec::new() };
        let primary_url = urls.into_iter().next();
        let domain = primary_url.as_deref().and_then(extract_domain);
        let query = primary_url.as_deref().and_then(extract_query_from_url);
        let query_family = query.as_deref().map(normalize_query).filter(|q| !q.is_empty());
        let source_class = self.lens.classify_source(primary_url.as_deref(), domain.as_deref());
        let move_type = classify_move(
            &self.move_ctx,
            domain.as_deref(),
            query_family.as_deref(),
            source_class,
        );
        let sig = move_sig(move_type, domain.as_deref(), query_family.as_deref());
        CallDims {
            cmd,
            notes_mode,
            primary_url,
            domain,
            query,
            query_family,
            source_class,
            move_type,
            move_sig: sig,
        }
    }

    /// Gate a call before execution. Returns the block to synthesize, or
    /// `None` to dispatch. May raise `force_domain_shift` as a side effect.
    pub fn check(&mut self, tool: &str, dims: &CallDims) -> Option<Block> {
        if tool == "shell" && dims.notes_mode == Some(NotesMode::Overwrite) {
            return Some(Block::NotesOverwrite);
        }
        if self.notes_required && tool == "shell" && dims.notes_mode != Some(NotesMode::Append) {
            return Some(Block::NotesUpdateRequired);
        }
        if tool == "shell" {
            if let Some(qf) = dims.query_family.as_deref() {
                let seen = self.recent_query_families.len();
                if seen < self.cfg.query_mutation_budget
                    && self.recent_query_families.iter().any(|q| q == qf)
                {
                    return Some(Block::QueryMutation {
                        required: self.cfg.query_mutation_budget,
                        seen,
                    });
                }
            }
        }
        if self.negative_claim {
            if let Some(domain) = dims.domain.as_deref() {
                if self.last_domain_key.as_deref() == Some(domain)
                    && self.domain_same_streak >= self.cfg.domain_shift_limit
                    && !self.negative_claim_minima_met()
                {
                    self.force_domain_shift = true;
                }
                if self.force_domain_shift && self.last_domain_key.as_deref() == Some(domain) {
                    return Some(Block::DomainShift);
                }
            }
        }
        None
    }

    /// Bookkeeping shared by every blocked call: the turn still counted as
    /// tool activity, so stagnation resets and the tool nudge clears.
    pub fn after_blocked_call(&mut self, block: &Block, evidence_count: usize) {
        if matches!(block, Block::QueryMutation { .. }) {
            self.force_query_mutation = true;
        }
        self.force_tool_next = false;
        self.stagnation_streak = 0;
        self.last_evidence_count = evidence_count;
    }

    /// Fold one observation's failure kind into the failure streak and the
    /// epistemic state. Any failure escalates the status to BLOCKED.
    pub fn observe_failure(
        &mut self,
        failure_type: Option<&str>,
        cmd: &str,
        epistemic: &mut EpistemicState,
    ) {
        match failure_type {
            Some(ft) => {
                if self.last_failure_type.as_deref() == Some(ft) {
                    self.last_failure_streak += 1;
                } else {
                    self.last_failure_type = Some(ft.to_string());
                    self.last_failure_streak = 1;
                }
                let detail = if cmd.is_empty() {
                    ft.to_string()
                } else {
                    let head: String = cmd.chars().take(200).collect();
                    format!("{ft}: {head}")
                };
                epistemic.add_blocked(&detail);
                epistemic.status = Status::Blocked;
            }
            None => {
                self.last_failure_type = None;
                self.last_failure_streak = 0;
            }
        }
    }

    /// Post-exec bookkeeping for an executed (non-blocked) call.
    pub fn after_exec(
        &mut self,
        dims: &CallDims,
        failure_type: Option<&str>,
        epistemic: &mut EpistemicState,
        evidence_count: usize,
    ) {
        if self.notes_required && dims.notes_mode == Some(NotesMode::Append) {
            self.notes_required = false;
        }

        if let Some(domain) = dims.domain.clone() {
            *self.domain_attempts.entry(domain.clone()).or_insert(0) += 1;
            // The first non-search domain a negative-claim task visits is
            // promoted into the official hint set.
            if self.negative_claim
                && !is_search_domain(&domain)
                && self.lens.official_hints.is_empty()
            {
                self.lens.official_hints.insert(domain.clone());
            }
            let is_official = self.lens.is_official(&domain)
                || matches!(
                    dims.source_class,
                    SourceClass::Official | SourceClass::Regulatory | SourceClass::Registry
                );
            if is_official {
                self.official_domains_checked.insert(domain.clone());
            } else if !is_search_domain(&domain) {
                self.independent_domains_checked.insert(domain.clone());
            }
            if self.last_domain_key.as_deref() == Some(domain.as_str()) {
                self.domain_same_streak += 1;
            } else {
                self.domain_same_streak = 1;
                self.force_domain_shift = false;
            }
            self.last_domain_key = Some(domain);
        }

        if let Some(qf) = dims.query_family.clone() {
            if !self.recent_query_families.iter().any(|q| *q == qf) {
                if self.recent_query_families.len() == self.cfg.query_mutation_budget.max(1) {
                    self.recent_query_families.pop_front();
                }
                self.recent_query_families.push_back(qf);
                self.force_query_mutation = false;
            }
        }

        if self.last_move_sig.as_deref() == Some(dims.move_sig.as_str())
            && self.last_move_type == Some(dims.move_type)
        {
            self.move_repeat_streak += 1;
        } else {
            self.move_repeat_streak = 0;
            self.force_move_change = false;
        }
        if let Some(domain) = dims.domain.clone() {
            self.move_ctx.last_domain = Some(domain);
        }
        if let Some(qf) = dims.query_family.clone() {
            self.move_ctx.last_query_family = Some(qf);
        }
        self.last_move_sig = Some(dims.move_sig.clone());
        self.last_move_type = Some(dims.move_type);

        if self.move_ctx.last_source_class == Some(dims.source_class) && failure_type.is_some() {
            self.source_class_failure_streak += 1;
        } else {
            self.source_class_failure_streak = 0;
        }
        if self.source_class_failure_streak >= self.cfg.failure_escalation_limit
            && failure_type.is_some()
        {
            self.force_source_shift = true;
            epistemic.add_constraint(&format!(
                "Source class stalled: {} failed {} times",
                dims.source_class.as_str(),
                self.source_class_failure_streak
            ));
        }
        if self.move_ctx.last_source_class != Some(dims.source_class) {
            self.force_source_shift = false;
        }
        self.move_ctx.last_source_class = Some(dims.source_class);

        if epistemic.status == Status::Unresolved
            && self.move_repeat_streak >= self.cfg.move_repeat_limit
        {
            self.force_move_change = true;
            epistemic.add_constraint(&format!(
                "Move stagnation: repeated {} {} times",
                dims.move_type.as_str(),
                self.move_repeat_streak
            ));
        }

        self.force_tool_next = false;
        self.stagnation_streak = 0;
        self.last_evidence_count = evidence_count;
    }

    /// Stagnation tracking on no-tool turns: UNRESOLVED turns that add no
    /// evidence accumulate; at the limit, `force_tool_next` is raised and a
    /// constraint recorded. Returns the streak when the flag fires.
    pub fn note_no_tool_turn(
        &mut self,
        epistemic: &mut EpistemicState,
        evidence_count: usize,
    ) -> Option<usize> {
        if epistemic.status == Status::Unresolved {
            if evidence_count == self.last_evidence_count {
                self.stagnation_streak += 1;
            } else {
                self.stagnation_streak = 0;
            }
        } else {
            self.stagnation_streak = 0;
        }
        if self.stagnation_streak >= self.cfg.stagnation_limit && !self.force_tool_next {
            self.force_tool_next = true;
            epistemic.add_constraint(&format!(
                "Stagnation: no new evidence for {} consecutive turns",
                self.stagnation_streak
            ));
            return Some(self.stagnation_streak);
        }
        None
    }

    /// Advisory messages prepended to the next turn for every raised flag.
    pub fn pre_turn_advisories(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.force_tool_next {
            let mut hint =
                "STAGNATION DETECTED: You must run a tool now to obtain new evidence.".to_string();
            if let Some(ft) = self.last_failure_type.as_deref() {
                hint.push_str(&format!(" Previous failures: {ft}. Try a different source/tool."));
                if self.last_failure_streak >= self.cfg.failure_escalation_limit {
                    hint.push_str(
                        " Escalate to a different acquisition path (alternate domain, API, or browser automation).",
                    );
                }
            }
            out.push(hint);
        }
        if self.force_query_mutation {
            out.push(
                "QUERY MUTATION REQUIRED: propose a materially different query before retrying. \
                 Use different keywords, synonyms, or a different formulation."
                    .to_string(),
            );
        }
        if self.force_move_change {
            out.push(
                "MOVE CHANGE REQUIRED: change your search move type (reformulate or domain shift). \
                 Avoid repeating the same move."
                    .to_string(),
            );
        }
        if self.force_source_shift {
            out.push(
                "SOURCE CLASS SHIFT REQUIRED: switch to a different source class \
                 (e.g., registry → primary literature → regulatory → commentary)."
                    .to_string(),
            );
        }
        if self.force_domain_shift {
            out.push(format!(
                "DOMAIN SHIFT REQUIRED: use a different domain than the last attempt. \
                 For negative-claim tasks, ensure at least {} official domains and \
                 {} independent domains are checked.",
                self.cfg.negative_claim_min_official, self.cfg.negative_claim_min_independent
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_args(cmd: &str) -> Value {
        json!({ "cmd": cmd })
    }

    fn engine(task: &str) -> (PolicyEngine, EpistemicState) {
        (PolicyEngine::new(&Config::default(), task), EpistemicState::default())
    }

    #[test]
    fn test_notes_overwrite_always_blocked() {
        let (mut policy, _) = engine("any task");
        let dims = policy.classify_call("shell", &shell_args("cat > /work/notes.md << EOF\nX\nEOF"));
        let block = policy.check("shell", &dims).unwrap();
        assert_eq!(block.error_type(), "notes_overwrite_blocked");
        assert!(block.error().contains("Overwriting notes.md is not allowed"));
        assert!(!block.records_move());
    }

    #[test]
    fn test_notes_gate_blocks_non_append() {
        let (mut policy, _) = engine("any task");
        policy.require_notes();
        let dims = policy.classify_call("shell", &shell_args("ls /work"));
        let block = policy.check("shell", &dims).unwrap();
        assert_eq!(block.error_type(), "notes_update_required");

        let dims = policy.classify_call("shell", &shell_args("echo done >> /work/notes.md"));
        assert!(policy.check("shell", &dims).is_none());
    }

    #[test]
    fn test_notes_gate_releases_on_executed_append() {
        let (mut policy, mut epistemic) = engine("any task");
        policy.require_notes();
        let dims = policy.classify_call("shell", &shell_args("echo x >> /work/notes.md"));
        policy.after_exec(&dims, None, &mut epistemic, 1);
        assert!(!policy.notes_required());
    }

    #[test]
    fn test_query_mutation_budget_scenario() {
        // Two identical searches: the second is blocked, a mutated third passes.
        let (mut policy, mut epistemic) = engine("find foo bar");
        let first = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://duckduckgo.com/?q=foo+bar'"),
        );
        assert!(policy.check("shell", &first).is_none());
        policy.after_exec(&first, None, &mut epistemic, 1);

        let second = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://duckduckgo.com/?q=foo+bar'"),
        );
        let block = policy.check("shell", &second).unwrap();
        assert_eq!(block.error_type(), "query_mutation_required");
        policy.after_blocked_call(&block, 2);
        assert!(policy.force_query_mutation);

        let third = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://duckduckgo.com/?q=baz'"),
        );
        assert!(policy.check("shell", &third).is_none());
        policy.after_exec(&third, None, &mut epistemic, 3);
        assert!(!policy.force_query_mutation);
    }

    #[test]
    fn test_query_mutation_window_full_allows_retry() {
        let (mut policy, mut epistemic) = engine("find things");
        for q in ["alpha", "beta"] {
            let dims = policy.classify_call(
                "shell",
                &shell_args(&format!("curl -sL 'https://duckduckgo.com/?q={q}'")),
            );
            assert!(policy.check("shell", &dims).is_none());
            policy.after_exec(&dims, None, &mut epistemic, 1);
        }
        // Window is full: retrying a seen family is no longer blocked.
        let dims = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://duckduckgo.com/?q=alpha'"),
        );
        assert!(policy.check("shell", &dims).is_none());
    }

    #[test]
    fn test_negative_claim_domain_shift_scenario() {
        let (mut policy, mut epistemic) = engine("Acme has not launched the widget");
        assert!(policy.negative_claim());

        // Distinct queries avoid the mutation gate; same domain throughout.
        for (i, q) in ["one", "two", "three"].iter().enumerate() {
            let dims = policy.classify_call(
                "shell",
                &shell_args(&format!("curl -sL 'https://acme.com/search/?q={q}'")),
            );
            if i < 2 {
                assert!(policy.check("shell", &dims).is_none(), "call {i} should pass");
                policy.after_exec(&dims, None, &mut epistemic, i + 1);
            } else {
                let block = policy.check("shell", &dims).unwrap();
                assert_eq!(block.error_type(), "domain_shift_required");
                policy.after_blocked_call(&block, i + 1);
            }
        }

        // A different domain passes and clears the forced shift.
        let dims = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://registry.example.org/?q=widget'"),
        );
        assert!(policy.check("shell", &dims).is_none());
        policy.after_exec(&dims, None, &mut epistemic, 4);
        assert!(!policy.force_domain_shift);
    }

    #[test]
    fn test_negative_claim_minima_tracking() {
        let (mut policy, mut epistemic) = engine("Acme has not launched the widget");
        let official = policy.classify_call("shell", &shell_args("curl -sL https://acme.com/news"));
        policy.after_exec(&official, None, &mut epistemic, 1);
        let regulator = policy.classify_call("shell", &shell_args("curl -sL https://ema.europa.eu/x"));
        policy.after_exec(&regulator, None, &mut epistemic, 2);
        let indie = policy.classify_call("shell", &shell_args("curl -sL https://techblog.example.net/a"));
        policy.after_exec(&indie, None, &mut epistemic, 3);

        assert!(policy.official_domains_checked() >= 2);
        assert!(policy.independent_domains_checked() >= 1);
        assert!(policy.negative_claim_minima_met());
    }

    #[test]
    fn test_stagnation_boundary() {
        let (mut policy, mut epistemic) = engine("task");
        epistemic.status = Status::Unresolved;
        assert!(policy.note_no_tool_turn(&mut epistemic, 0).is_none());
        assert!(policy.note_no_tool_turn(&mut epistemic, 0).is_none());
        // Exactly at the limit, the flag fires once.
        assert_eq!(policy.note_no_tool_turn(&mut epistemic, 0), Some(3));
        assert!(policy.force_tool_next);
        assert!(epistemic.constraints.iter().any(|c| c.contains("Stagnation")));

        // An executed tool call clears the flag.
        let dims = policy.classify_call("shell", &shell_args("ls"));
        policy.after_exec(&dims, None, &mut epistemic, 1);
        assert!(!policy.force_tool_next);
    }

    #[test]
    fn test_stagnation_resets_on_new_evidence() {
        let (mut policy, mut epistemic) = engine("task");
        epistemic.status = Status::Unresolved;
        policy.note_no_tool_turn(&mut epistemic, 0);
        policy.note_no_tool_turn(&mut epistemic, 5);
        assert_eq!(policy.stagnation_streak(), 0);
    }

    #[test]
    fn test_failure_streaks() {
        let (mut policy, mut epistemic) = engine("task");
        policy.observe_failure(Some("access_blocked"), "curl https://a.com", &mut epistemic);
        policy.observe_failure(Some("access_blocked"), "curl https://a.com", &mut epistemic);
        assert_eq!(policy.last_failure_streak(), 2);
        assert_eq!(policy.last_failure_type(), Some("access_blocked"));
        assert_eq!(epistemic.status, Status::Blocked);
        assert!(epistemic.blocked[0].starts_with("access_blocked: curl"));

        policy.observe_failure(None, "", &mut epistemic);
        assert_eq!(policy.last_failure_streak(), 0);
        assert!(policy.last_failure_type().is_none());
    }

    #[test]
    fn test_move_repeat_raises_force_move_change() {
        let (mut policy, mut epistemic) = engine("task");
        epistemic.status = Status::Unresolved;
        // Same non-search command over and over: identical move signature.
        for i in 0..5 {
            let dims = policy.classify_call("shell", &shell_args("ls /work"));
            assert!(policy.check("shell", &dims).is_none());
            policy.after_exec(&dims, None, &mut epistemic, i);
        }
        assert!(policy.force_move_change);
        assert!(epistemic.constraints.iter().any(|c| c.contains("Move stagnation")));
    }

    #[test]
    fn test_source_class_stall_raises_source_shift() {
        let (mut policy, mut epistemic) = engine("task");
        for (i, page) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let dims = policy.classify_call(
                "shell",
                &shell_args(&format!("curl -sL https://blog{i}.example.com/{page}")),
            );
            policy.after_exec(&dims, Some("access_blocked"), &mut epistemic, i);
        }
        assert!(policy.force_source_shift);
        assert!(epistemic.constraints.iter().any(|c| c.contains("Source class stalled")));
    }

    #[test]
    fn test_advisories_cover_raised_flags() {
        let (mut policy, _) = engine("task");
        policy.force_tool_next = true;
        policy.force_query_mutation = true;
        policy.force_move_change = true;
        policy.force_source_shift = true;
        policy.force_domain_shift = true;
        let advisories = policy.pre_turn_advisories();
        assert_eq!(advisories.len(), 5);
        assert!(advisories[0].starts_with("STAGNATION DETECTED"));
        assert!(advisories[1].starts_with("QUERY MUTATION REQUIRED"));
        assert!(advisories[2].starts_with("MOVE CHANGE REQUIRED"));
        assert!(advisories[3].starts_with("SOURCE CLASS SHIFT REQUIRED"));
        assert!(advisories[4].starts_with("DOMAIN SHIFT REQUIRED"));
    }

    #[test]
    fn test_classify_call_dims() {
        let (policy, _) = engine("task");
        let dims = policy.classify_call(
            "shell",
            &shell_args("curl -sL 'https://www.duckduckgo.com/?q=the+foo+bar'"),
        );
        assert_eq!(dims.domain.as_deref(), Some("duckduckgo.com"));
        assert_eq!(dims.query_family.as_deref(), Some("bar foo"));
        assert_eq!(dims.move_type, MoveType::Initial);
        assert_eq!(dims.move_sig, "initial:duckduckgo.com:bar foo");

        let dims = policy.classify_call("shell", &shell_args("ls /work"));
        assert_eq!(dims.move_type, MoveType::NonSearch);
        assert!(dims.domain.is_none());
    }
}
