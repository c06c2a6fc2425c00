use std::str::FromStr;

/// Docker image the sandbox containers run.
pub const IMAGE_NAME: &str = "vera/sandbox-agent:0.4";
pub const CONTAINER_NAME_PREFIX: &str = "vera-sandbox-";

/// Command patterns refused before they ever reach the sandbox.
pub const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-rf\b",
    r"\bdd\b",
    r"\bmkfs\b",
    r"\bmount\b",
    r"\bsudo\b",
    r"\bchown\b",
    r"\bchmod\b\s+777",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",
];

/// Hard per-exec timeout enforced inside the container.
pub const MAX_TOOL_SECONDS: u64 = 900;

/// Per-task virtualenv location inside the sandbox.
pub const VENV_DIR: &str = "/work/.venv";

// Trace/model-io compaction limits.
pub const MAX_MODEL_IO_MESSAGES: usize = 12;
pub const MAX_MODEL_IO_CHARS: usize = 4_000;
pub const MAX_MODEL_IO_RESPONSE_CHARS: usize = 12_000;
pub const MAX_MODEL_NOTE_CHARS: usize = 6_000;

/// Observations fed back to the model are clipped to this many chars.
pub const OBSERVATION_CLIP_CHARS: usize = 12_000;
/// Evidence records clip tool output to this many chars.
pub const EVIDENCE_OUTPUT_CLIP_CHARS: usize = 2_000;
/// At most this many URLs are attached to one evidence record.
pub const EVIDENCE_MAX_URLS: usize = 20;

pub const MAX_VERIFIER_ROUNDS: usize = 8;
pub const VERIFIER_CHECK_STEPS: usize = 4;
pub const PARSE_ERROR_LIMIT: usize = 5;
pub const LENGTH_NUDGE_LIMIT: usize = 4;
/// The verifier is not invokable until the agent has made this many tool calls.
pub const PRE_TOOL_MIN_CALLS: usize = 3;
pub const FINALIZATION_STOP_HITS: usize = 3;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Immutable snapshot of every tunable. Read from the environment exactly
/// once at startup; nothing re-reads env mid-task, so tests can construct
/// a `Config` literal and rely on it staying fixed.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_base_url: String,
    pub model_name: String,
    pub model_timeout_s: u64,
    pub context_max_chars: usize,
    pub action_tail_messages: usize,
    pub notes_update_interval: usize,
    pub stagnation_limit: usize,
    pub failure_escalation_limit: usize,
    pub query_mutation_budget: usize,
    pub move_repeat_limit: usize,
    pub domain_shift_limit: usize,
    pub negative_claim_min_official: usize,
    pub negative_claim_min_independent: usize,
    pub negative_claim_threshold_pct: f64,
    pub negative_claim_max_steps: usize,
    pub max_steps: usize,
    pub prompt_profile: Option<String>,
    pub system_role: String,
}

impl Config {
    pub fn from_env() -> Self {
        let profile = env_string("PROMPT_PROFILE", "");
        Self {
            model_base_url: env_string("MODEL_BASE_URL", "http://127.0.0.1:1234"),
            model_name: env_string("MODEL_NAME", ""),
            model_timeout_s: env_or("MODEL_TIMEOUT", 150),
            context_max_chars: env_or("CONTEXT_MAX_CHARS", 20_000),
            action_tail_messages: env_or("ACTION_TAIL_MESSAGES", 10),
            notes_update_interval: env_or("NOTES_UPDATE_INTERVAL", 3),
            stagnation_limit: env_or("STAGNATION_LIMIT", 3),
            failure_escalation_limit: env_or("FAILURE_ESCALATION_LIMIT", 3),
            query_mutation_budget: env_or("QUERY_MUTATION_BUDGET", 2),
            move_repeat_limit: env_or("MOVE_REPEAT_LIMIT", 3),
            domain_shift_limit: env_or("DOMAIN_SHIFT_LIMIT", 2),
            negative_claim_min_official: env_or("NEGATIVE_CLAIM_MIN_OFFICIAL", 2),
            negative_claim_min_independent: env_or("NEGATIVE_CLAIM_MIN_INDEPENDENT", 1),
            negative_claim_threshold_pct: env_or("NEGATIVE_CLAIM_THRESHOLD_PCT", 0.6),
            negative_claim_max_steps: env_or("NEGATIVE_CLAIM_MAX_STEPS", 40),
            max_steps: env_or("MAX_STEPS", 120),
            prompt_profile: if profile.is_empty() { None } else { Some(profile) },
            system_role: env_string("SYSTEM_ROLE", "system"),
        }
    }

    /// Step count after which a negative-claim task may conclude UNRESOLVED,
    /// provided the source-diversity minima are met.
    pub fn negative_claim_budget_steps(&self) -> usize {
        if self.max_steps > 0 {
            ((self.max_steps as f64 * self.negative_claim_threshold_pct) as usize).max(1)
        } else {
            self.negative_claim_max_steps.max(1)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_base_url: "http://127.0.0.1:1234".to_string(),
            model_name: String::new(),
            model_timeout_s: 150,
            context_max_chars: 20_000,
            action_tail_messages: 10,
            notes_update_interval: 3,
            stagnation_limit: 3,
            failure_escalation_limit: 3,
            query_mutation_budget: 2,
            move_repeat_limit: 3,
            domain_shift_limit: 2,
            negative_claim_min_official: 2,
            negative_claim_min_independent: 1,
            negative_claim_threshold_pct: 0.6,
            negative_claim_max_steps: 40,
            max_steps: 120,
            prompt_profile: None,
            system_role: "system".to_string(),
        }
    }
}

/// Clip text to `max_chars`, appending a truncation banner when cut.
pub fn clip_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    let dropped = text.chars().count() - max_chars;
    format!("{clipped}...[truncated {dropped} chars]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.context_max_chars, 20_000);
        assert_eq!(cfg.stagnation_limit, 3);
        assert_eq!(cfg.query_mutation_budget, 2);
        assert_eq!(cfg.system_role, "system");
        assert!(cfg.prompt_profile.is_none());
    }

    #[test]
    fn test_negative_claim_budget_from_max_steps() {
        let cfg = Config { max_steps: 100, ..Config::default() };
        assert_eq!(cfg.negative_claim_budget_steps(), 60);
    }

    #[test]
    fn test_negative_claim_budget_unlimited_steps() {
        let cfg = Config { max_steps: 0, ..Config::default() };
        assert_eq!(cfg.negative_claim_budget_steps(), 40);
    }

    #[test]
    fn test_clip_text() {
        assert_eq!(clip_text("short", 10), "short");
        let clipped = clip_text(&"x".repeat(20), 10);
        assert!(clipped.starts_with("xxxxxxxxxx..."));
        assert!(clipped.contains("truncated 10 chars"));
    }
}
