use serde::{Deserialize, Serialize};

/// The loop's self-assessment of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    InProgress,
    Blocked,
    Unresolved,
    Verified,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::InProgress => "IN_PROGRESS",
            Status::Blocked => "BLOCKED",
            Status::Unresolved => "UNRESOLVED",
            Status::Verified => "VERIFIED",
        };
        f.write_str(s)
    }
}

/// Epistemic state carried across turns: the status plus three deduplicated,
/// insertion-ordered lists of open conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpistemicState {
    pub status: Status,
    pub constraints: Vec<String>,
    pub blocked: Vec<String>,
    pub unresolved: Vec<String>,
}

impl Default for EpistemicState {
    fn default() -> Self {
        Self {
            status: Status::InProgress,
            constraints: Vec::new(),
            blocked: Vec::new(),
            unresolved: Vec::new(),
        }
    }
}

fn push_unique(list: &mut Vec<String>, text: &str) {
    if text.is_empty() {
        return;
    }
    if !list.iter().any(|x| x == text) {
        list.push(text.to_string());
    }
}

impl EpistemicState {
    pub fn add_constraint(&mut self, text: &str) {
        push_unique(&mut self.constraints, text);
    }

    pub fn add_blocked(&mut self, text: &str) {
        push_unique(&mut self.blocked, text);
    }

    pub fn add_unresolved(&mut self, text: &str) {
        push_unique(&mut self.unresolved, text);
    }

    /// VERIFIED is terminal within a task; the open lists are cleared.
    pub fn set_verified(&mut self) {
        self.status = Status::Verified;
        self.constraints.clear();
        self.blocked.clear();
        self.unresolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(Status::Unresolved.to_string(), "UNRESOLVED");
    }

    #[test]
    fn test_add_deduplicates() {
        let mut st = EpistemicState::default();
        st.add_constraint("need two sources");
        st.add_constraint("need two sources");
        st.add_constraint("");
        assert_eq!(st.constraints.len(), 1);
    }

    #[test]
    fn test_set_verified_clears_lists() {
        let mut st = EpistemicState::default();
        st.add_constraint("c");
        st.add_blocked("b");
        st.add_unresolved("u");
        st.status = Status::Blocked;
        st.set_verified();
        assert_eq!(st.status, Status::Verified);
        assert!(st.constraints.is_empty());
        assert!(st.blocked.is_empty());
        assert!(st.unresolved.is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut st = EpistemicState::default();
        st.status = Status::Unresolved;
        st.add_unresolved("verification_budget_exhausted");
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"UNRESOLVED\""));
        let back: EpistemicState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, Status::Unresolved);
        assert_eq!(back.unresolved, st.unresolved);
    }
}
