//! System prompt loading. A profile named `foo` resolves to
//! `assets/system_prompt.foo.txt` under the current directory when present;
//! otherwise the embedded English default is used.

const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../assets/system_prompt.en.txt");

pub fn load_system_prompt(profile: Option<&str>) -> String {
    if let Some(profile) = profile.filter(|p| !p.is_empty()) {
        let candidate = std::path::Path::new("assets").join(format!("system_prompt.{profile}.txt"));
        if let Ok(text) = std::fs::read_to_string(&candidate) {
            return text;
        }
        tracing::debug!("Prompt profile '{profile}' not found, using default");
    }
    DEFAULT_SYSTEM_PROMPT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompt_loads() {
        let prompt = load_system_prompt(None);
        assert!(prompt.contains("shell"));
        assert!(prompt.contains("STATUS_UPDATE"));
        assert!(prompt.contains("EVIDENCE_USED"));
        assert!(prompt.contains("notes.md"));
    }

    #[test]
    fn test_missing_profile_falls_back() {
        assert_eq!(load_system_prompt(Some("definitely-missing")), DEFAULT_SYSTEM_PROMPT);
    }
}
