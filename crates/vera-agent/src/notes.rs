//! `notes.md` handling. The file is reset once at task start and append-only
//! afterwards; the loop rejects any command that would overwrite it before
//! the sandbox ever sees the command. Runtime-initiated writes go through
//! the shell too, so the shell-only interaction surface stays honest.

use base64::Engine;
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::shell::ShellSession;
use crate::trace::TraceWriter;

/// How a shell command touches notes.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotesMode {
    Append,
    Overwrite,
}

/// Classify a command's effect on notes.md from the command string alone.
/// Returns `None` for read-only access (or commands that never mention it).
pub fn notes_write_mode(cmd: &str) -> Option<NotesMode> {
    if !cmd.contains("notes.md") {
        return None;
    }
    let c = cmd.to_lowercase();

    let append_redirect = Regex::new(r">>\s*[^\n]*notes\.md").expect("append regex");
    let tee_append = Regex::new(r"\btee\b[^\n]*\s(-a|--append)\b[^\n]*notes\.md").expect("tee -a regex");
    if append_redirect.is_match(&c) || tee_append.is_match(&c) || c.contains("notes_append") {
        return Some(NotesMode::Append);
    }

    let overwrite_redirect = Regex::new(r"(^|[^>])>\s*[^\n]*notes\.md").expect("redirect regex");
    let cat_overwrite = Regex::new(r"\bcat\b\s+>[^\n]*notes\.md").expect("cat regex");
    let tee_overwrite = Regex::new(r"\btee\b[^\n]*notes\.md").expect("tee regex");
    let destructive = Regex::new(r"\b(truncate|rm|mv|cp)\b[^\n]*notes\.md").expect("destructive regex");
    if overwrite_redirect.is_match(&c)
        || cat_overwrite.is_match(&c)
        || tee_overwrite.is_match(&c)
        || destructive.is_match(&c)
        || c.contains("write_text")
        || c.contains("write(")
        || c.contains("notes_reset")
    {
        return Some(NotesMode::Overwrite);
    }
    None
}

/// Run a runtime-initiated shell command (not model-initiated), traced with
/// `scope: "runtime"` for full observability.
pub async fn runtime_shell(shell: &mut ShellSession, trace: &TraceWriter, cmd: &str) {
    let obs = shell.shell(cmd).await;
    trace.event(json!({
        "type": "tool",
        "scope": "runtime",
        "step": 0,
        "tool": "shell",
        "args": {"cmd": cmd},
        "obs": obs,
    }));
}

pub struct NotesWriter {
    host_path: PathBuf,
}

impl NotesWriter {
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        Self { host_path: host_path.into() }
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Notes content as seen from the host side of the /work mount.
    pub fn read(&self) -> String {
        std::fs::read_to_string(&self.host_path).unwrap_or_default()
    }

    fn py_write_script(text: &str, append: bool) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        let write_stmt = if append {
            "with p.open('a', encoding='utf-8', errors='replace') as f:\n    f.write(data)\n"
        } else {
            "p.write_text(data, encoding='utf-8', errors='replace')\n"
        };
        format!(
            "python3 - <<'PY'\n\
             import base64\n\
             from pathlib import Path\n\
             data = base64.b64decode('{b64}').decode('utf-8', errors='replace')\n\
             p = Path('/work/notes.md')\n\
             p.parent.mkdir(parents=True, exist_ok=True)\n\
             {write_stmt}\
             print('OK')\n\
             PY"
        )
    }

    /// Full rewrite — used exactly once, at task start.
    pub async fn reset(&self, shell: &mut ShellSession, trace: &TraceWriter, text: &str) {
        runtime_shell(shell, trace, &Self::py_write_script(text, false)).await;
    }

    pub async fn append(&self, shell: &mut ShellSession, trace: &TraceWriter, text: &str) {
        runtime_shell(shell, trace, &Self::py_write_script(text, true)).await;
    }
}
