//! The agent's single tool: a shell command runner with a simulated
//! persistent session. Leading `cd` and `export KEY=VAL` segments are kept
//! across calls, and every command is re-wrapped with the session prologue
//! (cwd, venv PATH, cache dirs) before execution.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::sandbox::{Sandbox, SandboxBackend};
use vera_core::config::{DENY_PATTERNS, MAX_TOOL_SECONDS, VENV_DIR};

/// Result of one tool invocation, fed back to the model verbatim. Policy
/// blocks synthesize this same shape without touching the sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Observation {
    pub fn blocked(error: &str, error_type: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            error_type: Some(error_type.to_string()),
            ..Self::default()
        }
    }
}

/// POSIX single-quote, safe for embedding in `bash -lc`.
pub fn shlex_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// `posixpath.normpath` equivalent: resolve `.` and `..` lexically.
fn normalize_posix(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

pub struct ShellSession {
    backend: Arc<dyn SandboxBackend>,
    sandbox: Sandbox,
    cwd: String,
    env: BTreeMap<String, String>,
}

impl ShellSession {
    pub fn new(backend: Arc<dyn SandboxBackend>, sandbox: Sandbox) -> Self {
        Self {
            backend,
            sandbox,
            cwd: "/work".to_string(),
            env: BTreeMap::new(),
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    fn deny_check(&self, cmdline: &str) -> Option<String> {
        for pat in DENY_PATTERNS {
            let re = Regex::new(pat).expect("deny pattern");
            if re.is_match(cmdline) {
                return Some(format!("Denied command pattern matched: {pat}"));
            }
        }
        None
    }

    fn normalize_cwd(&self, new_cwd: &str) -> Result<String, String> {
        let new_cwd = new_cwd.trim();
        if new_cwd.is_empty() {
            return Ok(self.cwd.clone());
        }
        let resolved = if new_cwd.starts_with('/') {
            normalize_posix(new_cwd)
        } else {
            normalize_posix(&format!("{}/{}", self.cwd, new_cwd))
        };
        let allowed = resolved == "/work"
            || resolved.starts_with("/work/")
            || resolved == "/input"
            || resolved.starts_with("/input/");
        if !allowed {
            return Err("Denied cwd outside /work or /input".to_string());
        }
        Ok(resolved)
    }

    /// Persist leading `cd …` / `export K=V` segments (chained with `&&` or
    /// `;`) into the session. Parsing stops at the first other segment.
    fn update_persistent_state(&mut self, cmdline: &str) -> Result<(), String> {
        let cmdline = cmdline.trim();
        if cmdline.is_empty() {
            return Ok(());
        }
        let split = Regex::new(r"\s*(?:&&|;)\s*").expect("split regex");
        let cd_re = Regex::new(r"^cd\s+(.+)$").expect("cd regex");
        let export_re = Regex::new(r"^export\s+(.+)$").expect("export regex");
        let key_re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("key regex");

        for part in split.split(cmdline) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(m) = cd_re.captures(part) {
                let mut target = m[1].trim().to_string();
                let quoted = (target.starts_with('"') && target.ends_with('"'))
                    || (target.starts_with('\'') && target.ends_with('\''));
                if quoted && target.len() >= 2 {
                    target = target[1..target.len() - 1].to_string();
                }
                self.cwd = self.normalize_cwd(&target)?;
                continue;
            }
            if let Some(m) = export_re.captures(part) {
                for tok in m[1].split_whitespace() {
                    let Some((k, v)) = tok.split_once('=') else {
                        continue;
                    };
                    if !key_re.is_match(k) {
                        continue;
                    }
                    let v = v.trim_matches(|c| c == '"' || c == '\'');
                    self.env.insert(k.to_string(), v.to_string());
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    /// The session prologue re-applied before every command. The venv is
    /// always first on PATH so `pip install …` works without root.
    fn wrap_cmd(&self, cmdline: &str) -> String {
        let exports: String = self
            .env
            .iter()
            .map(|(k, v)| format!("export {k}={}; ", shlex_quote(v)))
            .collect();
        format!(
            "cd {}; export VIRTUAL_ENV={}; export PATH={}:$PATH; \
             export XDG_CACHE_HOME=/work/.cache; export PIP_CACHE_DIR=/work/.cache/pip; \
             export NPM_CONFIG_CACHE=/work/.cache/npm; \
             export PLAYWRIGHT_BROWSERS_PATH=/work/.cache/ms-playwright; {exports}{cmdline}",
            shlex_quote(&self.cwd),
            shlex_quote(VENV_DIR),
            shlex_quote(&format!("{VENV_DIR}/bin")),
        )
    }

    pub async fn shell(&mut self, cmd: &str) -> Observation {
        let cmd = cmd.trim();
        if let Some(denied) = self.deny_check(cmd) {
            return Observation::blocked(&denied, "denied_command");
        }
        if let Err(denied) = self.update_persistent_state(cmd) {
            return Observation::blocked(&denied, "denied_command");
        }

        let wrapped = self.wrap_cmd(cmd);
        let argv = vec!["bash".to_string(), "-lc".to_string(), wrapped];
        match self.backend.exec(&self.sandbox, &argv, MAX_TOOL_SECONDS).await {
            Ok(out) => {
                let tail: String = if out.output.chars().count() > 12_000 {
                    let chars: Vec<char> = out.output.chars().collect();
                    chars[chars.len() - 12_000..].iter().collect()
                } else {
                    out.output
                };
                Observation {
                    exit_code: Some(out.exit_code as i64),
                    output: Some(tail),
                    cwd: Some(self.cwd.clone()),
                    ..Observation::default()
                }
            }
            Err(e) => Observation::blocked(&e.to_string(), "exec_error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ByteStream, ExecOutput};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Backend that records the wrapped command and echoes a canned reply.
    struct MockBackend {
        seen: Mutex<Vec<String>>,
        reply: String,
        exit_code: i32,
    }

    impl MockBackend {
        fn new(reply: &str, exit_code: i32) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                reply: reply.to_string(),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for MockBackend {
        async fn start(&self, _i: Option<&Path>, _w: &Path, _n: bool) -> Result<Sandbox> {
            unimplemented!()
        }
        async fn exec(&self, _s: &Sandbox, argv: &[String], _t: u64) -> Result<ExecOutput> {
            self.seen.lock().unwrap().push(argv.last().cloned().unwrap_or_default());
            Ok(ExecOutput {
                exit_code: self.exit_code,
                output: self.reply.clone(),
            })
        }
        async fn logs_stream(&self, _s: &Sandbox) -> Result<ByteStream> {
            unimplemented!()
        }
        async fn events_stream(&self, _s: &Sandbox) -> Result<ByteStream> {
            unimplemented!()
        }
        async fn stop(&self, _s: &Sandbox) -> Result<()> {
            Ok(())
        }
    }

    fn test_sandbox() -> Sandbox {
        Sandbox {
            container_id: "cid".into(),
            name: "n".into(),
            mem_limit: None,
            nano_cpus: None,
            pids_limit: None,
            privileged: true,
            network_mode: "bridge".into(),
        }
    }

    #[test]
    fn test_shlex_quote() {
        assert_eq!(shlex_quote("plain"), "'plain'");
        assert_eq!(shlex_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_normalize_posix() {
        assert_eq!(normalize_posix("/work/../etc"), "/etc");
        assert_eq!(normalize_posix("/work/./sub//x"), "/work/sub/x");
        assert_eq!(normalize_posix("a/b/.."), "a");
    }

    #[tokio::test]
    async fn test_deny_pattern_blocks_before_exec() {
        let backend = Arc::new(MockBackend::new("never", 0));
        let mut session = ShellSession::new(backend.clone(), test_sandbox());
        let obs = session.shell("sudo cat /etc/shadow").await;
        assert_eq!(obs.error_type.as_deref(), Some("denied_command"));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cd_persists_across_calls() {
        let backend = Arc::new(MockBackend::new("ok", 0));
        let mut session = ShellSession::new(backend.clone(), test_sandbox());
        session.shell("cd /work/data && ls").await;
        assert_eq!(session.cwd(), "/work/data");
        session.shell("pwd").await;
        let seen = backend.seen.lock().unwrap();
        assert!(seen[1].contains("cd '/work/data';"));
    }

    #[tokio::test]
    async fn test_cd_outside_work_is_denied() {
        let backend = Arc::new(MockBackend::new("ok", 0));
        let mut session = ShellSession::new(backend.clone(), test_sandbox());
        let obs = session.shell("cd /etc && ls").await;
        assert_eq!(obs.error_type.as_deref(), Some("denied_command"));
        assert_eq!(session.cwd(), "/work");
    }

    #[tokio::test]
    async fn test_export_persists_and_wraps() {
        let backend = Arc::new(MockBackend::new("ok", 0));
        let mut session = ShellSession::new(backend.clone(), test_sandbox());
        session.shell("export FOO=bar && echo $FOO").await;
        session.shell("env").await;
        let seen = backend.seen.lock().unwrap();
        assert!(seen[1].contains("export FOO='bar';"));
    }

    #[tokio::test]
    async fn test_venv_path_in_prologue() {
        let backend = Arc::new(MockBackend::new("ok", 0));
        let mut session = ShellSession::new(backend.clone(), test_sandbox());
        session.shell("python3 --version").await;
        let seen = backend.seen.lock().unwrap();
        assert!(seen[0].contains("/work/.venv/bin"));
        assert!(seen[0].contains("cd '/work';"));
    }

    #[tokio::test]
    async fn test_observation_carries_exit_and_output() {
        let backend = Arc::new(MockBackend::new("hello\n", 2));
        let mut session = ShellSession::new(backend, test_sandbox());
        let obs = session.shell("false").await;
        assert_eq!(obs.exit_code, Some(2));
        assert_eq!(obs.output.as_deref(), Some("hello\n"));
        assert_eq!(obs.cwd.as_deref(), Some("/work"));
    }
}
