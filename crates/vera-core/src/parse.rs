//! Lenient tool-call extraction from free-form model output.
//!
//! Models emit tool calls in a zoo of shapes: the canonical
//! `{"tool":"shell","args":{"cmd":"..."}}`, action objects, nested command
//! objects, tokenizer-mangled JSON with SentencePiece artifacts, fenced
//! blocks, and raw newlines inside strings. Everything recognizable is
//! normalized into a `ToolCall`; everything else is left for the
//! THOUGHT/ACTION parser to report as a format error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A normalized tool invocation. `args` is always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

impl ToolCall {
    pub fn shell(cmd: impl Into<String>) -> Self {
        let cmd: String = cmd.into();
        Self {
            tool: "shell".to_string(),
            args: json!({ "cmd": cmd }),
        }
    }

    /// The shell command, when this is a shell call.
    pub fn cmd(&self) -> Option<&str> {
        if self.tool != "shell" {
            return None;
        }
        self.args.get("cmd").and_then(|v| v.as_str())
    }
}

/// Result of the THOUGHT/ACTION parse of a full response.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub thought: String,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub error: Option<String>,
}

impl AgentOutput {
    fn error(msg: &str) -> Self {
        Self {
            thought: String::new(),
            tool_name: None,
            tool_args: None,
            error: Some(msg.to_string()),
        }
    }
}

// ── Lenient JSON loading ──

/// Parse JSON, tolerating raw newlines inside quoted strings.
fn lenient_json_loads(blob: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(blob) {
        return Some(v);
    }
    let mut out = String::with_capacity(blob.len() + 16);
    let mut in_str = false;
    let mut esc = false;
    for ch in blob.chars() {
        if in_str {
            if esc {
                esc = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    esc = true;
                    out.push(ch);
                }
                '"' => {
                    in_str = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_str = true;
            }
            out.push(ch);
        }
    }
    serde_json::from_str(&out).ok()
}

/// Find a JSON object or array anywhere in the text: fenced blocks first,
/// then whole lines, then the first brace-to-last-brace span.
fn extract_json_block(text: &str) -> Option<Value> {
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\}|\[.*?\])\s*```").expect("fence regex");
    for cap in fence.captures_iter(text) {
        if let Some(v) = lenient_json_loads(cap[1].trim()) {
            return Some(v);
        }
    }
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bracketed = (line.starts_with('{') && line.ends_with('}'))
            || (line.starts_with('[') && line.ends_with(']'));
        if bracketed {
            if let Some(v) = lenient_json_loads(line) {
                return Some(v);
            }
        }
    }
    let block = Regex::new(r"(?s)(\{.*\}|\[.*\])").expect("block regex");
    let m = block.captures(text)?;
    lenient_json_loads(m[1].trim())
}

/// Strict variant used for structured sub-agent replies: whole JSON lines
/// first, then the first JSON-ish span.
pub fn extract_first_json(text: &str) -> Option<Value> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bracketed = (line.starts_with('{') && line.ends_with('}'))
            || (line.starts_with('[') && line.ends_with(']'));
        if bracketed {
            if let Ok(v) = serde_json::from_str(line) {
                return Some(v);
            }
        }
    }
    let block = Regex::new(r"(?s)(\{.*\}|\[.*\])").expect("block regex");
    let m = block.captures(text)?;
    serde_json::from_str(m[1].trim()).ok()
}

// ── Token-artifact cleanup ──

fn strip_ws_outside_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut esc = false;
    for ch in s.chars() {
        if in_str {
            out.push(ch);
            if esc {
                esc = false;
            } else if ch == '\\' {
                esc = true;
            } else if ch == '"' {
                in_str = false;
            }
        } else if ch == '"' {
            in_str = true;
            out.push(ch);
        } else if !ch.is_whitespace() {
            out.push(ch);
        }
    }
    out
}

/// Strip whitespace out of every object key, recursively.
fn strip_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let nk: String = k.chars().filter(|c| !c.is_whitespace()).collect();
                out.insert(nk, strip_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_keys).collect()),
        other => other.clone(),
    }
}

fn despace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn quote_if_needed(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().any(|c| c.is_whitespace()) {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}

/// Repair a command line shredded by tokenization: collapse whitespace,
/// rejoin split flags ("- la" -> "-la") and path chunks ("/ work /" ->
/// "/work/"), preserving pipe/chain separators.
fn normalize_command_str(s: &str) -> String {
    let mut s = s.replace(['\t', '\n'], " ");
    let ws = Regex::new(r"\s+").expect("ws regex");
    s = ws.replace_all(&s, " ").trim().to_string();
    let flag = Regex::new(r"(^|\s)-\s+([A-Za-z])").expect("flag regex");
    s = flag.replace_all(&s, "$1-$2").to_string();

    let separators = ["|", "&&", ";", "||"];
    let mut out: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for tok in s.split(' ') {
        if separators.contains(&tok) {
            if let Some(cur) = current.take() {
                out.push(cur);
            }
            out.push(tok.to_string());
            continue;
        }
        if let Some(cur) = current.as_mut() {
            cur.push_str(tok);
            continue;
        }
        if tok == "/" || tok.starts_with('/') || tok.ends_with('/') {
            current = Some(tok.to_string());
            continue;
        }
        out.push(tok.to_string());
    }
    if let Some(cur) = current {
        out.push(cur);
    }
    let joined = out.join(" ");
    ws.replace_all(&joined, " ").trim().to_string()
}

/// Rejoin URL and `-o` target fragments that tokenization split apart.
fn reconstruct_curl_cmd(cmdline: &str) -> String {
    let mut tokens: Vec<String> = cmdline.split_whitespace().map(|t| t.to_string()).collect();
    if tokens.is_empty() {
        return cmdline.to_string();
    }
    let is_flag = |tok: &str| tok.starts_with('-') && tok.len() > 1;

    if let Some(url_idx) = tokens.iter().position(|t| t.starts_with("http")) {
        let mut j = url_idx + 1;
        while j < tokens.len() && !is_flag(&tokens[j]) {
            j += 1;
        }
        let url: String = tokens[url_idx..j].concat();
        tokens.splice(url_idx..j, [url]);
    }

    if let Some(o_idx) = tokens.iter().position(|t| t == "-o" || t == "--output") {
        if o_idx + 1 < tokens.len() {
            let mut j = o_idx + 1;
            while j < tokens.len() && !is_flag(&tokens[j]) {
                j += 1;
            }
            let path: String = tokens[o_idx + 1..j].concat();
            tokens.splice(o_idx + 1..j, [path]);
        }
    }
    tokens.join(" ")
}

/// Undo SentencePiece artifacts ("▁", "<0x0A>") and tokenized escapes.
fn clean_tokenized(s: &str) -> String {
    let s = s.replace("<0x0A>", "\n").replace('▁', " ");
    let cleaned = strip_ws_outside_strings(&s);
    let esc = Regex::new(r#"\\\s+([A-Za-z0-9"'\\])"#).expect("esc regex");
    esc.replace_all(&cleaned, "\\$1").to_string()
}

// ── Shape normalization ──

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(s) = obj.get(*key).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return Some(s);
            }
        }
    }
    None
}

fn shell_call_from_args(args: &Map<String, Value>) -> ToolCall {
    let mut args = args.clone();
    if !args.contains_key("cmd") {
        if let Some(cmd) = args.remove("command") {
            args.insert("cmd".to_string(), cmd);
        }
    }
    ToolCall {
        tool: "shell".to_string(),
        args: Value::Object(args),
    }
}

fn curl_from_params(tool_name: &str, params: &Map<String, Value>) -> Option<ToolCall> {
    let url = str_field(params, &["url", "href", "link"])?;
    let url = despace(url);
    if let Some(out_path) = str_field(params, &["output", "out"]) {
        let out_path = despace(out_path);
        return Some(ToolCall::shell(format!(
            "{tool_name} -sL {} -o {}",
            quote_if_needed(&url),
            quote_if_needed(&out_path)
        )));
    }
    Some(ToolCall::shell(format!("{tool_name} -sL {}", quote_if_needed(&url))))
}

fn params_fallback(tool_name: &str, params: &Map<String, Value>) -> Option<ToolCall> {
    if let Some(cmdline) = str_field(params, &["command", "cmd"]) {
        return Some(ToolCall::shell(normalize_command_str(cmdline)));
    }
    if let Some(path) = str_field(params, &["file_path", "filepath", "path", "file"]) {
        let path = despace(path);
        return Some(ToolCall::shell(format!("{tool_name} {}", quote_if_needed(&path))));
    }
    None
}

const DIRECT_TOOLS: &[&str] = &[
    "which", "ls", "cat", "head", "tail", "grep", "rg", "sed", "awk", "jq", "python", "python3",
];

fn normalize_command_obj(cmd_obj: &Value) -> Option<ToolCall> {
    let cmd_obj = strip_keys(cmd_obj);
    let obj = cmd_obj.as_object()?;
    let tool_name = despace(str_field(obj, &["tool", "name"]).unwrap_or("")).to_lowercase();
    let params = obj
        .get("parameters")
        .or_else(|| obj.get("args"))
        .map(strip_keys)
        .unwrap_or_else(|| json!({}));
    let params = params.as_object().cloned().unwrap_or_default();
    let param = str_field(obj, &["parameter"]);
    let direct = str_field(obj, &["command", "cmd"]);

    if ["sh", "bash", "shell"].contains(&tool_name.as_str()) {
        if let Some(cmdline) = str_field(&params, &["command", "cmd"]) {
            return Some(ToolCall::shell(normalize_command_str(cmdline)));
        }
        if let Some(cmdline) = direct {
            return Some(ToolCall::shell(normalize_command_str(cmdline)));
        }
    }
    if ["curl", "wget"].contains(&tool_name.as_str()) {
        if let Some(cmdline) = str_field(&params, &["command", "cmd"]) {
            let cmdline = normalize_command_str(cmdline);
            return Some(ToolCall::shell(reconstruct_curl_cmd(&cmdline)));
        }
        if let Some(call) = curl_from_params(&tool_name, &params) {
            return Some(call);
        }
        if let Some(p) = param {
            let url = despace(p);
            return Some(ToolCall::shell(format!("{tool_name} -sL {}", quote_if_needed(&url))));
        }
    }
    if DIRECT_TOOLS.contains(&tool_name.as_str()) {
        if let Some(cmdline) = direct {
            return Some(ToolCall::shell(normalize_command_str(cmdline)));
        }
        if let Some(p) = param {
            return Some(ToolCall::shell(format!("{tool_name} {}", normalize_command_str(p))));
        }
    }
    params_fallback(&tool_name, &params)
}

/// Normalize any recognized object shape into a `ToolCall`.
fn normalize(value: &Value) -> Option<ToolCall> {
    let value = strip_keys(value);
    let obj = value.as_object()?;

    // {"action":"run"|"shell","command":"..."}
    if let Some(action) = obj.get("action").and_then(|v| v.as_str()) {
        let action = action.trim().to_lowercase();
        if action == "run" || action == "shell" {
            if let Some(cmd) = str_field(obj, &["command", "cmd"]) {
                return Some(ToolCall::shell(cmd));
            }
        }
        // {"action":"write_file","path":"...","content":"..."} — synthesized
        // as a heredoc; notes.md is forced to append.
        if ["write_file", "writefile", "write"].contains(&action.as_str()) {
            if let (Some(path), Some(content)) = (
                str_field(obj, &["path"]),
                obj.get("content").and_then(|v| v.as_str()),
            ) {
                let p = despace(path);
                let redir = if p.ends_with("notes.md") { ">>" } else { ">" };
                return Some(ToolCall::shell(format!("cat {redir} {p} << 'EOF'\n{content}\nEOF")));
            }
        }
    }

    // Canonical: {"tool":"...","args":{...}}
    if let Some(tool) = obj.get("tool") {
        if let (Some(tool), Some(args)) = (tool.as_str(), obj.get("args").and_then(|v| v.as_object())) {
            // Some smaller models mistake the field name for the value:
            // {"tool":"args","args":{"cmd":...}} is a shell invocation.
            if tool.trim().to_lowercase() == "args"
                && (args.contains_key("cmd") || args.contains_key("command"))
            {
                return Some(shell_call_from_args(args));
            }
            return Some(ToolCall {
                tool: tool.to_string(),
                args: Value::Object(args.clone()),
            });
        }
        // {"tool":"shell","command":"..."}
        if tool.as_str().map(|t| t.trim().to_lowercase()) == Some("shell".to_string()) {
            if let Some(cmd) = str_field(obj, &["command", "cmd"]) {
                return Some(ToolCall::shell(cmd));
            }
        }
    }

    // Top-level tool_name + command_line (tokenizer-mangled emitters).
    if obj.contains_key("tool_name") || obj.contains_key("command_line") {
        let tool_name = despace(
            obj.get("tool_name").and_then(|v| v.as_str()).unwrap_or(""),
        )
        .to_lowercase();
        if let Some(cmdline) = str_field(obj, &["command_line", "command", "cmd"]) {
            let mut cmdline = normalize_command_str(cmdline);
            if tool_name == "curl" || tool_name == "wget" {
                cmdline = reconstruct_curl_cmd(&cmdline);
            }
            return Some(ToolCall::shell(cmdline));
        }
        if !tool_name.is_empty() {
            if let Some(param) = str_field(obj, &["parameter", "parameters"]) {
                let param = normalize_command_str(param);
                return Some(ToolCall::shell(format!("{tool_name} {param}")));
            }
        }
    }

    // {"command": {"tool":"curl","parameters":{...}}}
    if let Some(cmd_obj) = obj.get("command") {
        if cmd_obj.is_object() {
            if let Some(call) = normalize_command_obj(cmd_obj) {
                return Some(call);
            }
        }
    }

    // {"commands": [{...}, ...]} — first element that normalizes wins.
    if let Some(cmds) = obj.get("commands").and_then(|v| v.as_array()) {
        for c in cmds {
            if !c.is_object() {
                continue;
            }
            if let Some(call) = normalize_command_obj(c) {
                return Some(call);
            }
        }
    }

    // {"shell": {"cmd"|"command": "..."}}
    if let Some(shell) = obj.get("shell").and_then(|v| v.as_object()) {
        return Some(shell_call_from_args(shell));
    }

    // Bare {"cmd":"..."} / {"command":"..."} — assume shell.
    if let Some(cmd) = obj.get("cmd").and_then(|v| v.as_str()) {
        return Some(ToolCall::shell(cmd));
    }
    if let Some(cmd) = obj.get("command").and_then(|v| v.as_str()) {
        return Some(ToolCall::shell(cmd));
    }

    // Generic single-key {"<tool>": {...}}.
    if obj.len() == 1 {
        let (k, v) = obj.iter().next()?;
        if let Some(inner) = v.as_object() {
            if k == "shell" {
                return Some(shell_call_from_args(inner));
            }
            return Some(ToolCall {
                tool: k.clone(),
                args: Value::Object(inner.clone()),
            });
        }
    }

    None
}

/// Try to pull one tool call out of free text.
pub fn try_parse_tool_call(text: &str) -> Option<ToolCall> {
    // Whole JSON lines first (the UX-friendly single-line format).
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') || !line.ends_with('}') {
            continue;
        }
        if let Ok(obj) = serde_json::from_str::<Value>(line) {
            if let Some(call) = normalize(&obj) {
                return Some(call);
            }
        }
    }

    // Fenced JSON block (common with smaller models).
    let fence = Regex::new(r"(?is)```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("fence regex");
    if let Some(cap) = fence.captures(text) {
        if let Ok(obj) = serde_json::from_str::<Value>(cap[1].trim()) {
            if let Some(call) = normalize(&obj) {
                return Some(call);
            }
        }
    }

    // A single JSON object anywhere in the text.
    let inline = Regex::new(r"(?s)(\{.*\})").expect("inline regex");
    if let Some(cap) = inline.captures(text) {
        if let Ok(obj) = serde_json::from_str::<Value>(cap[1].trim()) {
            if let Some(call) = normalize(&obj) {
                return Some(call);
            }
        }
    }

    // Tokenizer-mangled output.
    let cleaned = clean_tokenized(text);
    if let Some(cap) = inline.captures(&cleaned) {
        if let Ok(obj) = serde_json::from_str::<Value>(cap[1].trim()) {
            if let Some(call) = normalize(&obj) {
                return Some(call);
            }
        }
    }
    None
}

/// Canonical multi-call entry point: scan every `{…}` substring and yield
/// each successful normalization, so batched responses execute in order.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let re = Regex::new(r"(?s)\{.*?\}").expect("brace regex");
    let mut calls: Vec<ToolCall> = Vec::new();
    for m in re.find_iter(text) {
        if let Some(call) = try_parse_tool_call(m.as_str()) {
            calls.push(call);
        }
    }
    if !calls.is_empty() {
        return calls;
    }
    try_parse_tool_call(text).into_iter().collect()
}

/// Parse a full response with optional THOUGHT:/ACTION: markers.
pub fn parse_with_thought(text: &str) -> AgentOutput {
    if text.trim().is_empty() {
        return AgentOutput::error("Missing THOUGHT block. You must plan before acting.");
    }

    let thought_re = Regex::new(r"\bTHOUGHT:\s*").expect("thought regex");
    let Some(thought_m) = thought_re.find(text) else {
        // No THOUGHT: accept a direct tool JSON, else treat as freeform/final.
        if let Some(call) = try_parse_tool_call(text) {
            return AgentOutput {
                thought: String::new(),
                tool_name: Some(call.tool),
                tool_args: Some(call.args),
                error: None,
            };
        }
        if let Some(json_obj) = extract_json_block(text) {
            if let Some(call) = normalize(&json_obj) {
                return AgentOutput {
                    thought: String::new(),
                    tool_name: Some(call.tool),
                    tool_args: Some(call.args),
                    error: None,
                };
            }
        }
        return AgentOutput {
            thought: String::new(),
            tool_name: None,
            tool_args: None,
            error: None,
        };
    };

    let remainder = &text[thought_m.end()..];
    let action_re = Regex::new(r"\bACTION:\s*").expect("action regex");
    let json_obj = if let Some(action_m) = action_re.find(text) {
        extract_json_block(&text[action_m.end()..])
    } else {
        extract_json_block(remainder).or_else(|| extract_json_block(text))
    };
    let Some(json_obj) = json_obj else {
        return AgentOutput::error("Invalid or missing JSON Action.");
    };

    let mut thought = remainder.trim().to_string();
    let cut = [thought.find('{'), thought.find('[')]
        .into_iter()
        .flatten()
        .min();
    if let Some(idx) = cut {
        thought = thought[..idx].trim().to_string();
    }

    let Some(obj) = json_obj.as_object() else {
        return AgentOutput {
            thought,
            tool_name: None,
            tool_args: None,
            error: Some("Invalid or missing JSON Action.".to_string()),
        };
    };

    let tool_name = obj.get("tool").and_then(|v| v.as_str()).map(|t| t.trim().to_string());
    if tool_name.is_none() {
        if let Some(cmd) = obj.get("command").and_then(|v| v.as_str()) {
            return AgentOutput {
                thought,
                tool_name: Some("shell".to_string()),
                tool_args: Some(json!({ "cmd": cmd })),
                error: None,
            };
        }
        // A final payload or unrecognized object; keep the args visible so
        // the loop can pick out a {"final": ...} answer.
        return AgentOutput {
            thought,
            tool_name: None,
            tool_args: Some(Value::Object(obj.clone())),
            error: None,
        };
    }
    let mut tool_args = match obj.get("args") {
        Some(Value::String(s)) => json!({ "cmd": s }),
        Some(Value::Object(map)) => {
            let mut map = map.clone();
            if !map.contains_key("cmd") {
                if let Some(cmd) = map.get("command").cloned() {
                    map.insert("cmd".to_string(), cmd);
                }
            }
            Value::Object(map)
        }
        _ => json!({}),
    };

    if let Some(name) = tool_name.as_deref() {
        let empty = tool_args.as_object().map(|m| m.is_empty()).unwrap_or(true);
        if name.eq_ignore_ascii_case("shell") && empty {
            if let Some(cmd) = str_field(obj, &["cmd", "command"]) {
                tool_args = json!({ "cmd": cmd });
            }
        }
    }

    AgentOutput {
        thought,
        tool_name,
        tool_args: Some(tool_args),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_shape() {
        let call = try_parse_tool_call(r#"{"tool":"shell","args":{"cmd":"ls /work"}}"#).unwrap();
        assert_eq!(call.tool, "shell");
        assert_eq!(call.cmd(), Some("ls /work"));
    }

    #[test]
    fn test_tool_named_args_mistake() {
        let call = try_parse_tool_call(r#"{"tool":"args","args":{"command":"echo hi"}}"#).unwrap();
        assert_eq!(call.tool, "shell");
        assert_eq!(call.cmd(), Some("echo hi"));
    }

    #[test]
    fn test_tool_with_top_level_command() {
        let call = try_parse_tool_call(r#"{"tool":"shell","command":"pwd"}"#).unwrap();
        assert_eq!(call.cmd(), Some("pwd"));
    }

    #[test]
    fn test_action_run() {
        let call = try_parse_tool_call(r#"{"action":"run","command":"cat notes.md"}"#).unwrap();
        assert_eq!(call.cmd(), Some("cat notes.md"));
    }

    #[test]
    fn test_write_file_heredoc() {
        let call =
            try_parse_tool_call(r#"{"action":"write_file","path":"/work/out.txt","content":"hi"}"#)
                .unwrap();
        let cmd = call.cmd().unwrap();
        assert!(cmd.starts_with("cat > /work/out.txt << 'EOF'"));
        assert!(cmd.contains("\nhi\n"));
    }

    #[test]
    fn test_write_file_notes_forces_append() {
        let call =
            try_parse_tool_call(r#"{"action":"write_file","path":"/work/notes.md","content":"x"}"#)
                .unwrap();
        assert!(call.cmd().unwrap().starts_with("cat >> /work/notes.md"));
    }

    #[test]
    fn test_tool_name_command_line() {
        let call = try_parse_tool_call(
            r#"{"tool_name":"curl","command_line":"curl - sL https://example.com/a ?q=1 -o /work/out.html"}"#,
        )
        .unwrap();
        assert_eq!(
            call.cmd(),
            Some("curl -sL https://example.com/a?q=1 -o /work/out.html")
        );
    }

    #[test]
    fn test_nested_command_curl_url() {
        let call = try_parse_tool_call(
            r#"{"command":{"tool":"curl","parameters":{"url":"https://example.com/x","output":"/work/x.html"}}}"#,
        )
        .unwrap();
        assert_eq!(call.cmd(), Some("curl -sL https://example.com/x -o /work/x.html"));
    }

    #[test]
    fn test_commands_array() {
        let call = try_parse_tool_call(
            r#"{"commands":[{"tool":"grep","parameter":"-r foo /work"}]}"#,
        )
        .unwrap();
        assert_eq!(call.cmd(), Some("grep -r foo /work"));
    }

    #[test]
    fn test_shell_object_shape() {
        let call = try_parse_tool_call(r#"{"shell":{"command":"ls -la"}}"#).unwrap();
        assert_eq!(call.cmd(), Some("ls -la"));
    }

    #[test]
    fn test_bare_cmd_shapes() {
        assert_eq!(try_parse_tool_call(r#"{"cmd":"ls"}"#).unwrap().cmd(), Some("ls"));
        assert_eq!(try_parse_tool_call(r#"{"command":"ls"}"#).unwrap().cmd(), Some("ls"));
    }

    #[test]
    fn test_single_key_generic_tool() {
        let call = try_parse_tool_call(r#"{"browser":{"url":"https://example.com"}}"#).unwrap();
        assert_eq!(call.tool, "browser");
        assert_eq!(call.args["url"], "https://example.com");
    }

    #[test]
    fn test_fenced_block() {
        let text = "Sure, running it now:\n```json\n{\"tool\":\"shell\",\"args\":{\"cmd\":\"date\"}}\n```";
        assert_eq!(try_parse_tool_call(text).unwrap().cmd(), Some("date"));
    }

    #[test]
    fn test_raw_newline_in_string() {
        let text = "{\"tool\":\"shell\",\"args\":{\"cmd\":\"echo line1\nline2\"}}";
        let out = parse_with_thought(text);
        assert_eq!(out.tool_name.as_deref(), Some("shell"));
    }

    #[test]
    fn test_sentencepiece_artifacts() {
        let text = "{\"cmd\":▁\"ls▁/work\"}";
        let call = try_parse_tool_call(text).unwrap();
        assert_eq!(call.cmd(), Some("ls /work"));
    }

    #[test]
    fn test_extract_multiple_calls_in_order() {
        // Flat one-object-per-line batching: every fragment normalizes.
        let text = "{\"cmd\":\"echo a\"}\nsome narration\n{\"cmd\":\"echo b\"}";
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cmd(), Some("echo a"));
        assert_eq!(calls[1].cmd(), Some("echo b"));
    }

    #[test]
    fn test_extract_nested_shape_falls_back_to_single() {
        // Nested canonical shapes defeat the non-greedy fragment scan; the
        // whole-text fallback yields the first valid line.
        let text = concat!(
            "{\"tool\":\"shell\",\"args\":{\"cmd\":\"echo a\"}}\n",
            "{\"tool\":\"shell\",\"args\":{\"cmd\":\"echo b\"}}\n",
        );
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cmd(), Some("echo a"));
    }

    #[test]
    fn test_extract_none_from_prose() {
        assert!(extract_tool_calls("I believe the answer is 42.").is_empty());
    }

    #[test]
    fn test_parse_with_thought_and_action() {
        let text = "THOUGHT: inspect the input dir first.\nACTION: {\"tool\":\"shell\",\"args\":{\"cmd\":\"ls /input\"}}";
        let out = parse_with_thought(text);
        assert!(out.error.is_none());
        assert_eq!(out.thought, "inspect the input dir first.");
        assert_eq!(out.tool_name.as_deref(), Some("shell"));
        assert_eq!(out.tool_args.unwrap()["cmd"], "ls /input");
    }

    #[test]
    fn test_parse_with_thought_missing_action() {
        let out = parse_with_thought("THOUGHT: hmm, not sure what to do");
        assert_eq!(out.error.as_deref(), Some("Invalid or missing JSON Action."));
    }

    #[test]
    fn test_freeform_final_is_not_error() {
        let out = parse_with_thought("Final answer: the library was released in 2019.");
        assert!(out.error.is_none());
        assert!(out.tool_name.is_none());
    }

    #[test]
    fn test_empty_is_format_error() {
        let out = parse_with_thought("   ");
        assert!(out.error.is_some());
    }

    #[test]
    fn test_final_payload_surfaced_in_args() {
        let out = parse_with_thought("THOUGHT: done\n{\"final\":\"the answer\"}");
        assert!(out.error.is_none());
        assert!(out.tool_name.is_none());
        assert_eq!(out.tool_args.unwrap()["final"], "the answer");
    }

    #[test]
    fn test_round_trip_shape_equivalence() {
        // Parsing a recognized shape and re-serializing parses to the same call.
        let shapes = [
            r#"{"tool":"shell","args":{"cmd":"ls /work"}}"#,
            r#"{"action":"run","command":"pwd"}"#,
            r#"{"shell":{"cmd":"date"}}"#,
            r#"{"cmd":"whoami"}"#,
        ];
        for shape in shapes {
            let first = try_parse_tool_call(shape).unwrap();
            let serialized = serde_json::to_string(&first).unwrap();
            let second = try_parse_tool_call(&serialized).unwrap();
            assert_eq!(first, second, "shape not stable: {shape}");
        }
    }

    #[test]
    fn test_normalize_command_str_rejoins() {
        assert_eq!(normalize_command_str("ls - la / work /"), "ls -la /work/");
        assert_eq!(normalize_command_str("cat /work/a.txt | head"), "cat /work/a.txt | head");
    }

    #[test]
    fn test_reconstruct_curl() {
        assert_eq!(
            reconstruct_curl_cmd("curl -sL https://example. com/a /b -o /work /out.html"),
            "curl -sL https://example.com/a/b -o /work/out.html"
        );
    }

    #[test]
    fn test_extract_first_json() {
        let v = extract_first_json("noise\n{\"answer\":\"yes\",\"evidence\":[]}\nmore").unwrap();
        assert_eq!(v["answer"], "yes");
        assert!(extract_first_json("no json here").is_none());
    }
}
