//! Test doubles shared across the workspace: a scripted model and fake
//! tool-provider processes.

use anyhow::{Result, anyhow};
use quill_core::{
    ChatRequest, LlmResponse, LlmToolCall, McpServerConfig, StreamCallback, StreamChunk,
};
use quill_llm::LlmClient;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tempfile::TempDir;

/// An [`LlmClient`] that replays canned responses in order and records every
/// request it receives.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req.clone());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("no more scripted responses"))
    }

    fn complete_chat_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<LlmResponse> {
        let response = self.complete_chat(req)?;
        if !response.text.is_empty() {
            cb(StreamChunk::ContentDelta(response.text.clone()));
        }
        cb(StreamChunk::Done);
        Ok(response)
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "stop".to_string(),
        tool_calls: Vec::new(),
    }
}

pub fn tool_response(calls: Vec<LlmToolCall>) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        finish_reason: "tool_calls".to_string(),
        tool_calls: calls,
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> LlmToolCall {
    LlmToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

pub fn temp_workspace() -> TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("create temp workspace: {err}"),
    }
}

// Fake providers are POSIX shell loops. Each reads one JSON-RPC line at a
// time, pulls the numeric id out with sed, and answers by method name.
const PROVIDER_PRELUDE: &str = r#"
id_of() { printf '%s\n' "$1" | sed -n 's/.*"jsonrpc":"2.0","id":\([0-9][0-9]*\).*/\1/p'; }
text_of() { printf '%s\n' "$1" | sed -n 's/.*"text":"\([^"]*\)".*/\1/p'; }
reply() { printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$1" "$2"; }
text_reply() { reply "$1" "{\"content\":[{\"type\":\"text\",\"text\":\"$2\"}]}"; }
label="${FAKE_NAME:-fake}"
"#;

const HANDSHAKE_CASES: &str = r#"
    *'"method":"initialize"'*)
      printf 'provider booting\n'
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}\n'
      reply "$id" '{"protocolVersion":"2024-11-05","capabilities":{"tools":{},"resources":{}},"serverInfo":{"name":"fake","version":"0.1.0"}}' ;;
    *'"method":"tools/list"'*)
      reply "$id" '{"tools":[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}},{"name":"fail","description":"Always fails"}]}' ;;
    *'"method":"resources/list"'*)
      reply "$id" "{\"resources\":[{\"uri\":\"mem://$label/readme\",\"name\":\"readme\",\"mimeType\":\"text/plain\"}]}" ;;
    *'"method":"resources/read"'*)
      reply "$id" "{\"contents\":[{\"uri\":\"mem://$label/readme\",\"text\":\"hello from $label\"}]}" ;;
"#;

fn provider_script(call_cases: &str) -> String {
    format!(
        "{PROVIDER_PRELUDE}\nwhile IFS= read -r line; do\n  id=$(id_of \"$line\")\n  [ -z \"$id\" ] && continue\n  case \"$line\" in{HANDSHAKE_CASES}{call_cases}\n  esac\ndone\n"
    )
}

/// Answers `tools/call` immediately: `echo` returns `echo: <text>`, `fail`
/// returns an `isError` result.
pub fn echo_provider_script() -> String {
    provider_script(
        r#"
    *'"method":"tools/call"'*)
      case "$line" in
        *'"name":"fail"'*)
          reply "$id" '{"content":[{"type":"text","text":"fail tool refused"}],"isError":true}' ;;
        *)
          text_reply "$id" "echo: $(text_of "$line")" ;;
      esac ;;"#,
    )
}

/// Holds each odd `tools/call` until the next one arrives, then answers the
/// newer request first.
pub fn reversing_provider_script() -> String {
    provider_script(
        r#"
    *'"method":"tools/call"'*)
      if [ -z "$held_id" ]; then
        held_id="$id"; held_text=$(text_of "$line")
      else
        text_reply "$id" "echo: $(text_of "$line")"
        text_reply "$held_id" "echo: $held_text"
        held_id=""
      fi ;;"#,
    )
}

/// Reads stdin forever and never answers.
pub fn silent_provider_script() -> String {
    "exec cat > /dev/null".to_string()
}

/// Rejects `initialize` with a JSON-RPC error.
pub fn failing_handshake_script() -> String {
    format!(
        "{PROVIDER_PRELUDE}\nwhile IFS= read -r line; do\n  id=$(id_of \"$line\")\n  [ -z \"$id\" ] && continue\n  printf '{{\"jsonrpc\":\"2.0\",\"id\":%s,\"error\":{{\"code\":-32603,\"message\":\"boom\"}}}}\\n' \"$id\"\ndone\n"
    )
}

/// Answers every request with an error object that has no `code`.
pub fn codeless_error_script() -> String {
    format!(
        "{PROVIDER_PRELUDE}\nwhile IFS= read -r line; do\n  id=$(id_of \"$line\")\n  [ -z \"$id\" ] && continue\n  printf '{{\"jsonrpc\":\"2.0\",\"id\":%s,\"error\":{{\"message\":\"no code here\"}}}}\\n' \"$id\"\ndone\n"
    )
}

/// Launch config running `script` under `sh -c`, with `FAKE_NAME` set to
/// `label`.
pub fn provider_config(script: String, label: &str) -> McpServerConfig {
    McpServerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        env: BTreeMap::from([("FAKE_NAME".to_string(), label.to_string())]),
        enabled: true,
    }
}
