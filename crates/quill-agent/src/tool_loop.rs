//! Core tool-use conversation loop.
//!
//! Each iteration sends the whole conversation to the model, appends its
//! answer, and runs any requested tool calls through the permission gate and
//! the dispatcher before asking again.
//!
//! The loop continues until:
//! - the model responds with text only (no tool calls)
//! - the maximum number of turns is reached (`max_turns`)
//! - the interrupt flag is raised (`interrupted`)
//! - the model endpoint fails (returned as `Err`, history kept)

use anyhow::Result;
use quill_core::{
    AppConfig, ChatMessage, ChatRequest, LlmResponse, LlmToolCall, MessageContent, SessionStore,
    StreamCallback, StreamChunk,
};
use quill_llm::LlmClient;
use quill_observe::{ObservedEvent, Observer};
use quill_policy::{Decision, PermissionGate};
use quill_tools::ToolDispatcher;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Default maximum turns (model calls) before stopping the loop.
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Tool result recorded when the user refuses a call.
pub const USER_DENIED: &str = "Skipped: user denied permission";

const INTERRUPTED: &str = "Skipped: interrupted";

/// Record of a single tool call made during the loop.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub tool_call_id: String,
    pub args_summary: String,
    /// Gate outcome: `allow`, `deny`, `approved`, `approved_always` or `user_denied`.
    pub decision: &'static str,
    pub success: bool,
    pub duration_ms: u64,
}

/// Result of running the tool-use loop.
#[derive(Debug, Clone)]
pub struct ToolLoopResult {
    /// Final text response from the model.
    pub response: String,
    pub tool_calls_made: Vec<ToolCallRecord>,
    /// Why the loop stopped.
    pub finish_reason: String,
    /// Number of model calls made.
    pub turns: usize,
    /// Full conversation, system prompt included.
    pub messages: Vec<ChatMessage>,
}

/// The user's answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAnswer {
    /// Run this call and remember the exact tool and target.
    Once,
    /// Run this call and allow the tool for the rest of the process.
    Always,
    Deny,
}

/// Asked when the gate cannot decide a call on its own.
pub type ApprovalCallback = Arc<dyn Fn(&str, &Value) -> ApprovalAnswer + Send + Sync>;

/// Configuration for the tool-use loop.
#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_turns: usize,
    /// Use the streaming endpoint when a stream callback is set.
    pub stream: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            model: quill_core::DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            temperature: None,
            max_turns: DEFAULT_MAX_TURNS,
            stream: true,
        }
    }
}

impl ToolLoopConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            temperature: cfg.llm.temperature,
            max_turns: cfg.agent.max_turns,
            stream: cfg.llm.stream,
        }
    }
}

/// Drives one user turn to completion.
pub struct ToolUseLoop<'a> {
    llm: &'a dyn LlmClient,
    dispatcher: &'a ToolDispatcher,
    gate: &'a mut PermissionGate,
    config: ToolLoopConfig,
    messages: Vec<ChatMessage>,
    stream_cb: Option<StreamCallback>,
    approval_cb: Option<ApprovalCallback>,
    observer: Option<&'a Observer>,
    store: Option<&'a dyn SessionStore>,
    session_id: Option<String>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> ToolUseLoop<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        dispatcher: &'a ToolDispatcher,
        gate: &'a mut PermissionGate,
        config: ToolLoopConfig,
        system_prompt: String,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            gate,
            config,
            messages: vec![ChatMessage::system(system_prompt)],
            stream_cb: None,
            approval_cb: None,
            observer: None,
            store: None,
            session_id: None,
            interrupt: None,
        }
    }

    /// Set the stream callback for real-time UI updates.
    pub fn set_stream_callback(&mut self, cb: StreamCallback) {
        self.stream_cb = Some(cb);
    }

    /// Without an approval callback every `Ask` decision is a refusal.
    pub fn set_approval_callback(&mut self, cb: ApprovalCallback) {
        self.approval_cb = Some(cb);
    }

    pub fn set_observer(&mut self, observer: &'a Observer) {
        self.observer = Some(observer);
    }

    /// Tags file changes with `session_id`; when `store` is given every
    /// appended message is persisted there too.
    pub fn bind_session(&mut self, session_id: &str, store: Option<&'a dyn SessionStore>) {
        self.session_id = Some(session_id.to_string());
        self.store = store;
    }

    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    /// Initialize from existing conversation history (for multi-turn).
    /// System messages in `history` are dropped; the loop owns its own.
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.messages.extend(
            history
                .into_iter()
                .filter(|msg| !matches!(msg, ChatMessage::System { .. })),
        );
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The conversation without the leading system prompt.
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages[1..]
    }

    /// Run the loop with a user message.
    pub fn run(&mut self, user_message: impl Into<MessageContent>) -> Result<ToolLoopResult> {
        self.push(ChatMessage::user(user_message));
        self.execute_loop()
    }

    fn execute_loop(&mut self) -> Result<ToolLoopResult> {
        let mut tool_calls_made = Vec::new();
        let mut turns: usize = 0;

        loop {
            if self.interrupted() {
                return Ok(self.finish(String::new(), tool_calls_made, "interrupted", turns));
            }
            if turns >= self.config.max_turns {
                return Ok(self.finish(String::new(), tool_calls_made, "max_turns", turns));
            }

            turns += 1;
            let request = self.build_request();
            let response = self.send(&request)?;

            if response.tool_calls.is_empty() {
                self.push(ChatMessage::Assistant {
                    content: Some(response.text.clone()),
                    tool_calls: Vec::new(),
                });
                return Ok(self.finish(
                    response.text,
                    tool_calls_made,
                    &response.finish_reason,
                    turns,
                ));
            }

            self.push(ChatMessage::Assistant {
                content: (!response.text.is_empty()).then(|| response.text.clone()),
                tool_calls: response.tool_calls.clone(),
            });

            for (idx, call) in response.tool_calls.iter().enumerate() {
                if self.interrupted() {
                    // Every call of the batch still needs a result message.
                    for skipped in &response.tool_calls[idx..] {
                        self.push(ChatMessage::Tool {
                            tool_call_id: skipped.id.clone(),
                            content: INTERRUPTED.to_string(),
                        });
                    }
                    return Ok(self.finish(String::new(), tool_calls_made, "interrupted", turns));
                }
                tool_calls_made.push(self.execute_tool_call(call));
            }
        }
    }

    fn send(&self, request: &ChatRequest) -> Result<LlmResponse> {
        match &self.stream_cb {
            Some(cb) if self.config.stream => self.llm.complete_chat_streaming(request, cb.clone()),
            Some(cb) => {
                let response = self.llm.complete_chat(request)?;
                if !response.text.is_empty() {
                    cb(StreamChunk::ContentDelta(response.text.clone()));
                }
                cb(StreamChunk::Done);
                Ok(response)
            }
            None => self.llm.complete_chat(request),
        }
    }

    /// Gate, then approval, then dispatch. Always appends one tool message.
    fn execute_tool_call(&mut self, call: &LlmToolCall) -> ToolCallRecord {
        let args = call.parsed_arguments();
        let args_summary = summarize_args(&args);
        self.emit(StreamChunk::ToolCallStart {
            tool_name: call.name.clone(),
            args_summary: args_summary.clone(),
        });

        let (decision, refusal) = match self.gate.decide(&call.name, &args) {
            Decision::Allow => ("allow", None),
            Decision::Deny { reason } => ("deny", Some(format!("Blocked: {reason}"))),
            Decision::Ask => match self.ask(&call.name, &args) {
                ApprovalAnswer::Once => {
                    self.gate.approve(&call.name, &args);
                    ("approved", None)
                }
                ApprovalAnswer::Always => {
                    self.gate.approve_all(&call.name);
                    ("approved_always", None)
                }
                ApprovalAnswer::Deny => ("user_denied", Some(USER_DENIED.to_string())),
            },
        };

        let started = Instant::now();
        let (content, success) = match refusal {
            Some(text) => (text, false),
            None => {
                let output =
                    self.dispatcher
                        .execute(&call.name, &args, self.session_id.as_deref());
                let ok = !output.starts_with("error:");
                (output, ok)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.emit(StreamChunk::ToolCallEnd {
            tool_name: call.name.clone(),
            duration_ms,
            success,
            summary: preview(&content),
        });
        if let Some(observer) = self.observer {
            let _ = observer.record_event(&ObservedEvent::ToolCall {
                session_id: self.session_id.clone().unwrap_or_default(),
                tool: call.name.clone(),
                decision: decision.to_string(),
                duration_ms,
                success,
            });
            observer.verbose_log(&format!("{} [{decision}] {duration_ms}ms", call.name));
        }
        self.push(ChatMessage::Tool {
            tool_call_id: call.id.clone(),
            content,
        });

        ToolCallRecord {
            tool_name: call.name.clone(),
            tool_call_id: call.id.clone(),
            args_summary,
            decision,
            success,
            duration_ms,
        }
    }

    fn ask(&self, tool: &str, args: &Value) -> ApprovalAnswer {
        match &self.approval_cb {
            Some(cb) => cb(tool, args),
            None => ApprovalAnswer::Deny,
        }
    }

    fn build_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: self.messages.clone(),
            tools: self.dispatcher.definitions(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    fn push(&mut self, message: ChatMessage) {
        if let (Some(store), Some(session_id)) = (self.store, &self.session_id)
            && let Err(err) = store.append(session_id, &message)
            && let Some(observer) = self.observer
        {
            observer.warn_log(&format!("failed to persist message: {err:#}"));
        }
        self.messages.push(message);
    }

    fn finish(
        &self,
        response: String,
        tool_calls_made: Vec<ToolCallRecord>,
        finish_reason: &str,
        turns: usize,
    ) -> ToolLoopResult {
        if let Some(observer) = self.observer {
            let _ = observer.record_event(&ObservedEvent::TurnFinished {
                session_id: self.session_id.clone().unwrap_or_default(),
                turns,
                tool_calls: tool_calls_made.len(),
                finish_reason: finish_reason.to_string(),
            });
        }
        ToolLoopResult {
            response,
            tool_calls_made,
            finish_reason: finish_reason.to_string(),
            turns,
            messages: self.messages.clone(),
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn emit(&self, chunk: StreamChunk) {
        if let Some(cb) = &self.stream_cb {
            cb(chunk);
        }
    }
}

/// Produce a short summary of tool arguments for display.
pub fn summarize_args(args: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(obj) = args.as_object() {
        for (key, val) in obj {
            let short = match val {
                Value::String(s) if s.chars().count() > 60 => {
                    format!("{key}=\"{}...\"", s.chars().take(57).collect::<String>())
                }
                Value::String(s) => format!("{key}=\"{s}\""),
                Value::Number(n) => format!("{key}={n}"),
                Value::Bool(b) => format!("{key}={b}"),
                _ => format!("{key}=..."),
            };
            parts.push(short);
        }
    }
    if parts.is_empty() {
        return "()".to_string();
    }
    parts.join(", ")
}

/// First line of a tool result, cut to 100 characters.
fn preview(content: &str) -> String {
    let first = content.lines().next().unwrap_or_default();
    let mut out: String = first.chars().take(100).collect();
    if first.chars().count() > 100 || content.lines().nth(1).is_some() {
        out.push_str(" ...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{PermissionMode, ToolsConfig};
    use quill_store::SqliteStore;
    use quill_testkit::{ScriptedLlm, text_response, tool_call, tool_response};
    use quill_tools::{ToolContext, ToolRegistry};
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn dispatcher() -> (TempDir, ToolDispatcher) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ToolContext::new(dir.path(), ToolsConfig::default(), Arc::default())
            .expect("context");
        (dir, ToolDispatcher::new(ToolRegistry::builtin(), ctx))
    }

    fn tool_messages(messages: &[ChatMessage]) -> Vec<(String, String)> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                ChatMessage::Tool {
                    tool_call_id,
                    content,
                } => Some((tool_call_id.clone(), content.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn simple_text_response_no_tools() {
        let llm = ScriptedLlm::new(vec![text_response("Hello, world!")]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "You are helpful.".to_string(),
        );
        let result = loop_.run("Hi").expect("run");

        assert_eq!(result.response, "Hello, world!");
        assert_eq!(result.turns, 1);
        assert_eq!(result.finish_reason, "stop");
        assert!(result.tool_calls_made.is_empty());
        assert_eq!(result.messages.len(), 3);
        assert_eq!(
            result.messages[2],
            ChatMessage::Assistant {
                content: Some("Hello, world!".to_string()),
                tool_calls: Vec::new(),
            }
        );

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(
            requests[0]
                .tools
                .iter()
                .any(|tool| tool.function.name == "read")
        );
    }

    #[test]
    fn allowed_tool_result_is_fed_back() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call("call_1", "read", r#"{"path":"notes.txt"}"#)]),
            text_response("The file says hello."),
        ]);
        let (dir, dispatcher) = dispatcher();
        fs::write(dir.path().join("notes.txt"), "hello\n").expect("seed");
        let mut gate = PermissionGate::new(PermissionMode::Strict);

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        let result = loop_.run("What's in notes.txt?").expect("run");

        assert_eq!(result.turns, 2);
        assert_eq!(result.tool_calls_made.len(), 1);
        assert_eq!(result.tool_calls_made[0].decision, "allow");
        assert!(result.tool_calls_made[0].success);
        let tools = tool_messages(&result.messages);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "call_1");
        assert!(tools[0].1.contains("hello"));

        // The second request carries the assistant call and its result.
        let second = &llm.requests()[1];
        assert!(matches!(
            second.messages[2],
            ChatMessage::Assistant { content: None, ref tool_calls } if tool_calls.len() == 1
        ));
        assert!(matches!(second.messages[3], ChatMessage::Tool { .. }));
    }

    #[test]
    fn strict_mode_blocks_without_invoking_the_tool() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call(
                "call_w",
                "write",
                r#"{"path":"out.txt","content":"x"}"#,
            )]),
            text_response("Could not write."),
        ]);
        let (dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::new(PermissionMode::Strict);

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        let result = loop_.run("write it").expect("run");

        let tools = tool_messages(&result.messages);
        assert!(tools[0].1.starts_with("Blocked: "));
        assert!(tools[0].1.contains("denied"));
        assert!(!dir.path().join("out.txt").exists());
        assert_eq!(llm.requests().len(), 2);
        assert_eq!(result.response, "Could not write.");
        assert!(!result.tool_calls_made[0].success);
    }

    #[test]
    fn ask_without_callback_is_a_refusal() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call("c1", "bash", r#"{"command":"echo hi"}"#)]),
            text_response("ok"),
        ]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::new(PermissionMode::Ask);

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        let result = loop_.run("run it").expect("run");
        assert_eq!(tool_messages(&result.messages)[0].1, USER_DENIED);
        assert_eq!(result.tool_calls_made[0].decision, "user_denied");
    }

    #[test]
    fn approve_always_adds_rule_and_stops_asking() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                tool_call("c1", "write", r#"{"path":"a.txt","content":"a"}"#),
                tool_call("c2", "write", r#"{"path":"b.txt","content":"b"}"#),
            ]),
            text_response("done"),
        ]);
        let (dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::new(PermissionMode::Ask);
        let asked = Arc::new(AtomicUsize::new(0));

        {
            let mut loop_ = ToolUseLoop::new(
                &llm,
                &dispatcher,
                &mut gate,
                ToolLoopConfig::default(),
                "sys".to_string(),
            );
            let counter = Arc::clone(&asked);
            loop_.set_approval_callback(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                ApprovalAnswer::Always
            }));
            let result = loop_.run("write both").expect("run");
            let decisions: Vec<&str> = result.tool_calls_made.iter().map(|r| r.decision).collect();
            assert_eq!(decisions, vec!["approved_always", "allow"]);
        }

        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
        assert_eq!(gate.rules()[0].tool(), "write");
        assert_eq!(gate.rules()[0].pattern(), "*");
    }

    #[test]
    fn approve_once_remembers_exact_target() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call(
                "c1",
                "write",
                r#"{"path":"a.txt","content":"a"}"#,
            )]),
            text_response("done"),
        ]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::new(PermissionMode::Ask);
        {
            let mut loop_ = ToolUseLoop::new(
                &llm,
                &dispatcher,
                &mut gate,
                ToolLoopConfig::default(),
                "sys".to_string(),
            );
            loop_.set_approval_callback(Arc::new(|_, _| ApprovalAnswer::Once));
            loop_.run("write").expect("run");
        }
        assert!(gate.is_approved("write", &serde_json::json!({"path": "a.txt"})));
        assert!(!gate.is_approved("write", &serde_json::json!({"path": "b.txt"})));
    }

    #[test]
    fn max_turns_limit_stops_loop() {
        let looping = || tool_response(vec![tool_call("c", "think", r#"{"thought":"hmm"}"#)]);
        let llm = ScriptedLlm::new(vec![looping(), looping(), looping()]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();
        let config = ToolLoopConfig {
            max_turns: 2,
            ..ToolLoopConfig::default()
        };

        let mut loop_ = ToolUseLoop::new(&llm, &dispatcher, &mut gate, config, "sys".to_string());
        let result = loop_.run("think forever").expect("run");

        assert_eq!(result.finish_reason, "max_turns");
        assert_eq!(result.turns, 2);
        assert_eq!(result.tool_calls_made.len(), 2);
        assert_eq!(llm.remaining(), 1);
    }

    #[test]
    fn malformed_arguments_degrade_to_empty_object() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call("c1", "read", "{\"path\": \"unterminated")]),
            text_response("sorry"),
        ]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        let result = loop_.run("read").expect("run");
        assert_eq!(result.tool_calls_made[0].args_summary, "()");
        assert_eq!(
            tool_messages(&result.messages)[0].1,
            "error: missing required parameter 'path'"
        );
    }

    #[test]
    fn interrupt_before_send_skips_the_model() {
        let llm = ScriptedLlm::new(vec![text_response("never")]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        loop_.set_interrupt(Arc::new(AtomicBool::new(true)));
        let result = loop_.run("hi").expect("run");
        assert_eq!(result.finish_reason, "interrupted");
        assert_eq!(result.turns, 0);
        assert!(llm.requests().is_empty());
    }

    #[test]
    fn interrupt_mid_batch_answers_every_call() {
        let llm = ScriptedLlm::new(vec![tool_response(vec![
            tool_call("c1", "bash", r#"{"command":"sleep 5"}"#),
            tool_call("c2", "bash", r#"{"command":"echo later"}"#),
        ])]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::new(PermissionMode::Ask);
        let flag = Arc::new(AtomicBool::new(false));

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        loop_.set_interrupt(Arc::clone(&flag));
        let raised = Arc::clone(&flag);
        loop_.set_approval_callback(Arc::new(move |_, _| {
            raised.store(true, Ordering::SeqCst);
            ApprovalAnswer::Deny
        }));
        let result = loop_.run("go").expect("run");

        assert_eq!(result.finish_reason, "interrupted");
        assert_eq!(
            tool_messages(&result.messages),
            vec![
                ("c1".to_string(), USER_DENIED.to_string()),
                ("c2".to_string(), INTERRUPTED.to_string()),
            ]
        );
    }

    #[test]
    fn bound_store_receives_every_appended_message() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call("c1", "ls", "{}")]),
            text_response("listed"),
        ]);
        let (dir, dispatcher) = dispatcher();
        let store = SqliteStore::new(dir.path(), None).expect("store");
        let mut gate = PermissionGate::default();

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        loop_.bind_session("main", Some(&store));
        loop_.run("list files").expect("run");

        let stored = store.history("main").expect("history");
        assert_eq!(stored.len(), 4);
        assert_eq!(stored, loop_.history());
    }

    #[test]
    fn history_continues_and_drops_old_system_prompts() {
        let llm = ScriptedLlm::new(vec![text_response("second answer")]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();
        let history = vec![
            ChatMessage::system("stale prompt"),
            ChatMessage::user("first"),
            ChatMessage::Assistant {
                content: Some("first answer".to_string()),
                tool_calls: Vec::new(),
            },
        ];

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "fresh prompt".to_string(),
        )
        .with_history(history);
        let result = loop_.run("second").expect("run");

        assert_eq!(result.messages.len(), 5);
        assert_eq!(result.messages[0], ChatMessage::system("fresh prompt"));
        assert_eq!(llm.requests()[0].messages.len(), 4);
    }

    #[test]
    fn stream_callback_sees_content_and_tool_progress() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![tool_call("c1", "think", r#"{"thought":"plan"}"#)]),
            text_response("answer"),
        ]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        let sink = Arc::clone(&seen);
        loop_.set_stream_callback(Arc::new(move |chunk| {
            let label = match chunk {
                StreamChunk::ContentDelta(text) => format!("text:{text}"),
                StreamChunk::ToolCallStart { tool_name, .. } => format!("start:{tool_name}"),
                StreamChunk::ToolCallEnd {
                    tool_name, success, ..
                } => format!("end:{tool_name}:{success}"),
                StreamChunk::Done => "done".to_string(),
            };
            sink.lock().expect("lock").push(label);
        }));
        loop_.run("plan").expect("run");

        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["done", "start:think", "end:think:true", "text:answer", "done"]
        );
    }

    #[test]
    fn endpoint_failure_keeps_conversation() {
        let llm = ScriptedLlm::new(vec![tool_response(vec![tool_call(
            "c1",
            "think",
            r#"{"thought":"x"}"#,
        )])]);
        let (_dir, dispatcher) = dispatcher();
        let mut gate = PermissionGate::default();

        let mut loop_ = ToolUseLoop::new(
            &llm,
            &dispatcher,
            &mut gate,
            ToolLoopConfig::default(),
            "sys".to_string(),
        );
        assert!(loop_.run("go").is_err());
        // user, assistant call, tool result
        assert_eq!(loop_.history().len(), 3);
    }

    #[test]
    fn summarize_args_formats_correctly() {
        let args = serde_json::json!({"path": "src/main.rs", "limit": 10, "all": true});
        let summary = summarize_args(&args);
        for part in ["path=\"src/main.rs\"", "limit=10", "all=true"] {
            assert!(summary.contains(part), "{summary}");
        }
        assert_eq!(summarize_args(&serde_json::json!({})), "()");
        let long = "é".repeat(80);
        let summary = summarize_args(&serde_json::json!({ "text": long }));
        assert!(summary.ends_with("...\""));
        assert_eq!(summary.chars().count(), "text=\"".len() + 57 + 4);
    }

    #[test]
    fn preview_keeps_first_line() {
        assert_eq!(preview("one line"), "one line");
        assert_eq!(preview("first\nsecond"), "first ...");
    }
}
