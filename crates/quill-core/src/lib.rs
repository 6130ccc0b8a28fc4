use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

pub use config::{
    AgentConfig, AppConfig, CONFIG_TEMPLATE, DEFAULT_ENDPOINT, DEFAULT_MODEL, LlmConfig, McpConfig,
    McpServerConfig, PermissionRuleConfig, PermissionsConfig, SessionConfig, ToolsConfig,
};

pub type Result<T> = anyhow::Result<T>;

pub const APP_NAME: &str = "quill";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-workspace state directory (`<workspace>/.quill`).
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".quill")
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Per-user state directory (`~/.quill`).
pub fn user_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".quill"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument text as produced by the model. Not guaranteed to be valid JSON.
    pub arguments: String,
}

impl LlmToolCall {
    /// Parses the raw arguments, degrading to an empty object when they are
    /// missing or malformed.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        match serde_json::from_str::<serde_json::Value>(&self.arguments) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

/// A single chunk emitted to the presentation layer during a turn.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// A tool is about to run.
    ToolCallStart {
        tool_name: String,
        args_summary: String,
    },
    /// A tool finished.
    ToolCallEnd {
        tool_name: String,
        duration_ms: u64,
        success: bool,
        summary: String,
    },
    /// The model finished one response.
    Done,
}

pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One typed part of a multi-part user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text view of the content; image parts are dropped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Self::Text(_) => 0,
            Self::Parts(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: MessageContent },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Plain-text content of the message, empty when there is none.
    pub fn text(&self) -> String {
        match self {
            Self::System { content } | Self::Tool { content, .. } => content.clone(),
            Self::User { content } => content.text(),
            Self::Assistant { content, .. } => content.clone().unwrap_or_default(),
        }
    }
}

/// A tool (function) definition sent to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for the chat-with-tools API.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// How the permission gate resolves calls that no rule covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    #[default]
    Ask,
    Auto,
    Strict,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Auto => write!(f, "auto"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(Self::Ask),
            "auto" => Ok(Self::Auto),
            "strict" => Ok(Self::Strict),
            other => Err(anyhow::anyhow!(
                "invalid permission mode '{}' (expected ask|auto|strict)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for RuleAction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(anyhow::anyhow!(
                "invalid rule action '{}' (expected allow|deny)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub model: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub tool_messages: u64,
    pub file_changes: u64,
}

impl SessionStats {
    pub fn total_messages(&self) -> u64 {
        self.user_messages + self.assistant_messages + self.tool_messages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeRecord {
    pub path: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

/// Receives file mutations performed by tools.
pub trait ChangeTracker: Send + Sync {
    fn track_change(&self, session_id: &str, path: &str, action: &str) -> Result<()>;
}

/// Persistent conversation storage keyed by session id.
pub trait SessionStore: ChangeTracker {
    fn get_or_create(&self, session_id: &str, model: &str) -> Result<SessionRecord>;
    fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()>;
    fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
    fn clear(&self, session_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_messages_serialize_with_role_tag() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![LlmToolCall {
                id: "call_1".to_string(),
                name: "read".to_string(),
                arguments: "{\"path\":\"a.rs\"}".to_string(),
            }],
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["name"], "read");

        let tool = ChatMessage::Tool {
            tool_call_id: "call_1".to_string(),
            content: "ok".to_string(),
        };
        let value = serde_json::to_value(&tool).expect("serialize");
        assert_eq!(value, json!({"role": "tool", "tool_call_id": "call_1", "content": "ok"}));
    }

    #[test]
    fn user_content_accepts_text_and_parts() {
        let plain: ChatMessage =
            serde_json::from_value(json!({"role": "user", "content": "hi"})).expect("plain");
        assert_eq!(plain.text(), "hi");

        let parts: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]
        }))
        .expect("parts");
        match &parts {
            ChatMessage::User { content } => assert_eq!(content.image_count(), 1),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(parts.text(), "look");
    }

    #[test]
    fn malformed_tool_arguments_degrade_to_empty_object() {
        let call = LlmToolCall {
            id: "c".to_string(),
            name: "read".to_string(),
            arguments: "{\"path\": ".to_string(),
        };
        assert_eq!(call.parsed_arguments(), json!({}));

        let array = LlmToolCall {
            arguments: "[1,2]".to_string(),
            ..call.clone()
        };
        assert_eq!(array.parsed_arguments(), json!({}));

        let good = LlmToolCall {
            arguments: "{\"path\":\"x\"}".to_string(),
            ..call
        };
        assert_eq!(good.parsed_arguments()["path"], "x");
    }

    #[test]
    fn permission_mode_parses_case_insensitively() {
        assert_eq!(
            " Strict ".parse::<PermissionMode>().expect("parse"),
            PermissionMode::Strict
        );
        assert_eq!(PermissionMode::Auto.to_string(), "auto");
        let err = "locked".parse::<PermissionMode>().expect_err("invalid");
        assert!(err.to_string().contains("expected ask|auto|strict"));
    }

    #[test]
    fn rule_action_round_trips_through_display() {
        for action in [RuleAction::Allow, RuleAction::Deny] {
            let parsed: RuleAction = action.to_string().parse().expect("parse");
            assert_eq!(parsed, action);
        }
    }
}
