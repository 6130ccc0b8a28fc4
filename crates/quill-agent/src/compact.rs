//! Conversation compaction: replace a long history with a model-written summary.

use anyhow::{Result, bail};
use quill_core::{ChatMessage, ChatRequest};
use quill_llm::LlmClient;

/// Conversations shorter than this are left alone.
pub const MIN_MESSAGES: usize = 4;

const TRANSCRIPT_MESSAGES: usize = 20;
const MESSAGE_CHARS: usize = 500;

const COMPACT_PROMPT: &str = "Summarize this conversation into a concise context block. Include:\n\
1. What the user is working on\n\
2. Key decisions made\n\
3. Files modified or created\n\
4. Current state and progress\n\n\
Write a brief paragraph (at most 200 words) that can replace the full conversation history.";

pub const ACKNOWLEDGEMENT: &str = "I understand the context. I'm ready to continue helping.";

/// `role: text` lines for the last messages that carry text.
pub fn transcript(messages: &[ChatMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .filter_map(|msg| {
            let text = msg.text();
            if text.is_empty() {
                return None;
            }
            let cut: String = text.chars().take(MESSAGE_CHARS).collect();
            Some(format!("{}: {cut}", msg.role()))
        })
        .collect();
    let start = lines.len().saturating_sub(TRANSCRIPT_MESSAGES);
    lines[start..].join("\n")
}

/// Ask the model for a summary of `messages`.
pub fn summarize(llm: &dyn LlmClient, model: &str, messages: &[ChatMessage]) -> Result<String> {
    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage::system(COMPACT_PROMPT),
            ChatMessage::user(transcript(messages)),
        ],
        tools: Vec::new(),
        max_tokens: 1024,
        temperature: Some(0.0),
    };
    let summary = llm.complete_chat(&request)?.text.trim().to_string();
    if summary.is_empty() {
        bail!("the model returned an empty summary");
    }
    Ok(summary)
}

/// The replacement history: the original system prompt (if any), the
/// summary as a user message, and a fixed acknowledgement.
pub fn apply_compact(messages: &[ChatMessage], summary: &str) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = messages
        .iter()
        .find(|msg| matches!(msg, ChatMessage::System { .. }))
        .cloned()
        .into_iter()
        .collect();
    out.push(ChatMessage::user(format!(
        "[Previous conversation summary]\n{summary}\n\n[Continuing from here]"
    )));
    out.push(ChatMessage::Assistant {
        content: Some(ACKNOWLEDGEMENT.to_string()),
        tool_calls: Vec::new(),
    });
    out
}

/// Summarize and replace. `Ok(None)` when the conversation is too short.
pub fn compact(
    llm: &dyn LlmClient,
    model: &str,
    messages: &[ChatMessage],
) -> Result<Option<(Vec<ChatMessage>, String)>> {
    if messages.len() < MIN_MESSAGES {
        return Ok(None);
    }
    let summary = summarize(llm, model, messages)?;
    Ok(Some((apply_compact(messages, &summary), summary)))
}
