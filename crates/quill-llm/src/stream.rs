//! Incremental decoder for server-sent-event chat completion streams.

use quill_core::LlmToolCall;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, Lines};

/// One decoded step of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A text fragment, emitted as soon as it arrives.
    Content(String),
    /// Every tool call the stream carried, ordered by slot index. Arguments
    /// are still raw text.
    ToolCalls(Vec<LlmToolCall>),
    /// Always the last event: the concatenated text of the response.
    Done(String),
}

#[derive(Default)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reading,
    ToolCalls,
    Done,
    Finished,
}

/// Pulls lines from an SSE body and yields [`StreamEvent`]s lazily.
///
/// Lines without a `data:` prefix are ignored, `data: [DONE]` ends the stream,
/// and payloads that fail to parse are skipped. A read error is treated as the
/// end of the stream and is available afterwards through [`Self::read_error`].
pub struct SseDecoder<R> {
    lines: Lines<R>,
    phase: Phase,
    text: String,
    slots: BTreeMap<u64, StreamToolCall>,
    finish_reason: Option<String>,
    read_error: Option<std::io::Error>,
}

impl<R: BufRead> SseDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            phase: Phase::Reading,
            text: String::new(),
            slots: BTreeMap::new(),
            finish_reason: None,
            read_error: None,
        }
    }

    /// The last `finish_reason` reported by the provider, if any.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn read_error(&self) -> Option<&std::io::Error> {
        self.read_error.as_ref()
    }

    fn next_content(&mut self) -> Option<String> {
        loop {
            let line = match self.lines.next() {
                None => return None,
                Some(Err(err)) => {
                    self.read_error = Some(err);
                    return None;
                }
                Some(Ok(line)) => line,
            };
            let trimmed = line.trim();
            let Some(payload) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                return None;
            }
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let Some(choice) = value
                .get("choices")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
            else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                merge_stream_tool_calls(tool_calls, &mut self.slots);
            }
            if let Some(content) = delta.get("content").and_then(|v| v.as_str())
                && !content.is_empty()
            {
                self.text.push_str(content);
                return Some(content.to_string());
            }
        }
    }
}

impl<R: BufRead> Iterator for SseDecoder<R> {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        loop {
            match self.phase {
                Phase::Reading => match self.next_content() {
                    Some(fragment) => return Some(StreamEvent::Content(fragment)),
                    None => self.phase = Phase::ToolCalls,
                },
                Phase::ToolCalls => {
                    self.phase = Phase::Done;
                    if !self.slots.is_empty() {
                        let calls = std::mem::take(&mut self.slots)
                            .into_iter()
                            .map(|(index, slot)| LlmToolCall {
                                id: slot.id.unwrap_or_else(|| format!("call_{index}")),
                                name: slot.name,
                                arguments: slot.arguments,
                            })
                            .collect();
                        return Some(StreamEvent::ToolCalls(calls));
                    }
                }
                Phase::Done => {
                    self.phase = Phase::Finished;
                    return Some(StreamEvent::Done(std::mem::take(&mut self.text)));
                }
                Phase::Finished => return None,
            }
        }
    }
}

fn merge_stream_tool_calls(chunks: &[Value], out: &mut BTreeMap<u64, StreamToolCall>) {
    for item in chunks {
        let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let entry = out.entry(index).or_default();
        if let Some(id) = item.get("id").and_then(|v| v.as_str())
            && !id.trim().is_empty()
        {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = item.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str())
                && !name.trim().is_empty()
            {
                entry.name = name.to_string();
            }
            if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(arguments);
            }
        }
    }
}
