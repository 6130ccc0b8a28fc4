//! Terminal rendering: streamed turns, tables, and status lines.

use quill_core::{SessionRecord, SessionStats, StreamCallback, StreamChunk};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

pub fn success(message: &str) {
    println!("\x1b[32m+\x1b[0m {message}");
}

pub fn error(message: &str) {
    eprintln!("\x1b[31mx\x1b[0m {message}");
}

pub fn info(message: &str) {
    println!("{DIM}{message}{RESET}");
}

/// Whether assistant text is mid-line, so tool lines and `Done` can start
/// on a fresh line.
#[derive(Debug, Default)]
pub struct RenderState {
    in_text: bool,
}

pub fn render_chunk(out: &mut dyn Write, state: &mut RenderState, chunk: &StreamChunk) {
    match chunk {
        StreamChunk::ContentDelta(text) => {
            if text.is_empty() {
                return;
            }
            if !state.in_text {
                let _ = write!(out, "\n\x1b[36m*\x1b[0m ");
                state.in_text = true;
            }
            let _ = write!(out, "{text}");
        }
        StreamChunk::ToolCallStart {
            tool_name,
            args_summary,
        } => {
            if state.in_text {
                let _ = writeln!(out);
                state.in_text = false;
            }
            let _ = writeln!(
                out,
                "\x1b[32m> {tool_name}\x1b[0m({DIM}{args_summary}{RESET})"
            );
        }
        StreamChunk::ToolCallEnd {
            duration_ms,
            success,
            summary,
            ..
        } => {
            let color = if *success { DIM } else { "\x1b[31m" };
            let _ = writeln!(out, "   {color}-> {summary} ({duration_ms}ms){RESET}");
        }
        StreamChunk::Done => {
            if state.in_text {
                let _ = writeln!(out);
                state.in_text = false;
            }
        }
    }
    let _ = out.flush();
}

/// Stream callback printing to stdout.
pub fn stdout_callback() -> StreamCallback {
    let state = Mutex::new(RenderState::default());
    Arc::new(move |chunk| {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        render_chunk(&mut io::stdout().lock(), &mut state, &chunk);
    })
}

pub fn header(model: &str, cwd: &str, mode: &str) -> String {
    format!(
        "\x1b[1mquill\x1b[0m v{}\n{DIM}model: {model} | permissions: {mode}\ncwd: {cwd}{RESET}",
        quill_core::APP_VERSION
    )
}

pub fn sessions_table(sessions: &[SessionRecord]) -> String {
    if sessions.is_empty() {
        return "No sessions found".to_string();
    }
    let width = sessions
        .iter()
        .map(|s| s.id.chars().count())
        .max()
        .unwrap_or(0)
        .max("SESSION".len());
    let mut lines = vec![format!(
        "{:<width$}  {:>8}  {:<16}  MODEL",
        "SESSION", "MESSAGES", "UPDATED"
    )];
    for session in sessions {
        lines.push(format!(
            "{:<width$}  {:>8}  {:<16}  {}",
            session.id,
            session.message_count,
            session.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            session.model
        ));
    }
    lines.join("\n")
}

pub fn stats(session_id: &str, stats: &SessionStats) -> String {
    format!(
        "Session: {session_id}\n\
         Messages: {} (user {}, assistant {}, tool {})\n\
         File changes: {}",
        stats.total_messages(),
        stats.user_messages,
        stats.assistant_messages,
        stats.tool_messages,
        stats.file_changes
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn render_all(chunks: &[StreamChunk]) -> String {
        let mut out = Vec::new();
        let mut state = RenderState::default();
        for chunk in chunks {
            render_chunk(&mut out, &mut state, chunk);
        }
        String::from_utf8_lossy(&out).to_string()
    }

    #[test]
    fn text_and_tools_interleave_on_separate_lines() {
        let shown = render_all(&[
            StreamChunk::ContentDelta("Let me ".to_string()),
            StreamChunk::ContentDelta("look.".to_string()),
            StreamChunk::ToolCallStart {
                tool_name: "read".to_string(),
                args_summary: "path=a.rs".to_string(),
            },
            StreamChunk::ToolCallEnd {
                tool_name: "read".to_string(),
                duration_ms: 3,
                success: true,
                summary: "1: fn main() {}".to_string(),
            },
            StreamChunk::Done,
            StreamChunk::ContentDelta("Done.".to_string()),
            StreamChunk::Done,
        ]);
        assert_eq!(
            shown,
            "\n\x1b[36m*\x1b[0m Let me look.\n\
             \x1b[32m> read\x1b[0m(\x1b[2mpath=a.rs\x1b[0m)\n   \
             \x1b[2m-> 1: fn main() {} (3ms)\x1b[0m\n\
             \n\x1b[36m*\x1b[0m Done.\n"
        );
    }

    #[test]
    fn failed_tools_are_red() {
        let shown = render_all(&[StreamChunk::ToolCallEnd {
            tool_name: "bash".to_string(),
            duration_ms: 10,
            success: false,
            summary: "error: boom".to_string(),
        }]);
        assert!(shown.starts_with("   \x1b[31m-> error: boom"));
    }

    #[test]
    fn sessions_table_lists_rows() {
        assert_eq!(sessions_table(&[]), "No sessions found");
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        let table = sessions_table(&[SessionRecord {
            id: "default".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            cwd: "/ws".to_string(),
            created_at: at,
            updated_at: at,
            message_count: 12,
        }]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "SESSION  MESSAGES  UPDATED           MODEL");
        assert_eq!(
            lines[1],
            "default        12  2026-03-04 05:06  openai/gpt-4o-mini"
        );
    }

    #[test]
    fn stats_summarize_counts() {
        let text = stats(
            "s",
            &SessionStats {
                user_messages: 2,
                assistant_messages: 3,
                tool_messages: 1,
                file_changes: 4,
            },
        );
        assert!(text.contains("Messages: 6 (user 2, assistant 3, tool 1)"));
        assert!(text.ends_with("File changes: 4"));
    }
}
