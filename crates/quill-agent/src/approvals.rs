//! Interactive permission prompts.

use crate::tool_loop::{ApprovalAnswer, ApprovalCallback};
use quill_policy::call_target;
use serde_json::Value;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

const TARGET_PREVIEW_CHARS: usize = 50;

/// Shows the pending call on `output` and reads one answer line from `input`.
/// Anything other than `y` or `a` (including EOF) is a refusal.
pub fn prompt_approval(
    tool: &str,
    args: &Value,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> ApprovalAnswer {
    let _ = writeln!(output, "\n\x1b[33m! Permission required:\x1b[0m");
    let _ = writeln!(output, "  Tool: \x1b[36m{tool}\x1b[0m");
    if let Some(target) = call_target(args) {
        let preview: String = target.as_str().chars().take(TARGET_PREVIEW_CHARS).collect();
        let _ = writeln!(output, "  Target: \x1b[2m{preview}\x1b[0m");
    }
    let _ = write!(output, "\x1b[33mAllow? (y/n/a=always): \x1b[0m");
    let _ = output.flush();

    let mut line = String::new();
    if input.read_line(&mut line).unwrap_or(0) == 0 {
        return ApprovalAnswer::Deny;
    }
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalAnswer::Once,
        "a" | "always" => {
            let _ = writeln!(output, "\x1b[32mAuto-approving all {tool} calls\x1b[0m");
            ApprovalAnswer::Always
        }
        _ => ApprovalAnswer::Deny,
    }
}

/// Prompts on stderr and reads stdin. When stdin is not a terminal nobody can
/// answer, so every call is refused.
pub fn terminal_approval() -> ApprovalCallback {
    Arc::new(|tool, args| {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return ApprovalAnswer::Deny;
        }
        prompt_approval(tool, args, &mut stdin.lock(), &mut io::stderr())
    })
}
