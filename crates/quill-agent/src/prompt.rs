//! System prompt assembly.

use std::fs;
use std::path::Path;

/// Project instruction files, in lookup order. Only the first one found is used.
pub const CONTEXT_FILES: &[&str] = &["QUILL.md", ".quill.md", "CLAUDE.md", "AGENTS.md"];

const GUIDELINES: &str = "\
Guidelines:
- Be concise and direct
- Use tools to explore and modify code instead of guessing
- Read a file before editing it
- Explain changes briefly
- Use bash for running commands, tests and builds
- Use the git tools to check status and review diffs
- Use the think tool for complex reasoning";

/// The first project context file present in `workspace`, as `(name, contents)`.
pub fn project_context(workspace: &Path) -> Option<(&'static str, String)> {
    CONTEXT_FILES.iter().find_map(|name| {
        let path = workspace.join(name);
        if !path.is_file() {
            return None;
        }
        fs::read_to_string(&path).ok().map(|text| (*name, text))
    })
}

pub fn build_system_prompt(workspace: &Path, tool_names: &[String]) -> String {
    let mut prompt = format!(
        "You are {}, an expert coding assistant working directly in the user's terminal.\n\n\
         Current working directory: {}\n",
        quill_core::APP_NAME,
        workspace.display()
    );
    if let Some((name, text)) = project_context(workspace) {
        prompt.push_str(&format!(
            "\n<project_context file=\"{name}\">\n{}\n</project_context>\n",
            text.trim_end()
        ));
    }
    prompt.push('\n');
    prompt.push_str(GUIDELINES);
    prompt.push_str("\n\nAvailable tools: ");
    prompt.push_str(&tool_names.join(", "));
    prompt
}
