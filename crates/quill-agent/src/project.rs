//! `/init`: bootstrap a project context file without calling the model.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONTEXT_FILE: &str = "QUILL.md";

const MAX_ENTRIES: usize = 30;

const STACK_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "Rust"),
    ("package.json", "Node.js"),
    ("tsconfig.json", "TypeScript"),
    ("pyproject.toml", "Python"),
    ("setup.py", "Python"),
    ("requirements.txt", "Python"),
    ("go.mod", "Go"),
    ("pom.xml", "Java"),
    ("build.gradle", "Java"),
    ("Gemfile", "Ruby"),
];

const SKIPPED_ENTRIES: &[&str] = &[
    "node_modules",
    "target",
    "__pycache__",
    "venv",
    "dist",
    "build",
];

/// Languages whose marker files sit at the workspace root, deduplicated.
pub fn detect_stack(workspace: &Path) -> Vec<&'static str> {
    let mut stack = Vec::new();
    for (marker, language) in STACK_MARKERS {
        if workspace.join(marker).exists() && !stack.contains(language) {
            stack.push(*language);
        }
    }
    stack
}

/// Visible top-level entries, directories suffixed with `/`.
fn top_level_entries(workspace: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(workspace)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIPPED_ENTRIES.contains(&name.as_str()) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            entries.push(format!("{name}/"));
        } else {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

pub fn render_context(workspace: &Path) -> Result<String> {
    let name = workspace
        .canonicalize()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "project".to_string());

    let mut out = format!("# Project Context\n\nProject: **{name}**\n");
    let stack = detect_stack(workspace);
    if !stack.is_empty() {
        out.push_str(&format!("\nStack: {}\n", stack.join(", ")));
    }

    let entries = top_level_entries(workspace)?;
    if !entries.is_empty() {
        out.push_str("\n## Layout\n\n");
        for entry in entries.iter().take(MAX_ENTRIES) {
            out.push_str(&format!("- {entry}\n"));
        }
        if entries.len() > MAX_ENTRIES {
            out.push_str(&format!("- ... and {} more\n", entries.len() - MAX_ENTRIES));
        }
    }

    out.push_str(
        "\n## Guidelines\n\n\
         - Follow existing code style\n\
         - Write tests for new features\n\
         - Keep commits atomic\n\
         \n## Commands\n\n\
         ```bash\n# Add your common commands here\n```\n",
    );
    Ok(out)
}

/// Writes `QUILL.md` into `workspace`. An existing file is never overwritten.
pub fn quick_init(workspace: &Path) -> Result<PathBuf> {
    let path = workspace.join(CONTEXT_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let content = render_context(workspace)?;
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stack_and_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("Cargo.toml"), "[package]\n").expect("write");
        fs::write(dir.path().join("package.json"), "{}").expect("write");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::create_dir_all(dir.path().join("target")).expect("mkdir");
        fs::create_dir_all(dir.path().join(".git")).expect("mkdir");

        assert_eq!(detect_stack(dir.path()), vec!["Rust", "Node.js"]);
        let text = render_context(dir.path()).expect("render");
        assert!(text.starts_with("# Project Context\n\nProject: **"));
        assert!(text.contains("Stack: Rust, Node.js\n"));
        assert!(text.contains("## Layout\n\n- Cargo.toml\n- package.json\n- src/\n"));
        assert!(!text.contains("target"));
        assert!(!text.contains(".git"));
        assert!(text.contains("## Commands"));
    }

    #[test]
    fn quick_init_writes_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = quick_init(dir.path()).expect("init");
        assert_eq!(path, dir.path().join(CONTEXT_FILE));
        assert!(fs::read_to_string(&path).expect("read").contains("## Guidelines"));

        fs::write(&path, "custom").expect("write");
        assert!(quick_init(dir.path()).is_err());
        assert_eq!(fs::read_to_string(&path).expect("read"), "custom");
    }

    #[test]
    fn long_layouts_are_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..35 {
            fs::write(dir.path().join(format!("file{i:02}.txt")), "").expect("write");
        }
        let text = render_context(dir.path()).expect("render");
        assert!(text.contains("- file29.txt\n- ... and 5 more\n"));
        assert!(!text.contains("file30.txt"));
    }
}
