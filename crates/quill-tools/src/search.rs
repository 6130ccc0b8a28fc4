use crate::{ToolContext, opt_str, opt_u64, req_str};
use anyhow::{Result, anyhow};
use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const MAX_RESULTS: usize = 50;
const BINARY_PROBE_BYTES: usize = 8192;

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn should_skip(rel: &Path) -> bool {
    rel.components().any(|c| {
        c.as_os_str() == ".git" || c.as_os_str() == ".quill" || c.as_os_str() == "target"
    })
}

/// Every entry under `root`, honouring `.gitignore` files.
fn walk_paths(root: &Path) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(false);
    builder.follow_links(false);
    builder.require_git(false);

    let mut paths = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if rel.as_os_str().is_empty() || should_skip(rel) {
            continue;
        }
        paths.push(path.to_path_buf());
    }
    paths
}

fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_PROBE_BYTES).any(|b| *b == 0)
}

pub(crate) fn glob(ctx: &ToolContext, args: &Value) -> Result<String> {
    let pattern = req_str(args, "pattern")?;
    let base = ctx.resolve(opt_str(args, "path").unwrap_or("."));
    let compiled = Pattern::new(pattern)
        .map_err(|err| anyhow!("invalid glob pattern '{pattern}': {err}"))?;
    let mut matches: Vec<(SystemTime, PathBuf)> = walk_paths(&base)
        .into_iter()
        .filter(|path| {
            path.strip_prefix(&base)
                .map(|rel| compiled.matches_with(&normalize_rel_path(rel), PATH_MATCH))
                .unwrap_or(false)
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .ok()
                .filter(|m| m.is_file())
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();
    matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    if matches.is_empty() {
        return Ok("no files found".to_string());
    }
    Ok(matches
        .iter()
        .take(MAX_RESULTS)
        .map(|(_, path)| ctx.display(path))
        .collect::<Vec<_>>()
        .join("\n"))
}

pub(crate) fn grep(ctx: &ToolContext, args: &Value) -> Result<String> {
    let pattern = req_str(args, "pattern")?;
    let regex =
        Regex::new(pattern).map_err(|err| anyhow!("invalid regex '{pattern}': {err}"))?;
    let base = ctx.resolve(opt_str(args, "path").unwrap_or("."));
    let context = opt_u64(args, "context").unwrap_or(0) as usize;

    let files = if base.is_file() {
        vec![base.clone()]
    } else {
        walk_paths(&base)
    };
    let mut hits = Vec::new();
    'files: for path in files {
        if !path.is_file() {
            continue;
        }
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        if is_binary(&bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let shown = ctx.display(&path);
        for (idx, line) in lines.iter().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if context > 0 {
                let start = idx.saturating_sub(context);
                let end = (idx + context + 1).min(lines.len());
                let snippet: Vec<String> =
                    lines[start..end].iter().map(|l| format!("  {l}")).collect();
                hits.push(format!("{shown}:{}:\n{}", idx + 1, snippet.join("\n")));
            } else {
                hits.push(format!("{shown}:{}: {}", idx + 1, line.trim_end()));
            }
            if hits.len() >= MAX_RESULTS {
                break 'files;
            }
        }
    }
    if hits.is_empty() {
        return Ok("no matches found".to_string());
    }
    Ok(hits.join("\n"))
}

pub(crate) fn find(ctx: &ToolContext, args: &Value) -> Result<String> {
    let name = req_str(args, "name")?;
    let base = ctx.resolve(opt_str(args, "path").unwrap_or("."));
    let kind = opt_str(args, "type").unwrap_or("all");
    let compiled =
        Pattern::new(name).map_err(|err| anyhow!("invalid name pattern '{name}': {err}"))?;
    let mut results = Vec::new();
    for path in walk_paths(&base) {
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if !compiled.matches(&file_name.to_string_lossy()) {
            continue;
        }
        let keep = match kind {
            "file" => path.is_file(),
            "dir" => path.is_dir(),
            _ => true,
        };
        if keep {
            results.push(ctx.display(&path));
            if results.len() >= MAX_RESULTS {
                break;
            }
        }
    }
    results.sort();
    if results.is_empty() {
        return Ok("no files found".to_string());
    }
    Ok(results.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::temp_ctx;
    use serde_json::json;

    fn seed(dir: &Path) {
        fs::create_dir_all(dir.join("src/nested")).expect("mkdir");
        fs::write(dir.join("src/main.rs"), "fn main() {\n    helper();\n}\n").expect("seed");
        fs::write(dir.join("src/nested/util.rs"), "pub fn helper() {}\n").expect("seed");
        fs::write(dir.join("README.md"), "# demo\n").expect("seed");
    }

    #[test]
    fn glob_star_stays_in_one_directory() {
        let (dir, ctx) = temp_ctx();
        seed(dir.path());
        assert_eq!(
            glob(&ctx, &json!({"pattern": "*.md"})).expect("glob"),
            "README.md"
        );
        let mut all: Vec<String> = glob(&ctx, &json!({"pattern": "**/*.rs"}))
            .expect("glob")
            .lines()
            .map(str::to_string)
            .collect();
        all.sort();
        assert_eq!(all, vec!["src/main.rs", "src/nested/util.rs"]);
        assert_eq!(
            glob(&ctx, &json!({"pattern": "*.py"})).expect("glob"),
            "no files found"
        );
    }

    #[test]
    fn glob_respects_gitignore() {
        let (dir, ctx) = temp_ctx();
        seed(dir.path());
        fs::write(dir.path().join(".gitignore"), "src/nested/\n").expect("ignore");
        assert_eq!(
            glob(&ctx, &json!({"pattern": "**/*.rs"})).expect("glob"),
            "src/main.rs"
        );
    }

    #[test]
    fn grep_reports_path_and_line() {
        let (dir, ctx) = temp_ctx();
        seed(dir.path());
        let out = grep(&ctx, &json!({"pattern": "fn helper", "path": "src"})).expect("grep");
        assert_eq!(out, "src/nested/util.rs:1: pub fn helper() {}");
        let out = grep(&ctx, &json!({"pattern": "helper\\(\\);", "context": 1})).expect("grep");
        assert_eq!(out, "src/main.rs:2:\n  fn main() {\n      helper();\n  }");
        assert_eq!(
            grep(&ctx, &json!({"pattern": "nothing_here"})).expect("grep"),
            "no matches found"
        );
        assert!(grep(&ctx, &json!({"pattern": "("})).is_err());
    }

    #[test]
    fn find_filters_by_type() {
        let (dir, ctx) = temp_ctx();
        seed(dir.path());
        assert_eq!(
            find(&ctx, &json!({"name": "nest*", "type": "dir"})).expect("find"),
            "src/nested"
        );
        assert_eq!(
            find(&ctx, &json!({"name": "nest*", "type": "file"})).expect("find"),
            "no files found"
        );
        assert_eq!(
            find(&ctx, &json!({"name": "*.rs"})).expect("find"),
            "src/main.rs\nsrc/nested/util.rs"
        );
    }
}
