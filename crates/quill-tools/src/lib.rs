//! Local tool catalogue and the dispatcher that routes model tool calls to
//! local handlers or external providers.

mod background;
mod fs;
mod git;
mod search;
mod shell;
mod watch;
mod web;

use anyhow::{Result, anyhow};
use quill_core::{ChangeTracker, ToolDefinition, ToolsConfig};
use quill_mcp::{SharedMcpClient, is_mcp_tool_name};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

pub use background::BackgroundJobs;
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner, format_run_output};
pub use watch::{ChangeKind, FileChange, FileWatcher, summarize};

/// Tools whose successful runs are reported to the change tracker.
const MUTATING_TOOLS: &[&str] = &["write", "edit", "patch"];

pub type ToolHandler = fn(&ToolContext, &Value) -> Result<String>;

/// A registered tool: declared parameters are `(name, type)` pairs where a
/// trailing `?` on the type marks the parameter optional.
#[derive(Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [(&'static str, &'static str)],
    pub category: &'static str,
    pub handler: ToolHandler,
}

impl ToolSpec {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(self.name, self.description, parameter_schema(self.params))
    }
}

/// JSON-schema object for declared parameters. `number` maps to `integer`.
pub fn parameter_schema(params: &[(&str, &str)]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, ty) in params {
        let optional = ty.ends_with('?');
        let base = ty.trim_end_matches('?');
        let json_type = if base == "number" { "integer" } else { base };
        properties.insert((*name).to_string(), json!({"type": json_type}));
        if !optional {
            required.push(Value::String((*name).to_string()));
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

fn think(_ctx: &ToolContext, _args: &Value) -> Result<String> {
    Ok("ok".to_string())
}

fn bash(ctx: &ToolContext, args: &Value) -> Result<String> {
    let command = req_str(args, "command")?;
    let cwd = ctx.resolve(opt_str(args, "cwd").unwrap_or("."));
    let timeout = Duration::from_secs(opt_u64(args, "timeout").unwrap_or(ctx.settings.bash_timeout));
    let result = ctx.runner.run(command, &cwd, timeout, &ctx.interrupt)?;
    Ok(format_run_output(&result, timeout, ctx.settings.max_output_lines))
}

fn bash_bg(ctx: &ToolContext, args: &Value) -> Result<String> {
    let command = req_str(args, "command")?;
    let cwd = ctx.resolve(opt_str(args, "cwd").unwrap_or("."));
    ctx.jobs.start(command, &cwd, opt_str(args, "name"))
}

fn watch_tool(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = opt_str(args, "path").unwrap_or(".");
    let path = ctx.resolve(raw);
    if !path.exists() {
        return Err(anyhow!("path not found: {raw}"));
    }
    ctx.watcher.watch(&path);
    ctx.watcher.start();
    Ok(format!("ok: watching {raw} for changes"))
}

fn changes_tool(ctx: &ToolContext, args: &Value) -> Result<String> {
    if let Some(raw) = opt_str(args, "path") {
        ctx.watcher.watch(&ctx.resolve(raw));
    }
    Ok(ctx.watcher.summary())
}

const BUILTIN_TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "read",
        description: "Read file contents with line numbers",
        params: &[("path", "string"), ("offset", "number?"), ("limit", "number?")],
        category: "file",
        handler: fs::read,
    },
    ToolSpec {
        name: "write",
        description: "Write content to a file (creates directories if needed)",
        params: &[("path", "string"), ("content", "string")],
        category: "file",
        handler: fs::write,
    },
    ToolSpec {
        name: "edit",
        description: "Replace text in file (old must be unique unless all=true)",
        params: &[("path", "string"), ("old", "string"), ("new", "string"), ("all", "string?")],
        category: "file",
        handler: fs::edit,
    },
    ToolSpec {
        name: "patch",
        description: "Apply a unified diff patch to a file",
        params: &[("path", "string"), ("patch", "string")],
        category: "file",
        handler: fs::patch,
    },
    ToolSpec {
        name: "ls",
        description: "List directory contents",
        params: &[("path", "string?")],
        category: "file",
        handler: fs::ls,
    },
    ToolSpec {
        name: "glob",
        description: "Find files matching pattern, sorted by modification time",
        params: &[("pattern", "string"), ("path", "string?")],
        category: "search",
        handler: search::glob,
    },
    ToolSpec {
        name: "grep",
        description: "Search files for regex pattern",
        params: &[("pattern", "string"), ("path", "string?"), ("context", "number?")],
        category: "search",
        handler: search::grep,
    },
    ToolSpec {
        name: "find",
        description: "Find files by name pattern",
        params: &[("name", "string"), ("path", "string?"), ("type", "string?")],
        category: "search",
        handler: search::find,
    },
    ToolSpec {
        name: "bash",
        description: "Execute shell command",
        params: &[("command", "string"), ("cwd", "string?"), ("timeout", "number?")],
        category: "shell",
        handler: bash,
    },
    ToolSpec {
        name: "bash_bg",
        description: "Run command in background (for servers). Use /stop to kill later",
        params: &[("command", "string"), ("name", "string?"), ("cwd", "string?")],
        category: "shell",
        handler: bash_bg,
    },
    ToolSpec {
        name: "fetch",
        description: "Fetch URL content",
        params: &[("url", "string")],
        category: "web",
        handler: web::fetch,
    },
    ToolSpec {
        name: "git_status",
        description: "Get git repository status",
        params: &[("path", "string?")],
        category: "git",
        handler: git::status,
    },
    ToolSpec {
        name: "git_diff",
        description: "Show git diff for file or all changes",
        params: &[("file", "string?"), ("staged", "string?")],
        category: "git",
        handler: git::diff,
    },
    ToolSpec {
        name: "git_log",
        description: "Show git commit history",
        params: &[("count", "number?"), ("oneline", "string?")],
        category: "git",
        handler: git::log,
    },
    ToolSpec {
        name: "git_commit",
        description: "Create a git commit with message",
        params: &[("message", "string"), ("all", "string?")],
        category: "git",
        handler: git::commit,
    },
    ToolSpec {
        name: "git_add",
        description: "Stage files for commit",
        params: &[("files", "string")],
        category: "git",
        handler: git::add,
    },
    ToolSpec {
        name: "think",
        description: "Think through a complex problem step by step",
        params: &[("thought", "string")],
        category: "reasoning",
        handler: think,
    },
    ToolSpec {
        name: "watch",
        description: "Start watching a directory for file changes",
        params: &[("path", "string?")],
        category: "watcher",
        handler: watch_tool,
    },
    ToolSpec {
        name: "changes",
        description: "Check for recent file changes",
        params: &[("path", "string?")],
        category: "watcher",
        handler: changes_tool,
    },
];

/// Name-indexed tool catalogue, kept in registration order.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn builtin() -> Self {
        Self {
            tools: BUILTIN_TOOLS.to_vec(),
        }
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, spec: ToolSpec) {
        match self.tools.iter_mut().find(|t| t.name == spec.name) {
            Some(slot) => *slot = spec,
            None => self.tools.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.iter().map(|t| t.name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    pub fn by_category(&self) -> BTreeMap<&'static str, Vec<&ToolSpec>> {
        let mut out: BTreeMap<&'static str, Vec<&ToolSpec>> = BTreeMap::new();
        for tool in &self.tools {
            out.entry(tool.category).or_default().push(tool);
        }
        out
    }
}

/// Everything a local tool handler may touch.
pub struct ToolContext {
    pub workspace: PathBuf,
    pub settings: ToolsConfig,
    pub runner: Arc<dyn ShellRunner>,
    pub jobs: BackgroundJobs,
    pub watcher: FileWatcher,
    pub http: reqwest::blocking::Client,
    pub interrupt: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(workspace: &Path, settings: ToolsConfig, interrupt: Arc<AtomicBool>) -> Result<Self> {
        Self::with_runner(workspace, settings, interrupt, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        settings: ToolsConfig,
        interrupt: Arc<AtomicBool>,
        runner: Arc<dyn ShellRunner>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout))
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            settings,
            runner,
            jobs: BackgroundJobs::new(),
            watcher: FileWatcher::new(),
            http,
            interrupt,
        })
    }

    /// Relative paths are taken from the workspace root.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Workspace-relative form of `path` for tool output.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.workspace) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().replace('\\', "/"),
            _ => path.display().to_string(),
        }
    }
}

/// Routes tool calls by name. Results are always text: failures come back
/// as `error: ...` strings instead of `Err`.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    ctx: ToolContext,
    mcp: Option<SharedMcpClient>,
    tracker: Option<Arc<dyn ChangeTracker>>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, ctx: ToolContext) -> Self {
        Self {
            registry,
            ctx,
            mcp: None,
            tracker: None,
        }
    }

    pub fn with_mcp(mut self, mcp: SharedMcpClient) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Local definitions followed by every discovered provider tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.registry.definitions();
        if let Some(mcp) = &self.mcp {
            let client = mcp.read().unwrap_or_else(PoisonError::into_inner);
            defs.extend(client.tool_definitions());
        }
        defs
    }

    pub fn execute(&self, name: &str, args: &Value, session: Option<&str>) -> String {
        if is_mcp_tool_name(name)
            && let Some(mcp) = &self.mcp
        {
            let client = mcp.read().unwrap_or_else(PoisonError::into_inner);
            return match client.call_api_tool(name, args) {
                Ok(text) => text,
                Err(err) => format!("error: {err}"),
            };
        }
        let Some(spec) = self.registry.get(name) else {
            return unknown_tool_message(name, self.registry.names());
        };
        match (spec.handler)(&self.ctx, args) {
            Ok(output) => {
                self.track(name, args, session);
                output
            }
            Err(err) => format!("error: {err:#}"),
        }
    }

    fn track(&self, name: &str, args: &Value, session: Option<&str>) {
        if !MUTATING_TOOLS.contains(&name) {
            return;
        }
        if let (Some(tracker), Some(session), Some(path)) =
            (&self.tracker, session, opt_str(args, "path"))
        {
            let _ = tracker.track_change(session, path, name);
        }
    }

    /// Stop background jobs and the file watcher.
    pub fn shutdown(&self) -> String {
        self.ctx.watcher.stop();
        self.ctx.jobs.stop_all()
    }
}

fn unknown_tool_message<'a>(name: &str, known: impl Iterator<Item = &'a str>) -> String {
    let suggestion = known
        .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance);
    match suggestion {
        Some((_, candidate)) => {
            format!("error: unknown tool '{name}' (did you mean '{candidate}'?)")
        }
        None => format!("error: unknown tool '{name}'"),
    }
}

pub(crate) fn req_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required parameter '{key}'"))
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Integers may arrive as JSON numbers or numeric strings.
pub(crate) fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    match args.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flags may arrive as JSON booleans or the string `"true"`.
pub(crate) fn opt_bool(args: &Value, key: &str) -> bool {
    match args.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) fn temp_ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ToolContext::new(dir.path(), ToolsConfig::default(), Arc::default())
            .expect("context");
        (dir, ctx)
    }

    #[derive(Default)]
    struct RecordingTracker {
        changes: Mutex<Vec<(String, String, String)>>,
    }

    impl ChangeTracker for RecordingTracker {
        fn track_change(&self, session_id: &str, path: &str, action: &str) -> Result<()> {
            self.changes.lock().expect("lock").push((
                session_id.to_string(),
                path.to_string(),
                action.to_string(),
            ));
            Ok(())
        }
    }

    #[test]
    fn schema_marks_optional_params_and_maps_number() {
        let schema = parameter_schema(&[("path", "string"), ("limit", "number?")]);
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        assert_eq!(schema["properties"]["path"]["type"], "string");
        assert_eq!(schema["required"], json!(["path"]));
    }

    #[test]
    fn builtin_catalogue_is_complete() {
        let names: Vec<&str> = ToolRegistry::builtin().names().collect();
        for expected in [
            "read", "write", "edit", "patch", "ls", "glob", "grep", "find", "bash", "bash_bg",
            "fetch", "git_status", "git_diff", "git_log", "git_commit", "git_add", "think",
            "watch", "changes",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(ToolRegistry::builtin().by_category()["git"].len(), 5);
    }

    #[test]
    fn unknown_tools_get_a_suggestion() {
        let (_dir, ctx) = temp_ctx();
        let dispatcher = ToolDispatcher::new(ToolRegistry::builtin(), ctx);
        assert_eq!(
            dispatcher.execute("raed", &json!({}), None),
            "error: unknown tool 'raed' (did you mean 'read'?)"
        );
        assert_eq!(
            dispatcher.execute("launch_rockets", &json!({}), None),
            "error: unknown tool 'launch_rockets'"
        );
        assert_eq!(
            dispatcher.execute("mcp__nobody__x", &json!({}), None),
            "error: unknown tool 'mcp__nobody__x'"
        );
    }

    #[test]
    fn handler_errors_become_error_strings() {
        let (_dir, ctx) = temp_ctx();
        let dispatcher = ToolDispatcher::new(ToolRegistry::builtin(), ctx);
        assert_eq!(
            dispatcher.execute("read", &json!({}), None),
            "error: missing required parameter 'path'"
        );
        assert_eq!(dispatcher.execute("think", &json!({"thought": "hm"}), None), "ok");
    }

    #[test]
    fn successful_mutations_are_tracked() {
        let (_dir, ctx) = temp_ctx();
        let tracker = Arc::new(RecordingTracker::default());
        let dispatcher =
            ToolDispatcher::new(ToolRegistry::builtin(), ctx).with_tracker(tracker.clone());
        dispatcher.execute("write", &json!({"path": "a.txt", "content": "x"}), Some("s1"));
        dispatcher.execute("edit", &json!({"path": "a.txt", "old": "zzz", "new": "y"}), Some("s1"));
        dispatcher.execute("edit", &json!({"path": "a.txt", "old": "x", "new": "y"}), Some("s1"));
        dispatcher.execute("read", &json!({"path": "a.txt"}), Some("s1"));
        let changes = tracker.changes.lock().expect("lock").clone();
        assert_eq!(
            changes,
            vec![
                ("s1".to_string(), "a.txt".to_string(), "write".to_string()),
                ("s1".to_string(), "a.txt".to_string(), "edit".to_string()),
            ]
        );
    }

    struct CannedRunner;

    impl ShellRunner for CannedRunner {
        fn run(
            &self,
            cmd: &str,
            _cwd: &Path,
            _timeout: Duration,
            _interrupt: &AtomicBool,
        ) -> Result<ShellRunResult> {
            Ok(ShellRunResult {
                status: Some(1),
                stdout: format!("ran {cmd}\n"),
                ..Default::default()
            })
        }
    }

    #[test]
    fn bash_uses_the_configured_runner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ToolContext::with_runner(
            dir.path(),
            ToolsConfig::default(),
            Arc::default(),
            Arc::new(CannedRunner),
        )
        .expect("context");
        let dispatcher = ToolDispatcher::new(ToolRegistry::builtin(), ctx);
        assert_eq!(
            dispatcher.execute("bash", &json!({"command": "make"}), None),
            "ran make\n(exit code: 1)"
        );
    }

    #[test]
    fn numeric_and_flag_arguments_are_lenient() {
        let args = json!({"a": 3, "b": "7", "c": "x", "t": "TRUE", "f": false});
        assert_eq!(opt_u64(&args, "a"), Some(3));
        assert_eq!(opt_u64(&args, "b"), Some(7));
        assert_eq!(opt_u64(&args, "c"), None);
        assert!(opt_bool(&args, "t"));
        assert!(!opt_bool(&args, "f"));
        assert!(!opt_bool(&args, "missing"));
    }
}
