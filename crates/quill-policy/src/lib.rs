use glob::Pattern;
use quill_core::{PermissionMode, PermissionsConfig, RuleAction};
use serde_json::Value;
use std::collections::HashSet;

/// Tools that run without prompting unless a rule says otherwise.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "read",
    "ls",
    "glob",
    "grep",
    "find",
    "git_status",
    "git_diff",
    "git_log",
    "changes",
    "watch",
    "think",
    "fetch",
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid rule '{0}' (expected tool:pattern:allow|deny)")]
    InvalidRule(String),
    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Outcome of evaluating one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
    /// No rule or mode settles the call; a human must decide.
    Ask,
}

/// The argument a rule pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Path(&'a str),
    Command(&'a str),
}

impl<'a> Target<'a> {
    pub fn as_str(&self) -> &'a str {
        match self {
            Self::Path(p) | Self::Command(p) => p,
        }
    }
}

/// Extracts the rule target from call arguments: the first of `path`, `file`,
/// `save_path`, falling back to `command`.
pub fn call_target(args: &Value) -> Option<Target<'_>> {
    let non_empty = |key: &str| {
        args.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };
    ["path", "file", "save_path"]
        .into_iter()
        .find_map(non_empty)
        .map(Target::Path)
        .or_else(|| non_empty("command").map(Target::Command))
}

#[derive(Debug, Clone)]
pub struct PermissionRule {
    tool: String,
    pattern: String,
    glob: Option<Pattern>,
    action: RuleAction,
}

impl PermissionRule {
    pub fn new(
        tool: impl Into<String>,
        pattern: impl Into<String>,
        action: RuleAction,
    ) -> Result<Self, PolicyError> {
        let tool = tool.into();
        let pattern = pattern.into();
        let glob = if pattern == "*" {
            None
        } else {
            match Pattern::new(&pattern) {
                Ok(glob) => Some(glob),
                // Shell rules match by substring, so glob syntax is irrelevant.
                Err(_) if is_shell_tool(&tool) => None,
                Err(err) => {
                    return Err(PolicyError::InvalidPattern {
                        pattern,
                        message: err.to_string(),
                    });
                }
            }
        };
        Ok(Self {
            tool,
            pattern,
            glob,
            action,
        })
    }

    /// `(tool, *, allow)`.
    pub fn allow_all(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            pattern: "*".to_string(),
            glob: None,
            action: RuleAction::Allow,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    pub fn matches(&self, tool: &str, target: Option<Target<'_>>) -> bool {
        if self.tool != "*" && self.tool != tool {
            return false;
        }
        if self.pattern == "*" {
            return true;
        }
        match target {
            None => true,
            Some(Target::Command(command)) => command.contains(&self.pattern),
            Some(Target::Path(path)) => match &self.glob {
                Some(glob) => glob.matches(path),
                None => path == self.pattern,
            },
        }
    }
}

impl std::fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.tool, self.pattern, self.action)
    }
}

impl std::str::FromStr for PermissionRule {
    type Err = PolicyError;

    /// Parses `tool:action` or `tool:pattern:action`. The pattern may itself
    /// contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PolicyError::InvalidRule(s.to_string());
        let (rest, action) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let action: RuleAction = action.parse().map_err(|_| invalid())?;
        let (tool, pattern) = rest.split_once(':').unwrap_or((rest, "*"));
        let (tool, pattern) = (tool.trim(), pattern.trim());
        if tool.is_empty() || pattern.is_empty() {
            return Err(invalid());
        }
        Self::new(tool, pattern, action)
    }
}

fn is_shell_tool(tool: &str) -> bool {
    matches!(tool, "bash" | "bash_bg")
}

/// Per-process permission state: mode, prioritized rules, and the keys of
/// calls approved once during this session.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    mode: PermissionMode,
    rules: Vec<PermissionRule>,
    approved: HashSet<String>,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(PermissionMode::Ask)
    }
}

impl PermissionGate {
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            mode,
            rules: DEFAULT_ALLOWED_TOOLS
                .iter()
                .map(|tool| PermissionRule::allow_all(*tool))
                .collect(),
            approved: HashSet::new(),
        }
    }

    /// Default rules plus configured ones; the first configured rule has the
    /// highest priority.
    pub fn from_config(cfg: &PermissionsConfig) -> Result<Self, PolicyError> {
        let mut gate = Self::new(cfg.mode);
        for rule in cfg.rules.iter().rev() {
            gate.add_rule(PermissionRule::new(&rule.tool, &rule.pattern, rule.action)?);
        }
        Ok(gate)
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PermissionMode) {
        self.mode = mode;
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }

    pub fn add_rule(&mut self, rule: PermissionRule) {
        self.rules.insert(0, rule);
    }

    pub fn decide(&self, tool: &str, args: &Value) -> Decision {
        let target = call_target(args);
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(tool, target)) {
            return match rule.action() {
                RuleAction::Allow => Decision::Allow,
                RuleAction::Deny => Decision::Deny {
                    reason: match target {
                        Some(Target::Command(_)) => format!(
                            "denied: command matches blocked pattern '{}'",
                            rule.pattern()
                        ),
                        _ => format!("denied by rule {}:{}", rule.tool(), rule.pattern()),
                    },
                },
            };
        }

        match self.mode {
            PermissionMode::Auto => Decision::Allow,
            PermissionMode::Strict => Decision::Deny {
                reason: format!("denied: strict mode has no rule allowing '{tool}'"),
            },
            PermissionMode::Ask if self.is_approved(tool, args) => Decision::Allow,
            PermissionMode::Ask => Decision::Ask,
        }
    }

    /// Records a one-time approval for this exact tool and target.
    pub fn approve(&mut self, tool: &str, args: &Value) {
        self.approved.insert(approval_key(tool, args));
    }

    /// Allows every future call to `tool` for the rest of the process.
    pub fn approve_all(&mut self, tool: &str) {
        self.add_rule(PermissionRule::allow_all(tool));
    }

    pub fn is_approved(&self, tool: &str, args: &Value) -> bool {
        self.approved.contains(&approval_key(tool, args))
    }
}

fn approval_key(tool: &str, args: &Value) -> String {
    let target = call_target(args).map(|t| t.as_str()).unwrap_or_default();
    format!("{tool}:{target}")
}
