use crate::{PermissionMode, Result, RuleAction, runtime_dir, user_dir};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

pub const CONFIG_TEMPLATE: &str = r#"# quill configuration
# Place at ~/.quill/config.toml (user) or .quill/config.toml (project).

[llm]
# api_key = "..."                 # or export OPENROUTER_API_KEY
model = "openai/gpt-4o-mini"
max_tokens = 8192
stream = true

[agent]
max_turns = 50

[session]
auto_save = true

[tools]
bash_timeout = 60

[permissions]
mode = "ask"
# [[permissions.rules]]
# tool = "bash"
# pattern = "cargo test"
# action = "allow"

[aliases]
mini = "openai/gpt-4o-mini"
sonnet = "anthropic/claude-sonnet-4.5"
gemini-flash = "google/gemini-2.5-flash"

[mcp]
handshake_timeout_ms = 10000
call_timeout_ms = 60000

# [mcp.servers.filesystem]
# command = "npx"
# args = ["-y", "@modelcontextprotocol/server-filesystem", "."]
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub session: SessionConfig,
    pub permissions: PermissionsConfig,
    pub mcp: McpConfig,
    pub aliases: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let aliases = [
            ("mini", "openai/gpt-4o-mini"),
            ("sonnet", "anthropic/claude-sonnet-4.5"),
            ("gemini-flash", "google/gemini-2.5-flash"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            session: SessionConfig::default(),
            permissions: PermissionsConfig::default(),
            mcp: McpConfig::default(),
            aliases,
        }
    }
}

impl AppConfig {
    pub fn user_config_path() -> Option<PathBuf> {
        user_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn project_config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn project_local_config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.local.toml")
    }

    /// Loads the layered file configuration and applies environment overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut cfg = Self::load_files(workspace)?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Merges user, project, and project-local TOML files over the defaults.
    /// Later layers win key by key.
    pub fn load_files(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Some(user) = Self::user_config_path() {
            paths.push(user);
        }
        paths.push(Self::project_config_path(workspace));
        paths.push(Self::project_local_config_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let value: serde_json::Value = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        serde_json::from_value(merged).context("invalid merged configuration")
    }

    /// Applies environment overrides through `lookup` so callers can
    /// substitute the process environment in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup(&self.llm.api_key_env).filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("QUILL_MODEL").filter(|v| !v.trim().is_empty()) {
            self.llm.model = self.resolve_model(model.trim());
        }
        if let Some(raw) = lookup("QUILL_MAX_TOKENS") {
            self.llm.max_tokens = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid QUILL_MAX_TOKENS '{raw}'"))?;
        }
        Ok(())
    }

    /// The configured credential, if any.
    pub fn api_key(&self) -> Option<&str> {
        self.llm
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    /// Maps a model alias to its full name; unknown names pass through.
    pub fn resolve_model(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, CONFIG_TEMPLATE)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    /// Sent as `X-Title`; some gateways use it for attribution.
    pub app_title: String,
    pub referer: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            max_tokens: 8192,
            temperature: None,
            stream: true,
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 400,
            app_title: crate::APP_NAME.to_string(),
            referer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on model round-trips within one user turn.
    pub max_turns: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_turns: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub bash_timeout: u64,
    pub fetch_timeout: u64,
    pub fetch_max_chars: usize,
    pub max_output_lines: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bash_timeout: 60,
            fetch_timeout: 30,
            fetch_max_chars: 10_000,
            max_output_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_save: bool,
    /// Overrides the default `.quill/sessions.db` location.
    pub db_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub mode: PermissionMode,
    pub rules: Vec<PermissionRuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRuleConfig {
    pub tool: String,
    #[serde(default = "wildcard")]
    pub pattern: String,
    pub action: RuleAction,
}

fn wildcard() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: BTreeMap<String, McpServerConfig>,
    /// Deadline for `initialize` and for each discovery request.
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            handshake_timeout_ms: 10_000,
            call_timeout_ms: 60_000,
        }
    }
}

/// How to launch one capability provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn project_layers_override_defaults_key_by_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            &AppConfig::project_config_path(dir.path()),
            r#"
[llm]
model = "anthropic/claude-sonnet-4.5"

[tools]
bash_timeout = 5

[aliases]
fast = "openai/gpt-4o-mini"

[mcp.servers.files]
command = "npx"
args = ["-y", "server"]
"#,
        );
        write(
            &AppConfig::project_local_config_path(dir.path()),
            "[llm]\nmax_tokens = 1024\n\n[permissions]\nmode = \"strict\"\n",
        );

        let cfg = AppConfig::load_files(dir.path()).expect("load");
        assert_eq!(cfg.llm.model, "anthropic/claude-sonnet-4.5");
        assert_eq!(cfg.llm.max_tokens, 1024);
        assert_eq!(cfg.llm.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.tools.bash_timeout, 5);
        assert_eq!(cfg.tools.fetch_timeout, 30);
        assert_eq!(cfg.permissions.mode, PermissionMode::Strict);
        assert_eq!(cfg.resolve_model("fast"), "openai/gpt-4o-mini");
        // Built-in aliases survive a user alias table.
        assert_eq!(cfg.resolve_model("sonnet"), "anthropic/claude-sonnet-4.5");
        let server = cfg.mcp.servers.get("files").expect("server");
        assert_eq!(server.args, vec!["-y", "server"]);
        assert!(server.enabled);
    }

    #[test]
    fn invalid_layer_reports_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = AppConfig::project_config_path(dir.path());
        write(&path, "[llm\nmodel = ");
        let err = AppConfig::load_files(dir.path()).expect_err("invalid toml");
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn env_overrides_credential_model_and_budget() {
        let env: HashMap<&str, &str> = [
            ("OPENROUTER_API_KEY", "sk-test"),
            ("QUILL_MODEL", "mini"),
            ("QUILL_MAX_TOKENS", "2048"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AppConfig::default();
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("apply");
        assert_eq!(cfg.api_key(), Some("sk-test"));
        assert_eq!(cfg.llm.model, "openai/gpt-4o-mini");
        assert_eq!(cfg.llm.max_tokens, 2048);
    }

    #[test]
    fn bad_token_budget_is_rejected() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_env(|key| (key == "QUILL_MAX_TOKENS").then(|| "lots".to_string()))
            .expect_err("invalid");
        assert!(err.to_string().contains("QUILL_MAX_TOKENS"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = Some("   ".to_string());
        assert!(cfg.api_key().is_none());
    }

    #[test]
    fn template_parses_as_config() {
        let cfg: AppConfig = toml::from_str(CONFIG_TEMPLATE).expect("template");
        assert_eq!(cfg.agent.max_turns, 50);
        assert!(cfg.session.auto_save);
    }

    proptest! {
        #[test]
        fn merge_json_value_is_idempotent_for_flat_objects(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_json_value(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_json_value(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }

        #[test]
        fn merge_json_value_overlay_keys_win(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut merged = json!(base);
            merge_json_value(&mut merged, &json!(overlay));
            for (key, value) in &overlay {
                prop_assert_eq!(&merged[key.as_str()], &json!(value));
            }
        }
    }
}
