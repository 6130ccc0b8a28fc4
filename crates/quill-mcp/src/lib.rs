//! Client for external tool providers speaking MCP-style JSON-RPC over stdio.
//!
//! Each configured server is launched as a subprocess, handshaken, and asked
//! for its tools and resources. Discovered tools are exposed to the model
//! under `mcp__<server>__<tool>` names and calls are routed back to the
//! owning process.

mod connection;
mod protocol;

use connection::Connection;
use quill_core::{APP_NAME, APP_VERSION, McpConfig, McpServerConfig, ToolDefinition};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use protocol::PROTOCOL_VERSION;

/// Prefix marking a model-facing tool name as provider-backed.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

pub type SharedMcpClient = Arc<RwLock<McpClient>>;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("unknown MCP server '{0}'")]
    UnknownServer(String),
    #[error("MCP server '{0}' is not connected")]
    NotConnected(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("failed to start MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP server '{server}' did not answer {method} within {timeout:?}")]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },
    #[error("MCP server '{0}' closed the connection")]
    Closed(String),
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid handshake from MCP server '{server}': {detail}")]
    Handshake { server: String, detail: String },
    #[error("MCP tool error: {0}")]
    ToolFailed(String),
    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MCP JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-phase deadlines for provider traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpTimeouts {
    pub handshake: Duration,
    pub discovery: Duration,
    pub call: Duration,
    pub resource: Duration,
    pub shutdown_grace: Duration,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            discovery: Duration::from_secs(10),
            call: Duration::from_secs(60),
            resource: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl McpTimeouts {
    pub fn from_config(cfg: &McpConfig) -> Self {
        let handshake = Duration::from_millis(cfg.handshake_timeout_ms);
        Self {
            handshake,
            discovery: handshake,
            call: Duration::from_millis(cfg.call_timeout_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    Launching,
    Handshaking,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpTool {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpResource {
    pub server: String,
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
}

struct ServerEntry {
    config: McpServerConfig,
    state: ConnectionState,
    connection: Option<Connection>,
    last_error: Option<String>,
    shadowed: Vec<String>,
}

/// Registry of provider processes and the tool/resource namespace they feed.
pub struct McpClient {
    servers: BTreeMap<String, ServerEntry>,
    tools: BTreeMap<(String, String), McpTool>,
    resources: BTreeMap<String, McpResource>,
    timeouts: McpTimeouts,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    pub fn new() -> Self {
        Self::with_timeouts(McpTimeouts::default())
    }

    pub fn with_timeouts(timeouts: McpTimeouts) -> Self {
        Self {
            servers: BTreeMap::new(),
            tools: BTreeMap::new(),
            resources: BTreeMap::new(),
            timeouts,
        }
    }

    pub fn into_shared(self) -> SharedMcpClient {
        Arc::new(RwLock::new(self))
    }

    /// Record a server configuration. Re-registering a live server tears the
    /// old process down first.
    pub fn register(&mut self, name: &str, config: McpServerConfig) {
        self.disconnect(name);
        self.servers.insert(
            name.to_string(),
            ServerEntry {
                config,
                state: ConnectionState::Registered,
                connection: None,
                last_error: None,
                shadowed: Vec::new(),
            },
        );
    }

    /// Launch, handshake, and discover one registered server. Returns the
    /// number of tools it contributed. A tool whose model-facing name is
    /// already taken is skipped and listed in [`McpClient::shadowed_tools`].
    pub fn connect(&mut self, name: &str) -> Result<usize, McpError> {
        if !self.servers.contains_key(name) {
            return Err(McpError::UnknownServer(name.to_string()));
        }
        self.disconnect(name);
        let timeouts = self.timeouts;
        let Some(entry) = self.servers.get_mut(name) else {
            return Err(McpError::UnknownServer(name.to_string()));
        };
        entry.state = ConnectionState::Launching;
        let connection = match Connection::launch(name, &entry.config) {
            Ok(connection) => connection,
            Err(err) => {
                entry.state = ConnectionState::Disconnected;
                entry.last_error = Some(err.to_string());
                return Err(err);
            }
        };
        entry.state = ConnectionState::Handshaking;
        let (tools, resources) = match handshake(name, &connection, &timeouts) {
            Ok(found) => found,
            Err(err) => {
                connection.shutdown(timeouts.shutdown_grace);
                entry.state = ConnectionState::Disconnected;
                entry.last_error = Some(err.to_string());
                return Err(err);
            }
        };
        entry.connection = Some(connection);
        entry.state = ConnectionState::Ready;
        entry.last_error = None;

        let mut shadowed = Vec::new();
        for tool in tools {
            let api_name = api_tool_name(&tool.server, &tool.name);
            if let Some((server, other)) = self.resolve_api_name(&api_name) {
                shadowed.push(format!(
                    "{} (as {api_name}, already provided by {server}/{other})",
                    tool.name
                ));
                continue;
            }
            self.tools
                .insert((tool.server.clone(), tool.name.clone()), tool);
        }
        for resource in resources {
            self.resources.insert(resource.uri.clone(), resource);
        }
        let count = self.tools.keys().filter(|(server, _)| server == name).count();
        if let Some(entry) = self.servers.get_mut(name) {
            entry.shadowed = shadowed;
        }
        Ok(count)
    }

    /// Register and connect every enabled server. One failing server does
    /// not stop the others.
    pub fn connect_all(
        &mut self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Vec<(String, Result<usize, McpError>)> {
        let mut outcomes = Vec::new();
        for (name, config) in servers {
            if !config.enabled {
                continue;
            }
            self.register(name, config.clone());
            outcomes.push((name.clone(), self.connect(name)));
        }
        outcomes
    }

    /// Stop one server and drop its tools and resources. Returns whether a
    /// live process was stopped.
    pub fn disconnect(&mut self, name: &str) -> bool {
        let Some(entry) = self.servers.get_mut(name) else {
            return false;
        };
        self.tools.retain(|(server, _), _| server != name);
        self.resources.retain(|_, resource| resource.server != name);
        entry.shadowed.clear();
        let was_live = entry.connection.is_some();
        if let Some(connection) = entry.connection.take() {
            connection.shutdown(self.timeouts.shutdown_grace);
        }
        if entry.state != ConnectionState::Registered || was_live {
            entry.state = ConnectionState::Disconnected;
        }
        was_live
    }

    pub fn disconnect_all(&mut self) {
        let names: Vec<String> = self.servers.keys().cloned().collect();
        for name in names {
            self.disconnect(&name);
        }
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.servers.get(name).map(|entry| entry.state)
    }

    pub fn last_error(&self, name: &str) -> Option<&str> {
        self.servers.get(name).and_then(|e| e.last_error.as_deref())
    }

    /// Tools of `name` left out because their model-facing name collided.
    pub fn shadowed_tools(&self, name: &str) -> &[String] {
        self.servers
            .get(name)
            .map_or(&[][..], |entry| entry.shadowed.as_slice())
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn tools(&self) -> impl Iterator<Item = &McpTool> {
        self.tools.values()
    }

    pub fn resources(&self) -> impl Iterator<Item = &McpResource> {
        self.resources.values()
    }

    /// Model-facing definitions for every discovered tool.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(tool_definition).collect()
    }

    /// Map a model-facing `mcp__` name back to `(server, tool)`.
    pub fn resolve_api_name(&self, api_name: &str) -> Option<(String, String)> {
        if !api_name.starts_with(MCP_TOOL_PREFIX) {
            return None;
        }
        self.tools
            .keys()
            .find(|(server, tool)| api_tool_name(server, tool) == api_name)
            .cloned()
    }

    /// Invoke a tool on its owning server and flatten the result to text.
    pub fn call_tool(&self, server: &str, tool: &str, arguments: &Value) -> Result<String, McpError> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| McpError::UnknownServer(server.to_string()))?;
        let connection = entry
            .connection
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(server.to_string()))?;
        let arguments = if arguments.is_object() {
            arguments.clone()
        } else {
            json!({})
        };
        let result = connection.request(
            "tools/call",
            json!({"name": tool, "arguments": arguments}),
            self.timeouts.call,
        )?;
        extract_call_result(&result)
    }

    pub fn call_api_tool(&self, api_name: &str, arguments: &Value) -> Result<String, McpError> {
        let (server, tool) = self
            .resolve_api_name(api_name)
            .ok_or_else(|| McpError::UnknownTool(api_name.to_string()))?;
        self.call_tool(&server, &tool, arguments)
    }

    /// Fetch resource contents by URI. Unknown URIs yield `Ok(None)`.
    pub fn read_resource(&self, uri: &str) -> Result<Option<Value>, McpError> {
        let Some(resource) = self.resources.get(uri) else {
            return Ok(None);
        };
        let connection = self
            .servers
            .get(&resource.server)
            .and_then(|entry| entry.connection.as_ref())
            .ok_or_else(|| McpError::NotConnected(resource.server.clone()))?;
        let result = connection.request("resources/read", json!({"uri": uri}), self.timeouts.resource)?;
        Ok(result.get("contents").cloned())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn handshake(
    server: &str,
    connection: &Connection,
    timeouts: &McpTimeouts,
) -> Result<(Vec<McpTool>, Vec<McpResource>), McpError> {
    let init = connection.request(
        "initialize",
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": APP_NAME, "version": APP_VERSION},
        }),
        timeouts.handshake,
    )?;
    if !init.is_object() {
        return Err(McpError::Handshake {
            server: server.to_string(),
            detail: format!("expected an object result, got {init}"),
        });
    }
    connection.notify("notifications/initialized")?;

    // Providers without tools or resources may reject the list calls.
    let tools = connection
        .request("tools/list", json!({}), timeouts.discovery)
        .map(|result| parse_tools(server, &result))
        .unwrap_or_default();
    let resources = connection
        .request("resources/list", json!({}), timeouts.discovery)
        .map(|result| parse_resources(server, &result))
        .unwrap_or_default();
    Ok((tools, resources))
}

fn parse_tools(server: &str, result: &Value) -> Vec<McpTool> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?;
            Some(McpTool {
                server: server.to_string(),
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: item
                    .get("inputSchema")
                    .filter(|schema| schema.is_object())
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
        })
        .collect()
}

fn parse_resources(server: &str, result: &Value) -> Vec<McpResource> {
    let Some(items) = result.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let uri = item.get("uri").and_then(Value::as_str)?;
            let text = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
            Some(McpResource {
                server: server.to_string(),
                uri: uri.to_string(),
                name: text("name").unwrap_or_else(|| uri.to_string()),
                description: text("description").unwrap_or_default(),
                mime_type: text("mimeType"),
            })
        })
        .collect()
}

fn sanitize_name_part(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Model-facing name for a provider tool.
pub fn api_tool_name(server: &str, tool: &str) -> String {
    format!(
        "{MCP_TOOL_PREFIX}{}__{}",
        sanitize_name_part(server),
        sanitize_name_part(tool)
    )
}

pub fn is_mcp_tool_name(name: &str) -> bool {
    name.starts_with(MCP_TOOL_PREFIX)
}

pub fn tool_definition(tool: &McpTool) -> ToolDefinition {
    ToolDefinition::function(
        api_tool_name(&tool.server, &tool.name),
        format!("[MCP:{}] {}", tool.server, tool.description),
        tool.input_schema.clone(),
    )
}

/// Flatten a `tools/call` result: text parts joined by newlines, otherwise
/// the pretty-printed result. `isError` results become [`McpError::ToolFailed`].
pub fn extract_call_result(result: &Value) -> Result<String, McpError> {
    let text = match result.get("content").and_then(Value::as_array) {
        Some(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                serde_json::to_string_pretty(result)?
            } else {
                texts.join("\n")
            }
        }
        None => serde_json::to_string_pretty(result)?,
    };
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(McpError::ToolFailed(text));
    }
    Ok(text)
}
