use crate::compact;
use crate::prompt::build_system_prompt;
use crate::tool_loop::{ApprovalCallback, ToolLoopConfig, ToolLoopResult, ToolUseLoop};
use anyhow::{Context, Result};
use quill_core::{
    AppConfig, ChangeTracker, ChatMessage, MessageContent, SessionStore, StreamCallback,
};
use quill_llm::LlmClient;
use quill_mcp::{McpClient, McpError, McpTimeouts, SharedMcpClient};
use quill_observe::{ObservedEvent, Observer};
use quill_policy::PermissionGate;
use quill_store::SqliteStore;
use quill_tools::{ToolContext, ToolDispatcher, ToolRegistry};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};

/// Everything one process needs to hold a conversation: configuration, the
/// permission gate, providers, tools, storage and the model client.
pub struct AgentContext {
    workspace: PathBuf,
    config: AppConfig,
    gate: PermissionGate,
    mcp: SharedMcpClient,
    dispatcher: ToolDispatcher,
    store: Option<Arc<SqliteStore>>,
    observer: Observer,
    llm: Box<dyn LlmClient>,
    interrupt: Arc<AtomicBool>,
    stream_cb: Option<StreamCallback>,
    approval_cb: Option<ApprovalCallback>,
    shut_down: bool,
}

impl AgentContext {
    /// Builds the context. Providers are registered but not started; call
    /// [`AgentContext::connect_providers`] for that.
    pub fn new(
        workspace: &Path,
        config: AppConfig,
        llm: Box<dyn LlmClient>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        let gate = PermissionGate::from_config(&config.permissions)
            .context("invalid permission rule in configuration")?;
        let observer = Observer::new(workspace)?;
        let store = if config.session.auto_save {
            Some(Arc::new(SqliteStore::new(
                workspace,
                config.session.db_path.as_deref(),
            )?))
        } else {
            None
        };

        let mut client = McpClient::with_timeouts(McpTimeouts::from_config(&config.mcp));
        for (name, server) in &config.mcp.servers {
            if server.enabled {
                client.register(name, server.clone());
            }
        }
        let mcp = client.into_shared();

        let tools = ToolContext::new(workspace, config.tools.clone(), Arc::clone(&interrupt))?;
        let mut dispatcher =
            ToolDispatcher::new(ToolRegistry::builtin(), tools).with_mcp(Arc::clone(&mcp));
        if let Some(store) = &store {
            let tracker: Arc<dyn ChangeTracker> = store.clone();
            dispatcher = dispatcher.with_tracker(tracker);
        }

        Ok(Self {
            workspace: workspace.to_path_buf(),
            config,
            gate,
            mcp,
            dispatcher,
            store,
            observer,
            llm,
            interrupt,
            stream_cb: None,
            approval_cb: None,
            shut_down: false,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut PermissionGate {
        &mut self.gate
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_deref()
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.observer.set_verbose(verbose);
    }

    pub fn interrupt(&self) -> &Arc<AtomicBool> {
        &self.interrupt
    }

    pub fn llm(&self) -> &dyn LlmClient {
        self.llm.as_ref()
    }

    pub fn set_stream_callback(&mut self, cb: StreamCallback) {
        self.stream_cb = Some(cb);
    }

    pub fn set_approval_callback(&mut self, cb: ApprovalCallback) {
        self.approval_cb = Some(cb);
    }

    pub fn mcp(&self) -> RwLockReadGuard<'_, McpClient> {
        self.mcp.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mcp_mut(&self) -> RwLockWriteGuard<'_, McpClient> {
        self.mcp.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every registered provider. Failures are logged and leave the
    /// other providers untouched.
    pub fn connect_providers(&self) -> Vec<(String, Result<usize, McpError>)> {
        let names: Vec<String> = self.mcp().server_names().map(str::to_string).collect();
        let mut outcomes = Vec::new();
        for name in names {
            let outcome = self.mcp_mut().connect(&name);
            match &outcome {
                Ok(tools) => {
                    let resources = self
                        .mcp()
                        .resources()
                        .filter(|resource| resource.server == name)
                        .count();
                    self.observer.verbose_log(&format!(
                        "provider {name}: {tools} tools, {resources} resources"
                    ));
                    for skipped in self.mcp().shadowed_tools(&name) {
                        self.observer
                            .warn_log(&format!("provider {name}: skipped tool {skipped}"));
                    }
                    let _ = self.observer.record_event(&ObservedEvent::ProviderConnected {
                        server: name.clone(),
                        tools: *tools,
                        resources,
                    });
                }
                Err(err) => {
                    self.observer
                        .warn_log(&format!("provider {name} unavailable: {err}"));
                    let _ = self.observer.record_event(&ObservedEvent::ProviderFailed {
                        server: name.clone(),
                        error: err.to_string(),
                    });
                }
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub fn system_prompt(&self) -> String {
        let names: Vec<String> = self
            .dispatcher
            .definitions()
            .into_iter()
            .map(|def| def.function.name)
            .collect();
        build_system_prompt(&self.workspace, &names)
    }

    /// Stored conversation for `session_id`, creating the session record on
    /// first use. Empty when persistence is off.
    pub fn load_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        store.get_or_create(session_id, &self.config.llm.model)?;
        store.history(session_id)
    }

    pub fn clear_session(&self, session_id: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store.clear(session_id)?;
        }
        Ok(())
    }

    /// Resolves aliases and switches the model for later turns.
    pub fn set_model(&mut self, name: &str) -> String {
        self.config.llm.model = self.config.resolve_model(name);
        self.config.llm.model.clone()
    }

    /// Runs one user turn on top of `history`. `history` is updated with
    /// every message appended, including when the model endpoint fails.
    pub fn run_turn(
        &mut self,
        session_id: &str,
        history: &mut Vec<ChatMessage>,
        input: impl Into<MessageContent>,
    ) -> Result<ToolLoopResult> {
        let system_prompt = self.system_prompt();
        let store = self
            .store
            .as_deref()
            .map(|store| store as &dyn SessionStore);
        let mut tool_loop = ToolUseLoop::new(
            self.llm.as_ref(),
            &self.dispatcher,
            &mut self.gate,
            ToolLoopConfig::from_app_config(&self.config),
            system_prompt,
        )
        .with_history(std::mem::take(history));
        if let Some(cb) = &self.stream_cb {
            tool_loop.set_stream_callback(Arc::clone(cb));
        }
        if let Some(cb) = &self.approval_cb {
            tool_loop.set_approval_callback(Arc::clone(cb));
        }
        tool_loop.set_observer(&self.observer);
        tool_loop.set_interrupt(Arc::clone(&self.interrupt));
        tool_loop.bind_session(session_id, store);

        let result = tool_loop.run(input);
        *history = tool_loop.history().to_vec();
        result
    }

    /// Summarizes `history` and replaces it, in memory and in the store.
    /// Returns the summary, or `None` when there was too little to compact.
    pub fn compact(
        &self,
        session_id: &str,
        history: &mut Vec<ChatMessage>,
    ) -> Result<Option<String>> {
        let Some((replaced, summary)) =
            compact::compact(self.llm.as_ref(), &self.config.llm.model, history)?
        else {
            return Ok(None);
        };
        if let Some(store) = &self.store {
            store.clear(session_id)?;
            for message in &replaced {
                store.append(session_id, message)?;
            }
        }
        self.observer.verbose_log(&format!(
            "compacted {} messages to {}",
            history.len(),
            replaced.len()
        ));
        *history = replaced;
        Ok(Some(summary))
    }

    /// Stops every provider, background job and the file watcher. Safe to
    /// call more than once; also runs on drop.
    pub fn shutdown(&mut self) -> String {
        if self.shut_down {
            return "No background processes".to_string();
        }
        self.shut_down = true;
        {
            let mut client = self.mcp_mut();
            let names: Vec<String> = client.server_names().map(str::to_string).collect();
            for name in names {
                if client.disconnect(&name) {
                    let _ = self
                        .observer
                        .record_event(&ObservedEvent::ProviderDisconnected { server: name });
                }
            }
        }
        self.dispatcher.shutdown()
    }
}

impl Drop for AgentContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
