use crate::commands::{HELP, SlashCommand};
use crate::render;
use anyhow::Result;
use quill_agent::project::quick_init;
use quill_agent::{AgentContext, ToolLoopResult, images};
use quill_core::{ChatMessage, PermissionMode, RuleAction};
use quill_mcp::ConnectionState;
use quill_policy::PermissionRule;
use serde_json::json;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

const LOG_LINES: usize = 50;
pub const SESSION_LIST_LIMIT: usize = 20;
const SUMMARY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// One interactive session bound to a stored conversation.
pub struct Repl {
    ctx: AgentContext,
    session: String,
    history: Vec<ChatMessage>,
}

impl Repl {
    pub fn new(ctx: AgentContext, session: &str) -> Result<Self> {
        let history = ctx.load_history(session)?;
        Ok(Self {
            ctx,
            session: session.to_string(),
            history,
        })
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Sends `input` as the next user message. Image paths mentioned in it
    /// are attached.
    pub fn send(&mut self, input: &str, out: &mut dyn Write) -> Result<ToolLoopResult> {
        self.ctx.interrupt().store(false, Ordering::SeqCst);
        let (content, attached) = images::user_content(input, self.ctx.workspace());
        if attached > 0 {
            writeln!(out, "{attached} image(s) attached")?;
        }
        let result = self
            .ctx
            .run_turn(&self.session, &mut self.history, content)?;
        match result.finish_reason.as_str() {
            "max_turns" => writeln!(
                out,
                "Stopped after {} model calls (agent.max_turns)",
                result.turns
            )?,
            "interrupted" => writeln!(out, "Interrupted")?,
            _ => {}
        }
        Ok(result)
    }

    pub fn handle(&mut self, cmd: SlashCommand, out: &mut dyn Write) -> Result<Flow> {
        match cmd {
            SlashCommand::Quit => {
                writeln!(out, "Goodbye!")?;
                return Ok(Flow::Quit);
            }
            SlashCommand::Clear => {
                self.ctx.clear_session(&self.session)?;
                self.history.clear();
                writeln!(out, "Conversation cleared")?;
            }
            SlashCommand::Sessions => match self.ctx.store() {
                Some(store) => {
                    let sessions = store.list_sessions(SESSION_LIST_LIMIT)?;
                    writeln!(out, "{}", render::sessions_table(&sessions))?;
                }
                None => writeln!(out, "Session persistence is disabled")?,
            },
            SlashCommand::Model(None) => writeln!(out, "Model: {}", self.ctx.config().llm.model)?,
            SlashCommand::Model(Some(name)) => {
                let model = self.ctx.set_model(&name);
                writeln!(out, "Model: {model}")?;
            }
            SlashCommand::Diff => {
                let diff = self.ctx.dispatcher().execute("git_diff", &json!({}), None);
                writeln!(out, "{diff}")?;
            }
            SlashCommand::Stats => match self.ctx.store() {
                Some(store) => writeln!(
                    out,
                    "{}",
                    render::stats(&self.session, &store.stats(&self.session)?)
                )?,
                None => writeln!(out, "Session persistence is disabled")?,
            },
            SlashCommand::Help => {
                let tools: Vec<String> = self
                    .ctx
                    .dispatcher()
                    .definitions()
                    .into_iter()
                    .map(|def| def.function.name)
                    .collect();
                writeln!(out, "{HELP}\n\nTools: {}", tools.join(", "))?;
            }
            SlashCommand::Image(None) => writeln!(out, "Usage: /img <path>")?,
            SlashCommand::Image(Some(raw)) => self.check_image(&raw, out)?,
            SlashCommand::Watch => {
                let watcher = &self.ctx.dispatcher().context().watcher;
                if watcher.is_running() {
                    writeln!(out, "File watcher already running")?;
                } else {
                    watcher.watch(self.ctx.workspace());
                    watcher.start();
                    writeln!(out, "File watcher started")?;
                }
            }
            SlashCommand::Changes => {
                writeln!(out, "{}", self.ctx.dispatcher().context().watcher.summary())?;
            }
            SlashCommand::Compact => {
                writeln!(out, "Compacting conversation...")?;
                match self.ctx.compact(&self.session, &mut self.history)? {
                    Some(summary) => {
                        let preview: String =
                            summary.chars().take(SUMMARY_PREVIEW_CHARS).collect();
                        writeln!(out, "Compacted to {} messages", self.history.len())?;
                        writeln!(out, "{preview}")?;
                    }
                    None => writeln!(out, "Nothing to compact yet")?,
                }
            }
            SlashCommand::Init => {
                let path = quick_init(self.ctx.workspace())?;
                writeln!(out, "Created {}", path.display())?;
            }
            SlashCommand::Mode(mode) => {
                self.ctx.gate_mut().set_mode(mode);
                let message = match mode {
                    PermissionMode::Auto => "Auto-approve mode enabled",
                    PermissionMode::Ask => "Ask mode enabled (will prompt before risky tools)",
                    PermissionMode::Strict => "Strict mode enabled (unlisted tools are blocked)",
                };
                writeln!(out, "{message}")?;
            }
            SlashCommand::Allow(args) => self.add_rule(&args, RuleAction::Allow, out)?,
            SlashCommand::Deny(args) => self.add_rule(&args, RuleAction::Deny, out)?,
            SlashCommand::Stop(None) => {
                writeln!(out, "{}", self.ctx.dispatcher().context().jobs.stop_all())?;
            }
            SlashCommand::Stop(Some(name)) => {
                writeln!(out, "{}", self.ctx.dispatcher().context().jobs.stop(&name))?;
            }
            SlashCommand::Ps => writeln!(out, "{}", self.ctx.dispatcher().context().jobs.list())?,
            SlashCommand::Logs(None) => writeln!(out, "Usage: /logs <name>")?,
            SlashCommand::Logs(Some(name)) => {
                match self.ctx.dispatcher().context().jobs.logs(&name, LOG_LINES) {
                    Some(log) if log.is_empty() => writeln!(out, "(no output yet)")?,
                    Some(log) => writeln!(out, "{log}")?,
                    None => writeln!(out, "No process named: {name}")?,
                }
            }
            SlashCommand::Mcp => writeln!(out, "{}", self.provider_status())?,
            SlashCommand::Unknown { name, .. } => {
                writeln!(out, "Unknown command: /{name} (try /help)")?;
            }
        }
        Ok(Flow::Continue)
    }

    fn check_image(&self, raw: &str, out: &mut dyn Write) -> Result<()> {
        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.ctx.workspace().join(path)
        };
        match images::load_image(&path) {
            Some(_) => {
                let bytes = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
                writeln!(out, "Image loaded: {raw} ({bytes} bytes)")?;
                writeln!(out, "Mention the path in your next message to attach it")?;
            }
            None => writeln!(out, "Failed to load image: {raw}")?,
        }
        Ok(())
    }

    fn add_rule(&mut self, args: &[String], action: RuleAction, out: &mut dyn Write) -> Result<()> {
        let Some((tool, pattern)) = args.split_first() else {
            writeln!(out, "Usage: /{action} <tool> [pattern]")?;
            return Ok(());
        };
        let pattern = if pattern.is_empty() {
            "*".to_string()
        } else {
            pattern.join(" ")
        };
        let rule = PermissionRule::new(tool.as_str(), pattern, action)?;
        writeln!(out, "Rule added: {rule}")?;
        self.ctx.gate_mut().add_rule(rule);
        Ok(())
    }

    fn provider_status(&self) -> String {
        let client = self.ctx.mcp();
        let names: Vec<String> = client.server_names().map(str::to_string).collect();
        if names.is_empty() {
            return "No capability providers configured".to_string();
        }
        let mut lines = Vec::new();
        for name in names {
            let tools = client.tools().filter(|tool| tool.server == name).count();
            let line = match client.state(&name) {
                Some(ConnectionState::Ready) => format!("  {name}: ready, {tools} tools"),
                Some(state) => {
                    let state = format!("{state:?}").to_ascii_lowercase();
                    match client.last_error(&name) {
                        Some(err) => format!("  {name}: {state} ({err})"),
                        None => format!("  {name}: {state}"),
                    }
                }
                None => continue,
            };
            lines.push(line);
        }
        format!("Capability providers:\n{}", lines.join("\n"))
    }

    /// Reads prompts from stdin until EOF or `/q`.
    pub fn run(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            print!("\n\x1b[1;34m>\x1b[0m ");
            stdout.flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            let outcome = match SlashCommand::parse(input) {
                Some(cmd) => self.handle(cmd, &mut stdout),
                None => self.send(input, &mut stdout).map(|_| Flow::Continue),
            };
            match outcome {
                Ok(Flow::Quit) => break,
                Ok(Flow::Continue) => {}
                Err(err) => render::error(&format!("{err:#}")),
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> String {
        self.ctx.shutdown()
    }
}
