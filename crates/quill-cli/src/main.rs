use anyhow::{Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use quill_agent::AgentContext;
use quill_agent::approvals::terminal_approval;
use quill_core::{AppConfig, PermissionMode, SessionStore};
use quill_llm::ChatCompletionsClient;
use quill_store::SqliteStore;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

mod commands;
mod render;
mod repl;

use repl::{Repl, SESSION_LIST_LIMIT};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Terminal coding agent", long_about = None, version)]
struct Cli {
    /// Run a single prompt non-interactively, then exit.
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,

    /// Session name.
    #[arg(short = 's', long = "session", default_value = "default")]
    session: String,

    /// Model to use (full name or alias).
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Clear the session and exit.
    #[arg(short = 'c', long = "clear")]
    clear: bool,

    /// Write a config template to ~/.quill/config.toml and exit.
    #[arg(long = "init-config")]
    init_config: bool,

    /// Permission mode: ask (default), auto, or strict.
    #[arg(long = "permission-mode")]
    permission_mode: Option<PermissionMode>,

    /// Maximum model calls per user turn.
    #[arg(long = "max-turns")]
    max_turns: Option<usize>,

    /// Wait for whole responses instead of streaming.
    #[arg(long = "no-stream")]
    no_stream: bool,

    /// Log tool calls and provider activity to stderr.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored sessions for this workspace.
    Sessions,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "quill", &mut io::stdout());
        return Ok(());
    }

    if cli.init_config {
        let path = AppConfig::user_config_path()
            .ok_or_else(|| anyhow!("cannot locate the home directory"))?;
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        AppConfig::write_template(&path)?;
        render::success(&format!("Config template created: {}", path.display()));
        return Ok(());
    }

    let mut config = AppConfig::load(&cwd)?;
    apply_flags(&mut config, &cli);

    if let Some(Commands::Sessions) = &cli.command {
        let store = SqliteStore::new(&cwd, config.session.db_path.as_deref())?;
        println!(
            "{}",
            render::sessions_table(&store.list_sessions(SESSION_LIST_LIMIT)?)
        );
        return Ok(());
    }

    if cli.clear {
        let store = SqliteStore::new(&cwd, config.session.db_path.as_deref())?;
        store.clear(&cli.session)?;
        render::success(&format!("Session '{}' cleared", cli.session));
        return Ok(());
    }

    if config.api_key().is_none() {
        bail!(
            "{env} not set\nSet it with: export {env}='your-key'\n\
             Or create a config file: quill --init-config",
            env = config.llm.api_key_env
        );
    }

    run(&cwd, config, &cli)
}

fn apply_flags(config: &mut AppConfig, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.llm.model = config.resolve_model(model);
    }
    if let Some(mode) = cli.permission_mode {
        config.permissions.mode = mode;
    }
    if let Some(max_turns) = cli.max_turns {
        config.agent.max_turns = max_turns;
    }
    if cli.no_stream {
        config.llm.stream = false;
    }
}

/// SIGINT sets the interrupt flag; a second SIGINT while it is still set
/// exits the process.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_shutdown(
        signal_hook::consts::SIGINT,
        130,
        Arc::clone(&flag),
    )?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    Ok(flag)
}

fn run(cwd: &Path, config: AppConfig, cli: &Cli) -> Result<()> {
    let interrupt = install_interrupt_handler()?;
    let llm = ChatCompletionsClient::new(config.llm.clone())?;
    let mut ctx = AgentContext::new(cwd, config, Box::new(llm), interrupt)?;
    ctx.set_verbose(cli.verbose);
    ctx.set_stream_callback(render::stdout_callback());
    ctx.set_approval_callback(terminal_approval());

    // Failures are already reported by the observer.
    let outcomes = ctx.connect_providers();
    let tools: usize = outcomes.iter().filter_map(|(_, o)| o.as_ref().ok()).sum();
    let connected = outcomes.iter().filter(|(_, o)| o.is_ok()).count();
    if connected > 0 {
        render::info(&format!("{connected} provider(s) connected, {tools} tools"));
    }

    let mut repl = Repl::new(ctx, &cli.session)?;
    let outcome = match &cli.prompt {
        Some(prompt) => repl.send(prompt, &mut io::stdout()).map(|_| ()),
        None => {
            let ctx = repl.context();
            println!(
                "{}",
                render::header(
                    &ctx.config().llm.model,
                    &cwd.display().to_string(),
                    &ctx.gate().mode().to_string()
                )
            );
            render::info("Type /help for commands, /q to quit");
            repl.run()
        }
    };
    io::stdout().flush()?;
    let stopped = repl.shutdown();
    if stopped.starts_with("Stopped") {
        render::info(&stopped);
    }
    outcome
}
