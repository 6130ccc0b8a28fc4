use quill_core::PermissionMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Quit,
    Clear,
    Sessions,
    Model(Option<String>),
    Diff,
    Stats,
    Help,
    Image(Option<String>),
    Watch,
    Changes,
    Compact,
    Init,
    Mode(PermissionMode),
    Allow(Vec<String>),
    Deny(Vec<String>),
    Stop(Option<String>),
    Ps,
    Logs(Option<String>),
    Mcp,
    Unknown { name: String, args: Vec<String> },
}

impl SlashCommand {
    /// `None` for ordinary prompts. `exit` and `quit` also count as `/q`.
    pub fn parse(input: &str) -> Option<Self> {
        let line = input.trim();
        if matches!(line, "exit" | "quit") {
            return Some(Self::Quit);
        }
        let rest = line.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_ascii_lowercase();
        let args = parts.map(ToString::to_string).collect::<Vec<_>>();
        // `/img` keeps the raw remainder so paths may contain spaces.
        let remainder = rest[rest.find(char::is_whitespace).unwrap_or(rest.len())..]
            .trim()
            .to_string();

        let cmd = match name.as_str() {
            "q" | "quit" | "exit" => Self::Quit,
            "c" | "clear" => Self::Clear,
            "s" | "sessions" => Self::Sessions,
            "m" | "model" => Self::Model(args.first().cloned()),
            "d" | "diff" => Self::Diff,
            "stats" => Self::Stats,
            "help" => Self::Help,
            "img" => Self::Image(Some(remainder).filter(|path| !path.is_empty())),
            "watch" => Self::Watch,
            "changes" => Self::Changes,
            "compact" => Self::Compact,
            "init" => Self::Init,
            "auto" => Self::Mode(PermissionMode::Auto),
            "ask" => Self::Mode(PermissionMode::Ask),
            "strict" => Self::Mode(PermissionMode::Strict),
            "allow" => Self::Allow(args),
            "deny" => Self::Deny(args),
            "stop" => Self::Stop(args.first().cloned()),
            "ps" => Self::Ps,
            "logs" => Self::Logs(args.first().cloned()),
            "mcp" => Self::Mcp,
            other => Self::Unknown {
                name: other.to_string(),
                args,
            },
        };
        Some(cmd)
    }
}

pub const HELP: &str = "\
Commands:
  /q              quit (also: exit, quit)
  /c              clear the conversation
  /s              list sessions
  /m <model>      switch model (aliases allowed)
  /d              show git diff
  /stats          session statistics
  /img <path>     check that an image can be attached
  /watch          start the file watcher
  /changes        file changes seen by the watcher
  /compact        summarize the conversation
  /init           create QUILL.md for this project
  /auto /ask /strict
                  switch permission mode
  /allow <tool> [pattern]
  /deny <tool> [pattern]
                  add a permission rule for this process
  /stop [name]    stop one or all background processes
  /ps             list background processes
  /logs <name>    recent output of a background process
  /mcp            capability provider status
  /help           this help";
