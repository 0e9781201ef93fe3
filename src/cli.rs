use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(name = "studio")]
#[command(version)]
#[command(about = "Streaming chat client for a local LLM inference gateway")]
pub struct Args {
    /// TOML config file (falls back to $STUDIO_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend root URL, overrides the config file
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Persona used for the system prompt (default, coder, creative, english)
    #[arg(long, global = true)]
    pub persona: Option<String>,

    /// More log output on stderr (-v info, -vv debug). RUST_LOG wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Interactive chat. Ctrl-C stops a reply; typing while it streams interrupts it.
    Chat,

    /// Send one prompt and stream the answer to stdout
    Ask {
        prompt: String,
    },

    /// Report backend health and capacity
    Health,

    /// Poll /health until the model is ready
    WaitForReady {
        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Seconds between probes
        #[arg(long, default_value = "2")]
        interval: u64,
    },

    /// Measure latency and throughput over repeated requests
    Benchmark {
        #[arg(long, short = 'n', default_value = "10")]
        iterations: u32,

        #[arg(long, default_value = "Explain what a large language model is in two sentences.")]
        prompt: String,

        /// Also write the JSON report here
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List the model profiles the backend offers
    Profiles,

    /// Switch the backend to another model profile
    Switch {
        profile: String,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// REPL input, parsed from one line typed at the `chat` prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplInput {
    Message(String),
    Clear,
    Save(Option<PathBuf>),
    Load(PathBuf),
    Stats,
    Persona(String),
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl ReplInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplInput::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return ReplInput::Message(line.to_string());
        };

        let mut parts = rest.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match (cmd, arg) {
            ("clear", _) => ReplInput::Clear,
            ("save", arg) => ReplInput::Save(arg.map(PathBuf::from)),
            ("load", Some(path)) => ReplInput::Load(PathBuf::from(path)),
            ("stats", _) => ReplInput::Stats,
            ("persona", Some(name)) => ReplInput::Persona(name.to_string()),
            ("help", _) => ReplInput::Help,
            ("quit" | "exit", _) => ReplInput::Quit,
            _ => ReplInput::Unknown(line.to_string()),
        }
    }

    /// Whether typing this while a reply streams should stop that reply.
    /// Only new messages do; commands wait their turn.
    pub fn interrupts_reply(&self) -> bool {
        matches!(self, ReplInput::Message(_))
    }
}

pub const REPL_HELP: &str = "\
/clear          forget the conversation
/save [path]    write the transcript as JSON
/load path      replace the conversation with a saved transcript
/stats          session token and timing totals
/persona name   default, coder, creative or english
/quit           leave";
