use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// foreman — a multi-role AI coding agent.
///
/// An Architect plans and delegates, Developers execute, Reviewers verify.
/// Runs headless: the prompt comes from the command line or stdin, events
/// stream to stdout, and questions are answered interactively.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Prompt to run.  Reads stdin when omitted.
    pub prompt: Vec<String>,

    /// Explicit config file (merged over the standard search paths).
    #[arg(long, short = 'c', env = "FOREMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Role to run as (defaults to the config's active_role).
    #[arg(long, short = 'r')]
    pub role: Option<String>,

    /// Automatically answer plan-approval questions with "yes".
    #[arg(long)]
    pub auto_approve: bool,

    /// Resume conversation context from a previous session's JSONL log.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Directory for session and trajectory logs.
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Show raw streaming chunks as they arrive.
    #[arg(long)]
    pub stream: bool,

    /// Verbose tracing to stderr (RUST_LOG still applies).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit.
    ShowConfig,
    /// List configured roles and the providers/models they use.
    ListRoles,
}

impl Cli {
    pub fn prompt_text(&self) -> Option<String> {
        if self.prompt.is_empty() {
            None
        } else {
            Some(self.prompt.join(" "))
        }
    }
}
