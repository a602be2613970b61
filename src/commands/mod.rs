pub mod help;
pub mod mods;
pub mod server;

use crate::error::AppError;
use crate::handoff::{Choice, PromptId};
use crate::identity::Identity;
use crate::state::AppState;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};

/// Grammar of everything after the identity on a console line.
#[derive(Debug, Parser)]
#[command(
    name = "<your-id>",
    no_binary_name = true,
    disable_help_subcommand = true,
    about = "Claim server slots, hand them over and track time owned"
)]
pub struct ConsoleLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Claim a slot, asking current owners to give way when all are taken
    Start {
        /// Server code shown to other players
        #[arg(required = true)]
        label: Vec<String>,
    },
    /// Show who owns each slot
    Status,
    /// End your server session
    End,
    /// Show the leaderboard and your own time
    Stats,
    /// Toggle whether your time is published
    #[command(alias = "optout")]
    OptOut,
    /// Answer a prompt
    Respond {
        prompt: PromptId,
        #[arg(value_enum, ignore_case = true)]
        choice: Choice,
    },
    /// List prompts waiting for your answer
    Prompts,
    /// Administrators: change the number of slots
    Resize {
        slots: usize,
        /// End active sessions when idle slots alone cannot cover the shrink
        #[arg(long)]
        force: bool,
    },
    /// List the commands
    Help,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Status => "status",
            Self::End => "end",
            Self::Stats => "stats",
            Self::OptOut => "opt-out",
            Self::Respond { .. } => "respond",
            Self::Prompts => "prompts",
            Self::Resize { .. } => "resize",
            Self::Help => "help",
        }
    }

    /// Commands that change ownership run one at a time per caller, in the
    /// order they arrived. Answers and listings never wait behind them, since
    /// a pending `start` may itself be waiting for its caller's answer.
    pub fn runs_in_caller_order(&self) -> bool {
        !matches!(self, Self::Respond { .. } | Self::Prompts | Self::Help)
    }
}

/// One parsed input line: who is asking and what for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub caller: Identity,
    pub command: Command,
}

/// Parse `<identity> <command> [args...]`.
pub fn parse_line(line: &str) -> Result<Request, AppError> {
    let mut words = line.split_whitespace();
    let caller = words
        .next()
        .ok_or_else(|| AppError::Command("empty line".into()))?;

    let command = match ConsoleLine::try_parse_from(words) {
        Ok(parsed) => parsed.command,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => Command::Help,
        Err(e) => return Err(AppError::Command(e.to_string().trim_end().to_string())),
    };

    Ok(Request {
        caller: Identity::from(caller),
        command,
    })
}

/// Run a request against the tracker and build its JSON reply.
///
/// The caller's own slot is brought up to date first, whatever they asked.
pub async fn execute(state: &AppState, request: Request) -> Result<serde_json::Value, AppError> {
    let Request { caller, command } = request;
    state.touch(&caller);

    match command {
        Command::Start { label } => server::start(state, &caller, &label.join(" ")).await,
        Command::Status => server::status(state),
        Command::End => server::end(state, &caller),
        Command::Stats => server::stats(state, &caller),
        Command::OptOut => server::opt_out(state, &caller),
        Command::Respond { prompt, choice } => server::respond(state, &caller, prompt, choice),
        Command::Prompts => server::prompts(state, &caller),
        Command::Resize { slots, force } => mods::resize(state, &caller, slots, force),
        Command::Help => Ok(help::help()),
    }
}
