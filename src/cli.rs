use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "narrative", version, about = "Branching narrative progression engine")]
pub struct Cli {
    /// Database path
    #[arg(long, env = "NARRATIVE_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import fragments from a JSON or TOML file
    Import(ImportArgs),
    /// Deactivate a fragment (logical delete)
    Deactivate(DeactivateArgs),
    /// Check the story graph for dangling choices and dead ends
    Validate,
    /// Start a user's story at an entry fragment
    Start(StartArgs),
    /// Take a choice from the user's current fragment
    Advance(AdvanceArgs),
    /// Complete the user's terminal fragment and apply its rewards
    Finish(UserArgs),
    /// Show the fragment the user is currently on
    Show(UserArgs),
    /// Show a user's progress summary
    Progress(UserArgs),
    /// Clear a user's narrative progress
    Reset(UserArgs),
    /// Show database health: fragment, user and ledger counts
    Status,
}

#[derive(Parser)]
pub struct ImportArgs {
    /// Fragment file (.json or .toml) containing a `fragments` list
    pub file: PathBuf,
}

#[derive(Parser)]
pub struct DeactivateArgs {
    /// Fragment ID
    pub id: String,
}

#[derive(Parser)]
pub struct UserArgs {
    /// User ID
    #[arg(long, short)]
    pub user: String,
}

#[derive(Parser)]
pub struct StartArgs {
    /// User ID
    #[arg(long, short)]
    pub user: String,

    /// Entry fragment ID
    pub fragment: String,
}

#[derive(Parser)]
pub struct AdvanceArgs {
    /// User ID
    #[arg(long, short)]
    pub user: String,

    /// Zero-based index of the choice to take
    pub choice: usize,
}
