pub mod complete;
pub mod find_port;
pub mod status;

pub use complete::CompleteCommand;
pub use find_port::FindPortCommand;
pub use status::StatusCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Stream a completion for a prompt to stdout (Ctrl-C cancels)
    Complete(CompleteCommand),
    /// Start the backend and report whether it became ready
    Status(StatusCommand),
    /// Print an unused TCP port
    FindPort(FindPortCommand),
}
