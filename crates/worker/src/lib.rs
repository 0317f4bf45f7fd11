//! `jobrelay-worker`: runs queue consumers and the operator subcommands.

pub mod cli;
pub mod commands;
pub mod handlers;
pub mod shutdown;

pub use cli::Cli;
pub use commands::run;
