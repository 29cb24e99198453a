// CLI subcommand dispatch.

use clap::Subcommand;

pub mod config;
pub mod join;

#[derive(Subcommand)]
pub enum Command {
    /// Join a document session and edit it from stdin
    Join(join::JoinArgs),
    /// Show or change the client configuration
    Config(config::ConfigArgs),
}

pub fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Join(args) => join::run(args),
        Command::Config(args) => config::run(args),
    }
}
