//! Defines the sidecar's CLI through clap types.

mod agent;
mod keygen;
mod serve;

use std::{
    env,
    path::{Path, PathBuf},
};

use clap::Parser;

pub use self::agent::AgentCommand;
pub use self::keygen::KeygenCommand;
pub use self::serve::ServeCommand;

/// Command line options, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "jsx-tool", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Serve(subcommand) => subcommand.run(),
            Subcommand::Agent(subcommand) => subcommand.run(),
            Subcommand::Keygen(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Run the sidecar next to a web project: message bus, reverse proxy,
    /// desktop socket, and file watchers.
    Serve(ServeCommand),
    /// Run the host agent, tunnelling host-side operations into a bus.
    Agent(AgentCommand),
    /// Generate (or regenerate) the project's ECDSA keypair.
    Keygen(KeygenCommand),
}

impl Subcommand {
    pub fn project_path(&self) -> &Path {
        match self {
            Subcommand::Serve(cmd) => &cmd.project,
            Subcommand::Agent(cmd) => &cmd.project,
            Subcommand::Keygen(cmd) => &cmd.project,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Serve(_) => "serve",
            Subcommand::Agent(_) => "agent",
            Subcommand::Keygen(_) => "keygen",
        }
    }
}

/// Makes a path absolute against the current directory without touching the
/// filesystem.
pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
