use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "archivist",
    about = "Archivist: keeps archives open and replicating to peers",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the archive host
    Serve(ServeArgs),
    /// Generate or inspect archive keys
    Key(KeyArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Default)]
pub struct ServeArgs {
    /// HTTP listen address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Directory holding one subdirectory per archive
    #[arg(long)]
    pub storage: Option<PathBuf>,
    /// Swarm listen address
    #[arg(long)]
    pub swarm_listen: Option<SocketAddr>,
    /// Peer to dial when an archive joins the swarm (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,
    /// Host archives without joining the swarm
    #[arg(long)]
    pub no_swarm: bool,
}

#[derive(Args)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub action: KeyAction,
}

#[derive(Subcommand)]
pub enum KeyAction {
    /// Print a new random archive key
    Generate,
    /// Print the swarm discovery key for an archive key
    Discovery { key: String },
}
