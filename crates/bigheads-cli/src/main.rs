//! BigHeads command-line interface.
//!
//! Runs the mesh node and offers offline utilities (identity, peer list,
//! chat export, block list) against the same data directory.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// BigHeads - offline BLE mesh messenger
#[derive(Parser)]
#[command(name = "bigheads")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.bigheads")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show (creating on first run) this node's identity
    Identity,

    /// Run the mesh node until interrupted
    Start,

    /// List known peers
    Peers,

    /// Block or unblock a peer
    Block {
        /// Peer node id (32 hex chars)
        peer: String,

        /// Lift the block instead of setting it
        #[arg(long)]
        unblock: bool,
    },

    /// Export a chat history
    Export {
        /// Chat id: a peer node id, or "broadcast"
        chat: String,

        /// Output format
        #[arg(long, default_value = "json")]
        format: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        out: Option<String>,
    },
}

/// Exit codes: 0 ok, 2 configuration error, 3 persistence init failure,
/// 4 no BLE adapter.
fn exit_code(e: &bigheads_core::Error) -> i32 {
    match e {
        bigheads_core::Error::Config(_) => 2,
        bigheads_core::Error::Storage(_) => 3,
        bigheads_core::Error::NoAdapter => 4,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let data_dir = commands::expand_data_dir(&cli.data_dir);
    let result = match cli.command {
        Commands::Identity => commands::identity(&data_dir),
        Commands::Start => commands::start(&data_dir).await,
        Commands::Peers => commands::peers(&data_dir),
        Commands::Block { peer, unblock } => commands::block(&data_dir, &peer, !unblock),
        Commands::Export { chat, format, out } => {
            commands::export(&data_dir, &chat, &format, out.as_deref())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(exit_code(&e));
    }
}
