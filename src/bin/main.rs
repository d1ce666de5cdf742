//! embedstream binary.
//!
//! This binary provides the main entry point for the embedstream gateway, a
//! bidirectional gRPC service that turns streams of images into embedding
//! vectors using a model-serving backend.

use clap::Parser;
use embedstream_core::cli::{
    commands::Commands,
    handlers::{handle_models, handle_server},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(cmd) => handle_server(cmd).await?,
        Commands::Models(cmd) => handle_models(cmd).await?,
    }

    Ok(())
}
