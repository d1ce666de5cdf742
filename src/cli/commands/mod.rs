pub mod models;
pub mod server;

pub use models::ModelsCommand;
pub use server::ServerCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Start the embedstream gateway
    Server(ServerCommand),
    /// List configured models and optionally check their backend status
    Models(ModelsCommand),
}
