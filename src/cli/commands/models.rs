use crate::config::Args as ConfigArgs;
use clap::Args;

#[derive(Debug, Args)]
pub struct ModelsCommand {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Query the backend for each model's status
    #[arg(long)]
    pub check: bool,

    /// Print the catalog as JSON
    #[arg(long)]
    pub json: bool,
}
