use crate::config::Args as ConfigArgs;
use clap::Args;

#[derive(Debug, Args)]
pub struct ServerCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}
