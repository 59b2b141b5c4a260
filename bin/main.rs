use std::path::PathBuf;

use clap::Parser;
use policy_feed::{
    config::{self, CONFIG_ENV, Config},
    controller::Controller,
    internal, logging,
};

/// Mirror policy delegation requests to UDP collectors
#[derive(Parser, Debug)]
#[command(name = "policy-feed")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Number of workers, overriding the configuration file
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init();

    let path = config::locate(cli.config)?;
    let mut config = Config::load(&path)?;

    if let Some(workers) = cli.workers {
        config.workers = Some(workers);
    }

    internal!(level = INFO, "Using configuration file {}", path.display());

    Controller::bind(&config).await?.run().await
}
