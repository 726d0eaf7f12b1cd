use anyhow::Result;
use clap::Parser;
use tracing::{error, metadata::LevelFilter};

use config::{Cli, Command};

mod config;
mod training;

fn main() {
    configure_logging();

    if let Err(err) = run(Cli::parse()) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command() {
        Command::Train(config) => {
            training::setup_and_train_model(&config)?;
        }
        Command::Generate(config) => {
            training::generate_from_snapshot(&config)?;
        }
    }
    Ok(())
}

fn configure_logging() {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(LevelFilter::INFO)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logging subscriber: {err}");
    }
}
