use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod consumer;
mod github;
mod gitlab;
mod migrate;

#[derive(Parser, Debug)]
#[command(name = "bridge-processor")]
#[command(about = "Source-control ↔ contest-platform bridge processor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations.
    Migrate,

    /// Consume the issue and copilot-payment topics.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::Config::from_env().context("load processor config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Run => consumer::run(&cfg).await,
    }
}
