use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hive_signer::cli::{Cli, Command};
use hive_signer::commands;

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive_signer=info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();

	match &cli.command {
		Command::Login {
			username,
			with,
			prove,
		} => commands::login::run(&cli, username, *with, *prove).await,
		Command::Session { command } => commands::session::run(&cli, command).await,
		Command::Sign { command } => commands::sign::run(&cli, command).await,
		Command::Post { command } => commands::post::run(&cli, command).await,
		Command::Social { command } => commands::social::run(&cli, command).await,
		Command::Community { command } => commands::community::run(&cli, command).await,
		Command::Account { command } => commands::account::run(&cli, command).await,
		Command::Verify(args) => commands::verify::run(&cli, args).await,
		Command::Tx { command } => commands::tx::run(&cli, command).await,
	}
}
