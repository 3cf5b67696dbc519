use anyhow::Result;

use crate::cli::{Cli, SessionCommand};
use crate::commands::{service, Context};

pub async fn run(cli: &Cli, cmd: &SessionCommand) -> Result<()> {
	match cmd {
		SessionCommand::Status => show_status(cli),
		SessionCommand::Logout => logout(cli).await,
	}
}

fn show_status(cli: &Cli) -> Result<()> {
	let ctx = Context::load(cli)?;
	let config = &ctx.config;

	let method = config
		.session
		.login_type
		.map(|t| t.to_string())
		.unwrap_or_else(|| "not set".into());
	let user = config.session.username.as_deref().unwrap_or("not logged in");

	println!("Session");
	println!("  Account: {user}");
	println!("  Method:  {method}");
	println!("  Network: {}", ctx.network);
	println!("  Node:    {}", config.node_url(&ctx.network));
	if let Some(pairing) = &config.hiveauth.pairing {
		let expires = chrono::DateTime::from_timestamp(pairing.expires, 0)
			.map(|t| t.to_rfc3339())
			.unwrap_or_else(|| pairing.expires.to_string());
		println!("  HiveAuth pairing for @{} until {expires}", pairing.username);
	}
	Ok(())
}

async fn logout(cli: &Cli) -> Result<()> {
	// Let the backend drop what it holds (vault unlock, relay requests)
	// before the saved session goes away.
	match service(cli).await {
		Ok((svc, _)) => {
			if let Err(e) = svc.logout().await {
				tracing::warn!(error = %e, "backend did not end its session cleanly");
			}
		}
		Err(e) => tracing::debug!(error = %e, "no backend session to end"),
	}

	let mut ctx = Context::load(cli)?;
	let previous = ctx.config.session.username.take();
	ctx.config.session.login_type = None;
	ctx.config.hiveauth.pairing = None;
	ctx.config.save()?;
	match previous {
		Some(user) => println!("Logged out @{user}."),
		None => println!("No saved session."),
	}
	Ok(())
}
