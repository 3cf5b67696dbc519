use anyhow::Result;

use crate::cli::{Cli, SocialCommand};
use crate::commands::{print_broadcast, service};

pub async fn run(cli: &Cli, cmd: &SocialCommand) -> Result<()> {
	let (svc, _) = service(cli).await?;

	let result = match cmd {
		SocialCommand::Follow { account } => svc.follow(account).await?,
		SocialCommand::Unfollow { account } => svc.unfollow(account).await?,
		SocialCommand::Mute { account } => svc.mute(account).await?,
		SocialCommand::Unmute { account } => svc.unmute(account).await?,
	};

	print_broadcast(result);
	Ok(())
}
