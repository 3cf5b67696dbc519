use anyhow::Result;

use crate::cli::{Cli, CommunityCommand};
use crate::commands::{print_broadcast, service};

pub async fn run(cli: &Cli, cmd: &CommunityCommand) -> Result<()> {
	let (svc, _) = service(cli).await?;

	let result = match cmd {
		CommunityCommand::Subscribe { community } => svc.subscribe(community).await?,
		CommunityCommand::Unsubscribe { community } => svc.unsubscribe(community).await?,
		CommunityCommand::Flag {
			community,
			author,
			permlink,
			notes,
		} => svc.flag(community, author, permlink, notes).await?,
	};

	print_broadcast(result);
	Ok(())
}
