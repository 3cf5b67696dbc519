use anyhow::Result;

use crate::cli::{AccountCommand, Cli, ProfileArgs};
use crate::commands::{print_broadcast, service};
use crate::operation::Asset;
use crate::service::Profile;

pub async fn run(cli: &Cli, cmd: &AccountCommand) -> Result<()> {
	let (svc, _) = service(cli).await?;

	let result = match cmd {
		AccountCommand::Profile(args) => svc.update_profile(&profile(args)).await?,
		AccountCommand::ClaimRewards { hive, hbd, vests } => {
			let hive: Asset = hive.parse()?;
			let hbd: Asset = hbd.parse()?;
			let vests: Asset = vests.parse()?;
			svc.claim_rewards(hive, hbd, vests).await?
		}
		AccountCommand::DelegateRc { delegatees, max_rc } => {
			svc.delegate_rc(delegatees, *max_rc).await?
		}
		AccountCommand::Transfer { to, amount, memo } => {
			let amount: Asset = amount.parse()?;
			println!("Sending {amount} to @{to}...");
			svc.transfer(to, amount, memo).await?
		}
	};

	print_broadcast(result);
	Ok(())
}

fn profile(args: &ProfileArgs) -> Profile {
	Profile {
		name: args.name.clone(),
		about: args.about.clone(),
		location: args.location.clone(),
		website: args.website.clone(),
		profile_image: args.profile_image.clone(),
		cover_image: args.cover_image.clone(),
	}
}
