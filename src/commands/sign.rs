use anyhow::{Context as _, Result};

use crate::cli::{Cli, SignCommand};
use crate::commands::service;
use crate::types::KeyType;

pub async fn run(cli: &Cli, cmd: &SignCommand) -> Result<()> {
	let (svc, _) = service(cli).await?;

	let signature = match cmd {
		SignCommand::Challenge { message, key_type } => {
			svc.sign_challenge(message.as_bytes(), KeyType::from(*key_type))
				.await?
		}
		SignCommand::Image { path } => {
			let image = std::fs::read(path)
				.with_context(|| format!("cannot read {}", path.display()))?;
			svc.sign_image_upload(&image).await?
		}
		SignCommand::Proof => {
			if let Some(proof) = svc.login_proof().await? {
				println!("Message:   {}", proof.message);
				println!("Signature: {}", proof.signature);
				println!("Verified against the account's posting authority.");
			}
			return Ok(());
		}
	};

	match signature {
		Some(sig) => println!("{sig}"),
		None => println!("Not logged in; nothing was signed."),
	}
	Ok(())
}
