use anyhow::{Context as _, Result};

use crate::cli::{Cli, TxCommand};
use crate::commands::Context;

pub async fn run(cli: &Cli, cmd: &TxCommand) -> Result<()> {
	let ctx = Context::load(cli)?;

	match cmd {
		TxCommand::Status { id } => {
			let status = ctx.node.find_transaction(id).await?;
			println!("Transaction: {id}");
			println!("Status:      {status:?}");
			if status.is_final() {
				println!("Irreversible.");
			}
			Ok(())
		}
		TxCommand::Digest { path } => {
			let json = std::fs::read_to_string(path)
				.with_context(|| format!("cannot read {}", path.display()))?;
			let digest = ctx.builder().from_serialized(&json)?;
			println!("Transaction: {}", digest.transaction.id()?);
			println!("Digest:      {}", digest.digest_hex);
			println!("Expires:     {}", digest.transaction.expiration);
			Ok(())
		}
	}
}
