use anyhow::{Context as _, Result};

use crate::cli::{Cli, VerifyArgs};
use crate::commands::Context;
use crate::crypto::sha256;
use crate::types::KeyType;
use crate::verify::VerifyRequest;

pub async fn run(cli: &Cli, args: &VerifyArgs) -> Result<()> {
	let ctx = Context::load(cli)?;
	let verifier = ctx.verifier();

	let digest_hex = match (&args.digest, &args.message) {
		(Some(digest), _) => digest.clone(),
		(None, Some(message)) => hex::encode(sha256(message.as_bytes())),
		(None, None) => anyhow::bail!("pass --digest or --message"),
	};
	let transaction = match &args.transaction {
		Some(path) => Some(
			std::fs::read_to_string(path)
				.with_context(|| format!("cannot read {}", path.display()))?,
		),
		None => None,
	};

	let key_type = KeyType::from(args.key_type);
	let valid = verifier
		.verify(&VerifyRequest {
			username: &args.username,
			digest_hex: &digest_hex,
			signature: &args.signature,
			key_type,
			serialized_transaction: transaction.as_deref(),
			strict: args.strict,
		})
		.await?;

	if valid {
		println!("Valid: signed by @{}'s {key_type} authority.", args.username);
		Ok(())
	} else {
		anyhow::bail!("Invalid: not signed by @{}'s {key_type} authority.", args.username)
	}
}
