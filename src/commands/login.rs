use std::sync::Arc;

use anyhow::Result;

use crate::cli::{Cli, MethodArg};
use crate::commands::{build_signer, connect_hiveauth, secret_prompt, Context};
use crate::config::Pairing;
use crate::service::{OperationService, Session};
use crate::signer::SignerFacade;
use crate::types::{KeyType, LoginType};

pub async fn run(cli: &Cli, username: &str, with: MethodArg, prove: bool) -> Result<()> {
	let mut ctx = Context::load(cli)?;
	let login_type = LoginType::from(with);

	match login_type {
		LoginType::Wif | LoginType::HbAuth if cli.password.is_none() => {
			anyhow::bail!("{login_type} login needs a secret: pass --password or set HIVE_SIGNER_PASSWORD")
		}
		LoginType::HiveAuth => {
			let pairing = pair(&ctx, username).await?;
			ctx.config.hiveauth.pairing = Some(pairing);
		}
		_ => {}
	}

	if prove {
		let signer = build_signer(&ctx, login_type).await?;
		let facade = Arc::new(SignerFacade::builder().register(signer).build());
		let svc = OperationService::new(facade, Arc::new(ctx.verifier())).with_secrets(secret_prompt(cli));
		svc.login(Session {
			username: username.to_owned(),
			login_type,
		});
		if let Some(proof) = svc.login_proof().await? {
			println!("Login proof verified.");
			println!("  Message:   {}", proof.message);
			println!("  Signature: {}", proof.signature);
		}
	}

	ctx.config.session.login_type = Some(login_type);
	ctx.config.session.username = Some(username.to_owned());
	ctx.config.save()?;
	println!("Logged in as @{username} with {login_type}.");
	if login_type == LoginType::Wif || login_type == LoginType::HbAuth {
		println!("The secret is not saved; supply it again with each command.");
	}
	Ok(())
}

/// Run the HiveAuth handshake, showing the pairing link as a QR code.
async fn pair(ctx: &Context, username: &str) -> Result<Pairing> {
	let signer = connect_hiveauth(ctx).await?;
	let session = signer
		.authenticate(
			username,
			&ctx.config.hiveauth.relay_url,
			&ctx.config.hiveauth.app_name,
			|link| {
				match qrcode::QrCode::new(link) {
					Ok(code) => {
						let rendered = code
							.render::<char>()
							.quiet_zone(false)
							.module_dimensions(2, 1)
							.build();
						println!("{rendered}");
					}
					Err(e) => tracing::warn!(error = %e, "could not render QR code"),
				}
				println!();
				println!("Scan with your HiveAuth app, or open: {link}");
				if let Err(e) = opener::open(link) {
					tracing::debug!(error = %e, "no handler for has:// links");
				}
			},
		)
		.await?;

	Ok(Pairing {
		username: session.username.clone(),
		auth_key: hex::encode(*session.auth_key),
		expires: session.expires,
		posting_key: session
			.keys
			.get(&KeyType::Posting)
			.map(|k| k.to_string_with_prefix(ctx.params.key_prefix)),
	})
}
