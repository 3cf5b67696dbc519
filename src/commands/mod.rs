pub mod account;
pub mod community;
pub mod login;
pub mod post;
pub mod session;
pub mod sign;
pub mod social;
pub mod tx;
pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use zeroize::Zeroizing;

use crate::chain::ChainParams;
use crate::cli::Cli;
use crate::config::{Config, Pairing};
use crate::crypto::{Password, PublicKey};
use crate::rpc::{HttpNode, NodeApi};
use crate::service::{OperationService, SecretPrompt, Session};
use crate::signer::hiveauth::{HiveAuthSession, HiveAuthSigner, WebSocketRelay};
use crate::signer::keychain::{BrowserBridge, KeychainSigner};
use crate::signer::vault::{HttpVault, VaultSigner};
use crate::signer::wif::WifSigner;
use crate::signer::{ChainContext, Signer, SignerFacade};
use crate::tx_builder::TransactionBuilder;
use crate::types::{BroadcastResult, KeyType, LoginType};
use crate::verify::SignatureVerifier;

/// Everything a command needs to talk to the chain.
pub struct Context {
	pub config: Config,
	pub network: String,
	pub params: &'static ChainParams,
	pub node: Arc<dyn NodeApi>,
}

impl Context {
	pub fn load(cli: &Cli) -> Result<Self> {
		let config = Config::load()?;
		let network = cli
			.network
			.map(|n| n.as_str().to_owned())
			.unwrap_or_else(|| config.node.network.clone());
		let url = cli
			.node_url
			.clone()
			.unwrap_or_else(|| config.node_url(&network));
		let params = config.chain(&network);
		tracing::debug!(%network, %url, "using node");
		Ok(Self {
			node: Arc::new(HttpNode::new(&url)),
			config,
			network,
			params,
		})
	}

	pub fn builder(&self) -> TransactionBuilder {
		TransactionBuilder::new(self.params).with_expiration_secs(self.config.node.expiration_secs)
	}

	pub fn chain(&self) -> ChainContext {
		ChainContext::new(self.node.clone(), self.builder())
	}

	pub fn verifier(&self) -> SignatureVerifier {
		SignatureVerifier::new(self.node.clone(), self.params)
	}
}

/// Login method from the CLI flag or the saved session.
pub fn resolve_method(cli: &Cli, config: &Config) -> Result<LoginType> {
	cli.method
		.map(LoginType::from)
		.or(config.session.login_type)
		.ok_or_else(|| anyhow::anyhow!("Not logged in. Run: hive-signer login <username> --with <method>"))
}

/// Account from the CLI flag or the saved session.
pub fn resolve_user(cli: &Cli, config: &Config) -> Result<String> {
	cli.user
		.clone()
		.or_else(|| config.session.username.clone())
		.ok_or_else(|| anyhow::anyhow!("No account given. Use --user or run: hive-signer login"))
}

pub async fn connect_hiveauth(ctx: &Context) -> Result<HiveAuthSigner> {
	let (relay, inbound) = WebSocketRelay::connect(&ctx.config.hiveauth.relay_url).await?;
	Ok(
		HiveAuthSigner::new(Arc::new(relay), inbound, ctx.chain(), ctx.params.key_prefix)
			.with_timeout(Duration::from_secs(ctx.config.hiveauth.timeout_secs)),
	)
}

pub fn restore_pairing(pairing: &Pairing) -> Result<HiveAuthSession> {
	let key: [u8; 32] = hex::decode(&pairing.auth_key)
		.ok()
		.and_then(|raw| raw.try_into().ok())
		.context("stored HiveAuth key is corrupt; log in again")?;
	let mut session = HiveAuthSession::new(&pairing.username, key, pairing.expires);
	if let Some(posting) = &pairing.posting_key {
		session.keys.insert(KeyType::Posting, PublicKey::parse(posting)?);
	}
	Ok(session)
}

/// Build the one backend `login_type` needs.
pub async fn build_signer(ctx: &Context, login_type: LoginType) -> Result<Arc<dyn Signer>> {
	Ok(match login_type {
		LoginType::Wif => Arc::new(WifSigner::new(ctx.chain(), ctx.params).with_authority_check(true)),
		LoginType::Keychain => {
			let limit = match ctx.config.keychain.approval_timeout_secs {
				0 => None,
				secs => Some(Duration::from_secs(secs)),
			};
			Arc::new(KeychainSigner::new(Arc::new(BrowserBridge::new(limit)), ctx.chain()))
		}
		LoginType::HiveAuth => {
			let signer = connect_hiveauth(ctx).await?;
			if let Some(pairing) = &ctx.config.hiveauth.pairing {
				signer.pair(restore_pairing(pairing)?);
			}
			Arc::new(signer)
		}
		LoginType::HbAuth => Arc::new(VaultSigner::new(
			Arc::new(HttpVault::new(&ctx.config.vault.url)),
			ctx.chain(),
		)),
	})
}

/// An operation service logged in with the resolved session.
pub async fn service(cli: &Cli) -> Result<(OperationService, Context)> {
	let ctx = Context::load(cli)?;
	let login_type = resolve_method(cli, &ctx.config)?;
	let username = resolve_user(cli, &ctx.config)?;
	let signer = build_signer(&ctx, login_type).await?;

	let facade = Arc::new(SignerFacade::builder().register(signer).build());
	let svc = OperationService::new(facade, Arc::new(ctx.verifier()))
		.with_app(&ctx.config.hiveauth.app_name)
		.with_secrets(secret_prompt(cli));
	svc.login(Session { username, login_type });
	Ok((svc, ctx))
}

/// Hands out `--password` (or `HIVE_SIGNER_PASSWORD`) to each call that
/// needs a secret.
pub fn secret_prompt(cli: &Cli) -> SecretPrompt {
	let secret = cli.password.clone().map(Zeroizing::new);
	Arc::new(move |_: &str, _: LoginType, _: KeyType| {
		secret.as_deref().map(|s| Password::new(s.as_str()))
	})
}

pub fn print_broadcast(result: Option<BroadcastResult>) {
	match result {
		Some(r) => {
			println!("Broadcast accepted.");
			println!("TX: {}", r.transaction_id);
		}
		None => println!("Not logged in; nothing was sent."),
	}
}
