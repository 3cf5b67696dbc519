use async_trait::async_trait;
use tracing::debug;

use super::{ChainContext, Signer};
use crate::chain::ChainParams;
use crate::crypto::{Password, PrivateKey};
use crate::error::{Result, SignerError};
use crate::types::{BroadcastRequest, BroadcastResult, KeyType, LoginType, SignChallengeRequest};

/// Signs with a private key supplied in the request.  The key is decoded
/// for one call and erased when the call returns.
pub struct WifSigner {
	chain: ChainContext,
	key_prefix: &'static str,
	check_authority: bool,
}

impl WifSigner {
	pub fn new(chain: ChainContext, params: &ChainParams) -> Self {
		Self {
			chain,
			key_prefix: params.key_prefix,
			check_authority: false,
		}
	}

	/// Before broadcasting, confirm through the node that the key belongs
	/// to the account, turning a post-hoc verification failure into an
	/// up-front `InvalidCredential`.
	pub fn with_authority_check(mut self, enabled: bool) -> Self {
		self.check_authority = enabled;
		self
	}

	async fn ensure_authority(&self, username: &str, key: &PrivateKey) -> Result<()> {
		let public = key.public_key().to_string_with_prefix(self.key_prefix);
		let refs = self.chain.node().get_key_references(&[public.clone()]).await?;
		if refs.iter().flatten().any(|account| account == username) {
			Ok(())
		} else {
			Err(SignerError::InvalidCredential(format!(
				"{public} is not an authority of @{username}"
			)))
		}
	}
}

/// Decode the request's secret: a WIF is used as is, anything else is
/// treated as the account's master password and the role key derived.
fn unlock(username: &str, key_type: KeyType, password: Option<&Password>) -> Result<PrivateKey> {
	let password = password.filter(|p| !p.is_empty()).ok_or_else(|| {
		SignerError::InvalidCredential("a private key or master password is required".into())
	})?;
	match PrivateKey::from_wif(password.expose()) {
		Ok(key) => Ok(key),
		Err(e) if looks_like_wif(password) => Err(SignerError::InvalidCredential(e.to_string())),
		Err(_) => Ok(PrivateKey::from_login(username, key_type.as_str(), password)?),
	}
}

fn looks_like_wif(password: &Password) -> bool {
	let s = password.expose();
	s.len() == 51 && s.starts_with('5')
}

#[async_trait]
impl Signer for WifSigner {
	fn login_type(&self) -> LoginType {
		LoginType::Wif
	}

	async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String> {
		let key = unlock(&req.username, req.key_type, req.password.as_ref())?;
		Ok(key.sign_message(&req.message).to_hex())
	}

	async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult> {
		let key = unlock(&req.username, req.key_type, req.password.as_ref())?;
		if self.check_authority {
			self.ensure_authority(&req.username, &key).await?;
		}
		let digest = self.chain.prepare(&req.operation).await?;
		let signature = key.sign_digest(&digest.digest()?).to_hex();
		drop(key);
		debug!(username = %req.username, "raw key signature produced");
		self.chain.submit(digest, signature).await
	}

	async fn destroy(&self, _username: &str) -> Result<()> {
		// Keys never outlive a call.
		Ok(())
	}
}
