use std::sync::Arc;

use tracing::debug;

use crate::chain::ChainParams;
use crate::crypto::{parse_digest, Signature};
use crate::error::{Result, SignerError};
use crate::rpc::{NodeApi, VerifySignaturesRequest};
use crate::tx_builder::TransactionBuilder;
use crate::types::KeyType;

/// What to verify.
#[derive(Debug, Clone)]
pub struct VerifyRequest<'a> {
	pub username: &'a str,
	pub digest_hex: &'a str,
	pub signature: &'a str,
	pub key_type: KeyType,
	/// When present, its digest is rebuilt and must equal `digest_hex`.
	pub serialized_transaction: Option<&'a str>,
	/// Additionally require the recovered key to be registered on
	/// `username`'s authorities.
	pub strict: bool,
}

/// Checks signatures against account authorities through the node.
pub struct SignatureVerifier {
	node: Arc<dyn NodeApi>,
	builder: TransactionBuilder,
	key_prefix: &'static str,
}

impl SignatureVerifier {
	pub fn new(node: Arc<dyn NodeApi>, params: &ChainParams) -> Self {
		Self {
			node,
			builder: TransactionBuilder::new(params),
			key_prefix: params.key_prefix,
		}
	}

	pub async fn verify(&self, req: &VerifyRequest<'_>) -> Result<bool> {
		let digest_hex = req.digest_hex.trim_start_matches("0x").to_lowercase();

		if let Some(serialized) = req.serialized_transaction {
			let rebuilt = self.builder.from_serialized(serialized)?;
			if rebuilt.digest_hex != digest_hex {
				return Err(SignerError::VerificationFailed(
					"digest does not match the supplied transaction".into(),
				));
			}
		}

		let mut request = VerifySignaturesRequest {
			hash: digest_hex.clone(),
			signatures: vec![req.signature.to_owned()],
			..Default::default()
		};
		let bucket = match req.key_type {
			KeyType::Posting => &mut request.required_posting,
			KeyType::Active => &mut request.required_active,
			KeyType::Owner => &mut request.required_owner,
		};
		bucket.push(req.username.to_owned());

		let valid = self.node.verify_signatures(&request).await?;
		debug!(username = req.username, key_type = %req.key_type, valid, "verify_signatures");
		if !valid || !req.strict {
			return Ok(valid);
		}

		let digest = parse_digest(&digest_hex)?;
		let signature: Signature = req.signature.parse()?;
		let key = signature
			.recover(&digest)?
			.to_string_with_prefix(self.key_prefix);
		let references = self.node.get_key_references(&[key.clone()]).await?;
		let registered = references
			.iter()
			.flatten()
			.any(|account| account == req.username);
		debug!(username = req.username, %key, registered, "strict key reference check");
		Ok(registered)
	}

	/// Like [`Self::verify`] but a negative verdict is an error.
	pub async fn ensure_valid(&self, req: &VerifyRequest<'_>) -> Result<()> {
		if self.verify(req).await? {
			Ok(())
		} else {
			Err(SignerError::VerificationFailed(format!(
				"signature is not valid for @{} ({})",
				req.username, req.key_type
			)))
		}
	}
}
