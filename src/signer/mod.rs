pub mod hiveauth;
pub mod keychain;
pub mod vault;
pub mod wif;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::{Result, SignerError};
use crate::operation::Operation;
use crate::rpc::NodeApi;
use crate::tx_builder::{TransactionBuilder, TransactionDigest};
use crate::types::{BroadcastRequest, BroadcastResult, KeyType, LoginType, SignAction, SignChallengeRequest};

/// One credential mechanism.  Implementations may hold session handles
/// (a relay pairing, an open bridge) but never long-lived key material.
#[async_trait]
pub trait Signer: Send + Sync {
	/// The login type this backend serves.
	fn login_type(&self) -> LoginType;

	/// Whether this backend can handle `action` for `key_type`.  The facade
	/// answers `NotImplemented` for unsupported shapes without calling in.
	fn supports(&self, _action: SignAction, _key_type: KeyType) -> bool {
		true
	}

	/// Backends over a non-reentrant resource ask the facade to serialize
	/// calls per (account, key type).
	fn serialize_per_key(&self) -> bool {
		false
	}

	/// Sign `req.message` and return the hex signature.
	async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String>;

	/// Build, sign and broadcast `req.operation`.
	async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult>;

	/// Drop any session state held for `username`.  Safe without a session.
	async fn destroy(&self, username: &str) -> Result<()>;
}

/// Node access plus transaction building, shared by every backend.
#[derive(Clone)]
pub struct ChainContext {
	node: Arc<dyn NodeApi>,
	builder: TransactionBuilder,
}

impl ChainContext {
	pub fn new(node: Arc<dyn NodeApi>, builder: TransactionBuilder) -> Self {
		Self { node, builder }
	}

	pub fn node(&self) -> &dyn NodeApi {
		self.node.as_ref()
	}

	pub fn builder(&self) -> &TransactionBuilder {
		&self.builder
	}

	/// Build a fresh single-operation transaction at the current head.
	pub async fn prepare(&self, operation: &Operation) -> Result<TransactionDigest> {
		let digest = self
			.builder
			.build(self.node.as_ref(), vec![operation.clone()])
			.await?;
		debug!(op = operation.name(), digest = %digest.digest_hex, "transaction prepared");
		Ok(digest)
	}

	/// Attach `signature` and hand the transaction to the node.
	pub async fn submit(&self, digest: TransactionDigest, signature: String) -> Result<BroadcastResult> {
		let transaction_id = digest.transaction.id()?;
		let transaction = digest.into_signed(vec![signature]);
		self.node.broadcast_transaction(&transaction).await?;
		info!(%transaction_id, "transaction accepted for inclusion");
		Ok(BroadcastResult {
			transaction_id,
			transaction,
		})
	}
}

/// Routes requests to the backend for their login type.
///
/// Construct one per application and pass it where it is needed; it holds
/// the per-(account, key type) locks used for backends that ask for them.
pub struct SignerFacade {
	wif: Option<Arc<dyn Signer>>,
	keychain: Option<Arc<dyn Signer>>,
	hiveauth: Option<Arc<dyn Signer>>,
	hbauth: Option<Arc<dyn Signer>>,
	locks: KeyedLocks,
}

impl SignerFacade {
	pub fn builder() -> SignerFacadeBuilder {
		SignerFacadeBuilder::default()
	}

	/// The backend serving `login_type`.  Fails when that backend was not
	/// registered; there is no fallback to another backend.
	pub fn resolve(&self, login_type: LoginType) -> Result<&dyn Signer> {
		let slot = match login_type {
			LoginType::Wif => &self.wif,
			LoginType::Keychain => &self.keychain,
			LoginType::HiveAuth => &self.hiveauth,
			LoginType::HbAuth => &self.hbauth,
		};
		slot.as_deref().ok_or_else(|| {
			SignerError::BackendUnavailable(format!("no {login_type} backend configured"))
		})
	}

	/// Resolve from a raw tag; unknown tags are `UnsupportedLoginType`.
	pub fn resolve_tag(&self, tag: &str) -> Result<&dyn Signer> {
		self.resolve(tag.parse()?)
	}

	pub async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String> {
		let signer = self.resolve(req.login_type)?;
		check_support(signer, SignAction::Challenge, req.key_type)?;
		debug!(login_type = %req.login_type, username = %req.username, key_type = %req.key_type, "sign challenge");

		let _guard = self.guard(signer, &req.username, req.key_type).await;
		signer.sign_challenge(req).await
	}

	pub async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult> {
		let signer = self.resolve(req.login_type)?;
		check_support(signer, SignAction::Broadcast, req.key_type)?;
		let required = req.operation.required_key_type();
		if req.key_type < required {
			return Err(SignerError::InvalidCredential(format!(
				"{} requires the {required} key, got {}",
				req.operation.name(),
				req.key_type
			)));
		}
		debug!(
			login_type = %req.login_type,
			username = %req.username,
			op = req.operation.name(),
			"broadcast"
		);

		let _guard = self.guard(signer, &req.username, req.key_type).await;
		signer.broadcast_transaction(req).await
	}

	pub async fn destroy(&self, username: &str, login_type: LoginType) -> Result<()> {
		let signer = self.resolve(login_type)?;
		signer.destroy(username).await?;
		self.locks.forget(username);
		debug!(%login_type, %username, "session destroyed");
		Ok(())
	}

	async fn guard(
		&self,
		signer: &dyn Signer,
		username: &str,
		key_type: KeyType,
	) -> Option<OwnedMutexGuard<()>> {
		if signer.serialize_per_key() {
			Some(self.locks.acquire(username, key_type).await)
		} else {
			None
		}
	}
}

fn check_support(signer: &dyn Signer, action: SignAction, key_type: KeyType) -> Result<()> {
	if signer.supports(action, key_type) {
		Ok(())
	} else {
		Err(SignerError::NotImplemented {
			backend: signer.login_type().as_str(),
			action: format!("{action} with the {key_type} key"),
		})
	}
}

#[derive(Default)]
pub struct SignerFacadeBuilder {
	backends: Vec<Arc<dyn Signer>>,
}

impl SignerFacadeBuilder {
	/// Register a backend under its own login type; a later registration
	/// for the same type replaces the earlier one.
	pub fn register(mut self, signer: Arc<dyn Signer>) -> Self {
		self.backends.push(signer);
		self
	}

	pub fn build(self) -> SignerFacade {
		let mut facade = SignerFacade {
			wif: None,
			keychain: None,
			hiveauth: None,
			hbauth: None,
			locks: KeyedLocks::default(),
		};
		for signer in self.backends {
			let slot = match signer.login_type() {
				LoginType::Wif => &mut facade.wif,
				LoginType::Keychain => &mut facade.keychain,
				LoginType::HiveAuth => &mut facade.hiveauth,
				LoginType::HbAuth => &mut facade.hbauth,
			};
			*slot = Some(signer);
		}
		facade
	}
}

/// Async mutexes keyed by (account, key type).
#[derive(Default)]
struct KeyedLocks {
	inner: Mutex<HashMap<(String, KeyType), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
	async fn acquire(&self, username: &str, key_type: KeyType) -> OwnedMutexGuard<()> {
		let lock = {
			let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
			map.entry((username.to_owned(), key_type))
				.or_default()
				.clone()
		};
		lock.lock_owned().await
	}

	/// Drop `username`'s locks.  A lock still held or waited on stays, so
	/// a call arriving during teardown still queues behind it.
	fn forget(&self, username: &str) {
		let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
		map.retain(|(user, _), lock| user != username || Arc::strong_count(lock) > 1);
	}
}
