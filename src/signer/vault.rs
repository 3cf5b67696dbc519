//! Password-protected key store, unlocked for a single signature at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use argon2::Argon2;
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde_json::{json, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{ChainContext, Signer};
use crate::crypto::{sha256, CryptoError, Password, PrivateKey};
use crate::error::{Result, SignerError};
use crate::types::{
	BroadcastRequest, BroadcastResult, KeyType, LoginType, SignAction, SignChallengeRequest,
};

/// JSON-RPC error code for a wrong passphrase.
pub const ERR_WRONG_PASSPHRASE: i64 = -32001;
/// JSON-RPC error code for an account/role with no stored key.
pub const ERR_NO_KEY: i64 = -32002;

#[async_trait]
pub trait Vault: Send + Sync {
	async fn unlock(&self, account: &str, key_type: KeyType, passphrase: &Password) -> Result<()>;

	/// Sign a 32-byte digest with the unlocked key; returns the hex signature.
	async fn sign(&self, account: &str, key_type: KeyType, digest: &[u8; 32]) -> Result<String>;

	async fn lock(&self, account: &str) -> Result<()>;
}

pub struct VaultSigner {
	vault: Arc<dyn Vault>,
	chain: ChainContext,
	accounts: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VaultSigner {
	pub fn new(vault: Arc<dyn Vault>, chain: ChainContext) -> Self {
		Self {
			vault,
			chain,
			accounts: Mutex::new(HashMap::new()),
		}
	}

	fn account_lock(&self, account: &str) -> Arc<tokio::sync::Mutex<()>> {
		let mut map = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
		map.entry(account.to_owned()).or_default().clone()
	}

	/// unlock, sign, lock.  The vault is locked again even when signing
	/// fails.  Sessions on one account never overlap since `lock` is
	/// account wide.
	async fn sign_with(
		&self,
		account: &str,
		key_type: KeyType,
		password: Option<&Password>,
		digest: &[u8; 32],
	) -> Result<String> {
		let passphrase = password.filter(|p| !p.is_empty()).ok_or_else(|| {
			SignerError::InvalidCredential("a vault passphrase is required".into())
		})?;

		let account_lock = self.account_lock(account);
		let _session = account_lock.lock().await;

		self.vault.unlock(account, key_type, passphrase).await?;
		let signed = self.vault.sign(account, key_type, digest).await;
		if let Err(e) = self.vault.lock(account).await {
			warn!(%account, error = %e, "vault lock failed");
		}
		debug!(%account, %key_type, ok = signed.is_ok(), "vault session closed");
		signed
	}
}

#[async_trait]
impl Signer for VaultSigner {
	fn login_type(&self) -> LoginType {
		LoginType::HbAuth
	}

	fn supports(&self, _action: SignAction, key_type: KeyType) -> bool {
		key_type != KeyType::Owner
	}

	fn serialize_per_key(&self) -> bool {
		true
	}

	async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String> {
		self.sign_with(
			&req.username,
			req.key_type,
			req.password.as_ref(),
			&sha256(&req.message),
		)
		.await
	}

	async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult> {
		let digest = self.chain.prepare(&req.operation).await?;
		let signature = self
			.sign_with(
				&req.username,
				req.key_type,
				req.password.as_ref(),
				&digest.digest()?,
			)
			.await?;
		self.chain.submit(digest, signature).await
	}

	/// Waits for an in-flight session on the account before locking.
	async fn destroy(&self, username: &str) -> Result<()> {
		let account_lock = self.account_lock(username);
		let locked = {
			let _session = account_lock.lock().await;
			self.vault.lock(username).await
		};
		drop(account_lock);

		let mut map = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
		if map.get(username).is_some_and(|lock| Arc::strong_count(lock) == 1) {
			map.remove(username);
		}
		locked
	}
}

// -- Local vault service --

/// JSON-RPC client for a vault daemon on this machine.
pub struct HttpVault {
	url: String,
	http: reqwest::Client,
	next_id: AtomicU64,
}

impl HttpVault {
	pub fn new(url: &str) -> Self {
		Self {
			url: url.to_owned(),
			http: reqwest::Client::new(),
			next_id: AtomicU64::new(1),
		}
	}

	async fn call(&self, method: &str, params: Value, account: &str, key_type: Option<KeyType>) -> Result<Value> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		debug!(method, id, %account, "vault call");
		let resp = self
			.http
			.post(&self.url)
			.json(&json!({
				"id": id,
				"jsonrpc": "2.0",
				"method": method,
				"params": params,
			}))
			.send()
			.await
			.map_err(|e| {
				if e.is_connect() || e.is_timeout() {
					SignerError::BackendUnavailable(format!("vault at {}: {e}", self.url))
				} else {
					SignerError::from(e)
				}
			})?;
		let resp: Value = resp.error_for_status()?.json().await?;
		if let Some(err) = resp.get("error") {
			return Err(vault_error(err, account, key_type));
		}
		resp.get("result")
			.cloned()
			.ok_or_else(|| SignerError::BackendFailure(format!("{method}: response has no result")))
	}
}

fn vault_error(err: &Value, account: &str, key_type: Option<KeyType>) -> SignerError {
	let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
	let message = err
		.get("message")
		.and_then(Value::as_str)
		.unwrap_or("vault error")
		.to_owned();
	match code {
		ERR_WRONG_PASSPHRASE => SignerError::InvalidCredential(message),
		ERR_NO_KEY => SignerError::MissingKey {
			account: account.to_owned(),
			key_type: key_type.map(|k| k.to_string()).unwrap_or_default(),
		},
		_ => SignerError::BackendFailure(message),
	}
}

#[async_trait]
impl Vault for HttpVault {
	async fn unlock(&self, account: &str, key_type: KeyType, passphrase: &Password) -> Result<()> {
		let params = json!({
			"account": account,
			"key_type": key_type,
			"passphrase": passphrase.expose(),
		});
		self.call("vault.unlock", params, account, Some(key_type)).await?;
		Ok(())
	}

	async fn sign(&self, account: &str, key_type: KeyType, digest: &[u8; 32]) -> Result<String> {
		let params = json!({
			"account": account,
			"key_type": key_type,
			"digest": hex::encode(digest),
		});
		let result = self.call("vault.sign", params, account, Some(key_type)).await?;
		result
			.get("signature")
			.and_then(Value::as_str)
			.map(str::to_owned)
			.ok_or_else(|| SignerError::BackendFailure("vault.sign returned no signature".into()))
	}

	async fn lock(&self, account: &str) -> Result<()> {
		self.call("vault.lock", json!({ "account": account }), account, None)
			.await?;
		Ok(())
	}
}

// -- In-process vault --

struct SealedKey {
	salt: [u8; 16],
	nonce: [u8; 24],
	ciphertext: Vec<u8>,
}

/// Keeps WIFs encrypted under a passphrase-derived key (argon2id +
/// XChaCha20-Poly1305).  At most one key per account is unlocked.
#[derive(Default)]
pub struct MemoryVault {
	sealed: Mutex<HashMap<(String, KeyType), SealedKey>>,
	unlocked: Mutex<HashMap<String, (KeyType, Zeroizing<String>)>>,
}

fn derive_key(passphrase: &Password, salt: &[u8; 16]) -> Result<Zeroizing<[u8; 32]>> {
	let mut key = Zeroizing::new([0u8; 32]);
	Argon2::default()
		.hash_password_into(passphrase.expose().as_bytes(), salt, &mut key[..])
		.map_err(|e| CryptoError::Cipher(e.to_string()))?;
	Ok(key)
}

impl MemoryVault {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store `wif` for `(account, key_type)`, replacing any earlier key.
	pub fn import(&self, account: &str, key_type: KeyType, wif: &str, passphrase: &Password) -> Result<()> {
		if key_type == KeyType::Owner {
			return Err(SignerError::NotImplemented {
				backend: "hbauth",
				action: "storing owner keys".into(),
			});
		}
		PrivateKey::from_wif(wif)?;

		let salt: [u8; 16] = rand::random();
		let nonce: [u8; 24] = rand::random();
		let key = derive_key(passphrase, &salt)?;
		let ciphertext = XChaCha20Poly1305::new(Key::from_slice(&key[..]))
			.encrypt(XNonce::from_slice(&nonce), wif.as_bytes())
			.map_err(|e| CryptoError::Cipher(e.to_string()))?;

		self.sealed
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(
				(account.to_owned(), key_type),
				SealedKey {
					salt,
					nonce,
					ciphertext,
				},
			);
		debug!(%account, %key_type, "key imported into vault");
		Ok(())
	}
}

#[async_trait]
impl Vault for MemoryVault {
	async fn unlock(&self, account: &str, key_type: KeyType, passphrase: &Password) -> Result<()> {
		let wif = {
			let sealed = self.sealed.lock().unwrap_or_else(|e| e.into_inner());
			let entry = sealed
				.get(&(account.to_owned(), key_type))
				.ok_or_else(|| SignerError::MissingKey {
					account: account.to_owned(),
					key_type: key_type.to_string(),
				})?;
			let key = derive_key(passphrase, &entry.salt)?;
			let plain = XChaCha20Poly1305::new(Key::from_slice(&key[..]))
				.decrypt(XNonce::from_slice(&entry.nonce), entry.ciphertext.as_slice())
				.map_err(|_| SignerError::InvalidCredential("wrong vault passphrase".into()))?;
			Zeroizing::new(
				String::from_utf8(plain)
					.map_err(|_| SignerError::BackendFailure("corrupt vault entry".into()))?,
			)
		};
		self.unlocked
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(account.to_owned(), (key_type, wif));
		Ok(())
	}

	async fn sign(&self, account: &str, key_type: KeyType, digest: &[u8; 32]) -> Result<String> {
		let unlocked = self.unlocked.lock().unwrap_or_else(|e| e.into_inner());
		match unlocked.get(account) {
			Some((unlocked_type, wif)) if *unlocked_type == key_type => {
				let key = PrivateKey::from_wif(wif)?;
				Ok(key.sign_digest(digest).to_hex())
			}
			_ => Err(SignerError::InvalidCredential(format!(
				"vault is locked for @{account} ({key_type})"
			))),
		}
	}

	async fn lock(&self, account: &str) -> Result<()> {
		self.unlocked
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(account);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorKind;

	fn pass(s: &str) -> Password {
		Password::new(s)
	}

	#[tokio::test]
	async fn memory_vault_signs_with_imported_key() {
		let vault = MemoryVault::new();
		let key = PrivateKey::generate();
		vault
			.import("alice", KeyType::Posting, &key.to_wif(), &pass("hunter2"))
			.unwrap();

		let digest = sha256(b"payload");
		vault.unlock("alice", KeyType::Posting, &pass("hunter2")).await.unwrap();
		let sig = vault.sign("alice", KeyType::Posting, &digest).await.unwrap();
		let recovered = sig.parse::<crate::crypto::Signature>().unwrap().recover(&digest).unwrap();
		assert_eq!(recovered, key.public_key());

		vault.lock("alice").await.unwrap();
		let err = vault.sign("alice", KeyType::Posting, &digest).await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::InvalidCredential);
	}

	#[tokio::test]
	async fn wrong_passphrase_and_missing_key() {
		let vault = MemoryVault::new();
		vault
			.import("alice", KeyType::Active, &PrivateKey::generate().to_wif(), &pass("right"))
			.unwrap();

		let err = vault.unlock("alice", KeyType::Active, &pass("wrong")).await.unwrap_err();
		assert!(matches!(err, SignerError::InvalidCredential(_)));

		let err = vault.unlock("alice", KeyType::Posting, &pass("right")).await.unwrap_err();
		assert!(matches!(err, SignerError::MissingKey { .. }));
		assert_eq!(err.kind(), ErrorKind::InvalidCredential);
	}

	#[test]
	fn import_rejects_bad_wif_and_owner() {
		let vault = MemoryVault::new();
		assert!(vault.import("alice", KeyType::Posting, "not-a-wif", &pass("p")).is_err());
		let err = vault
			.import("alice", KeyType::Owner, &PrivateKey::generate().to_wif(), &pass("p"))
			.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::NotImplemented);
	}

	/// Vault whose `sign` always fails; counts locks.
	#[derive(Default)]
	struct Failing {
		locks: AtomicU64,
	}

	#[async_trait]
	impl Vault for Failing {
		async fn unlock(&self, _a: &str, _k: KeyType, _p: &Password) -> Result<()> {
			Ok(())
		}
		async fn sign(&self, _a: &str, _k: KeyType, _d: &[u8; 32]) -> Result<String> {
			Err(SignerError::BackendFailure("device error".into()))
		}
		async fn lock(&self, _a: &str) -> Result<()> {
			self.locks.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn vault_is_locked_after_failed_sign() {
		use crate::chain::MAINNET;
		use crate::tx_builder::TransactionBuilder;

		let vault = Arc::new(Failing::default());
		let node: Arc<dyn crate::rpc::NodeApi> = Arc::new(crate::rpc::HttpNode::new("http://127.0.0.1:1"));
		let signer = VaultSigner::new(vault.clone(), ChainContext::new(node, TransactionBuilder::new(&MAINNET)));
		let req = SignChallengeRequest {
			message: b"x".to_vec(),
			login_type: LoginType::HbAuth,
			username: "alice".into(),
			password: Some(pass("p")),
			key_type: KeyType::Posting,
			translate: crate::types::english(),
		};
		assert!(signer.sign_challenge(&req).await.is_err());
		assert_eq!(vault.locks.load(Ordering::SeqCst), 1);
		assert!(!signer.supports(SignAction::Broadcast, KeyType::Owner));
	}

	/// Vault that notices a session being locked underneath it.
	#[derive(Default)]
	struct Slow {
		unlocked: std::sync::atomic::AtomicBool,
		overlaps: AtomicU64,
		signing: AtomicU64,
	}

	#[async_trait]
	impl Vault for Slow {
		async fn unlock(&self, _a: &str, _k: KeyType, _p: &Password) -> Result<()> {
			if self.unlocked.swap(true, Ordering::SeqCst) {
				self.overlaps.fetch_add(1, Ordering::SeqCst);
			}
			Ok(())
		}
		async fn sign(&self, _a: &str, _k: KeyType, _d: &[u8; 32]) -> Result<String> {
			self.signing.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			if !self.unlocked.load(Ordering::SeqCst) {
				return Err(SignerError::BackendFailure("locked mid-sign".into()));
			}
			Ok("1f".into())
		}
		async fn lock(&self, _a: &str) -> Result<()> {
			self.unlocked.store(false, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn destroy_waits_for_the_running_session() {
		use crate::chain::MAINNET;
		use crate::tx_builder::TransactionBuilder;

		let vault = Arc::new(Slow::default());
		let node: Arc<dyn crate::rpc::NodeApi> = Arc::new(crate::rpc::HttpNode::new("http://127.0.0.1:1"));
		let signer = Arc::new(VaultSigner::new(
			vault.clone(),
			ChainContext::new(node, TransactionBuilder::new(&MAINNET)),
		));
		let req = SignChallengeRequest {
			message: b"x".to_vec(),
			login_type: LoginType::HbAuth,
			username: "alice".into(),
			password: Some(pass("p")),
			key_type: KeyType::Posting,
			translate: crate::types::english(),
		};
		let sign = |req: SignChallengeRequest| {
			let signer = signer.clone();
			tokio::spawn(async move { signer.sign_challenge(&req).await })
		};

		let first = sign(req.clone());
		while vault.signing.load(Ordering::SeqCst) == 0 {
			tokio::task::yield_now().await;
		}
		let destroy = {
			let signer = signer.clone();
			tokio::spawn(async move { signer.destroy("alice").await })
		};
		let second = sign(req);

		assert_eq!(first.await.unwrap().unwrap(), "1f");
		destroy.await.unwrap().unwrap();
		assert_eq!(second.await.unwrap().unwrap(), "1f");
		assert_eq!(vault.overlaps.load(Ordering::SeqCst), 0);

		// Nothing in flight now, so the account's lock is released.
		signer.destroy("alice").await.unwrap();
		assert!(signer.accounts.lock().unwrap().is_empty());
	}

	#[test]
	fn rpc_error_codes_map_to_kinds() {
		let wrong = vault_error(&json!({"code": ERR_WRONG_PASSPHRASE, "message": "bad"}), "alice", Some(KeyType::Posting));
		assert_eq!(wrong.kind(), ErrorKind::InvalidCredential);
		let missing = vault_error(&json!({"code": ERR_NO_KEY}), "alice", Some(KeyType::Active));
		assert!(matches!(missing, SignerError::MissingKey { ref key_type, .. } if key_type.as_str() == "active"));
		let other = vault_error(&json!({"code": -1, "message": "boom"}), "alice", None);
		assert_eq!(other.kind(), ErrorKind::BackendFailure);
	}

	#[tokio::test]
	async fn unreachable_vault_is_unavailable() {
		let vault = HttpVault::new("http://127.0.0.1:1/");
		let err = vault.lock("alice").await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
	}
}
