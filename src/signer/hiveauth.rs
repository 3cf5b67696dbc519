//! Remote approval over a relay, in the style of HiveAuth.
//!
//! The client and an authenticator app share a 32-byte key established at
//! pairing time.  Every request is sealed with that key, tagged with a fresh
//! nonce and published on the relay; the app answers with a sealed reply
//! carrying the same nonce.  Replies are routed to the waiting call by a
//! dispatcher task.  Nonces are single use: once a call completes, times
//! out or is cancelled its nonce is retired and later replies are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{NaiveDateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ChainContext, Signer};
use crate::crypto::{sha256, CryptoError, PublicKey, Signature};
use crate::error::{Result, SignerError};
use crate::types::{
	BroadcastRequest, BroadcastResult, KeyType, LoginType, SignAction, SignChallengeRequest,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a pairing made by [`HiveAuthSigner::authenticate`] stays valid.
pub const PAIRING_TTL_SECS: i64 = 24 * 60 * 60;

/// Issued nonces are remembered this long past the approval timeout.
const NONCE_GRACE_SECS: i64 = 5 * 60;

// -- Wire types --

/// What travels over the relay.  Only `payload` is encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
	pub nonce: String,
	pub account: String,
	/// Unix seconds after which the envelope must be ignored.
	pub expiry: i64,
	pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
	Auth,
	Challenge,
	Transaction,
}

/// How `RelayRequest::payload` carries its bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
	#[default]
	Text,
	Base64,
}

impl PayloadEncoding {
	/// UTF-8 messages travel as text, anything else as base64.
	pub fn encode(message: &[u8]) -> (Self, String) {
		match std::str::from_utf8(message) {
			Ok(text) => (Self::Text, text.to_owned()),
			Err(_) => (Self::Base64, BASE64_STANDARD.encode(message)),
		}
	}
}

/// Sealed request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
	pub nonce: String,
	pub expiry: i64,
	pub account: String,
	pub kind: RequestKind,
	pub key_type: KeyType,
	/// Challenge message, transaction JSON, or the app name for `Auth`.
	pub payload: String,
	#[serde(default)]
	pub encoding: PayloadEncoding,
	/// What the authenticator is expected to sign.
	pub digest_hex: String,
}

impl RelayRequest {
	/// The exact bytes behind `payload`.
	pub fn payload_bytes(&self) -> Result<Vec<u8>> {
		match self.encoding {
			PayloadEncoding::Text => Ok(self.payload.as_bytes().to_vec()),
			PayloadEncoding::Base64 => BASE64_STANDARD
				.decode(&self.payload)
				.map_err(|e| SignerError::InvalidRequest(format!("payload is not base64: {e}"))),
		}
	}
}

/// Sealed reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayReply {
	pub nonce: String,
	#[serde(flatten)]
	pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
	Approved { signature: String, public_key: String },
	Rejected,
	Error { message: String },
}

// -- Pairing --

/// Shared secret and metadata from a completed pairing.
#[derive(Clone)]
pub struct HiveAuthSession {
	pub username: String,
	pub auth_key: Zeroizing<[u8; 32]>,
	/// Unix seconds.
	pub expires: i64,
	/// Role keys proven during pairing, checked against later approvals.
	pub keys: HashMap<KeyType, PublicKey>,
}

impl HiveAuthSession {
	pub fn new(username: &str, auth_key: [u8; 32], expires: i64) -> Self {
		Self {
			username: username.to_owned(),
			auth_key: Zeroizing::new(auth_key),
			expires,
			keys: HashMap::new(),
		}
	}

	pub fn is_expired(&self, now: i64) -> bool {
		self.expires <= now
	}
}

impl std::fmt::Debug for HiveAuthSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HiveAuthSession")
			.field("username", &self.username)
			.field("expires", &self.expires)
			.field("keys", &self.keys)
			.finish_non_exhaustive()
	}
}

// -- Pluggable transport and cipher --

/// Outbound half of the relay channel.  Inbound envelopes arrive on the
/// `mpsc::Receiver` handed to [`HiveAuthSigner::new`].
#[async_trait]
pub trait Relay: Send + Sync {
	async fn publish(&self, envelope: RelayEnvelope) -> Result<()>;
}

/// Seals request and reply bodies with the pairing key.
pub trait RelayCipher: Send + Sync {
	fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<String>;
	fn open(&self, key: &[u8; 32], sealed: &str) -> Result<Vec<u8>>;
}

/// XChaCha20-Poly1305; sealed form is `base64(nonce24 || ciphertext)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaCipher;

impl RelayCipher for XChaChaCipher {
	fn seal(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
		let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
		let nonce: [u8; 24] = rand::random();
		let ciphertext = cipher
			.encrypt(XNonce::from_slice(&nonce), plaintext)
			.map_err(|e| CryptoError::Cipher(e.to_string()))?;
		let mut out = nonce.to_vec();
		out.extend_from_slice(&ciphertext);
		Ok(BASE64_STANDARD.encode(out))
	}

	fn open(&self, key: &[u8; 32], sealed: &str) -> Result<Vec<u8>> {
		let raw = BASE64_STANDARD
			.decode(sealed)
			.map_err(|e| CryptoError::Cipher(e.to_string()))?;
		if raw.len() < 24 {
			return Err(CryptoError::Cipher("sealed payload too short".into()).into());
		}
		let (nonce, ciphertext) = raw.split_at(24);
		let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
		Ok(cipher
			.decrypt(XNonce::from_slice(nonce), ciphertext)
			.map_err(|e| CryptoError::Cipher(e.to_string()))?)
	}
}

/// JSON envelopes over a WebSocket connection to the relay server.
pub struct WebSocketRelay {
	outbound: mpsc::UnboundedSender<String>,
}

impl WebSocketRelay {
	pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<RelayEnvelope>)> {
		let (stream, _) = tokio_tungstenite::connect_async(url)
			.await
			.map_err(|e| SignerError::BackendUnavailable(format!("relay {url}: {e}")))?;
		let (mut sink, mut source) = stream.split();
		let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
		let (in_tx, in_rx) = mpsc::channel(64);

		tokio::spawn(async move {
			while let Some(text) = out_rx.recv().await {
				if let Err(e) = sink.send(Message::Text(text.into())).await {
					warn!(error = %e, "relay write failed");
					break;
				}
			}
		});

		tokio::spawn(async move {
			while let Some(frame) = source.next().await {
				match frame {
					Ok(Message::Text(text)) => match serde_json::from_str::<RelayEnvelope>(text.as_str()) {
						Ok(envelope) => {
							if in_tx.send(envelope).await.is_err() {
								break;
							}
						}
						Err(e) => debug!(error = %e, "ignoring non-envelope relay frame"),
					},
					Ok(Message::Close(_)) => break,
					Ok(_) => {}
					Err(e) => {
						warn!(error = %e, "relay read failed");
						break;
					}
				}
			}
		});

		info!(%url, "connected to relay");
		Ok((Self { outbound: out_tx }, in_rx))
	}
}

#[async_trait]
impl Relay for WebSocketRelay {
	async fn publish(&self, envelope: RelayEnvelope) -> Result<()> {
		let text = serde_json::to_string(&envelope)?;
		self.outbound
			.send(text)
			.map_err(|_| SignerError::BackendUnavailable("relay connection closed".into()))
	}
}

// -- Routing state --

struct Pending {
	account: String,
	expiry: i64,
	reply: oneshot::Sender<RelayReply>,
}

/// Why an inbound envelope was or was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
	Delivered,
	UnknownNonce,
	WrongAccount,
	Expired,
	Unreadable,
	NonceMismatch,
}

struct Shared {
	cipher: Arc<dyn RelayCipher>,
	sessions: RwLock<HashMap<String, HiveAuthSession>>,
	pending: Mutex<HashMap<String, Pending>>,
	/// Nonce to the unix second it was handed out.
	issued: Mutex<HashMap<String, i64>>,
}

impl Shared {
	/// A nonce not handed out by this signer within the last `keep_secs`.
	/// Older entries are dropped; no reply to them can still be accepted.
	fn fresh_nonce(&self, now: i64, keep_secs: i64) -> String {
		let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
		issued.retain(|_, at| now - *at <= keep_secs);
		loop {
			let nonce = hex::encode(rand::random::<[u8; 16]>());
			if !issued.contains_key(&nonce) {
				issued.insert(nonce.clone(), now);
				return nonce;
			}
		}
	}

	fn session(&self, username: &str) -> Option<HiveAuthSession> {
		self.sessions
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.get(username)
			.cloned()
	}

	fn route(&self, envelope: RelayEnvelope, now: i64) -> Routed {
		let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
		let Some(waiting) = pending.get(&envelope.nonce) else {
			return Routed::UnknownNonce;
		};
		if waiting.account != envelope.account {
			return Routed::WrongAccount;
		}
		if envelope.expiry < now || waiting.expiry < now {
			return Routed::Expired;
		}
		let Some(session) = self.session(&envelope.account) else {
			return Routed::Unreadable;
		};
		let reply = self
			.cipher
			.open(&session.auth_key, &envelope.payload)
			.ok()
			.and_then(|plain| serde_json::from_slice::<RelayReply>(&plain).ok());
		let Some(reply) = reply else {
			return Routed::Unreadable;
		};
		if reply.nonce != envelope.nonce {
			return Routed::NonceMismatch;
		}
		if let Some(waiting) = pending.remove(&envelope.nonce) {
			let _ = waiting.reply.send(reply);
		}
		Routed::Delivered
	}

	fn retire(&self, nonce: &str) {
		self.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(nonce);
	}
}

/// Retires a pending nonce when the waiting call ends, including when the
/// caller drops or aborts it mid-wait.
struct PendingGuard<'a> {
	shared: &'a Shared,
	nonce: &'a str,
}

impl Drop for PendingGuard<'_> {
	fn drop(&mut self) {
		self.shared.retire(self.nonce);
	}
}

// -- The signer --

pub struct HiveAuthSigner {
	relay: Arc<dyn Relay>,
	chain: ChainContext,
	shared: Arc<Shared>,
	timeout: Duration,
	key_prefix: &'static str,
	dispatcher: JoinHandle<()>,
}

impl HiveAuthSigner {
	pub fn new(
		relay: Arc<dyn Relay>,
		mut inbound: mpsc::Receiver<RelayEnvelope>,
		chain: ChainContext,
		key_prefix: &'static str,
	) -> Self {
		let shared = Arc::new(Shared {
			cipher: Arc::new(XChaChaCipher),
			sessions: RwLock::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
			issued: Mutex::new(HashMap::new()),
		});

		let routing = shared.clone();
		let dispatcher = tokio::spawn(async move {
			while let Some(envelope) = inbound.recv().await {
				let nonce = envelope.nonce.clone();
				match routing.route(envelope, Utc::now().timestamp()) {
					Routed::Delivered => debug!(%nonce, "relay reply delivered"),
					other => warn!(%nonce, reason = ?other, "dropping relay message"),
				}
			}
			debug!("relay inbound closed");
		});

		Self {
			relay,
			chain,
			shared,
			timeout: DEFAULT_TIMEOUT,
			key_prefix,
			dispatcher,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Install a pairing made earlier (e.g. restored from config).
	pub fn pair(&self, session: HiveAuthSession) {
		self.shared
			.sessions
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.insert(session.username.clone(), session);
	}

	pub fn session(&self, username: &str) -> Option<HiveAuthSession> {
		self.shared.session(username)
	}

	fn next_nonce(&self) -> String {
		let keep = self.timeout.as_secs() as i64 + NONCE_GRACE_SECS;
		self.shared.fresh_nonce(Utc::now().timestamp(), keep)
	}

	/// Requests currently waiting for a reply.
	pub fn pending(&self) -> usize {
		self.shared
			.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.len()
	}

	/// Abandon every waiting request for `username`.  Waiters resolve to
	/// `Cancelled` and their nonces are retired.
	pub fn cancel(&self, username: &str) -> usize {
		let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
		let before = pending.len();
		pending.retain(|_, p| p.account != username);
		before - pending.len()
	}

	/// Pair with an authenticator app.  A fresh key is generated and shown
	/// to the user as a `has://auth_req/...` link through `show_link`; the
	/// app proves the account by signing a challenge with its posting key.
	pub async fn authenticate<F>(&self, username: &str, host: &str, app_name: &str, show_link: F) -> Result<HiveAuthSession>
	where
		F: FnOnce(&str) + Send,
	{
		let auth_key: [u8; 32] = rand::random();
		let now = Utc::now().timestamp();
		let mut session = HiveAuthSession::new(username, auth_key, now + PAIRING_TTL_SECS);
		// Installed before publishing so the dispatcher can open the reply.
		self.pair(session.clone());

		let nonce = self.next_nonce();
		let link_body = serde_json::json!({
			"account": username,
			"uuid": nonce,
			"key": hex::encode(auth_key),
			"host": host,
		});
		show_link(&format!("has://auth_req/{}", BASE64_STANDARD.encode(link_body.to_string())));

		let digest = sha256(format!("{app_name}|{nonce}").as_bytes());
		let result = self
			.exchange(
				&session,
				nonce,
				RequestKind::Auth,
				KeyType::Posting,
				(PayloadEncoding::Text, app_name.to_owned()),
				digest,
				None,
			)
			.await;
		match result {
			Ok((_, public_key)) => {
				session.keys.insert(KeyType::Posting, public_key);
				self.pair(session.clone());
				info!(%username, "HiveAuth pairing established");
				Ok(session)
			}
			Err(e) => {
				self.forget(username);
				Err(e)
			}
		}
	}

	fn forget(&self, username: &str) {
		self.shared
			.sessions
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.remove(username);
	}

	fn active_session(&self, username: &str) -> Result<HiveAuthSession> {
		let session = self.shared.session(username).ok_or_else(|| {
			SignerError::InvalidCredential(format!("no HiveAuth pairing for @{username}"))
		})?;
		if session.is_expired(Utc::now().timestamp()) {
			return Err(SignerError::InvalidCredential(format!(
				"HiveAuth pairing for @{username} has expired"
			)));
		}
		Ok(session)
	}

	/// Publish one sealed request and wait for its reply.  Returns the
	/// approved signature and the key it recovers to.
	#[allow(clippy::too_many_arguments)]
	async fn exchange(
		&self,
		session: &HiveAuthSession,
		nonce: String,
		kind: RequestKind,
		key_type: KeyType,
		(encoding, payload): (PayloadEncoding, String),
		digest: [u8; 32],
		deadline: Option<NaiveDateTime>,
	) -> Result<(String, PublicKey)> {
		let now = Utc::now().timestamp();
		let mut wait = self.timeout;
		if let Some(deadline) = deadline {
			let left = deadline.and_utc().timestamp() - now;
			if left <= 0 {
				return Err(SignerError::Timeout);
			}
			wait = wait.min(Duration::from_secs(left as u64));
		}
		let expiry = now + wait.as_secs().max(1) as i64;

		let request = RelayRequest {
			nonce: nonce.clone(),
			expiry,
			account: session.username.clone(),
			kind,
			key_type,
			payload,
			encoding,
			digest_hex: hex::encode(digest),
		};
		let sealed = self
			.shared
			.cipher
			.seal(&session.auth_key, &serde_json::to_vec(&request)?)?;

		let (tx, rx) = oneshot::channel();
		self.shared
			.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(
				nonce.clone(),
				Pending {
					account: session.username.clone(),
					expiry,
					reply: tx,
				},
			);
		let _pending = PendingGuard {
			shared: &self.shared,
			nonce: &nonce,
		};

		let envelope = RelayEnvelope {
			nonce: nonce.clone(),
			account: session.username.clone(),
			expiry,
			payload: sealed,
		};
		self.relay.publish(envelope).await?;
		debug!(%nonce, ?kind, wait_secs = wait.as_secs(), "waiting for remote approval");

		let outcome = tokio::time::timeout(wait, rx).await;

		let reply = match outcome {
			Err(_) => {
				info!(%nonce, "remote approval timed out");
				return Err(SignerError::Timeout);
			}
			Ok(Err(_)) => return Err(SignerError::Cancelled),
			Ok(Ok(reply)) => reply,
		};

		match reply.outcome {
			ReplyOutcome::Approved {
				signature,
				public_key,
			} => {
				let claimed = PublicKey::parse(&public_key)?;
				let recovered = signature.parse::<Signature>()?.recover(&digest)?;
				if recovered != claimed {
					return Err(SignerError::VerificationFailed(
						"approval signature does not match the claimed key".into(),
					));
				}
				if let Some(known) = session.keys.get(&key_type) {
					if *known != claimed {
						return Err(SignerError::VerificationFailed(format!(
							"approved with an unexpected key {}",
							claimed.to_string_with_prefix(self.key_prefix)
						)));
					}
				}
				Ok((signature, claimed))
			}
			ReplyOutcome::Rejected => Err(SignerError::UserRejected),
			ReplyOutcome::Error { message } => Err(SignerError::BackendFailure(message)),
		}
	}
}

impl Drop for HiveAuthSigner {
	fn drop(&mut self) {
		self.dispatcher.abort();
	}
}

#[async_trait]
impl Signer for HiveAuthSigner {
	fn login_type(&self) -> LoginType {
		LoginType::HiveAuth
	}

	fn supports(&self, _action: SignAction, key_type: KeyType) -> bool {
		key_type != KeyType::Owner
	}

	async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String> {
		let session = self.active_session(&req.username)?;
		let nonce = self.next_nonce();
		let (signature, _) = self
			.exchange(
				&session,
				nonce,
				RequestKind::Challenge,
				req.key_type,
				PayloadEncoding::encode(&req.message),
				sha256(&req.message),
				None,
			)
			.await?;
		Ok(signature)
	}

	async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult> {
		let session = self.active_session(&req.username)?;
		let digest = self.chain.prepare(&req.operation).await?;
		let nonce = self.next_nonce();
		let (signature, _) = self
			.exchange(
				&session,
				nonce,
				RequestKind::Transaction,
				req.key_type,
				(PayloadEncoding::Text, digest.serialized_transaction.clone()),
				digest.digest()?,
				// Approval after expiration would produce a dead transaction.
				Some(digest.transaction.expiration),
			)
			.await?;
		self.chain.submit(digest, signature).await
	}

	async fn destroy(&self, username: &str) -> Result<()> {
		let cancelled = self.cancel(username);
		self.forget(username);
		debug!(%username, cancelled, "HiveAuth session dropped");
		Ok(())
	}
}
