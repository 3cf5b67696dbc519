//! End-to-end signing through the facade against an in-memory node.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::{chain, MemoryNode, MISSING_AUTHORITY};
use hive_signer::chain::MAINNET;
use hive_signer::crypto::{parse_digest, sha256, Password, PrivateKey};
use hive_signer::error::{ErrorKind, Result, SignerError};
use hive_signer::operation::{Asset, AssetSymbol, Operation, TransferOperation, VoteOperation};
use hive_signer::rpc::{NodeApi, TransactionStatus};
use hive_signer::service::{OperationService, SecretPrompt, Session};
use hive_signer::signer::hiveauth::{
	HiveAuthSession, HiveAuthSigner, Relay, RelayCipher, RelayEnvelope, RelayReply, RelayRequest,
	ReplyOutcome, RequestKind, XChaChaCipher,
};
use hive_signer::signer::keychain::{message_bytes, KeychainBridge, KeychainResponse, KeychainSigner};
use hive_signer::signer::vault::{MemoryVault, Vault, VaultSigner};
use hive_signer::signer::wif::WifSigner;
use hive_signer::signer::SignerFacade;
use hive_signer::tx_builder::TransactionBuilder;
use hive_signer::types::{
	english, BroadcastRequest, BroadcastResult, KeyType, LoginType, SignChallengeRequest,
};
use hive_signer::verify::{SignatureVerifier, VerifyRequest};

const MASTER: &str = "P5KalicesMasterPasswordForTests";
const PASSPHRASE: &str = "correct horse battery staple";
const RELAY_KEY: [u8; 32] = [0x42; 32];

fn role_key(account: &str, key_type: KeyType) -> PrivateKey {
	PrivateKey::from_login(account, key_type.as_str(), &Password::new(MASTER)).unwrap()
}

// -- Doubles for the remote backends --

/// Keychain extension holding alice's keys, approving everything.
struct Extension {
	builder: TransactionBuilder,
}

#[async_trait]
impl KeychainBridge for Extension {
	async fn request_sign_buffer(&self, account: &str, message: &str, key_type: KeyType) -> Result<KeychainResponse> {
		Ok(KeychainResponse {
			success: true,
			signature: Some(role_key(account, key_type).sign_message(&message_bytes(message)).to_hex()),
			..Default::default()
		})
	}

	async fn request_transaction(&self, account: &str, transaction: &str, key_type: KeyType) -> Result<KeychainResponse> {
		let digest = self.builder.from_serialized(transaction)?.digest()?;
		Ok(KeychainResponse {
			success: true,
			signature: Some(role_key(account, key_type).sign_digest(&digest).to_hex()),
			..Default::default()
		})
	}
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
	Approve,
	/// Answer the first request, then keep replaying that answer.
	Replay,
	Silent,
}

/// Authenticator app on the far side of the relay.
struct Authenticator {
	mode: Mode,
	inbound: mpsc::Sender<RelayEnvelope>,
	builder: TransactionBuilder,
	answered: Mutex<Option<RelayEnvelope>>,
}

#[async_trait]
impl Relay for Authenticator {
	async fn publish(&self, envelope: RelayEnvelope) -> Result<()> {
		if self.mode == Mode::Silent {
			return Ok(());
		}
		if self.mode == Mode::Replay {
			let old = self.answered.lock().unwrap().clone();
			if let Some(old) = old {
				self.inbound.send(old).await.unwrap();
				return Ok(());
			}
		}

		let request: RelayRequest =
			serde_json::from_slice(&XChaChaCipher.open(&RELAY_KEY, &envelope.payload)?)?;
		assert_eq!(request.nonce, envelope.nonce);
		match request.kind {
			RequestKind::Transaction => {
				let rebuilt = self.builder.from_serialized(&request.payload)?;
				assert_eq!(rebuilt.digest_hex, request.digest_hex, "payload and digest disagree");
			}
			RequestKind::Challenge => {
				let digest = hex::encode(sha256(&request.payload_bytes()?));
				assert_eq!(digest, request.digest_hex, "payload and digest disagree");
			}
			RequestKind::Auth => {}
		}

		let key = role_key(&request.account, request.key_type);
		let reply = RelayReply {
			nonce: request.nonce.clone(),
			outcome: ReplyOutcome::Approved {
				signature: key.sign_digest(&parse_digest(&request.digest_hex)?).to_hex(),
				public_key: key.public_key().to_string(),
			},
		};
		let answer = RelayEnvelope {
			payload: XChaChaCipher.seal(&RELAY_KEY, &serde_json::to_vec(&reply)?)?,
			..envelope
		};
		*self.answered.lock().unwrap() = Some(answer.clone());
		self.inbound.send(answer).await.unwrap();
		Ok(())
	}
}

fn hiveauth(node: &Arc<MemoryNode>, mode: Mode, timeout: Duration) -> HiveAuthSigner {
	let (tx, rx) = mpsc::channel(8);
	let relay = Arc::new(Authenticator {
		mode,
		inbound: tx,
		builder: TransactionBuilder::new(&MAINNET),
		answered: Mutex::new(None),
	});
	let signer = HiveAuthSigner::new(relay, rx, chain(node), "STM").with_timeout(timeout);
	signer.pair(HiveAuthSession::new("alice", RELAY_KEY, i64::MAX));
	signer
}

fn vault() -> MemoryVault {
	let vault = MemoryVault::new();
	for key_type in [KeyType::Posting, KeyType::Active] {
		vault
			.import("alice", key_type, &role_key("alice", key_type).to_wif(), &Password::new(PASSPHRASE))
			.unwrap();
	}
	vault
}

/// Vault whose next `sign` fails once; counts sessions.
struct Flaky {
	inner: MemoryVault,
	fail_next: AtomicBool,
	open: AtomicUsize,
	overlaps: AtomicUsize,
	unlocks: AtomicUsize,
	locks: AtomicUsize,
}

#[async_trait]
impl Vault for Flaky {
	async fn unlock(&self, account: &str, key_type: KeyType, passphrase: &Password) -> Result<()> {
		self.inner.unlock(account, key_type, passphrase).await?;
		self.unlocks.fetch_add(1, Ordering::SeqCst);
		if self.open.fetch_add(1, Ordering::SeqCst) > 0 {
			self.overlaps.fetch_add(1, Ordering::SeqCst);
		}
		Ok(())
	}

	async fn sign(&self, account: &str, key_type: KeyType, digest: &[u8; 32]) -> Result<String> {
		tokio::task::yield_now().await;
		if self.fail_next.swap(false, Ordering::SeqCst) {
			return Err(SignerError::BackendFailure("device busy".into()));
		}
		self.inner.sign(account, key_type, digest).await
	}

	async fn lock(&self, account: &str) -> Result<()> {
		self.locks.fetch_add(1, Ordering::SeqCst);
		self.open.fetch_sub(1, Ordering::SeqCst);
		self.inner.lock(account).await
	}
}

fn facade(node: &Arc<MemoryNode>) -> SignerFacade {
	SignerFacade::builder()
		.register(Arc::new(WifSigner::new(chain(node), &MAINNET).with_authority_check(true)))
		.register(Arc::new(KeychainSigner::new(
			Arc::new(Extension {
				builder: TransactionBuilder::new(&MAINNET),
			}),
			chain(node),
		)))
		.register(Arc::new(hiveauth(node, Mode::Approve, Duration::from_secs(5))))
		.register(Arc::new(VaultSigner::new(Arc::new(vault()), chain(node))))
		.build()
}

fn secret_for(login_type: LoginType) -> Option<Password> {
	match login_type {
		LoginType::Wif => Some(Password::new(MASTER)),
		LoginType::HbAuth => Some(Password::new(PASSPHRASE)),
		LoginType::Keychain | LoginType::HiveAuth => None,
	}
}

fn vote(voter: &str) -> Operation {
	Operation::Vote(VoteOperation {
		voter: voter.into(),
		author: "bob".into(),
		permlink: "a-post".into(),
		weight: 10000,
	})
}

fn transfer() -> Operation {
	Operation::Transfer(TransferOperation {
		from: "alice".into(),
		to: "bob".into(),
		amount: Asset::new(1_000, AssetSymbol::Hive),
		memo: "thanks".into(),
	})
}

fn broadcast(login_type: LoginType, operation: Operation, key_type: KeyType) -> BroadcastRequest {
	BroadcastRequest {
		operation,
		login_type,
		username: "alice".into(),
		key_type,
		password: secret_for(login_type),
		translate: english(),
	}
}

fn challenge(login_type: LoginType, message: &[u8], key_type: KeyType) -> SignChallengeRequest {
	SignChallengeRequest {
		message: message.to_vec(),
		login_type,
		username: "alice".into(),
		password: secret_for(login_type),
		key_type,
		translate: english(),
	}
}

async fn verifies(node: &Arc<MemoryNode>, result: &BroadcastResult, key_type: KeyType) -> bool {
	let digest = result
		.transaction
		.transaction
		.signing_digest(&MAINNET.chain_id_bytes())
		.unwrap();
	SignatureVerifier::new(node.clone(), &MAINNET)
		.verify(&VerifyRequest {
			username: "alice",
			digest_hex: &hex::encode(digest),
			signature: &result.transaction.signatures[0],
			key_type,
			serialized_transaction: None,
			strict: false,
		})
		.await
		.unwrap()
}

// -- Tests --

#[tokio::test]
async fn digest_is_deterministic_for_the_same_head() {
	let node = MemoryNode::new();
	let builder = TransactionBuilder::new(&MAINNET);
	let a = builder.build(node.as_ref(), vec![vote("alice")]).await.unwrap();
	let b = builder.build(node.as_ref(), vec![vote("alice")]).await.unwrap();
	assert_eq!(a.digest_hex, b.digest_hex);
	assert_eq!(a.serialized_transaction, b.serialized_transaction);
	assert_eq!(a, builder.build_at(&node.head(), vec![vote("alice")]).unwrap());
}

#[tokio::test]
async fn every_backend_round_trips_posting_and_active() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let facade = facade(&node);
	let verifier = SignatureVerifier::new(node.clone(), &MAINNET);

	for login_type in LoginType::ALL {
		let voted = facade
			.broadcast_transaction(&broadcast(login_type, vote("alice"), KeyType::Posting))
			.await
			.unwrap_or_else(|e| panic!("{login_type} vote: {e}"));
		assert!(verifies(&node, &voted, KeyType::Posting).await, "{login_type}");

		let sent = facade
			.broadcast_transaction(&broadcast(login_type, transfer(), KeyType::Active))
			.await
			.unwrap_or_else(|e| panic!("{login_type} transfer: {e}"));
		assert!(verifies(&node, &sent, KeyType::Active).await, "{login_type}");
		assert_eq!(
			node.find_transaction(&sent.transaction_id).await.unwrap(),
			TransactionStatus::WithinMempool
		);

		for key_type in [KeyType::Posting, KeyType::Active] {
			let signature = facade
				.sign_challenge(&challenge(login_type, b"login:alice", key_type))
				.await
				.unwrap_or_else(|e| panic!("{login_type} challenge: {e}"));
			let ok = verifier
				.verify(&VerifyRequest {
					username: "alice",
					digest_hex: &hex::encode(sha256(b"login:alice")),
					signature: &signature,
					key_type,
					serialized_transaction: None,
					strict: true,
				})
				.await
				.unwrap();
			assert!(ok, "{login_type} {key_type}");
		}
	}
	assert_eq!(node.broadcasts.lock().unwrap().len(), 2 * LoginType::ALL.len());
}

#[tokio::test]
async fn binary_challenge_is_signed_byte_for_byte() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let facade = facade(&node);
	let verifier = SignatureVerifier::new(node.clone(), &MAINNET);
	let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0xfe, 0x00, 0x80];
	assert!(std::str::from_utf8(&png).is_err());

	for login_type in LoginType::ALL {
		let signature = facade
			.sign_challenge(&challenge(login_type, &png, KeyType::Posting))
			.await
			.unwrap_or_else(|e| panic!("{login_type}: {e}"));
		let ok = verifier
			.verify(&VerifyRequest {
				username: "alice",
				digest_hex: &hex::encode(sha256(&png)),
				signature: &signature,
				key_type: KeyType::Posting,
				serialized_transaction: None,
				strict: true,
			})
			.await
			.unwrap();
		assert!(ok, "{login_type}");
	}
}

#[tokio::test]
async fn vault_failure_leaves_the_account_usable() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let vault = Arc::new(Flaky {
		inner: vault(),
		fail_next: AtomicBool::new(true),
		open: AtomicUsize::new(0),
		overlaps: AtomicUsize::new(0),
		unlocks: AtomicUsize::new(0),
		locks: AtomicUsize::new(0),
	});
	let facade = Arc::new(
		SignerFacade::builder()
			.register(Arc::new(VaultSigner::new(vault.clone(), chain(&node))))
			.build(),
	);

	let err = facade
		.sign_challenge(&challenge(LoginType::HbAuth, b"first", KeyType::Posting))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::BackendFailure);
	assert_eq!(vault.locks.load(Ordering::SeqCst), 1);

	// Posting and active calls queue on the same account without overlap.
	let calls: Vec<_> = [KeyType::Posting, KeyType::Active]
		.into_iter()
		.cycle()
		.take(8)
		.map(|key_type| {
			let facade = facade.clone();
			tokio::spawn(async move {
				facade
					.sign_challenge(&challenge(LoginType::HbAuth, b"again", key_type))
					.await
			})
		})
		.collect();
	for call in calls {
		call.await.unwrap().unwrap();
	}
	assert_eq!(vault.overlaps.load(Ordering::SeqCst), 0);
	assert_eq!(vault.unlocks.load(Ordering::SeqCst), 9);
	assert_eq!(vault.locks.load(Ordering::SeqCst), 9);
	assert_eq!(vault.open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn raw_key_and_vault_produce_the_same_signature() {
	let node = MemoryNode::new();
	let facade = facade(&node);
	for key_type in [KeyType::Posting, KeyType::Active] {
		let raw = facade
			.sign_challenge(&challenge(LoginType::Wif, b"same bytes", key_type))
			.await
			.unwrap();
		let vaulted = facade
			.sign_challenge(&challenge(LoginType::HbAuth, b"same bytes", key_type))
			.await
			.unwrap();
		assert_eq!(raw, vaulted, "{key_type}");
	}
}

#[tokio::test]
async fn vote_signed_by_account_key_is_accepted() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let signer = WifSigner::new(chain(&node), &MAINNET);
	let facade = SignerFacade::builder().register(Arc::new(signer)).build();

	let mut req = broadcast(LoginType::Wif, vote("alice"), KeyType::Posting);
	req.password = Some(Password::new(role_key("alice", KeyType::Posting).to_wif()));
	let result = facade.broadcast_transaction(&req).await.unwrap();

	assert_eq!(result.transaction_id.len(), 40);
	assert_eq!(result.transaction.signatures.len(), 1);
	assert!(verifies(&node, &result, KeyType::Posting).await);
}

#[tokio::test]
async fn vote_signed_by_foreign_key_is_rejected() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	node.create_account("mallory", "mallorys-own-password");
	let mallory = PrivateKey::from_login("mallory", "posting", &Password::new("mallorys-own-password")).unwrap();

	let mut req = broadcast(LoginType::Wif, vote("alice"), KeyType::Posting);
	req.password = Some(Password::new(mallory.to_wif()));

	// With the up-front authority check the key never signs.
	let checked = SignerFacade::builder()
		.register(Arc::new(WifSigner::new(chain(&node), &MAINNET).with_authority_check(true)))
		.build();
	let err = checked.broadcast_transaction(&req).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidCredential);

	// Without it the node refuses the transaction.
	let unchecked = SignerFacade::builder()
		.register(Arc::new(WifSigner::new(chain(&node), &MAINNET)))
		.build();
	let err = unchecked.broadcast_transaction(&req).await.unwrap_err();
	assert!(matches!(err, SignerError::NodeRejected { code: MISSING_AUTHORITY, .. }), "{err:?}");
	assert!(node.broadcasts.lock().unwrap().is_empty());

	// And the signature does not verify for alice.
	let digest = sha256(b"anything");
	let ok = SignatureVerifier::new(node.clone(), &MAINNET)
		.verify(&VerifyRequest {
			username: "alice",
			digest_hex: &hex::encode(digest),
			signature: &mallory.sign_digest(&digest).to_hex(),
			key_type: KeyType::Posting,
			serialized_transaction: None,
			strict: false,
		})
		.await
		.unwrap();
	assert!(!ok);
}

#[tokio::test(start_paused = true)]
async fn replayed_approval_is_ignored() {
	let node = MemoryNode::new();
	let signer = hiveauth(&node, Mode::Replay, Duration::from_secs(30));
	let facade = SignerFacade::builder().register(Arc::new(signer)).build();

	facade
		.sign_challenge(&challenge(LoginType::HiveAuth, b"first", KeyType::Posting))
		.await
		.unwrap();

	// The relay answers the second request with the first approval.
	let err = facade
		.sign_challenge(&challenge(LoginType::HiveAuth, b"second", KeyType::Posting))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn silent_authenticator_times_out() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let signer = hiveauth(&node, Mode::Silent, Duration::from_secs(300));
	let facade = SignerFacade::builder().register(Arc::new(signer)).build();

	let started = tokio::time::Instant::now();
	let err = facade
		.broadcast_transaction(&broadcast(LoginType::HiveAuth, vote("alice"), KeyType::Posting))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Timeout);
	assert!(err.kind().is_retryable());
	// Bounded by the transaction's remaining lifetime, not the relay timeout.
	assert!(started.elapsed() <= Duration::from_secs(61));
	assert!(node.broadcasts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn remote_backends_refuse_owner_key() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let facade = facade(&node);
	for login_type in [LoginType::Keychain, LoginType::HiveAuth, LoginType::HbAuth] {
		let err = facade
			.sign_challenge(&challenge(login_type, b"x", KeyType::Owner))
			.await
			.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::NotImplemented, "{login_type}");
	}
	facade
		.sign_challenge(&challenge(LoginType::Wif, b"x", KeyType::Owner))
		.await
		.unwrap();
}

#[tokio::test]
async fn service_votes_and_proves_login() {
	let node = MemoryNode::new();
	node.create_account("alice", MASTER);
	let typed = Arc::new(Mutex::new(PASSPHRASE.to_owned()));
	let prompt: SecretPrompt = {
		let typed = typed.clone();
		Arc::new(move |_: &str, _: LoginType, _: KeyType| Some(Password::new(typed.lock().unwrap().clone())))
	};
	let svc = OperationService::new(
		Arc::new(facade(&node)),
		Arc::new(SignatureVerifier::new(node.clone(), &MAINNET)),
	)
	.with_secrets(prompt);
	assert!(svc.vote("bob", "a-post", 5000).await.unwrap().is_none());

	svc.login(Session {
		username: "alice".into(),
		login_type: LoginType::HbAuth,
	});
	let voted = svc.vote("bob", "a-post", 5000).await.unwrap().unwrap();
	assert_eq!(voted.transaction.transaction.operations[0].name(), "vote");

	let proof = svc.login_proof().await.unwrap().unwrap();
	assert!(proof.message.contains("\"account\":\"alice\""));

	// Wrong passphrase surfaces as a classified credential error.
	*typed.lock().unwrap() = "nope".into();
	let err = svc.follow("bob").await.unwrap_err();
	assert_eq!(err.kind, ErrorKind::InvalidCredential);
	assert_eq!(err.param("following"), Some("bob"));
}
