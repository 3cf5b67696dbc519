//! Social and wallet actions on top of the signer facade.
//!
//! Each action turns into one operation, signed through whichever backend
//! the current session logged in with.  Without a session every action is
//! a no-op returning `Ok(None)`.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::crypto::{sha256, Password};
use crate::error::{ServiceError, SignerError};
use crate::operation::{
	AccountUpdate2Operation, Asset, ClaimRewardBalanceOperation, CommentOperation,
	CustomJsonOperation, Operation, TransferOperation, VoteOperation,
};
use crate::signer::SignerFacade;
use crate::types::{
	english, BroadcastRequest, BroadcastResult, KeyType, LoginType, SignChallengeRequest,
	Translate,
};
use crate::verify::{SignatureVerifier, VerifyRequest};

/// Prefix the Hive image hoster expects in front of the image bytes.
pub const IMAGE_CHALLENGE_PREFIX: &[u8] = b"ImageSigningChallenge";

pub type ServiceResult<T> = std::result::Result<Option<T>, ServiceError>;

/// Largest vote weight in basis points; negative values are downvotes.
pub const MAX_VOTE_WEIGHT: i16 = 10_000;

/// Who is logged in and how.  Holds no secret: backends that unlock local
/// key material ask the [`SecretPrompt`] on every call instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub username: String,
	pub login_type: LoginType,
}

/// Asked for the raw key, master password or vault passphrase each time a
/// `wif` or `hbauth` call needs one.  The answer is dropped, and zeroized,
/// when that call returns.
pub type SecretPrompt = Arc<dyn Fn(&str, LoginType, KeyType) -> Option<Password> + Send + Sync>;

/// A post or a reply.  An empty `parent_author` makes a root post under
/// `parent_permlink` (its category or community).
#[derive(Debug, Clone, Default)]
pub struct CommentDraft {
	pub parent_author: String,
	pub parent_permlink: String,
	pub title: String,
	pub body: String,
	pub tags: Vec<String>,
}

/// Fields of the `profile` object in posting metadata.  `None` fields are
/// left out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Profile {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub about: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub location: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub website: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile_image: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cover_image: Option<String>,
}

/// A signed and verified statement that the session user controls the
/// account.
#[derive(Debug, Clone)]
pub struct LoginProof {
	pub message: String,
	pub signature: String,
}

pub struct OperationService {
	facade: Arc<SignerFacade>,
	verifier: Arc<SignatureVerifier>,
	session: RwLock<Option<Session>>,
	secrets: Option<SecretPrompt>,
	translate: Translate,
	app: String,
}

impl OperationService {
	pub fn new(facade: Arc<SignerFacade>, verifier: Arc<SignatureVerifier>) -> Self {
		Self {
			facade,
			verifier,
			session: RwLock::new(None),
			secrets: None,
			translate: english(),
			app: concat!("hive-signer/", env!("CARGO_PKG_VERSION")).to_owned(),
		}
	}

	pub fn with_translate(mut self, translate: Translate) -> Self {
		self.translate = translate;
		self
	}

	pub fn with_secrets(mut self, secrets: SecretPrompt) -> Self {
		self.secrets = Some(secrets);
		self
	}

	/// `app` tag written into comment metadata.
	pub fn with_app(mut self, app: &str) -> Self {
		self.app = app.to_owned();
		self
	}

	pub fn login(&self, session: Session) {
		debug!(username = %session.username, login_type = %session.login_type, "session started");
		*self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session);
	}

	/// End the session and let its backend drop whatever it held.
	pub async fn logout(&self) -> Result<(), ServiceError> {
		let previous = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
		if let Some(session) = previous {
			self.facade
				.destroy(&session.username, session.login_type)
				.await
				.map_err(|e| self.classify("logout", vec![("username", session.username.clone())], e))?;
		}
		Ok(())
	}

	pub fn current_user(&self) -> Option<(String, LoginType)> {
		self.current().map(|s| (s.username, s.login_type))
	}

	fn current(&self) -> Option<Session> {
		self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
	}

	fn secret_for(&self, session: &Session, key_type: KeyType) -> Option<Password> {
		match session.login_type {
			LoginType::Wif | LoginType::HbAuth => self
				.secrets
				.as_ref()
				.and_then(|ask| ask(&session.username, session.login_type, key_type)),
			LoginType::Keychain | LoginType::HiveAuth => None,
		}
	}

	fn classify(
		&self,
		operation: &'static str,
		params: Vec<(&'static str, String)>,
		source: SignerError,
	) -> ServiceError {
		let kind = source.kind();
		warn!(operation, %kind, error = %source, "operation failed");
		ServiceError {
			kind,
			message: (self.translate)(kind.message_key()),
			operation,
			params,
			source,
		}
	}

	async fn broadcast(
		&self,
		name: &'static str,
		params: Vec<(&'static str, String)>,
		key_type: KeyType,
		build: impl FnOnce(&str) -> Operation,
	) -> ServiceResult<BroadcastResult> {
		let Some(session) = self.current() else {
			debug!(operation = name, "no session; skipped");
			return Ok(None);
		};
		let req = BroadcastRequest {
			operation: build(&session.username),
			password: self.secret_for(&session, key_type),
			login_type: session.login_type,
			username: session.username,
			key_type,
			translate: self.translate.clone(),
		};
		self.facade
			.broadcast_transaction(&req)
			.await
			.map(Some)
			.map_err(|e| self.classify(name, params, e))
	}

	/// Broadcast a posting-authorized custom_json.
	async fn custom_json(
		&self,
		name: &'static str,
		params: Vec<(&'static str, String)>,
		id: &'static str,
		payload: impl FnOnce(&str) -> Value,
	) -> ServiceResult<BroadcastResult> {
		self.broadcast(name, params, KeyType::Posting, |user| {
			Operation::CustomJson(CustomJsonOperation::posting(user, id, &payload(user)))
		})
		.await
	}

	// -- Voting and content --

	/// `weight` is in basis points, -10000 ..= 10000.
	pub async fn vote(&self, author: &str, permlink: &str, weight: i16) -> ServiceResult<BroadcastResult> {
		let params = vec![("author", author.to_owned()), ("permlink", permlink.to_owned())];
		if self.current().is_some() && !(-MAX_VOTE_WEIGHT..=MAX_VOTE_WEIGHT).contains(&weight) {
			let e = SignerError::InvalidRequest(format!(
				"vote weight {weight} is outside -{MAX_VOTE_WEIGHT}..={MAX_VOTE_WEIGHT}"
			));
			return Err(self.classify("vote", params, e));
		}
		self.broadcast("vote", params, KeyType::Posting, |voter| {
			Operation::Vote(VoteOperation {
				voter: voter.to_owned(),
				author: author.to_owned(),
				permlink: permlink.to_owned(),
				weight,
			})
		})
		.await
	}

	pub async fn add_comment(&self, draft: &CommentDraft) -> ServiceResult<BroadcastResult> {
		let permlink = if draft.parent_author.is_empty() {
			root_permlink(&draft.title)
		} else {
			reply_permlink(&draft.parent_permlink)
		};
		let json_metadata = json!({
			"app": self.app,
			"format": "markdown",
			"tags": draft.tags,
		})
		.to_string();
		let params = vec![
			("parent_author", draft.parent_author.clone()),
			("parent_permlink", draft.parent_permlink.clone()),
			("permlink", permlink.clone()),
		];
		self.broadcast("add_comment", params, KeyType::Posting, |author| {
			Operation::Comment(CommentOperation {
				parent_author: draft.parent_author.clone(),
				parent_permlink: draft.parent_permlink.clone(),
				author: author.to_owned(),
				permlink,
				title: draft.title.clone(),
				body: draft.body.clone(),
				json_metadata,
			})
		})
		.await
	}

	pub async fn reblog(&self, author: &str, permlink: &str) -> ServiceResult<BroadcastResult> {
		let params = vec![("author", author.to_owned()), ("permlink", permlink.to_owned())];
		self.custom_json("reblog", params, "follow", |account| {
			json!(["reblog", {"account": account, "author": author, "permlink": permlink}])
		})
		.await
	}

	// -- Follows --

	async fn follow_with(&self, name: &'static str, following: &str, what: &[&str]) -> ServiceResult<BroadcastResult> {
		let params = vec![("following", following.to_owned())];
		self.custom_json(name, params, "follow", |follower| {
			json!(["follow", {"follower": follower, "following": following, "what": what}])
		})
		.await
	}

	pub async fn follow(&self, following: &str) -> ServiceResult<BroadcastResult> {
		self.follow_with("follow", following, &["blog"]).await
	}

	pub async fn unfollow(&self, following: &str) -> ServiceResult<BroadcastResult> {
		self.follow_with("unfollow", following, &[]).await
	}

	pub async fn mute(&self, following: &str) -> ServiceResult<BroadcastResult> {
		self.follow_with("mute", following, &["ignore"]).await
	}

	pub async fn unmute(&self, following: &str) -> ServiceResult<BroadcastResult> {
		self.follow_with("unmute", following, &[]).await
	}

	// -- Communities --

	pub async fn subscribe(&self, community: &str) -> ServiceResult<BroadcastResult> {
		let params = vec![("community", community.to_owned())];
		self.custom_json("subscribe", params, "community", |_| {
			json!(["subscribe", {"community": community}])
		})
		.await
	}

	pub async fn unsubscribe(&self, community: &str) -> ServiceResult<BroadcastResult> {
		let params = vec![("community", community.to_owned())];
		self.custom_json("unsubscribe", params, "community", |_| {
			json!(["unsubscribe", {"community": community}])
		})
		.await
	}

	/// Report a post to the community's moderators.
	pub async fn flag(&self, community: &str, author: &str, permlink: &str, notes: &str) -> ServiceResult<BroadcastResult> {
		let params = vec![
			("community", community.to_owned()),
			("author", author.to_owned()),
			("permlink", permlink.to_owned()),
		];
		self.custom_json("flag", params, "community", |_| {
			json!(["flagPost", {
				"community": community,
				"account": author,
				"permlink": permlink,
				"notes": notes,
			}])
		})
		.await
	}

	// -- Account --

	pub async fn update_profile(&self, profile: &Profile) -> ServiceResult<BroadcastResult> {
		let posting_json_metadata = json!({"profile": profile, "version": 2}).to_string();
		self.broadcast("update_profile", Vec::new(), KeyType::Posting, |account| {
			Operation::AccountUpdate2(AccountUpdate2Operation {
				account: account.to_owned(),
				json_metadata: String::new(),
				posting_json_metadata,
				extensions: Vec::new(),
			})
		})
		.await
	}

	pub async fn claim_rewards(&self, hive: Asset, hbd: Asset, vests: Asset) -> ServiceResult<BroadcastResult> {
		let params = vec![
			("reward_hive", hive.to_string()),
			("reward_hbd", hbd.to_string()),
			("reward_vests", vests.to_string()),
		];
		self.broadcast("claim_rewards", params, KeyType::Posting, |account| {
			Operation::ClaimRewardBalance(ClaimRewardBalanceOperation {
				account: account.to_owned(),
				reward_hive: hive,
				reward_hbd: hbd,
				reward_vests: vests,
			})
		})
		.await
	}

	/// Delegate resource credits; `max_rc == 0` removes the delegation.
	pub async fn delegate_rc(&self, delegatees: &[String], max_rc: i64) -> ServiceResult<BroadcastResult> {
		let params = vec![("delegatees", delegatees.join(",")), ("max_rc", max_rc.to_string())];
		self.custom_json("delegate_rc", params, "rc", |from| {
			json!(["delegate_rc", {"from": from, "delegatees": delegatees, "max_rc": max_rc}])
		})
		.await
	}

	pub async fn transfer(&self, to: &str, amount: Asset, memo: &str) -> ServiceResult<BroadcastResult> {
		let params = vec![("to", to.to_owned()), ("amount", amount.to_string())];
		self.broadcast("transfer", params, KeyType::Active, |from| {
			Operation::Transfer(TransferOperation {
				from: from.to_owned(),
				to: to.to_owned(),
				amount,
				memo: memo.to_owned(),
			})
		})
		.await
	}

	// -- Off-chain signatures --

	pub async fn sign_challenge(&self, message: &[u8], key_type: KeyType) -> ServiceResult<String> {
		self.sign_named("sign_challenge", message.to_vec(), key_type).await
	}

	/// Signature the image hoster accepts as an upload token.
	pub async fn sign_image_upload(&self, image: &[u8]) -> ServiceResult<String> {
		let mut message = IMAGE_CHALLENGE_PREFIX.to_vec();
		message.extend_from_slice(image);
		self.sign_named("sign_image_upload", message, KeyType::Posting)
			.await
	}

	async fn sign_named(&self, name: &'static str, message: Vec<u8>, key_type: KeyType) -> ServiceResult<String> {
		let Some(session) = self.current() else {
			debug!(operation = name, "no session; skipped");
			return Ok(None);
		};
		let req = SignChallengeRequest {
			message,
			password: self.secret_for(&session, key_type),
			login_type: session.login_type,
			username: session.username,
			key_type,
			translate: self.translate.clone(),
		};
		self.facade
			.sign_challenge(&req)
			.await
			.map(Some)
			.map_err(|e| self.classify(name, vec![("key_type", key_type.to_string())], e))
	}

	/// Sign `{"account", "timestamp"}` with the posting key and confirm,
	/// against the chain, that the key belongs to the account.
	pub async fn login_proof(&self) -> ServiceResult<LoginProof> {
		let Some((username, _)) = self.current_user() else {
			return Ok(None);
		};
		let message = json!({"account": username, "timestamp": Utc::now().timestamp()}).to_string();
		let Some(signature) = self
			.sign_named("login_proof", message.clone().into_bytes(), KeyType::Posting)
			.await?
		else {
			return Ok(None);
		};

		let digest_hex = hex::encode(sha256(message.as_bytes()));
		self.verifier
			.ensure_valid(&VerifyRequest {
				username: &username,
				digest_hex: &digest_hex,
				signature: &signature,
				key_type: KeyType::Posting,
				serialized_transaction: None,
				strict: true,
			})
			.await
			.map_err(|e| self.classify("login_proof", vec![("username", username.clone())], e))?;
		Ok(Some(LoginProof { message, signature }))
	}
}

/// `re-<parent permlink>-<utc stamp>`, the convention used by Hive front ends.
fn reply_permlink(parent_permlink: &str) -> String {
	let stamp = Utc::now().format("%Y%m%dt%H%M%S%3fz");
	let parent: String = slugify(parent_permlink).chars().take(200).collect();
	format!("re-{parent}-{stamp}")
}

/// Title slug plus a random suffix so equal titles do not collide.
fn root_permlink(title: &str) -> String {
	let suffix: String = rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(8)
		.map(|c| char::from(c).to_ascii_lowercase())
		.collect();
	let slug: String = slugify(title).chars().take(200).collect();
	let slug = slug.trim_end_matches('-');
	if slug.is_empty() {
		suffix
	} else {
		format!("{slug}-{suffix}")
	}
}

/// Lowercase ASCII letters, digits and single dashes.
fn slugify(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for c in text.chars() {
		if c.is_ascii_alphanumeric() {
			out.push(c.to_ascii_lowercase());
		} else if !out.is_empty() && !out.ends_with('-') {
			out.push('-');
		}
	}
	out.trim_end_matches('-').to_owned()
}
