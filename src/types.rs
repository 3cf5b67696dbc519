use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::Password;
use crate::error::{ErrorKind, SignerError};
use crate::operation::Operation;
use crate::tx_builder::SignedTransaction;

/// Credential mechanism backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginType {
	/// Raw private key (or master password) supplied per call.
	Wif,
	/// Hive Keychain browser extension.
	Keychain,
	/// HiveAuth remote approval over a relay.
	#[serde(rename = "hiveauth")]
	HiveAuth,
	/// Local encrypted key vault.
	#[serde(rename = "hbauth")]
	HbAuth,
}

impl LoginType {
	pub const ALL: [LoginType; 4] = [Self::Wif, Self::Keychain, Self::HiveAuth, Self::HbAuth];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Wif => "wif",
			Self::Keychain => "keychain",
			Self::HiveAuth => "hiveauth",
			Self::HbAuth => "hbauth",
		}
	}
}

impl fmt::Display for LoginType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for LoginType {
	type Err = SignerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|t| t.as_str() == s)
			.ok_or_else(|| SignerError::UnsupportedLoginType(s.to_owned()))
	}
}

/// Authority class a signature must satisfy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
	#[default]
	Posting,
	Active,
	Owner,
}

impl KeyType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Posting => "posting",
			Self::Active => "active",
			Self::Owner => "owner",
		}
	}
}

impl fmt::Display for KeyType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for KeyType {
	type Err = SignerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"posting" => Ok(Self::Posting),
			"active" => Ok(Self::Active),
			"owner" => Ok(Self::Owner),
			other => Err(SignerError::Serialization(format!("unknown key type {other:?}"))),
		}
	}
}

/// The two request shapes a backend may be asked to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignAction {
	Challenge,
	Broadcast,
}

impl fmt::Display for SignAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Challenge => "challenge signing",
			Self::Broadcast => "transaction broadcast",
		})
	}
}

/// Hook turning a message key (`errors.timeout`, ...) into user text.
pub type Translate = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Translator returning the built-in English message for known error keys
/// and echoing anything else.
pub fn english() -> Translate {
	Arc::new(|key: &str| {
		const KINDS: [ErrorKind; 13] = [
			ErrorKind::UnsupportedLoginType,
			ErrorKind::UserRejected,
			ErrorKind::Timeout,
			ErrorKind::Cancelled,
			ErrorKind::BackendUnavailable,
			ErrorKind::NotImplemented,
			ErrorKind::InvalidCredential,
			ErrorKind::NetworkFailure,
			ErrorKind::NodeRejected,
			ErrorKind::VerificationFailed,
			ErrorKind::BackendFailure,
			ErrorKind::InvalidRequest,
			ErrorKind::Internal,
		];
		KINDS
			.into_iter()
			.find(|k| k.message_key() == key)
			.map(|k| k.default_message().to_owned())
			.unwrap_or_else(|| key.to_owned())
	})
}

/// A signature request over an arbitrary payload (login proof, upload
/// token, ...), not a chain transaction.
#[derive(Clone)]
pub struct SignChallengeRequest {
	pub message: Vec<u8>,
	pub login_type: LoginType,
	pub username: String,
	/// Only read by backends that unlock local key material.
	pub password: Option<Password>,
	pub key_type: KeyType,
	pub translate: Translate,
}

impl fmt::Debug for SignChallengeRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SignChallengeRequest")
			.field("message_len", &self.message.len())
			.field("login_type", &self.login_type)
			.field("username", &self.username)
			.field("key_type", &self.key_type)
			.finish_non_exhaustive()
	}
}

/// Input to [`crate::signer::SignerFacade::broadcast_transaction`].
#[derive(Clone)]
pub struct BroadcastRequest {
	pub operation: Operation,
	pub login_type: LoginType,
	pub username: String,
	pub key_type: KeyType,
	/// WIF / master password for `wif`, passphrase for `hbauth`.
	pub password: Option<Password>,
	pub translate: Translate,
}

impl fmt::Debug for BroadcastRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BroadcastRequest")
			.field("operation", &self.operation.name())
			.field("login_type", &self.login_type)
			.field("username", &self.username)
			.field("key_type", &self.key_type)
			.finish_non_exhaustive()
	}
}

/// Node acknowledgment of a broadcast.  The transaction was accepted for
/// inclusion; it is not final until it lands in an irreversible block
/// (see [`crate::rpc::NodeApi::find_transaction`]).
#[derive(Debug, Clone)]
pub struct BroadcastResult {
	pub transaction_id: String,
	pub transaction: SignedTransaction,
}
