use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;

/// Failures produced while resolving a backend, signing, broadcasting or
/// verifying.  Every variant maps onto exactly one [`ErrorKind`].
#[derive(Debug, Error)]
pub enum SignerError {
	#[error("unsupported login type: {0}")]
	UnsupportedLoginType(String),

	#[error("request was declined by the user")]
	UserRejected,

	#[error("timed out waiting for approval")]
	Timeout,

	#[error("request was cancelled")]
	Cancelled,

	#[error("signing backend unavailable: {0}")]
	BackendUnavailable(String),

	#[error("{backend} does not support {action}")]
	NotImplemented {
		backend: &'static str,
		action: String,
	},

	#[error("invalid credential: {0}")]
	InvalidCredential(String),

	#[error("no {key_type} key stored for @{account}")]
	MissingKey { account: String, key_type: String },

	#[error("network failure: {0}")]
	Network(String),

	#[error("node rejected the request ({code}): {message}")]
	NodeRejected { code: i64, message: String },

	#[error("signature verification failed: {0}")]
	VerificationFailed(String),

	#[error("signing backend error: {0}")]
	BackendFailure(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error(transparent)]
	Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, SignerError>;

impl From<reqwest::Error> for SignerError {
	fn from(e: reqwest::Error) -> Self {
		Self::Network(e.to_string())
	}
}

impl From<serde_json::Error> for SignerError {
	fn from(e: serde_json::Error) -> Self {
		Self::Serialization(e.to_string())
	}
}

/// The caller-facing categories every backend failure is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	UnsupportedLoginType,
	UserRejected,
	Timeout,
	Cancelled,
	BackendUnavailable,
	NotImplemented,
	InvalidCredential,
	NetworkFailure,
	NodeRejected,
	VerificationFailed,
	BackendFailure,
	InvalidRequest,
	Internal,
}

impl SignerError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::UnsupportedLoginType(_) => ErrorKind::UnsupportedLoginType,
			Self::UserRejected => ErrorKind::UserRejected,
			Self::Timeout => ErrorKind::Timeout,
			Self::Cancelled => ErrorKind::Cancelled,
			Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
			Self::NotImplemented { .. } => ErrorKind::NotImplemented,
			Self::InvalidCredential(_) | Self::MissingKey { .. } => ErrorKind::InvalidCredential,
			Self::Network(_) => ErrorKind::NetworkFailure,
			Self::NodeRejected { .. } => ErrorKind::NodeRejected,
			Self::VerificationFailed(_) => ErrorKind::VerificationFailed,
			Self::BackendFailure(_) => ErrorKind::BackendFailure,
			Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
			Self::Serialization(_) => ErrorKind::Internal,
			Self::Crypto(CryptoError::InvalidWif(_) | CryptoError::InvalidPrivateKey) => {
				ErrorKind::InvalidCredential
			}
			Self::Crypto(_) => ErrorKind::Internal,
		}
	}
}

impl ErrorKind {
	/// Translation key handed to the caller's translate hook.
	pub fn message_key(self) -> &'static str {
		match self {
			Self::UnsupportedLoginType => "errors.unsupported_login_type",
			Self::UserRejected => "errors.user_rejected",
			Self::Timeout => "errors.timeout",
			Self::Cancelled => "errors.cancelled",
			Self::BackendUnavailable => "errors.backend_unavailable",
			Self::NotImplemented => "errors.not_implemented",
			Self::InvalidCredential => "errors.invalid_credential",
			Self::NetworkFailure => "errors.network_failure",
			Self::NodeRejected => "errors.node_rejected",
			Self::VerificationFailed => "errors.verification_failed",
			Self::BackendFailure => "errors.backend_failure",
			Self::InvalidRequest => "errors.invalid_request",
			Self::Internal => "errors.internal",
		}
	}

	/// English text for [`Self::message_key`].
	pub fn default_message(self) -> &'static str {
		match self {
			Self::UnsupportedLoginType => "This login method is not supported.",
			Self::UserRejected => "The request was declined.",
			Self::Timeout => "No approval arrived in time. Please try again.",
			Self::Cancelled => "The request was cancelled.",
			Self::BackendUnavailable => {
				"The signing method is unavailable. Try another login method."
			}
			Self::NotImplemented => "This login method cannot sign this request.",
			Self::InvalidCredential => "The key or password is not valid for this account.",
			Self::NetworkFailure => "Could not reach the Hive node. Please retry.",
			Self::NodeRejected => "The Hive node rejected the transaction.",
			Self::VerificationFailed => "The signature could not be verified.",
			Self::BackendFailure => "The signing method reported an error.",
			Self::InvalidRequest => "The request is not valid.",
			Self::Internal => "Something went wrong while signing.",
		}
	}

	/// Whether re-issuing the same request (without new user input) may
	/// succeed.  Nothing in this crate retries on its own.
	pub fn is_retryable(self) -> bool {
		matches!(self, Self::Timeout | Self::Cancelled | Self::NetworkFailure)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.message_key().trim_start_matches("errors."))
	}
}

/// A classified failure as surfaced by [`crate::service::OperationService`].
#[derive(Debug, Error)]
#[error("{operation} failed: {message}")]
pub struct ServiceError {
	pub kind: ErrorKind,
	/// Localized description produced by the request's translate hook.
	pub message: String,
	pub operation: &'static str,
	/// Identifying parameters of the operation, for diagnostics.
	pub params: Vec<(&'static str, String)>,
	#[source]
	pub source: SignerError,
}

impl ServiceError {
	pub fn param(&self, name: &str) -> Option<&str> {
		self.params
			.iter()
			.find(|(k, _)| *k == name)
			.map(|(_, v)| v.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_key_counts_as_invalid_credential() {
		let e = SignerError::MissingKey {
			account: "alice".into(),
			key_type: "active".into(),
		};
		assert_eq!(e.kind(), ErrorKind::InvalidCredential);
		assert_eq!(e.to_string(), "no active key stored for @alice");
	}

	#[test]
	fn malformed_wif_is_a_credential_problem() {
		let e = SignerError::from(CryptoError::InvalidWif("bad checksum".into()));
		assert_eq!(e.kind(), ErrorKind::InvalidCredential);
	}

	#[test]
	fn only_transient_kinds_are_retryable() {
		assert!(ErrorKind::Timeout.is_retryable());
		assert!(ErrorKind::NetworkFailure.is_retryable());
		assert!(!ErrorKind::UserRejected.is_retryable());
		assert!(!ErrorKind::NodeRejected.is_retryable());
		assert!(!ErrorKind::UnsupportedLoginType.is_retryable());
	}

	#[test]
	fn kind_display_drops_prefix() {
		assert_eq!(ErrorKind::UserRejected.to_string(), "user_rejected");
	}
}
