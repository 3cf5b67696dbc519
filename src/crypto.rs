use std::fmt;
use std::str::FromStr;

use base58::{FromBase58, ToBase58};
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chain::DEFAULT_KEY_PREFIX;

/// WIF version byte for Hive private keys.
const WIF_VERSION: u8 = 0x80;

#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("invalid WIF: {0}")]
	InvalidWif(String),

	#[error("invalid private key")]
	InvalidPrivateKey,

	#[error("invalid public key: {0}")]
	InvalidPublicKey(String),

	#[error("invalid signature: {0}")]
	InvalidSignature(String),

	#[error("public key recovery failed")]
	RecoveryFailed,

	#[error("cipher error: {0}")]
	Cipher(String),
}

// -- Secrets --

/// A transient secret typed by the user: a WIF, a master password or a
/// vault passphrase.  Cleared on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
	pub fn new(secret: impl Into<String>) -> Self {
		Self(secret.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for Password {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Password(***)")
	}
}

impl From<String> for Password {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl FromStr for Password {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.to_owned()))
	}
}

// -- Private keys --

/// A secp256k1 secret key.  The scalar is erased when the value drops, so
/// holders should keep it scoped to a single signing call.
pub struct PrivateKey {
	inner: SecretKey,
}

impl PrivateKey {
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
		let inner = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
		Ok(Self { inner })
	}

	/// Decode a base58check WIF string (`0x80 || key || checksum`).
	pub fn from_wif(wif: &str) -> Result<Self, CryptoError> {
		let mut raw = wif
			.trim()
			.from_base58()
			.map_err(|e| CryptoError::InvalidWif(format!("{e:?}")))?;
		if raw.len() != 37 {
			raw.zeroize();
			return Err(CryptoError::InvalidWif(format!("expected 37 bytes, got {}", raw.len())));
		}
		if raw[0] != WIF_VERSION {
			raw.zeroize();
			return Err(CryptoError::InvalidWif("unexpected version byte".into()));
		}
		let checksum = double_sha256(&raw[..33]);
		if checksum[..4] != raw[33..] {
			raw.zeroize();
			return Err(CryptoError::InvalidWif("checksum mismatch".into()));
		}
		let key = Self::from_bytes(&raw[1..33]);
		raw.zeroize();
		key
	}

	/// Derive a role key from an account's master password:
	/// `sha256(username || role || password)`.
	pub fn from_login(username: &str, role: &str, password: &Password) -> Result<Self, CryptoError> {
		let mut seed = format!("{username}{role}{}", password.expose());
		let mut digest = sha256(seed.as_bytes());
		seed.zeroize();
		let key = Self::from_bytes(&digest);
		digest.zeroize();
		key
	}

	/// Generate a fresh random key.
	pub fn generate() -> Self {
		let mut bytes: [u8; 32] = rand::random();
		// The chance of an out-of-range scalar is negligible; loop anyway.
		loop {
			if let Ok(inner) = SecretKey::from_slice(&bytes) {
				bytes.zeroize();
				return Self { inner };
			}
			bytes = rand::random();
		}
	}

	pub fn to_wif(&self) -> String {
		let mut raw = Vec::with_capacity(37);
		raw.push(WIF_VERSION);
		raw.extend_from_slice(&self.inner.secret_bytes());
		let checksum = double_sha256(&raw);
		raw.extend_from_slice(&checksum[..4]);
		let wif = raw.to_base58();
		raw.zeroize();
		wif
	}

	pub fn public_key(&self) -> PublicKey {
		let secp = Secp256k1::signing_only();
		PublicKey(secp256k1::PublicKey::from_secret_key(&secp, &self.inner))
	}

	/// Produce a canonical compact recoverable signature over a 32-byte
	/// digest.  Non-canonical results are retried with fresh RFC 6979 extra
	/// entropy, `sha256(digest || attempt)`.
	pub fn sign_digest(&self, digest: &[u8; 32]) -> Signature {
		let secp = Secp256k1::signing_only();
		let message = Message::from_digest(*digest);
		let mut attempt: u8 = 0;
		loop {
			attempt = attempt.wrapping_add(1);
			let mut seed = digest.to_vec();
			seed.push(attempt);
			let noncedata = sha256(&seed);
			let sig = secp.sign_ecdsa_recoverable_with_noncedata(&message, &self.inner, &noncedata);
			let (recid, compact) = sig.serialize_compact();
			if is_canonical(&compact) {
				let mut out = [0u8; 65];
				// 27 + 4 (compressed) + recovery id
				out[0] = recid.to_i32() as u8 + 31;
				out[1..].copy_from_slice(&compact);
				return Signature(out);
			}
		}
	}

	/// Sign an arbitrary buffer: the signature covers `sha256(message)`.
	pub fn sign_message(&self, message: &[u8]) -> Signature {
		self.sign_digest(&sha256(message))
	}
}

impl Drop for PrivateKey {
	fn drop(&mut self) {
		self.inner.non_secure_erase();
	}
}

impl fmt::Debug for PrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PrivateKey({})", self.public_key())
	}
}

// -- Public keys --

/// A compressed secp256k1 public key in Hive text form:
/// `PREFIX || base58(key || ripemd160(key)[..4])`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
		secp256k1::PublicKey::from_slice(bytes)
			.map(Self)
			.map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
	}

	pub fn to_bytes(&self) -> [u8; 33] {
		self.0.serialize()
	}

	/// Render with an explicit chain prefix (`STM`, `TST`, ...).
	pub fn to_string_with_prefix(&self, prefix: &str) -> String {
		let key = self.0.serialize();
		let mut data = key.to_vec();
		data.extend_from_slice(&Ripemd160::digest(key)[..4]);
		format!("{prefix}{}", data.to_base58())
	}

	/// Parse a key carrying any three-letter prefix.
	pub fn parse(s: &str) -> Result<Self, CryptoError> {
		if s.len() < 4 || !s.is_char_boundary(3) {
			return Err(CryptoError::InvalidPublicKey("too short".into()));
		}
		let (prefix, body) = s.split_at(3);
		if !prefix.chars().all(|c| c.is_ascii_uppercase()) {
			return Err(CryptoError::InvalidPublicKey(format!("bad prefix {prefix:?}")));
		}
		let raw = body
			.from_base58()
			.map_err(|e| CryptoError::InvalidPublicKey(format!("{e:?}")))?;
		if raw.len() != 37 {
			return Err(CryptoError::InvalidPublicKey(format!(
				"expected 37 bytes, got {}",
				raw.len()
			)));
		}
		if Ripemd160::digest(&raw[..33])[..4] != raw[33..] {
			return Err(CryptoError::InvalidPublicKey("checksum mismatch".into()));
		}
		Self::from_bytes(&raw[..33])
	}
}

impl fmt::Display for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_string_with_prefix(DEFAULT_KEY_PREFIX))
	}
}

impl fmt::Debug for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PublicKey({self})")
	}
}

impl FromStr for PublicKey {
	type Err = CryptoError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

// -- Signatures --

/// 65-byte compact recoverable signature: `header || r || s` where
/// `header = 27 + 4 + recovery_id`.  Text form is lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 65]);

impl Signature {
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
		let arr: [u8; 65] = bytes
			.try_into()
			.map_err(|_| CryptoError::InvalidSignature(format!("expected 65 bytes, got {}", bytes.len())))?;
		Ok(Self(arr))
	}

	pub fn as_bytes(&self) -> &[u8; 65] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	/// Recover the public key that produced this signature over `digest`.
	pub fn recover(&self, digest: &[u8; 32]) -> Result<PublicKey, CryptoError> {
		let header = self.0[0];
		if !(27..=34).contains(&header) {
			return Err(CryptoError::InvalidSignature(format!("bad header byte {header}")));
		}
		let recid = RecoveryId::from_i32(i32::from((header - 27) & 3))
			.map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
		let sig = RecoverableSignature::from_compact(&self.0[1..], recid)
			.map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
		let secp = Secp256k1::verification_only();
		secp.recover_ecdsa(&Message::from_digest(*digest), &sig)
			.map(PublicKey)
			.map_err(|_| CryptoError::RecoveryFailed)
	}

	pub fn is_canonical(&self) -> bool {
		let mut compact = [0u8; 64];
		compact.copy_from_slice(&self.0[1..]);
		is_canonical(&compact)
	}
}

impl fmt::Display for Signature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl fmt::Debug for Signature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Signature({})", self.to_hex())
	}
}

impl FromStr for Signature {
	type Err = CryptoError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let raw = hex::decode(s.strip_prefix("0x").unwrap_or(s))
			.map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
		Self::from_bytes(&raw)
	}
}

/// Graphene canonical form: neither `r` nor `s` may have the high bit set
/// or a redundant leading zero byte.
fn is_canonical(compact: &[u8; 64]) -> bool {
	compact[0] & 0x80 == 0
		&& !(compact[0] == 0 && compact[1] & 0x80 == 0)
		&& compact[32] & 0x80 == 0
		&& !(compact[32] == 0 && compact[33] & 0x80 == 0)
}

// -- Hashing --

pub fn sha256(data: &[u8]) -> [u8; 32] {
	Sha256::digest(data).into()
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
	sha256(&sha256(data))
}

/// Parse a 64-character hex digest.
pub fn parse_digest(hex_str: &str) -> Result<[u8; 32], CryptoError> {
	let raw = hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str))
		.map_err(|e| CryptoError::InvalidSignature(format!("digest: {e}")))?;
	raw.try_into()
		.map_err(|_| CryptoError::InvalidSignature("digest must be 32 bytes".into()))
}
