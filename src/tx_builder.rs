use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::{ChainParams, DEFAULT_EXPIRATION_SECS};
use crate::error::{Result, SignerError};
use crate::operation::Operation;
use crate::rpc::NodeApi;

/// Reference to the current head block, as reported by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainHead {
	pub head_block_number: u32,
	pub head_block_id: String,
	#[serde(with = "hive_time")]
	pub time: NaiveDateTime,
}

/// An unsigned transaction.  JSON form matches the condenser API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub ref_block_num: u16,
	pub ref_block_prefix: u32,
	#[serde(with = "hive_time")]
	pub expiration: NaiveDateTime,
	pub operations: Vec<Operation>,
	#[serde(default)]
	pub extensions: Vec<serde_json::Value>,
}

impl Transaction {
	/// Canonical binary form, the pre-image of both the digest and the id.
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		let expiration = u32::try_from(self.expiration.and_utc().timestamp())
			.map_err(|_| SignerError::Serialization("expiration out of range".into()))?;

		let mut enc = Encoder::default();
		enc.u16(self.ref_block_num);
		enc.u32(self.ref_block_prefix);
		enc.u32(expiration);
		enc.varint(self.operations.len() as u32);
		for op in &self.operations {
			op.encode(&mut enc)?;
		}
		if !self.extensions.is_empty() {
			return Err(SignerError::Serialization(
				"transaction extensions are not supported".into(),
			));
		}
		enc.varint(0);
		Ok(enc.into_bytes())
	}

	/// `sha256(chain_id || bytes)`: the value every signature covers.
	pub fn signing_digest(&self, chain_id: &[u8; 32]) -> Result<[u8; 32]> {
		let mut h = Sha256::new();
		h.update(chain_id);
		h.update(self.to_bytes()?);
		Ok(h.finalize().into())
	}

	/// Transaction id: first 20 bytes of `sha256(bytes)`, hex encoded.
	pub fn id(&self) -> Result<String> {
		let hash = Sha256::digest(self.to_bytes()?);
		Ok(hex::encode(&hash[..20]))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
	#[serde(flatten)]
	pub transaction: Transaction,
	pub signatures: Vec<String>,
}

/// A transaction ready for signing plus its digest.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDigest {
	pub transaction: Transaction,
	/// JSON text of `transaction`; what gets handed to external signers.
	pub serialized_transaction: String,
	pub digest_hex: String,
}

impl TransactionDigest {
	pub fn digest(&self) -> Result<[u8; 32]> {
		crate::crypto::parse_digest(&self.digest_hex).map_err(SignerError::from)
	}

	/// Attach signatures, consuming the digest.
	pub fn into_signed(self, signatures: Vec<String>) -> SignedTransaction {
		SignedTransaction {
			transaction: self.transaction,
			signatures,
		}
	}
}

/// Builds transaction shells and computes their digests for one chain.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
	chain_id: [u8; 32],
	expiration: TimeDelta,
}

impl TransactionBuilder {
	pub fn new(params: &ChainParams) -> Self {
		Self {
			chain_id: params.chain_id_bytes(),
			expiration: TimeDelta::seconds(i64::from(DEFAULT_EXPIRATION_SECS)),
		}
	}

	pub fn with_expiration_secs(mut self, secs: u32) -> Self {
		self.expiration = TimeDelta::seconds(i64::from(secs));
		self
	}

	/// Fetch the current head from `node` and build a fresh transaction.
	pub async fn build(
		&self,
		node: &dyn NodeApi,
		operations: Vec<Operation>,
	) -> Result<TransactionDigest> {
		let head = node.get_chain_head().await?;
		self.build_at(&head, operations)
	}

	/// Build against a known head.  Pure: same inputs, same digest.
	pub fn build_at(&self, head: &ChainHead, operations: Vec<Operation>) -> Result<TransactionDigest> {
		if operations.is_empty() {
			return Err(SignerError::Serialization("transaction has no operations".into()));
		}
		let tx = Transaction {
			ref_block_num: (head.head_block_number & 0xffff) as u16,
			ref_block_prefix: ref_block_prefix(&head.head_block_id)?,
			expiration: head.time + self.expiration,
			operations,
			extensions: Vec::new(),
		};
		self.digest(tx)
	}

	/// Rebuild the digest of a transaction received as JSON (signed or not).
	pub fn from_serialized(&self, serialized: &str) -> Result<TransactionDigest> {
		let tx: Transaction = serde_json::from_str(serialized)?;
		self.digest(tx)
	}

	pub fn digest(&self, transaction: Transaction) -> Result<TransactionDigest> {
		let digest = transaction.signing_digest(&self.chain_id)?;
		let serialized_transaction = serde_json::to_string(&transaction)?;
		Ok(TransactionDigest {
			transaction,
			serialized_transaction,
			digest_hex: hex::encode(digest),
		})
	}
}

/// Bytes 4..8 of the head block id, read little endian.
fn ref_block_prefix(block_id: &str) -> Result<u32> {
	let raw = hex::decode(block_id)
		.map_err(|e| SignerError::Serialization(format!("invalid block id: {e}")))?;
	let bytes: [u8; 4] = raw
		.get(4..8)
		.and_then(|s| s.try_into().ok())
		.ok_or_else(|| SignerError::Serialization("block id too short".into()))?;
	Ok(u32::from_le_bytes(bytes))
}

// -- Binary encoding --

/// Little-endian writer for the chain's binary serialization.
#[derive(Default)]
pub(crate) struct Encoder(Vec<u8>);

impl Encoder {
	pub fn u8(&mut self, v: u8) {
		self.0.push(v);
	}

	pub fn u16(&mut self, v: u16) {
		self.0.extend_from_slice(&v.to_le_bytes());
	}

	pub fn u32(&mut self, v: u32) {
		self.0.extend_from_slice(&v.to_le_bytes());
	}

	pub fn i16(&mut self, v: i16) {
		self.0.extend_from_slice(&v.to_le_bytes());
	}

	pub fn i64(&mut self, v: i64) {
		self.0.extend_from_slice(&v.to_le_bytes());
	}

	pub fn raw(&mut self, bytes: &[u8]) {
		self.0.extend_from_slice(bytes);
	}

	/// Unsigned LEB128.
	pub fn varint(&mut self, mut v: u32) {
		loop {
			let byte = (v & 0x7f) as u8;
			v >>= 7;
			if v == 0 {
				self.0.push(byte);
				break;
			}
			self.0.push(byte | 0x80);
		}
	}

	pub fn string(&mut self, s: &str) {
		self.varint(s.len() as u32);
		self.0.extend_from_slice(s.as_bytes());
	}

	pub fn strings(&mut self, items: &[String]) {
		self.varint(items.len() as u32);
		for s in items {
			self.string(s);
		}
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.0
	}
}

/// Node timestamps: `YYYY-MM-DDTHH:MM:SS`, UTC, no zone suffix.
pub(crate) mod hive_time {
	use chrono::NaiveDateTime;
	use serde::{de::Error, Deserialize, Deserializer, Serializer};

	const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

	pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&t.format(FORMAT).to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
		let s = String::deserialize(d)?;
		NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), FORMAT).map_err(D::Error::custom)
	}
}
