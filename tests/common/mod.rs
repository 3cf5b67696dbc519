//! In-memory stand-in for a Hive API node.
//!
//! Accounts hold role keys; broadcasts are accepted only when the
//! signatures recover to a key with enough authority for every operation,
//! the way the chain checks them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hive_signer::chain::MAINNET;
use hive_signer::crypto::{parse_digest, Password, PrivateKey, PublicKey, Signature};
use hive_signer::error::{Result, SignerError};
use hive_signer::operation::Operation;
use hive_signer::rpc::{NodeApi, TransactionStatus, VerifySignaturesRequest};
use hive_signer::signer::ChainContext;
use hive_signer::tx_builder::{ChainHead, SignedTransaction, TransactionBuilder};
use hive_signer::types::KeyType;

pub const MISSING_AUTHORITY: i64 = -32003;

pub struct MemoryNode {
	head: ChainHead,
	accounts: Mutex<HashMap<String, Vec<(KeyType, PublicKey)>>>,
	pub broadcasts: Mutex<Vec<SignedTransaction>>,
}

impl MemoryNode {
	pub fn new() -> Arc<Self> {
		// Whole seconds, so the head survives the JSON round trip.
		let now = DateTime::from_timestamp(Utc::now().timestamp(), 0)
			.unwrap()
			.naive_utc();
		Arc::new(Self {
			head: ChainHead {
				head_block_number: 88_000_123,
				head_block_id: "053ec67bf1e2d3c4a5b6978800000000deadbeef".into(),
				time: now,
			},
			accounts: Mutex::new(HashMap::new()),
			broadcasts: Mutex::new(Vec::new()),
		})
	}

	pub fn head(&self) -> ChainHead {
		self.head.clone()
	}

	/// Register `account` with role keys derived from a master password.
	pub fn create_account(&self, account: &str, password: &str) {
		let password = Password::new(password);
		for key_type in [KeyType::Posting, KeyType::Active, KeyType::Owner] {
			let key = PrivateKey::from_login(account, key_type.as_str(), &password).unwrap();
			self.add_key(account, key_type, key.public_key());
		}
	}

	pub fn add_key(&self, account: &str, key_type: KeyType, key: PublicKey) {
		self.accounts
			.lock()
			.unwrap()
			.entry(account.to_owned())
			.or_default()
			.push((key_type, key));
	}

	/// Whether `key` can act for `account` at `level` or above.
	fn authorizes(&self, account: &str, level: KeyType, key: &PublicKey) -> bool {
		self.accounts
			.lock()
			.unwrap()
			.get(account)
			.map(|keys| keys.iter().any(|(t, k)| *t >= level && k == key))
			.unwrap_or(false)
	}

	fn recover_all(digest: &[u8; 32], signatures: &[String]) -> Result<Vec<PublicKey>> {
		signatures
			.iter()
			.map(|s| -> Result<PublicKey> { Ok(s.parse::<Signature>()?.recover(digest)?) })
			.collect()
	}
}

/// The account whose authority an operation needs.
pub fn signing_account(op: &Operation) -> &str {
	match op {
		Operation::Vote(v) => &v.voter,
		Operation::Comment(c) => &c.author,
		Operation::Transfer(t) => &t.from,
		Operation::CustomJson(c) => c
			.required_auths
			.first()
			.or(c.required_posting_auths.first())
			.map(String::as_str)
			.unwrap_or(""),
		Operation::ClaimRewardBalance(c) => &c.account,
		Operation::AccountUpdate2(a) => &a.account,
	}
}

#[async_trait]
impl NodeApi for MemoryNode {
	async fn get_chain_head(&self) -> Result<ChainHead> {
		Ok(self.head.clone())
	}

	async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<()> {
		let digest = tx.transaction.signing_digest(&MAINNET.chain_id_bytes())?;
		let keys = Self::recover_all(&digest, &tx.signatures)?;
		for op in &tx.transaction.operations {
			let account = signing_account(op);
			let level = op.required_key_type();
			if !keys.iter().any(|k| self.authorizes(account, level, k)) {
				return Err(SignerError::NodeRejected {
					code: MISSING_AUTHORITY,
					message: format!("missing required {level} authority: {account}"),
				});
			}
		}
		self.broadcasts.lock().unwrap().push(tx.clone());
		Ok(())
	}

	async fn verify_signatures(&self, req: &VerifySignaturesRequest) -> Result<bool> {
		let digest = parse_digest(&req.hash)?;
		let keys = Self::recover_all(&digest, &req.signatures)?;
		let buckets = [
			(KeyType::Owner, &req.required_owner),
			(KeyType::Active, &req.required_active),
			(KeyType::Posting, &req.required_posting),
		];
		Ok(buckets.iter().all(|(level, accounts)| {
			accounts
				.iter()
				.all(|account| keys.iter().any(|k| self.authorizes(account, *level, k)))
		}))
	}

	async fn get_key_references(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
		let accounts = self.accounts.lock().unwrap();
		keys.iter()
			.map(|text| -> Result<Vec<String>> {
				let key = PublicKey::parse(text)?;
				let mut names: Vec<String> = accounts
					.iter()
					.filter(|(_, ks)| ks.iter().any(|(_, k)| *k == key))
					.map(|(name, _)| name.clone())
					.collect();
				names.sort();
				Ok(names)
			})
			.collect()
	}

	async fn find_transaction(&self, transaction_id: &str) -> Result<TransactionStatus> {
		let known = self
			.broadcasts
			.lock()
			.unwrap()
			.iter()
			.any(|tx| tx.transaction.id().map(|id| id == transaction_id).unwrap_or(false));
		Ok(if known {
			TransactionStatus::WithinMempool
		} else {
			TransactionStatus::Unknown
		})
	}
}

pub fn chain(node: &Arc<MemoryNode>) -> ChainContext {
	ChainContext::new(node.clone(), TransactionBuilder::new(&MAINNET))
}
