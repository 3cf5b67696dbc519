use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, SignerError};
use crate::tx_builder::{ChainHead, SignedTransaction};

/// Arguments of the node's `verify_signatures` call.  Each account list is
/// an authority bucket the signatures must jointly satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifySignaturesRequest {
	pub hash: String,
	pub signatures: Vec<String>,
	pub required_owner: Vec<String>,
	pub required_active: Vec<String>,
	pub required_posting: Vec<String>,
	pub required_other: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VerifySignaturesResponse {
	pub valid: bool,
}

/// Where a broadcast transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
	Unknown,
	WithinMempool,
	WithinReversibleBlock,
	WithinIrreversibleBlock,
	ExpiredReversible,
	ExpiredIrreversible,
	TooOld,
}

impl TransactionStatus {
	pub fn is_final(self) -> bool {
		matches!(self, Self::WithinIrreversibleBlock)
	}
}

/// The node surface this crate depends on.
#[async_trait]
pub trait NodeApi: Send + Sync {
	/// Head block reference used to anchor new transactions.
	async fn get_chain_head(&self) -> Result<ChainHead>;

	/// Submit a signed transaction.  `Ok` means accepted for inclusion.
	async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<()>;

	async fn verify_signatures(&self, req: &VerifySignaturesRequest) -> Result<bool>;

	/// For each key, the accounts whose authorities reference it.
	async fn get_key_references(&self, keys: &[String]) -> Result<Vec<Vec<String>>>;

	async fn find_transaction(&self, transaction_id: &str) -> Result<TransactionStatus>;
}

/// JSON-RPC 2.0 client for a Hive API node.
pub struct HttpNode {
	url: String,
	http: reqwest::Client,
	next_id: AtomicU64,
}

impl HttpNode {
	pub fn new(url: &str) -> Self {
		Self {
			url: url.to_owned(),
			http: reqwest::Client::new(),
			next_id: AtomicU64::new(1),
		}
	}

	async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let body = json!({
			"id": id,
			"jsonrpc": "2.0",
			"method": method,
			"params": params,
		});
		debug!(method, id, "node call");

		let resp: Value = self
			.http
			.post(&self.url)
			.json(&body)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;

		if let Some(err) = resp.get("error") {
			return Err(rpc_error(err));
		}
		let result = resp
			.get("result")
			.cloned()
			.ok_or_else(|| SignerError::Network(format!("{method}: response has no result")))?;
		Ok(serde_json::from_value(result)?)
	}
}

#[async_trait]
impl NodeApi for HttpNode {
	async fn get_chain_head(&self) -> Result<ChainHead> {
		self.call("condenser_api.get_dynamic_global_properties", json!([]))
			.await
	}

	async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<()> {
		let _: Value = self
			.call("condenser_api.broadcast_transaction", json!([tx]))
			.await?;
		Ok(())
	}

	async fn verify_signatures(&self, req: &VerifySignaturesRequest) -> Result<bool> {
		let resp: VerifySignaturesResponse = self
			.call("database_api.verify_signatures", serde_json::to_value(req)?)
			.await?;
		Ok(resp.valid)
	}

	async fn get_key_references(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
		self.call("condenser_api.get_key_references", json!([keys]))
			.await
	}

	async fn find_transaction(&self, transaction_id: &str) -> Result<TransactionStatus> {
		#[derive(Deserialize)]
		struct Found {
			status: TransactionStatus,
		}
		let found: Found = self
			.call(
				"transaction_status_api.find_transaction",
				json!({ "transaction_id": transaction_id }),
			)
			.await?;
		Ok(found.status)
	}
}

/// Map a JSON-RPC error object onto [`SignerError::NodeRejected`].
fn rpc_error(err: &Value) -> SignerError {
	let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
	let message = err
		.get("message")
		.and_then(Value::as_str)
		.unwrap_or("unknown error")
		.to_owned();
	SignerError::NodeRejected { code, message }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rpc_error_keeps_code_and_message() {
		let err = rpc_error(&json!({"code": -32003, "message": "missing required posting authority"}));
		match err {
			SignerError::NodeRejected { code, message } => {
				assert_eq!(code, -32003);
				assert!(message.contains("posting authority"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn verify_request_field_names() {
		let req = VerifySignaturesRequest {
			hash: "ab".into(),
			signatures: vec!["cd".into()],
			required_posting: vec!["alice".into()],
			..Default::default()
		};
		let v = serde_json::to_value(&req).unwrap();
		assert_eq!(v["required_posting"], json!(["alice"]));
		assert_eq!(v["required_active"], json!([]));
		assert_eq!(v["required_other"], json!([]));
	}

	#[test]
	fn chain_head_ignores_extra_properties() {
		let head: ChainHead = serde_json::from_value(json!({
			"head_block_number": 81_000_000u32,
			"head_block_id": "04d3f6c0aabbccdd000000000000000000000000",
			"time": "2024-03-01T12:00:00",
			"current_witness": "someone",
		}))
		.unwrap();
		assert_eq!(head.head_block_number, 81_000_000);
	}

	#[test]
	fn status_finality() {
		let s: TransactionStatus = serde_json::from_value(json!("within_mempool")).unwrap();
		assert!(!s.is_final());
		assert!(TransactionStatus::WithinIrreversibleBlock.is_final());
	}
}
