use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{ChainContext, Signer};
use crate::error::{Result, SignerError};
use crate::types::{
	BroadcastRequest, BroadcastResult, KeyType, LoginType, SignAction, SignChallengeRequest,
};

/// What the extension reports back for either request kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeychainResponse {
	pub success: bool,
	#[serde(default)]
	pub signature: Option<String>,
	/// Machine-readable failure tag (`user_cancel`, `extension_missing`, ...).
	#[serde(default)]
	pub error: Option<String>,
	#[serde(default)]
	pub message: Option<String>,
}

/// Channel to a Keychain-compatible extension.  Each call suspends until
/// the user approves or declines inside the extension.
#[async_trait]
pub trait KeychainBridge: Send + Sync {
	async fn request_sign_buffer(
		&self,
		account: &str,
		message: &str,
		key_type: KeyType,
	) -> Result<KeychainResponse>;

	/// `transaction` is the JSON of the unsigned transaction.
	async fn request_transaction(
		&self,
		account: &str,
		transaction: &str,
		key_type: KeyType,
	) -> Result<KeychainResponse>;
}

/// Delegates every signature to the extension; holds no key material.
pub struct KeychainSigner {
	bridge: Arc<dyn KeychainBridge>,
	chain: ChainContext,
}

impl KeychainSigner {
	pub fn new(bridge: Arc<dyn KeychainBridge>, chain: ChainContext) -> Self {
		Self { bridge, chain }
	}
}

/// Text form of `message` for `requestSignBuffer`.  The extension signs
/// the string's UTF-8 bytes unless it parses as a serialized Node `Buffer`
/// (`{"type":"Buffer","data":[..]}`), in which case it signs `data`.  Binary
/// messages, and text that would be mistaken for such a buffer, go out in
/// that form.
pub fn buffer_message(message: &[u8]) -> String {
	match std::str::from_utf8(message) {
		Ok(text) if as_buffer(text).is_none() => text.to_owned(),
		_ => json!({ "type": "Buffer", "data": message }).to_string(),
	}
}

/// The bytes the extension signs for a `requestSignBuffer` string.
pub fn message_bytes(message: &str) -> Vec<u8> {
	as_buffer(message).unwrap_or_else(|| message.as_bytes().to_vec())
}

fn as_buffer(text: &str) -> Option<Vec<u8>> {
	#[derive(Deserialize)]
	struct Buffer {
		#[serde(rename = "type")]
		kind: String,
		data: Vec<u8>,
	}
	serde_json::from_str::<Buffer>(text)
		.ok()
		.filter(|b| b.kind == "Buffer")
		.map(|b| b.data)
}

fn into_signature(resp: KeychainResponse) -> Result<String> {
	if resp.success {
		return resp
			.signature
			.filter(|s| !s.is_empty())
			.ok_or_else(|| SignerError::BackendFailure("extension returned no signature".into()));
	}
	match resp.error.as_deref() {
		Some("user_cancel") => Err(SignerError::UserRejected),
		Some("extension_missing") => Err(SignerError::BackendUnavailable(
			"Hive Keychain is not installed".into(),
		)),
		other => Err(SignerError::BackendFailure(
			resp.message
				.or_else(|| other.map(str::to_owned))
				.unwrap_or_else(|| "unknown extension error".into()),
		)),
	}
}

#[async_trait]
impl Signer for KeychainSigner {
	fn login_type(&self) -> LoginType {
		LoginType::Keychain
	}

	fn supports(&self, _action: SignAction, key_type: KeyType) -> bool {
		key_type != KeyType::Owner
	}

	async fn sign_challenge(&self, req: &SignChallengeRequest) -> Result<String> {
		let message = buffer_message(&req.message);
		let resp = self
			.bridge
			.request_sign_buffer(&req.username, &message, req.key_type)
			.await?;
		into_signature(resp)
	}

	async fn broadcast_transaction(&self, req: &BroadcastRequest) -> Result<BroadcastResult> {
		let digest = self.chain.prepare(&req.operation).await?;
		let resp = self
			.bridge
			.request_transaction(&req.username, &digest.serialized_transaction, req.key_type)
			.await?;
		let signature = into_signature(resp)?;
		self.chain.submit(digest, signature).await
	}

	async fn destroy(&self, _username: &str) -> Result<()> {
		// The extension keeps its own keys; nothing is cached here.
		Ok(())
	}
}

// -- Browser bridge --

/// Reaches the extension by serving a one-shot page on localhost, opening
/// it in the user's browser, and waiting for the page to post the
/// extension's answer back.
pub struct BrowserBridge {
	approval_timeout: Option<Duration>,
	open_browser: bool,
}

impl BrowserBridge {
	pub fn new(approval_timeout: Option<Duration>) -> Self {
		Self {
			approval_timeout,
			open_browser: true,
		}
	}

	/// Print the URL instead of launching a browser.
	pub fn headless(mut self) -> Self {
		self.open_browser = false;
		self
	}

	async fn run(&self, request: Value) -> Result<KeychainResponse> {
		let (reply_tx, reply_rx) = oneshot::channel();
		let state = Arc::new(BridgeState {
			request,
			reply: Mutex::new(Some(reply_tx)),
		});
		let app = Router::new()
			.route("/", get(bridge_page))
			.route("/request", get(bridge_request))
			.route("/callback", post(bridge_callback))
			.with_state(state);

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
			.await
			.map_err(|e| SignerError::BackendUnavailable(format!("cannot bind bridge: {e}")))?;
		let addr = listener
			.local_addr()
			.map_err(|e| SignerError::BackendUnavailable(e.to_string()))?;
		let url = format!("http://{addr}/");

		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let server = tokio::spawn(async move {
			axum::serve(listener, app)
				.with_graceful_shutdown(async {
					let _ = stop_rx.await;
				})
				.await
		});

		info!(%url, "waiting for Hive Keychain approval");
		if self.open_browser {
			if let Err(e) = opener::open(&url) {
				warn!(error = %e, %url, "could not open browser; open the URL manually");
			}
		} else {
			println!("Open {url} in a browser with Hive Keychain installed.");
		}

		let outcome = match self.approval_timeout {
			Some(limit) => tokio::time::timeout(limit, reply_rx)
				.await
				.map_err(|_| SignerError::Timeout)?,
			None => reply_rx.await,
		};

		let _ = stop_tx.send(());
		let _ = server.await;
		outcome.map_err(|_| SignerError::BackendFailure("browser bridge closed".into()))
	}
}

/// Keychain's method names are capitalized role names.
fn keychain_role(key_type: KeyType) -> &'static str {
	match key_type {
		KeyType::Posting => "Posting",
		KeyType::Active => "Active",
		KeyType::Owner => "Owner",
	}
}

#[async_trait]
impl KeychainBridge for BrowserBridge {
	async fn request_sign_buffer(
		&self,
		account: &str,
		message: &str,
		key_type: KeyType,
	) -> Result<KeychainResponse> {
		self.run(json!({
			"kind": "sign_buffer",
			"account": account,
			"message": message,
			"role": keychain_role(key_type),
		}))
		.await
	}

	async fn request_transaction(
		&self,
		account: &str,
		transaction: &str,
		key_type: KeyType,
	) -> Result<KeychainResponse> {
		let tx: Value = serde_json::from_str(transaction)?;
		self.run(json!({
			"kind": "sign_tx",
			"account": account,
			"transaction": tx,
			"role": keychain_role(key_type),
		}))
		.await
	}
}

struct BridgeState {
	request: Value,
	reply: Mutex<Option<oneshot::Sender<KeychainResponse>>>,
}

async fn bridge_page() -> Html<&'static str> {
	Html(BRIDGE_PAGE)
}

async fn bridge_request(State(state): State<Arc<BridgeState>>) -> Json<Value> {
	Json(state.request.clone())
}

async fn bridge_callback(
	State(state): State<Arc<BridgeState>>,
	Json(resp): Json<KeychainResponse>,
) -> StatusCode {
	let sender = state.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
	match sender {
		Some(tx) => {
			let _ = tx.send(resp);
			StatusCode::NO_CONTENT
		}
		None => StatusCode::CONFLICT,
	}
}

const BRIDGE_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>hive-signer</title></head>
<body>
<p id="status">Waiting for Hive Keychain...</p>
<script>
const report = (body) => fetch("/callback", {
	method: "POST",
	headers: {"Content-Type": "application/json"},
	body: JSON.stringify(body),
}).then(() => {
	document.getElementById("status").textContent = body.success
		? "Done. You can close this tab."
		: "Failed: " + (body.message || body.error);
});

const finish = (pick) => (r) => r.success
	? report({success: true, signature: pick(r.result)})
	: report({success: false, error: r.error, message: r.message});

setTimeout(async () => {
	const req = await (await fetch("/request")).json();
	const kc = window.hive_keychain;
	if (!kc) {
		return report({success: false, error: "extension_missing"});
	}
	if (req.kind === "sign_buffer") {
		kc.requestSignBuffer(req.account, req.message, req.role, finish((s) => s));
	} else {
		kc.requestSignTx(req.account, req.transaction, req.role,
			finish((tx) => tx.signatures[tx.signatures.length - 1]));
	}
}, 500);
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_cancel_is_rejection() {
		let err = into_signature(KeychainResponse {
			success: false,
			error: Some("user_cancel".into()),
			..Default::default()
		})
		.unwrap_err();
		assert!(matches!(err, SignerError::UserRejected));
	}

	#[test]
	fn missing_extension_is_unavailable() {
		let err = into_signature(KeychainResponse {
			success: false,
			error: Some("extension_missing".into()),
			..Default::default()
		})
		.unwrap_err();
		assert!(matches!(err, SignerError::BackendUnavailable(_)));
	}

	#[test]
	fn other_failures_keep_the_extension_message() {
		let err = into_signature(KeychainResponse {
			success: false,
			error: Some("sign_tx".into()),
			message: Some("Key not found".into()),
			..Default::default()
		})
		.unwrap_err();
		match err {
			SignerError::BackendFailure(msg) => assert_eq!(msg, "Key not found"),
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn success_without_signature_is_a_failure() {
		let err = into_signature(KeychainResponse {
			success: true,
			..Default::default()
		})
		.unwrap_err();
		assert!(matches!(err, SignerError::BackendFailure(_)));
	}

	#[test]
	fn text_goes_out_as_is() {
		assert_eq!(buffer_message(b"hello"), "hello");
		assert_eq!(message_bytes("hello"), b"hello");
	}

	#[test]
	fn binary_goes_out_as_a_buffer() {
		let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0xfe];
		let sent = buffer_message(&png);
		assert!(sent.contains(r#""type":"Buffer""#));
		assert_eq!(message_bytes(&sent), png);
	}

	#[test]
	fn text_that_looks_like_a_buffer_is_wrapped() {
		let text = r#"{"type":"Buffer","data":[1,2,3]}"#;
		let sent = buffer_message(text.as_bytes());
		assert_ne!(sent, text);
		assert_eq!(message_bytes(&sent), text.as_bytes());
		// Other JSON is plain text to the extension.
		let other = r#"{"type":"login","data":[1]}"#;
		assert_eq!(buffer_message(other.as_bytes()), other);
	}

	#[tokio::test]
	async fn callback_delivers_only_the_first_answer() {
		let (tx, rx) = oneshot::channel();
		let state = Arc::new(BridgeState {
			request: json!({}),
			reply: Mutex::new(Some(tx)),
		});
		let code = bridge_callback(
			State(state.clone()),
			Json(KeychainResponse {
				success: true,
				signature: Some("1f00".into()),
				..Default::default()
			}),
		)
		.await;
		assert_eq!(code, StatusCode::NO_CONTENT);
		assert_eq!(rx.await.unwrap().signature.as_deref(), Some("1f00"));

		let second = bridge_callback(State(state), Json(KeychainResponse::default())).await;
		assert_eq!(second, StatusCode::CONFLICT);
	}

	#[tokio::test]
	async fn bridge_times_out_without_a_page() {
		let bridge = BrowserBridge::new(Some(Duration::from_millis(50))).headless();
		let err = bridge
			.request_sign_buffer("alice", "hello", KeyType::Posting)
			.await
			.unwrap_err();
		assert!(matches!(err, SignerError::Timeout));
	}
}
