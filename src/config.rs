use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chain::{self, ChainParams, DEFAULT_EXPIRATION_SECS};
use crate::types::LoginType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub node: NodeConfig,
	pub session: SessionConfig,
	pub hiveauth: HiveAuthConfig,
	pub vault: VaultConfig,
	pub keychain: KeychainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
	/// Overrides the network's default public node.
	pub url: Option<String>,
	pub network: String,
	pub expiration_secs: u32,
}

/// The persisted login.  Secrets are never stored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
	pub login_type: Option<LoginType>,
	pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveAuthConfig {
	pub relay_url: String,
	pub timeout_secs: u64,
	pub app_name: String,
	/// Pairing from the last `login --with hiveauth`.
	pub pairing: Option<Pairing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pairing {
	pub username: String,
	/// Hex of the 32-byte relay key.
	pub auth_key: String,
	pub expires: i64,
	pub posting_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
	pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeychainConfig {
	/// Give up waiting for the extension after this long; 0 waits forever.
	pub approval_timeout_secs: u64,
}

impl Default for NodeConfig {
	fn default() -> Self {
		Self {
			url: None,
			network: "mainnet".into(),
			expiration_secs: DEFAULT_EXPIRATION_SECS,
		}
	}
}

impl Default for HiveAuthConfig {
	fn default() -> Self {
		Self {
			relay_url: "wss://hive-auth.arcange.eu".into(),
			timeout_secs: 60,
			app_name: "hive-signer".into(),
			pairing: None,
		}
	}
}

impl Default for VaultConfig {
	fn default() -> Self {
		Self {
			url: "http://127.0.0.1:8731/".into(),
		}
	}
}

impl Default for KeychainConfig {
	fn default() -> Self {
		Self {
			approval_timeout_secs: 300,
		}
	}
}

impl Config {
	/// Directory where CLI state is stored (~/.hive-signer/).
	pub fn dir() -> anyhow::Result<PathBuf> {
		dirs::home_dir()
			.map(|home| home.join(".hive-signer"))
			.ok_or_else(|| anyhow::anyhow!("could not determine home directory"))
	}

	/// Path to the config file.
	pub fn path() -> anyhow::Result<PathBuf> {
		Ok(Self::dir()?.join("config.toml"))
	}

	/// Load config from disk, falling back to defaults if no file exists.
	pub fn load() -> anyhow::Result<Self> {
		let path = Self::path()?;
		if path.exists() {
			let content = std::fs::read_to_string(&path)?;
			Ok(toml::from_str(&content)?)
		} else {
			Ok(Self::default())
		}
	}

	/// Persist the current config to disk, creating the directory if needed.
	pub fn save(&self) -> anyhow::Result<()> {
		let path = Self::path()?;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(&path, toml::to_string_pretty(self)?)?;
		Ok(())
	}

	pub fn chain(&self, network: &str) -> &'static ChainParams {
		chain::for_network(network)
	}

	/// The configured node URL, else the network's public node.
	pub fn node_url(&self, network: &str) -> String {
		self.node
			.url
			.clone()
			.unwrap_or_else(|| self.chain(network).default_node.to_owned())
	}
}
