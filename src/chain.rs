/// Public key prefix used when no network is specified.
pub const DEFAULT_KEY_PREFIX: &str = "STM";

/// Default transaction validity window, in seconds past the head block time.
pub const DEFAULT_EXPIRATION_SECS: u32 = 60;

/// Parameters that differ between Hive networks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainParams {
	/// Chain id (64 hex chars), prepended to every signing pre-image.
	pub chain_id: &'static str,
	/// Prefix of text-form public keys.
	pub key_prefix: &'static str,
	/// Public API node used when no URL is configured.
	pub default_node: &'static str,
}

impl ChainParams {
	pub fn chain_id_bytes(&self) -> [u8; 32] {
		let mut out = [0u8; 32];
		// Constants below are fixed-length hex; a bad literal is caught by tests.
		if let Ok(raw) = hex::decode(self.chain_id) {
			if raw.len() == 32 {
				out.copy_from_slice(&raw);
			}
		}
		out
	}
}

pub static MAINNET: ChainParams = ChainParams {
	chain_id: "beeab0de00000000000000000000000000000000000000000000000000000000",
	key_prefix: "STM",
	default_node: "https://api.hive.blog",
};

pub static TESTNET: ChainParams = ChainParams {
	chain_id: "18dcf0a285365fc58b71f18b3d3fec954aa0c141c44e4e5cb4cf777b9eab274e",
	key_prefix: "TST",
	default_node: "https://testnet.openhive.network",
};

/// Look up parameters by network name, falling back to mainnet.
pub fn for_network(network: &str) -> &'static ChainParams {
	match network {
		"testnet" => &TESTNET,
		_ => &MAINNET,
	}
}
