use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::{KeyType, LoginType};

#[derive(Parser)]
#[command(
	name = "hive-signer",
	about = "Sign, broadcast and verify Hive transactions with a raw key, Hive Keychain, HiveAuth or a local vault.",
	version
)]
pub struct Cli {
	/// Network to connect to.
	#[arg(long, global = true)]
	pub network: Option<Network>,

	/// Override the API node URL.
	#[arg(long, global = true)]
	pub node_url: Option<String>,

	/// Override the login method of the saved session.
	#[arg(long, global = true)]
	pub method: Option<MethodArg>,

	/// Override the account of the saved session.
	#[arg(long, short, global = true)]
	pub user: Option<String>,

	/// Private key, master password or vault passphrase.
	#[arg(long, global = true, env = "HIVE_SIGNER_PASSWORD", hide_env_values = true)]
	pub password: Option<String>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Network {
	Mainnet,
	Testnet,
}

impl Network {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Mainnet => "mainnet",
			Self::Testnet => "testnet",
		}
	}
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodArg {
	Wif,
	Keychain,
	Hiveauth,
	Hbauth,
}

impl From<MethodArg> for LoginType {
	fn from(m: MethodArg) -> Self {
		match m {
			MethodArg::Wif => Self::Wif,
			MethodArg::Keychain => Self::Keychain,
			MethodArg::Hiveauth => Self::HiveAuth,
			MethodArg::Hbauth => Self::HbAuth,
		}
	}
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum KeyTypeArg {
	#[default]
	Posting,
	Active,
	Owner,
}

impl From<KeyTypeArg> for KeyType {
	fn from(k: KeyTypeArg) -> Self {
		match k {
			KeyTypeArg::Posting => Self::Posting,
			KeyTypeArg::Active => Self::Active,
			KeyTypeArg::Owner => Self::Owner,
		}
	}
}

#[derive(Subcommand)]
pub enum Command {
	/// Log in and remember the account and method.
	Login {
		/// Hive account name.
		username: String,

		/// Login method.
		#[arg(long = "with", value_enum)]
		with: MethodArg,

		/// Sign and verify a login proof before saving the session.
		#[arg(long)]
		prove: bool,
	},

	/// Inspect or end the saved session.
	Session {
		#[command(subcommand)]
		command: SessionCommand,
	},

	/// Sign off-chain messages.
	Sign {
		#[command(subcommand)]
		command: SignCommand,
	},

	/// Vote on, write and reblog content.
	Post {
		#[command(subcommand)]
		command: PostCommand,
	},

	/// Follow and mute accounts.
	Social {
		#[command(subcommand)]
		command: SocialCommand,
	},

	/// Join communities and report posts.
	Community {
		#[command(subcommand)]
		command: CommunityCommand,
	},

	/// Profile, rewards, RC delegation and transfers.
	Account {
		#[command(subcommand)]
		command: AccountCommand,
	},

	/// Check a signature against an account's authorities.
	Verify(VerifyArgs),

	/// Inspect transactions.
	Tx {
		#[command(subcommand)]
		command: TxCommand,
	},
}

// -- Session --

#[derive(Subcommand)]
pub enum SessionCommand {
	/// Show the saved session and configuration.
	Status,

	/// Forget the saved session and its pairing.
	Logout,
}

// -- Sign --

#[derive(Subcommand)]
pub enum SignCommand {
	/// Sign an arbitrary text message.
	Challenge {
		message: String,

		#[arg(long, value_enum, default_value_t)]
		key_type: KeyTypeArg,
	},

	/// Produce an image-hoster upload signature for a file.
	Image { path: PathBuf },

	/// Sign and verify a login proof for the current account.
	Proof,
}

// -- Post --

#[derive(Subcommand)]
pub enum PostCommand {
	/// Upvote (positive weight) or downvote (negative weight).
	Vote {
		author: String,
		permlink: String,

		/// Percent of full strength, -100 to 100.
		#[arg(long, default_value = "100", allow_hyphen_values = true)]
		weight: f32,
	},

	/// Publish a root post, or a reply with --parent-author.
	Comment {
		#[arg(long, default_value = "")]
		parent_author: String,

		/// Community or category for a post, parent permlink for a reply.
		#[arg(long)]
		parent_permlink: String,

		#[arg(long, default_value = "")]
		title: String,

		#[arg(long)]
		body: String,

		#[arg(long = "tag")]
		tags: Vec<String>,
	},

	/// Reblog a post to your blog.
	Reblog { author: String, permlink: String },
}

// -- Social --

#[derive(Subcommand)]
pub enum SocialCommand {
	Follow { account: String },
	Unfollow { account: String },
	Mute { account: String },
	Unmute { account: String },
}

// -- Community --

#[derive(Subcommand)]
pub enum CommunityCommand {
	Subscribe {
		/// Community account, e.g. hive-123456.
		community: String,
	},

	Unsubscribe { community: String },

	/// Report a post to the community's moderators.
	Flag {
		community: String,
		author: String,
		permlink: String,

		#[arg(long, default_value = "")]
		notes: String,
	},
}

// -- Account --

#[derive(Subcommand)]
pub enum AccountCommand {
	/// Update profile fields in posting metadata.
	Profile(ProfileArgs),

	/// Claim pending author and curation rewards.
	ClaimRewards {
		#[arg(long, default_value = "0.000 HIVE")]
		hive: String,

		#[arg(long, default_value = "0.000 HBD")]
		hbd: String,

		#[arg(long, default_value = "0.000000 VESTS")]
		vests: String,
	},

	/// Delegate resource credits (0 removes the delegation).
	DelegateRc {
		#[arg(required = true)]
		delegatees: Vec<String>,

		#[arg(long)]
		max_rc: i64,
	},

	/// Send HIVE or HBD (requires the active key).
	Transfer {
		to: String,

		/// Amount with symbol, e.g. "1.000 HIVE".
		amount: String,

		#[arg(long, default_value = "")]
		memo: String,
	},
}

#[derive(Args)]
pub struct ProfileArgs {
	#[arg(long)]
	pub name: Option<String>,

	#[arg(long)]
	pub about: Option<String>,

	#[arg(long)]
	pub location: Option<String>,

	#[arg(long)]
	pub website: Option<String>,

	#[arg(long)]
	pub profile_image: Option<String>,

	#[arg(long)]
	pub cover_image: Option<String>,
}

// -- Verify --

#[derive(Args)]
pub struct VerifyArgs {
	/// Account whose authority should have signed.
	pub username: String,

	/// 32-byte digest (hex).  Use --message to hash a text instead.
	#[arg(long, required_unless_present = "message")]
	pub digest: Option<String>,

	/// Text whose sha256 was signed.
	#[arg(long, conflicts_with = "digest")]
	pub message: Option<String>,

	/// Signature (hex, 65 bytes).
	#[arg(long)]
	pub signature: String,

	#[arg(long, value_enum, default_value_t)]
	pub key_type: KeyTypeArg,

	/// JSON transaction file; its digest must equal --digest.
	#[arg(long, requires = "digest")]
	pub transaction: Option<PathBuf>,

	/// Also require the recovered key to be registered on the account.
	#[arg(long)]
	pub strict: bool,
}

// -- Tx --

#[derive(Subcommand)]
pub enum TxCommand {
	/// Check where a broadcast transaction stands.
	Status {
		/// Transaction id (40 hex chars).
		id: String,
	},

	/// Print the id and signing digest of a JSON transaction file.
	Digest { path: PathBuf },
}
