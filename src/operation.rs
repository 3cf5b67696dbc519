use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SignerError};
use crate::tx_builder::Encoder;
use crate::types::KeyType;

// -- Assets --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSymbol {
	Hive,
	Hbd,
	Vests,
}

impl AssetSymbol {
	pub fn precision(self) -> u8 {
		match self {
			Self::Hive | Self::Hbd => 3,
			Self::Vests => 6,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Hive => "HIVE",
			Self::Hbd => "HBD",
			Self::Vests => "VESTS",
		}
	}

	/// Symbol as it appears in the binary form; the chain still packs the
	/// pre-fork names.
	fn wire_name(self) -> &'static str {
		match self {
			Self::Hive => "STEEM",
			Self::Hbd => "SBD",
			Self::Vests => "VESTS",
		}
	}

	fn parse(s: &str) -> Option<Self> {
		match s {
			"HIVE" | "STEEM" | "TESTS" => Some(Self::Hive),
			"HBD" | "SBD" | "TBD" => Some(Self::Hbd),
			"VESTS" => Some(Self::Vests),
			_ => None,
		}
	}
}

/// A fixed-point amount, e.g. `1.000 HIVE`.  `amount` is in the smallest
/// unit of the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asset {
	pub amount: i64,
	pub symbol: AssetSymbol,
}

impl Asset {
	pub fn new(amount: i64, symbol: AssetSymbol) -> Self {
		Self { amount, symbol }
	}

	pub fn zero(symbol: AssetSymbol) -> Self {
		Self::new(0, symbol)
	}

	fn encode(&self, enc: &mut Encoder) {
		enc.i64(self.amount);
		enc.u8(self.symbol.precision());
		let mut symbol = [0u8; 7];
		let name = self.symbol.wire_name().as_bytes();
		symbol[..name.len()].copy_from_slice(name);
		enc.raw(&symbol);
	}
}

impl fmt::Display for Asset {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let precision = u32::from(self.symbol.precision());
		let scale = 10i64.pow(precision);
		let sign = if self.amount < 0 { "-" } else { "" };
		let abs = self.amount.unsigned_abs();
		let whole = abs / scale as u64;
		let frac = abs % scale as u64;
		write!(
			f,
			"{sign}{whole}.{frac:0width$} {}",
			self.symbol.name(),
			width = precision as usize
		)
	}
}

impl FromStr for Asset {
	type Err = SignerError;

	fn from_str(s: &str) -> Result<Self> {
		let bad = || SignerError::Serialization(format!("invalid asset {s:?}"));
		let (number, symbol) = s.trim().split_once(' ').ok_or_else(bad)?;
		let symbol = AssetSymbol::parse(symbol.trim()).ok_or_else(bad)?;
		let precision = usize::from(symbol.precision());

		let (negative, number) = match number.strip_prefix('-') {
			Some(rest) => (true, rest),
			None => (false, number),
		};
		let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
		let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
		if whole.is_empty() || frac.len() > precision || !digits(whole) || !digits(frac) {
			return Err(bad());
		}
		let whole: i64 = whole.parse().map_err(|_| bad())?;
		let frac: i64 = if frac.is_empty() {
			0
		} else {
			format!("{frac:0<precision$}").parse().map_err(|_| bad())?
		};
		let amount = whole
			.checked_mul(10i64.pow(precision as u32))
			.and_then(|v| v.checked_add(frac))
			.ok_or_else(bad)?;
		Ok(Self::new(if negative { -amount } else { amount }, symbol))
	}
}

impl Serialize for Asset {
	fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
		s.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Asset {
	fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		s.parse().map_err(D::Error::custom)
	}
}

// -- Operation bodies --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOperation {
	pub voter: String,
	pub author: String,
	pub permlink: String,
	/// -10000 ..= 10000 (basis points of full vote strength).
	pub weight: i16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentOperation {
	pub parent_author: String,
	pub parent_permlink: String,
	pub author: String,
	pub permlink: String,
	pub title: String,
	pub body: String,
	pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOperation {
	pub from: String,
	pub to: String,
	pub amount: Asset,
	pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomJsonOperation {
	pub required_auths: Vec<String>,
	pub required_posting_auths: Vec<String>,
	pub id: String,
	/// JSON document, already serialized.
	pub json: String,
}

impl CustomJsonOperation {
	/// A custom_json authorized by `account`'s posting key.
	pub fn posting(account: &str, id: &str, json: &serde_json::Value) -> Self {
		Self {
			required_auths: Vec::new(),
			required_posting_auths: vec![account.to_owned()],
			id: id.to_owned(),
			json: json.to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRewardBalanceOperation {
	pub account: String,
	pub reward_hive: Asset,
	pub reward_hbd: Asset,
	pub reward_vests: Asset,
}

/// Metadata-only account update.  Authority and memo key changes are not
/// built by this crate and are always packed as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate2Operation {
	pub account: String,
	pub json_metadata: String,
	pub posting_json_metadata: String,
	#[serde(default)]
	pub extensions: Vec<serde_json::Value>,
}

// -- The tagged union --

/// A single chain action.  JSON form is the condenser `[name, body]` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	Vote(VoteOperation),
	Comment(CommentOperation),
	Transfer(TransferOperation),
	CustomJson(CustomJsonOperation),
	ClaimRewardBalance(ClaimRewardBalanceOperation),
	AccountUpdate2(AccountUpdate2Operation),
}

impl Operation {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Vote(_) => "vote",
			Self::Comment(_) => "comment",
			Self::Transfer(_) => "transfer",
			Self::CustomJson(_) => "custom_json",
			Self::ClaimRewardBalance(_) => "claim_reward_balance",
			Self::AccountUpdate2(_) => "account_update2",
		}
	}

	/// Protocol operation id (position in the chain's operation variant).
	pub fn id(&self) -> u32 {
		match self {
			Self::Vote(_) => 0,
			Self::Comment(_) => 1,
			Self::Transfer(_) => 2,
			Self::CustomJson(_) => 18,
			Self::ClaimRewardBalance(_) => 39,
			Self::AccountUpdate2(_) => 43,
		}
	}

	/// Lowest authority able to sign this operation.
	pub fn required_key_type(&self) -> KeyType {
		match self {
			Self::Transfer(_) => KeyType::Active,
			Self::CustomJson(op) if !op.required_auths.is_empty() => KeyType::Active,
			Self::AccountUpdate2(op) if !op.json_metadata.is_empty() => KeyType::Active,
			_ => KeyType::Posting,
		}
	}

	pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
		enc.varint(self.id());
		match self {
			Self::Vote(op) => {
				enc.string(&op.voter);
				enc.string(&op.author);
				enc.string(&op.permlink);
				enc.i16(op.weight);
			}
			Self::Comment(op) => {
				enc.string(&op.parent_author);
				enc.string(&op.parent_permlink);
				enc.string(&op.author);
				enc.string(&op.permlink);
				enc.string(&op.title);
				enc.string(&op.body);
				enc.string(&op.json_metadata);
			}
			Self::Transfer(op) => {
				enc.string(&op.from);
				enc.string(&op.to);
				op.amount.encode(enc);
				enc.string(&op.memo);
			}
			Self::CustomJson(op) => {
				enc.strings(&op.required_auths);
				enc.strings(&op.required_posting_auths);
				enc.string(&op.id);
				enc.string(&op.json);
			}
			Self::ClaimRewardBalance(op) => {
				enc.string(&op.account);
				op.reward_hive.encode(enc);
				op.reward_hbd.encode(enc);
				op.reward_vests.encode(enc);
			}
			Self::AccountUpdate2(op) => {
				enc.string(&op.account);
				// owner, active, posting, memo_key
				for _ in 0..4 {
					enc.u8(0);
				}
				enc.string(&op.json_metadata);
				enc.string(&op.posting_json_metadata);
				if !op.extensions.is_empty() {
					return Err(SignerError::Serialization(
						"account_update2 extensions are not supported".into(),
					));
				}
				enc.varint(0);
			}
		}
		Ok(())
	}
}

impl Serialize for Operation {
	fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
		let name = self.name();
		match self {
			Self::Vote(op) => (name, op).serialize(s),
			Self::Comment(op) => (name, op).serialize(s),
			Self::Transfer(op) => (name, op).serialize(s),
			Self::CustomJson(op) => (name, op).serialize(s),
			Self::ClaimRewardBalance(op) => (name, op).serialize(s),
			Self::AccountUpdate2(op) => (name, op).serialize(s),
		}
	}
}

impl<'de> Deserialize<'de> for Operation {
	fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
		let (name, body): (String, serde_json::Value) = Deserialize::deserialize(d)?;
		let op = match name.as_str() {
			"vote" => serde_json::from_value(body).map(Self::Vote),
			"comment" => serde_json::from_value(body).map(Self::Comment),
			"transfer" => serde_json::from_value(body).map(Self::Transfer),
			"custom_json" => serde_json::from_value(body).map(Self::CustomJson),
			"claim_reward_balance" => serde_json::from_value(body).map(Self::ClaimRewardBalance),
			"account_update2" => serde_json::from_value(body).map(Self::AccountUpdate2),
			other => return Err(D::Error::custom(format!("unsupported operation {other:?}"))),
		};
		op.map_err(D::Error::custom)
	}
}
