//! Attestation request and status types.

use crate::{keccak256, Hash32, RoundId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External chain an attestation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceId {
	#[serde(rename = "BTC")]
	Btc,
	#[serde(rename = "LTC")]
	Ltc,
	#[serde(rename = "DOGE")]
	Doge,
	#[serde(rename = "XRP")]
	Xrp,
	#[serde(rename = "ALGO")]
	Algo,
}

impl SourceId {
	pub const ALL: [SourceId; 5] = [
		SourceId::Btc,
		SourceId::Ltc,
		SourceId::Doge,
		SourceId::Xrp,
		SourceId::Algo,
	];

	/// Numeric id as carried by inbound request events.
	pub fn id(&self) -> u32 {
		match self {
			SourceId::Btc => 0,
			SourceId::Ltc => 1,
			SourceId::Doge => 2,
			SourceId::Xrp => 3,
			SourceId::Algo => 4,
		}
	}

	pub fn from_id(id: u32) -> Option<Self> {
		Self::ALL.into_iter().find(|source| source.id() == id)
	}

	pub fn name(&self) -> &'static str {
		match self {
			SourceId::Btc => "BTC",
			SourceId::Ltc => "LTC",
			SourceId::Doge => "DOGE",
			SourceId::Xrp => "XRP",
			SourceId::Algo => "ALGO",
		}
	}
}

impl fmt::Display for SourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for SourceId {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|source| source.name().eq_ignore_ascii_case(s))
			.ok_or_else(|| format!("Unknown source id: {}", s))
	}
}

/// Kind of fact being attested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttestationType {
	Payment,
	BalanceDecreasingTransaction,
	ConfirmedBlockHeightExists,
	ReferencedPaymentNonexistence,
}

impl AttestationType {
	pub const ALL: [AttestationType; 4] = [
		AttestationType::Payment,
		AttestationType::BalanceDecreasingTransaction,
		AttestationType::ConfirmedBlockHeightExists,
		AttestationType::ReferencedPaymentNonexistence,
	];

	pub fn id(&self) -> u16 {
		match self {
			AttestationType::Payment => 1,
			AttestationType::BalanceDecreasingTransaction => 2,
			AttestationType::ConfirmedBlockHeightExists => 3,
			AttestationType::ReferencedPaymentNonexistence => 4,
		}
	}

	pub fn from_id(id: u16) -> Option<Self> {
		Self::ALL.into_iter().find(|kind| kind.id() == id)
	}
}

impl fmt::Display for AttestationType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl FromStr for AttestationType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|kind| kind.to_string() == s)
			.ok_or_else(|| format!("Unknown attestation type: {}", s))
	}
}

/// Inbound attestation request event as emitted by the request source.
///
/// Source and type are kept as raw numeric ids so that events carrying ids
/// unknown to this client can still be decoded, logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRequest {
	#[serde(rename = "type")]
	pub attestation_type: u16,
	pub source_id: u32,
	/// Block timestamp of the request event in seconds.
	pub timestamp: u64,
	#[serde(with = "crate::common::hex_bytes")]
	pub request: Vec<u8>,
	pub block_number: u64,
	pub log_index: u64,
}

impl AttestationRequest {
	/// Dedup key of the request within a round.
	pub fn request_id(&self) -> Hash32 {
		keccak256(&self.request)
	}

	pub fn timestamp_ms(&self) -> u64 {
		self.timestamp.saturating_mul(1000)
	}
}

/// Protocol state of a single attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestationStatus {
	Queued,
	Processing,
	Failed,
	Valid,
	Invalid,
	TooLate,
	OverLimit,
	Error,
}

/// Stable handle of an attestation: its round and its index in the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttestationId {
	pub round_id: RoundId,
	pub index: usize,
}

impl AttestationId {
	pub fn new(round_id: RoundId, index: usize) -> Self {
		Self { round_id, index }
	}
}

impl fmt::Display for AttestationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.round_id, self.index)
	}
}
