//! Round phases, vote statuses and persisted round records.

use crate::{Hash32, RoundId};
use serde::{Deserialize, Serialize};

/// Wall-clock driven phase of a round. Ordered; a round never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundPhase {
	Collect,
	Commit,
	Reveal,
	Completed,
}

/// Protocol driven voting status of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoteStatus {
	Collecting,
	Committing,
	Committed,
	Revealed,
	NothingToCommit,
	Error,
	ProcessingTimeout,
}

/// Data committed for a round: the masked root plus its preimage parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitData {
	pub merkle_root: Hash32,
	pub masked_merkle_root: Hash32,
	pub random: Hash32,
}

/// Data revealed for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevealData {
	pub merkle_root: Hash32,
	pub random: Hash32,
}

/// Persisted view of a round.
///
/// Every field besides the id is optional so that partial records (progress
/// comments) can be merged into existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoundResult {
	pub round_id: RoundId,
	#[serde(default)]
	pub merkle_root: Option<Hash32>,
	#[serde(default)]
	pub masked_merkle_root: Option<Hash32>,
	#[serde(default)]
	pub random: Option<Hash32>,
	#[serde(default)]
	pub finalized_timestamp: Option<u64>,
	#[serde(default)]
	pub transaction_count: Option<u64>,
	#[serde(default)]
	pub valid_transaction_count: Option<u64>,
}

impl RoundResult {
	pub fn new(round_id: RoundId) -> Self {
		Self {
			round_id,
			..Default::default()
		}
	}

	/// Overwrites the fields present in `other`, keeping the rest.
	pub fn merge(&mut self, other: &RoundResult) {
		if other.merkle_root.is_some() {
			self.merkle_root = other.merkle_root;
		}
		if other.masked_merkle_root.is_some() {
			self.masked_merkle_root = other.masked_merkle_root;
		}
		if other.random.is_some() {
			self.random = other.random;
		}
		if other.finalized_timestamp.is_some() {
			self.finalized_timestamp = other.finalized_timestamp;
		}
		if other.transaction_count.is_some() {
			self.transaction_count = other.transaction_count;
		}
		if other.valid_transaction_count.is_some() {
			self.valid_transaction_count = other.valid_transaction_count;
		}
	}

	/// Reveal data recorded for the round, zeros when nothing was committed.
	pub fn reveal_data(&self) -> RevealData {
		RevealData {
			merkle_root: self.merkle_root.unwrap_or(Hash32::ZERO),
			random: self.random.unwrap_or(Hash32::ZERO),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_phase_ordering() {
		assert!(RoundPhase::Collect < RoundPhase::Commit);
		assert!(RoundPhase::Reveal < RoundPhase::Completed);
	}

	#[test]
	fn test_merge_keeps_missing_fields() {
		let mut stored = RoundResult {
			merkle_root: Some(Hash32([1; 32])),
			random: Some(Hash32([2; 32])),
			transaction_count: Some(3),
			..RoundResult::new(5)
		};
		let comment = RoundResult {
			transaction_count: Some(4),
			finalized_timestamp: Some(99),
			..RoundResult::new(5)
		};
		stored.merge(&comment);
		assert_eq!(stored.merkle_root, Some(Hash32([1; 32])));
		assert_eq!(stored.transaction_count, Some(4));
		assert_eq!(stored.finalized_timestamp, Some(99));
		assert_eq!(stored.reveal_data().random, Hash32([2; 32]));
	}
}
