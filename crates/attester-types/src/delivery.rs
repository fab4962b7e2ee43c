use crate::{CommitData, RevealData};
use serde::{Deserialize, Serialize};

/// One submission to the home chain for a given buffer number.
///
/// The commit part belongs to round `buffer_number - 1`, the reveal part to
/// round `buffer_number - 2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
	/// Human readable label used in logs and by relayers.
	pub action: String,
	pub buffer_number: u64,
	pub commit: CommitData,
	pub reveal: RevealData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
	pub tx_hash: String,
	#[serde(default)]
	pub block_number: Option<u64>,
}
