use crate::{Hash32, RoundId, RoundPhase};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttesterEvent {
	Round(RoundEvent),
	Submission(SubmissionEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoundEvent {
	Created {
		round_id: RoundId,
	},
	PhaseChanged {
		round_id: RoundId,
		phase: RoundPhase,
	},
	Committed {
		round_id: RoundId,
		merkle_root: Hash32,
		valid: usize,
		total: usize,
	},
	NothingToCommit {
		round_id: RoundId,
	},
	ProcessingTimeout {
		round_id: RoundId,
		processed: usize,
		total: usize,
	},
	Revealed {
		round_id: RoundId,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubmissionEvent {
	Submitted {
		round_id: RoundId,
		buffer_number: u64,
		tx_hash: String,
	},
	Failed {
		round_id: RoundId,
		buffer_number: u64,
		error: String,
	},
}
