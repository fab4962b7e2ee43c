//! State machine of a single voting round.
//!
//! The phase (`collect → commit → reveal → completed`) follows the clock and
//! only moves on scheduler callbacks. The vote status follows the protocol:
//! a round commits once every attestation is accounted for during the commit
//! phase, and reveals during the reveal phase together with the next round's
//! commitment. Methods never perform I/O; they append [`CoreCommand`]s and
//! events to an [`Outbox`] executed by the engine.

use crate::admission::AdmissionController;
use crate::attestation::{Attestation, AttestationArena};
use attester_types::{
	commit_hash, Address, AttestationId, AttestationStatus, AttesterEvent, CommitData, Hash32,
	MerkleTree, RevealData, RoundEvent, RoundId, RoundPhase, RoundResult, SubmissionRequest,
	VoteStatus,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
	/// Upsert the round's commitment and counters.
	PersistRound(RoundResult),
	/// Upsert progress counters only.
	PersistComment(RoundResult),
	/// Bootstrap submission: commit `round_id` as buffer `round_id + 1` and
	/// reveal `round_id - 1` as read back from the state store.
	FirstCommit { round_id: RoundId, commit: CommitData },
	/// Regular submission sent from `round_id`'s reveal phase.
	Submit {
		round_id: RoundId,
		request: SubmissionRequest,
	},
}

#[derive(Debug, Default)]
pub struct Outbox {
	pub commands: Vec<CoreCommand>,
	pub events: Vec<AttesterEvent>,
}

impl Outbox {
	fn event(&mut self, event: RoundEvent) {
		self.events.push(AttesterEvent::Round(event));
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
	/// Same request already in the round; nothing was added.
	Duplicate,
	/// Added and closed without verification.
	Processed(AttestationId),
	/// Added and admitted; must be routed to its source.
	Dispatch(AttestationId),
}

fn crypto_random() -> Hash32 {
	let mut bytes = [0u8; 32];
	OsRng.fill_bytes(&mut bytes);
	Hash32(bytes)
}

pub struct AttestationRound {
	round_id: RoundId,
	phase: RoundPhase,
	vote_status: VoteStatus,
	attestations: Vec<Attestation>,
	by_request: HashMap<Hash32, usize>,
	processed: usize,
	merkle_root: Option<Hash32>,
	random: Option<Hash32>,
	masked_merkle_root: Option<Hash32>,
	commit_end_ms: u64,
	submitter: Address,
	pub(crate) prev_round: Option<RoundId>,
	pub(crate) next_round: Option<RoundId>,
}

impl AttestationRound {
	pub fn new(round_id: RoundId, commit_end_ms: u64, submitter: Address) -> Self {
		Self {
			round_id,
			phase: RoundPhase::Collect,
			vote_status: VoteStatus::Collecting,
			attestations: Vec::new(),
			by_request: HashMap::new(),
			processed: 0,
			merkle_root: None,
			random: None,
			masked_merkle_root: None,
			commit_end_ms,
			submitter,
			prev_round: None,
			next_round: None,
		}
	}

	pub fn round_id(&self) -> RoundId {
		self.round_id
	}

	pub fn phase(&self) -> RoundPhase {
		self.phase
	}

	pub fn vote_status(&self) -> VoteStatus {
		self.vote_status
	}

	pub fn attestations(&self) -> &[Attestation] {
		&self.attestations
	}

	pub fn attestations_processed(&self) -> usize {
		self.processed
	}

	pub fn commit_end_ms(&self) -> u64 {
		self.commit_end_ms
	}

	pub fn merkle_root(&self) -> Option<Hash32> {
		self.merkle_root
	}

	pub fn prev_round(&self) -> Option<RoundId> {
		self.prev_round
	}

	pub fn next_round(&self) -> Option<RoundId> {
		self.next_round
	}

	pub fn valid_count(&self) -> usize {
		self.attestations
			.iter()
			.filter(|a| a.status == AttestationStatus::Valid)
			.count()
	}

	pub fn has_commit_data(&self) -> bool {
		self.merkle_root.is_some()
	}

	/// All attestations are accounted for and the commit phase has started.
	pub fn can_commit(&self) -> bool {
		self.processed == self.attestations.len() && self.phase == RoundPhase::Commit
	}

	pub fn commit_data(&self) -> CommitData {
		CommitData {
			merkle_root: self.merkle_root.unwrap_or(Hash32::ZERO),
			masked_merkle_root: self.masked_merkle_root.unwrap_or(Hash32::ZERO),
			random: self.random.unwrap_or(Hash32::ZERO),
		}
	}

	/// Own root and random once committed on chain, zeros otherwise.
	pub fn reveal_data(&self) -> RevealData {
		match self.vote_status {
			VoteStatus::Committed | VoteStatus::Revealed => RevealData {
				merkle_root: self.merkle_root.unwrap_or(Hash32::ZERO),
				random: self.random.unwrap_or(Hash32::ZERO),
			},
			_ => RevealData::default(),
		}
	}

	pub fn result(&self) -> RoundResult {
		RoundResult {
			merkle_root: self.merkle_root,
			masked_merkle_root: self.masked_merkle_root,
			random: self.random,
			transaction_count: Some(self.attestations.len() as u64),
			valid_transaction_count: Some(self.valid_count() as u64),
			..RoundResult::new(self.round_id)
		}
	}

	pub fn progress(&self) -> RoundResult {
		RoundResult {
			transaction_count: Some(self.attestations.len() as u64),
			valid_transaction_count: Some(self.valid_count() as u64),
			..RoundResult::new(self.round_id)
		}
	}

	/// Adds an attestation unless the same request is already present.
	/// Attestations that failed at construction or are refused by admission
	/// are closed immediately.
	pub fn add_attestation(
		&mut self,
		mut attestation: Attestation,
		admission: &mut AdmissionController,
		out: &mut Outbox,
	) -> AddOutcome {
		if self.by_request.contains_key(&attestation.request_id) {
			debug!(
				round_id = self.round_id,
				request_id = %attestation.request_id,
				"Duplicate request dropped"
			);
			return AddOutcome::Duplicate;
		}

		let index = self.attestations.len();
		let id = AttestationId::new(self.round_id, index);

		if attestation.status != AttestationStatus::Failed {
			if let Err(status) =
				admission.admit(self.round_id, attestation.source, attestation.attestation_type)
			{
				debug!(attestation = %id, ?status, "Attestation not admitted");
				attestation.status = status;
			}
		}

		let closed = matches!(
			attestation.status,
			AttestationStatus::Failed | AttestationStatus::OverLimit | AttestationStatus::Error
		);
		self.by_request.insert(attestation.request_id, index);
		self.attestations.push(attestation);

		if closed {
			self.processed(index, out);
			AddOutcome::Processed(id)
		} else {
			AddOutcome::Dispatch(id)
		}
	}

	/// Counts a finished attestation and commits if it was the last one.
	pub fn processed(&mut self, index: usize, out: &mut Outbox) {
		let Some(attestation) = self.attestations.get_mut(index) else {
			error!(round_id = self.round_id, index, "Processed unknown attestation");
			return;
		};
		if attestation.counted {
			warn!(round_id = self.round_id, index, "Attestation already counted");
			return;
		}
		attestation.counted = true;

		self.processed += 1;
		assert!(
			self.processed <= self.attestations.len(),
			"round {} processed {} of {} attestations",
			self.round_id,
			self.processed,
			self.attestations.len()
		);

		self.try_trigger_commit(out);
	}

	pub fn try_trigger_commit(&mut self, out: &mut Outbox) {
		if self.can_commit() {
			self.commit(out);
		}
	}

	fn set_phase(&mut self, phase: RoundPhase, out: &mut Outbox) {
		if phase <= self.phase {
			return;
		}
		self.phase = phase;
		out.event(RoundEvent::PhaseChanged {
			round_id: self.round_id,
			phase,
		});
	}

	pub fn start_commit_phase(&mut self, out: &mut Outbox) {
		info!(
			round_id = self.round_id,
			processed = self.processed,
			total = self.attestations.len(),
			"Commit phase started"
		);
		self.set_phase(RoundPhase::Commit, out);
		self.try_trigger_commit(out);
	}

	pub fn start_reveal_phase(&mut self, out: &mut Outbox) {
		debug!(round_id = self.round_id, "Reveal phase started");
		self.set_phase(RoundPhase::Reveal, out);
	}

	pub fn complete(&mut self, out: &mut Outbox) {
		debug!(round_id = self.round_id, "Round completed");
		self.set_phase(RoundPhase::Completed, out);
	}

	/// Commit deadline passed. Stragglers keep running and are still counted.
	pub fn commit_limit(&mut self, out: &mut Outbox) {
		if self.vote_status != VoteStatus::Collecting {
			return;
		}
		error!(
			round_id = self.round_id,
			processed = self.processed,
			total = self.attestations.len(),
			"Round processing timeout"
		);
		self.vote_status = VoteStatus::ProcessingTimeout;
		out.event(RoundEvent::ProcessingTimeout {
			round_id: self.round_id,
			processed: self.processed,
			total: self.attestations.len(),
		});
	}

	/// Builds the round commitment. Runs at most once; calls outside the
	/// commit phase or after collecting ended are skipped.
	pub fn commit(&mut self, out: &mut Outbox) {
		if self.phase != RoundPhase::Commit {
			warn!(round_id = self.round_id, phase = ?self.phase, "Cannot commit outside commit phase");
			return;
		}
		if self.vote_status != VoteStatus::Collecting {
			debug!(round_id = self.round_id, status = ?self.vote_status, "Commit skipped");
			return;
		}
		self.vote_status = VoteStatus::Committing;

		let hashes: Vec<Hash32> = self
			.attestations
			.iter()
			.filter_map(Attestation::vote_hash)
			.collect();

		if hashes.is_empty() {
			warn!(
				round_id = self.round_id,
				total = self.attestations.len(),
				"Nothing to commit, no valid attestations"
			);
			self.create_empty_state(out);
			return;
		}

		let tree = MerkleTree::new(hashes.iter().copied());
		let Some(root) = tree.root() else {
			self.create_empty_state(out);
			return;
		};
		let random = crypto_random();

		self.merkle_root = Some(root);
		self.random = Some(random);
		self.masked_merkle_root = Some(commit_hash(&root, &random, &self.submitter));

		info!(
			round_id = self.round_id,
			valid = hashes.len(),
			total = self.attestations.len(),
			merkle_root = %root,
			"Round committed"
		);
		out.commands.push(CoreCommand::PersistRound(self.result()));
		out.event(RoundEvent::Committed {
			round_id: self.round_id,
			merkle_root: root,
			valid: hashes.len(),
			total: self.attestations.len(),
		});
	}

	/// Zero root with a fresh random, for rounds with nothing to commit.
	/// No-op once commitment data exists.
	pub fn create_empty_state(&mut self, out: &mut Outbox) {
		if self.merkle_root.is_some() {
			return;
		}

		let random = crypto_random();
		self.merkle_root = Some(Hash32::ZERO);
		self.random = Some(random);
		self.masked_merkle_root = Some(commit_hash(&Hash32::ZERO, &random, &self.submitter));

		if matches!(
			self.vote_status,
			VoteStatus::Collecting | VoteStatus::Committing | VoteStatus::ProcessingTimeout
		) {
			self.vote_status = VoteStatus::NothingToCommit;
		}

		debug!(round_id = self.round_id, "Empty state created");
		out.commands.push(CoreCommand::PersistRound(self.result()));
		out.event(RoundEvent::NothingToCommit {
			round_id: self.round_id,
		});
	}

	/// Bootstrap for the first round after start-up, which has no previous
	/// round to carry its commitment.
	pub fn first_commit(&mut self, out: &mut Outbox) {
		self.try_trigger_commit(out);
		if !self.has_commit_data() {
			warn!(round_id = self.round_id, "First round cannot commit in time");
			self.create_empty_state(out);
		}

		info!(
			round_id = self.round_id,
			buffer_number = self.round_id + 1,
			"Scheduling first commit"
		);
		out.commands.push(CoreCommand::FirstCommit {
			round_id: self.round_id,
			commit: self.commit_data(),
		});
	}

	/// Submits the next round's commitment together with this round's
	/// reveal, as buffer `round_id + 2`. Proceeds even when this round never
	/// committed, revealing zeros.
	pub fn reveal(&mut self, next_commit: CommitData, out: &mut Outbox) {
		if self.phase != RoundPhase::Reveal {
			error!(round_id = self.round_id, phase = ?self.phase, "Cannot reveal outside reveal phase");
			return;
		}

		match self.vote_status {
			VoteStatus::Committed => {}
			VoteStatus::NothingToCommit => {
				warn!(round_id = self.round_id, "Nothing to reveal");
			}
			VoteStatus::Collecting => {
				error!(
					round_id = self.round_id,
					processed = self.processed,
					total = self.attestations.len(),
					"Revealing unprocessed round"
				);
			}
			VoteStatus::Committing => {
				error!(round_id = self.round_id, "Revealing round that is still committing");
			}
			other => {
				error!(round_id = self.round_id, status = ?other, "Revealing uncommitted round");
			}
		}

		let buffer_number = self.round_id + 2;
		out.commands.push(CoreCommand::Submit {
			round_id: self.round_id,
			request: SubmissionRequest {
				action: format!(
					"Commit round {} reveal round {} (buffer {})",
					self.round_id + 1,
					self.round_id,
					buffer_number
				),
				buffer_number,
				commit: next_commit,
				reveal: self.reveal_data(),
			},
		});
	}

	pub fn on_first_commit_result(&mut self, success: bool) {
		if !success {
			self.vote_status = VoteStatus::Error;
		} else if self.vote_status == VoteStatus::Committing {
			self.vote_status = VoteStatus::Committed;
		}
	}

	/// Outcome of the submission sent from this round's reveal phase.
	pub fn on_reveal_result(&mut self, success: bool, out: &mut Outbox) {
		if success {
			self.vote_status = VoteStatus::Revealed;
			out.event(RoundEvent::Revealed {
				round_id: self.round_id,
			});
		} else {
			self.vote_status = VoteStatus::Error;
		}
	}

	/// The previous round's submission carried this round's commitment.
	pub fn on_commitment_submitted(&mut self) {
		if self.vote_status == VoteStatus::Committing {
			self.vote_status = VoteStatus::Committed;
		}
	}
}

impl AttestationArena for BTreeMap<RoundId, AttestationRound> {
	fn attestation(&self, id: AttestationId) -> Option<&Attestation> {
		self.get(&id.round_id)?.attestations.get(id.index)
	}

	fn attestation_mut(&mut self, id: AttestationId) -> Option<&mut Attestation> {
		self.get_mut(&id.round_id)?.attestations.get_mut(id.index)
	}

	fn commit_end_ms(&self, round_id: RoundId) -> Option<u64> {
		self.get(&round_id).map(|round| round.commit_end_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use attester_config::{AttestationConfig, SourceLimiterConfig};
	use attester_types::{AttestationRequest, AttestationType, SourceId, Verification};

	fn admission(max_weight: u64) -> AdmissionController {
		let limiter = SourceLimiterConfig {
			max_total_round_weight: max_weight,
			type_weights: HashMap::from([(AttestationType::Payment, 1)]),
		};
		AdmissionController::new(vec![AttestationConfig {
			start_round_id: 0,
			source_limiters: HashMap::from([(SourceId::Btc, limiter)]),
		}])
	}

	fn attestation(round_id: RoundId, request: u8) -> Attestation {
		Attestation::from_request(
			round_id,
			AttestationRequest {
				attestation_type: AttestationType::Payment.id(),
				source_id: SourceId::Btc.id(),
				timestamp: 0,
				request: vec![request],
				block_number: 1,
				log_index: request as u64,
			},
		)
		.unwrap()
	}

	fn finish(round: &mut AttestationRound, index: usize, hash: Option<Hash32>, out: &mut Outbox) {
		let attestation = &mut round.attestations[index];
		match hash {
			Some(hash) => {
				attestation.status = AttestationStatus::Valid;
				attestation.verification = Some(Verification::ok(hash));
			}
			None => attestation.status = AttestationStatus::Invalid,
		}
		round.processed(index, out);
	}

	#[test]
	fn test_duplicates_are_dropped() {
		let mut round = AttestationRound::new(5, 1_000, Address::ZERO);
		let mut admission = admission(10);
		let mut out = Outbox::default();

		let first = round.add_attestation(attestation(5, 1), &mut admission, &mut out);
		let second = round.add_attestation(attestation(5, 1), &mut admission, &mut out);

		assert_eq!(first, AddOutcome::Dispatch(AttestationId::new(5, 0)));
		assert_eq!(second, AddOutcome::Duplicate);
		assert_eq!(round.attestations().len(), 1);
		assert_eq!(round.attestations_processed(), 0);
		assert_eq!(admission.used_weight(5, SourceId::Btc), 1);
	}

	#[test]
	fn test_rejected_attestations_are_counted_without_dispatch() {
		let mut round = AttestationRound::new(5, 1_000, Address::ZERO);
		let mut admission = admission(1);
		let mut out = Outbox::default();

		let mut failed = attestation(5, 9);
		failed.status = AttestationStatus::Failed;

		assert!(matches!(
			round.add_attestation(attestation(5, 1), &mut admission, &mut out),
			AddOutcome::Dispatch(_)
		));
		assert_eq!(
			round.add_attestation(attestation(5, 2), &mut admission, &mut out),
			AddOutcome::Processed(AttestationId::new(5, 1))
		);
		assert_eq!(
			round.add_attestation(failed, &mut admission, &mut out),
			AddOutcome::Processed(AttestationId::new(5, 2))
		);

		assert_eq!(round.attestations()[1].status, AttestationStatus::OverLimit);
		assert_eq!(round.attestations()[2].status, AttestationStatus::Failed);
		assert_eq!(round.attestations_processed(), 2);
		// failed attestations are not charged
		assert_eq!(admission.used_weight(5, SourceId::Btc), 1);
	}

	#[test]
	fn test_processed_never_exceeds_attestations() {
		let mut round = AttestationRound::new(1, 1_000, Address::ZERO);
		let mut admission = admission(10);
		let mut out = Outbox::default();
		for request in 0..3 {
			round.add_attestation(attestation(1, request), &mut admission, &mut out);
		}

		for index in [0, 1, 1, 2, 0] {
			round.processed(index, &mut out);
			assert!(round.attestations_processed() <= round.attestations().len());
		}
		assert_eq!(round.attestations_processed(), 3);
	}

	#[test]
	fn test_commit_waits_for_phase_and_runs_once() {
		let mut round = AttestationRound::new(1, 1_000, Address([9; 20]));
		let mut admission = admission(10);
		let mut out = Outbox::default();
		round.add_attestation(attestation(1, 1), &mut admission, &mut out);
		round.add_attestation(attestation(1, 2), &mut admission, &mut out);

		finish(&mut round, 0, Some(Hash32([1; 32])), &mut out);
		finish(&mut round, 1, Some(Hash32([2; 32])), &mut out);
		assert!(!round.has_commit_data());
		assert_eq!(round.vote_status(), VoteStatus::Collecting);

		round.start_commit_phase(&mut out);
		assert_eq!(round.vote_status(), VoteStatus::Committing);
		let root = round.merkle_root().unwrap();
		let expected = MerkleTree::new([Hash32([1; 32]), Hash32([2; 32])]).root().unwrap();
		assert_eq!(root, expected);

		let data = round.commit_data();
		assert_eq!(
			data.masked_merkle_root,
			commit_hash(&root, &data.random, &Address([9; 20]))
		);

		round.commit(&mut out);
		round.try_trigger_commit(&mut out);
		assert_eq!(round.commit_data(), data);

		let persisted = out
			.commands
			.iter()
			.filter(|c| matches!(c, CoreCommand::PersistRound(_)))
			.count();
		assert_eq!(persisted, 1);
	}

	#[test]
	fn test_empty_round_commits_zero_root() {
		let mut round = AttestationRound::new(2, 1_000, Address([1; 20]));
		let mut admission = admission(10);
		let mut out = Outbox::default();
		round.add_attestation(attestation(2, 1), &mut admission, &mut out);
		finish(&mut round, 0, None, &mut out);

		round.start_commit_phase(&mut out);

		assert_eq!(round.vote_status(), VoteStatus::NothingToCommit);
		let data = round.commit_data();
		assert_eq!(data.merkle_root, Hash32::ZERO);
		assert!(!data.random.is_zero());
		assert!(!data.masked_merkle_root.is_zero());
		assert_eq!(
			data.masked_merkle_root,
			commit_hash(&Hash32::ZERO, &data.random, &Address([1; 20]))
		);

		// a second empty state keeps the first random
		round.create_empty_state(&mut out);
		assert_eq!(round.commit_data(), data);
	}

	#[test]
	fn test_commit_limit_blocks_late_commit() {
		let mut round = AttestationRound::new(3, 1_000, Address::ZERO);
		let mut admission = admission(10);
		let mut out = Outbox::default();
		round.add_attestation(attestation(3, 1), &mut admission, &mut out);

		round.start_commit_phase(&mut out);
		round.commit_limit(&mut out);
		assert_eq!(round.vote_status(), VoteStatus::ProcessingTimeout);

		finish(&mut round, 0, Some(Hash32([4; 32])), &mut out);
		assert_eq!(round.attestations_processed(), 1);
		assert!(!round.has_commit_data());
	}

	#[test]
	fn test_commit_outside_phase_is_skipped() {
		let mut round = AttestationRound::new(3, 1_000, Address::ZERO);
		let mut out = Outbox::default();
		round.commit(&mut out);
		assert_eq!(round.vote_status(), VoteStatus::Collecting);
		assert!(out.commands.is_empty());
	}

	#[test]
	fn test_reveal_requires_reveal_phase() {
		let mut round = AttestationRound::new(3, 1_000, Address::ZERO);
		let mut out = Outbox::default();
		round.reveal(CommitData::default(), &mut out);
		assert!(out.commands.is_empty());

		round.start_commit_phase(&mut out);
		round.start_reveal_phase(&mut out);
		round.reveal(CommitData::default(), &mut out);

		let submit = out
			.commands
			.iter()
			.find_map(|c| match c {
				CoreCommand::Submit { request, .. } => Some(request.clone()),
				_ => None,
			})
			.unwrap();
		assert_eq!(submit.buffer_number, 5);
		// never committed on chain, so nothing real is revealed
		assert_eq!(submit.reveal, RevealData::default());
	}
}
