//! Top-level orchestration of rounds.
//!
//! The [`AttestationRoundManager`] maps inbound requests to rounds, creates
//! rounds on demand together with their phase timers, and hands admitted
//! attestations to the [`SourceRouter`]. All methods are synchronous and take
//! the current time explicitly; side effects leave as [`CoreCommand`]s and
//! events.

use crate::admission::AdmissionController;
use crate::attestation::Attestation;
use crate::dispatch::{VerificationDispatcher, VerificationOutcome};
use crate::epoch::AttesterContext;
use crate::event_bus::EventBus;
use crate::round::{AddOutcome, AttestationRound, CoreCommand, Outbox};
use crate::scheduler::{RoundTimer, Scheduler, TimerAction};
use crate::source::{SourceContext, SourceRouter};
use attester_config::SourceConfig;
use attester_types::{
	AttestationId, AttestationRequest, AttestationStatus, AttesterEvent, CommitData, RoundEvent,
	RoundId, SourceId,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Rounds this far behind the current one are dropped.
pub const ROUND_RETENTION: RoundId = 10;

/// Which submission a [`SubmissionOutcome`](crate::SubmissionOutcome) reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
	FirstCommit,
	Reveal,
}

pub struct AttestationRoundManager {
	context: AttesterContext,
	rounds: BTreeMap<RoundId, AttestationRound>,
	router: SourceRouter,
	scheduler: Scheduler,
	admission: AdmissionController,
	dispatcher: Box<dyn VerificationDispatcher>,
	/// Round active at start-up; older requests are ignored.
	start_round_id: RoundId,
	outbox: Outbox,
	completed: Vec<AttestationId>,
	event_bus: EventBus,
}

impl AttestationRoundManager {
	pub fn new(
		context: AttesterContext,
		source_configs: HashMap<SourceId, SourceConfig>,
		admission: AdmissionController,
		dispatcher: Box<dyn VerificationDispatcher>,
		event_bus: EventBus,
		now_ms: u64,
	) -> Self {
		let start_round_id = context.epoch.round_id_for_time(now_ms);
		info!(start_round_id, "Round manager started");

		Self {
			context,
			rounds: BTreeMap::new(),
			router: SourceRouter::new(source_configs),
			scheduler: Scheduler::new(),
			admission,
			dispatcher,
			start_round_id,
			outbox: Outbox::default(),
			completed: Vec::new(),
			event_bus,
		}
	}

	pub fn context(&self) -> &AttesterContext {
		&self.context
	}

	pub fn start_round_id(&self) -> RoundId {
		self.start_round_id
	}

	pub fn round(&self, round_id: RoundId) -> Option<&AttestationRound> {
		self.rounds.get(&round_id)
	}

	pub fn round_ids(&self) -> impl Iterator<Item = RoundId> + '_ {
		self.rounds.keys().copied()
	}

	pub fn router(&self) -> &SourceRouter {
		&self.router
	}

	pub fn admission(&self) -> &AdmissionController {
		&self.admission
	}

	/// Earliest armed timer, for the engine to sleep until.
	pub fn next_deadline(&mut self) -> Option<u64> {
		self.scheduler.next_deadline()
	}

	/// Commands produced since the last call.
	pub fn take_commands(&mut self) -> Vec<CoreCommand> {
		std::mem::take(&mut self.outbox.commands)
	}

	/// Places an inbound request into the round its timestamp belongs to.
	pub fn attestate(&mut self, request: AttestationRequest, now_ms: u64) {
		let round_id = self.context.epoch.round_id_for_time(request.timestamp_ms());
		if round_id < self.start_round_id {
			debug!(
				round_id,
				start_round_id = self.start_round_id,
				"Request from before start-up ignored"
			);
			return;
		}
		if now_ms > self.context.commit_end_ms(round_id) {
			debug!(round_id, "Request for a round past its commit deadline ignored");
			return;
		}

		let (source_id, type_id) = (request.source_id, request.attestation_type);
		let Some(mut attestation) = Attestation::from_request(round_id, request) else {
			warn!(
				round_id,
				source_id, type_id, "Unsupported source or attestation type, request dropped"
			);
			return;
		};

		if !self
			.dispatcher
			.supports(attestation.source, attestation.attestation_type)
		{
			warn!(
				round_id,
				source = %attestation.source,
				attestation_type = %attestation.attestation_type,
				"No verifier for attestation"
			);
			attestation.status = AttestationStatus::Failed;
		}
		let source = attestation.source;

		self.ensure_round(round_id);
		let Some(round) = self.rounds.get_mut(&round_id) else {
			return;
		};

		if let AddOutcome::Dispatch(id) =
			round.add_attestation(attestation, &mut self.admission, &mut self.outbox)
		{
			let Self {
				rounds,
				router,
				scheduler,
				dispatcher,
				context,
				completed,
				..
			} = &mut *self;
			let mut cx = SourceContext {
				now_ms,
				arena: rounds,
				scheduler,
				dispatcher: &**dispatcher,
				context,
				completed,
			};
			router.validate_attestation(id, source, &mut cx);
		}

		self.settle();
	}

	/// Creates the round with its timers unless it already exists.
	pub fn ensure_round(&mut self, round_id: RoundId) {
		if self.rounds.contains_key(&round_id) {
			return;
		}

		let epoch = &self.context.epoch;
		let commit_end_ms = self.context.commit_end_ms(round_id);
		let mut round = AttestationRound::new(round_id, commit_end_ms, self.context.submitter);

		for (fire_at, timer) in [
			(epoch.commit_start_ms(round_id), RoundTimer::StartCommit),
			(epoch.reveal_start_ms(round_id), RoundTimer::StartReveal),
			(commit_end_ms, RoundTimer::CommitLimit),
			(self.context.reveal_ms(round_id), RoundTimer::Reveal),
			(epoch.reveal_end_ms(round_id), RoundTimer::Completed),
		] {
			self.scheduler
				.schedule(fire_at, TimerAction::Round(round_id, timer));
		}

		let prev_id = round_id.checked_sub(1);
		match prev_id.and_then(|id| self.rounds.get_mut(&id)) {
			Some(prev) => {
				prev.next_round = Some(round_id);
				round.prev_round = Some(prev.round_id());
			}
			None => {
				info!(round_id, "No previous round, scheduling first commit");
				self.scheduler.schedule(
					self.context.first_commit_ms(round_id),
					TimerAction::Round(round_id, RoundTimer::FirstCommit),
				);
			}
		}
		if let Some(next) = self.rounds.get_mut(&(round_id + 1)) {
			next.prev_round = Some(round_id);
			round.next_round = Some(round_id + 1);
		}

		debug!(round_id, commit_end_ms, "Round created");
		self.rounds.insert(round_id, round);
		self.outbox
			.events
			.push(AttesterEvent::Round(RoundEvent::Created { round_id }));
	}

	/// Feeds a verifier answer back to the source that dispatched it.
	pub fn on_verification(&mut self, outcome: VerificationOutcome, now_ms: u64) {
		if !self.rounds.contains_key(&outcome.id.round_id) {
			debug!(attestation = %outcome.id, "Outcome for a dropped round ignored");
			return;
		}

		let Self {
			rounds,
			router,
			scheduler,
			dispatcher,
			context,
			completed,
			..
		} = &mut *self;
		let mut cx = SourceContext {
			now_ms,
			arena: rounds,
			scheduler,
			dispatcher: &**dispatcher,
			context,
			completed,
		};
		router.on_verification(outcome.id, outcome.source, outcome.result, &mut cx);

		self.settle();
	}

	/// Runs every timer due at `now_ms`, earliest first.
	pub fn fire_due(&mut self, now_ms: u64) {
		while let Some(action) = self.scheduler.pop_due(now_ms) {
			match action {
				TimerAction::Round(round_id, timer) => {
					self.on_round_timer(round_id, timer, now_ms)
				}
				TimerAction::Source(source, timer) => {
					let Self {
						rounds,
						router,
						scheduler,
						dispatcher,
						context,
						completed,
						..
					} = &mut *self;
					let mut cx = SourceContext {
						now_ms,
						arena: rounds,
						scheduler,
						dispatcher: &**dispatcher,
						context,
						completed,
					};
					router.on_timer(source, timer, &mut cx);
				}
			}
			self.settle();
		}
	}

	fn on_round_timer(&mut self, round_id: RoundId, timer: RoundTimer, now_ms: u64) {
		if timer == RoundTimer::Reveal {
			self.reveal_round(round_id, now_ms);
			return;
		}
		if timer == RoundTimer::FirstCommit
			&& now_ms > self.context.epoch.reveal_start_ms(round_id)
		{
			warn!(round_id, "Commit window closed, first commit skipped");
			return;
		}

		let Some(round) = self.rounds.get_mut(&round_id) else {
			debug!(round_id, ?timer, "Timer for a dropped round");
			return;
		};
		let out = &mut self.outbox;
		match timer {
			RoundTimer::StartCommit => round.start_commit_phase(out),
			RoundTimer::StartReveal => round.start_reveal_phase(out),
			RoundTimer::CommitLimit => round.commit_limit(out),
			RoundTimer::FirstCommit => round.first_commit(out),
			RoundTimer::Completed => round.complete(out),
			RoundTimer::Reveal => {}
		}
	}

	/// Reveals `round_id` together with the next round's commitment. The next
	/// round falls back to an empty state when it could not commit in time.
	/// A next round that was never created commits zeros and is not created.
	fn reveal_round(&mut self, round_id: RoundId, now_ms: u64) {
		if !self.rounds.contains_key(&round_id) {
			debug!(round_id, "Reveal for a dropped round");
			return;
		}
		if now_ms > self.context.epoch.reveal_end_ms(round_id) {
			warn!(round_id, "Reveal window closed, submission skipped");
			return;
		}

		let next_id = round_id + 1;
		let next_commit = match self.rounds.get_mut(&next_id) {
			Some(next) => {
				next.try_trigger_commit(&mut self.outbox);
				next.create_empty_state(&mut self.outbox);
				next.commit_data()
			}
			None => {
				warn!(round_id, next_round = next_id, "Next round missing, committing zeros");
				CommitData::default()
			}
		};

		if let Some(round) = self.rounds.get_mut(&round_id) {
			round.reveal(next_commit, &mut self.outbox);
		}
	}

	/// Applies the outcome of a submission sent on behalf of `round_id`.
	pub fn on_submission_result(&mut self, round_id: RoundId, kind: SubmissionKind, success: bool) {
		match kind {
			SubmissionKind::FirstCommit => {
				if let Some(round) = self.rounds.get_mut(&round_id) {
					round.on_first_commit_result(success);
				}
			}
			SubmissionKind::Reveal => {
				if let Some(round) = self.rounds.get_mut(&round_id) {
					round.on_reveal_result(success, &mut self.outbox);
				}
				if success {
					if let Some(next) = self.rounds.get_mut(&(round_id + 1)) {
						next.on_commitment_submitted();
					}
				}
			}
		}
		self.flush_events();
	}

	/// Maintenance: makes sure the current round exists, records its
	/// progress and drops old rounds.
	pub fn tick(&mut self, now_ms: u64) {
		let current = self.context.epoch.round_id_for_time(now_ms);
		if current >= self.start_round_id {
			self.ensure_round(current);
		}
		if let Some(round) = self.rounds.get(&current) {
			self.outbox
				.commands
				.push(CoreCommand::PersistComment(round.progress()));
		}
		self.cleanup(current);
		self.flush_events();
	}

	/// Drops rounds at least [`ROUND_RETENTION`] behind `current`.
	pub fn cleanup(&mut self, current: RoundId) {
		let Some(last) = current.checked_sub(ROUND_RETENTION) else {
			return;
		};
		let before = self.rounds.len();
		self.rounds.retain(|round_id, _| *round_id > last);
		self.admission.cleanup(last);

		let removed = before - self.rounds.len();
		if removed > 0 {
			debug!(removed, last_round = last, "Old rounds dropped");
		}
	}

	/// Forwards completed attestations to their rounds and publishes events.
	fn settle(&mut self) {
		for id in std::mem::take(&mut self.completed) {
			match self.rounds.get_mut(&id.round_id) {
				Some(round) => round.processed(id.index, &mut self.outbox),
				None => debug!(attestation = %id, "Completion for a dropped round"),
			}
		}
		self.flush_events();
	}

	fn flush_events(&mut self) {
		for event in self.outbox.events.drain(..) {
			// no subscribers is fine
			let _ = self.event_bus.publish(event);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{admission_config, context, request, source_config, RecordingDispatcher};
	use attester_types::{
		commit_hash, AttestationType, Hash32, RoundPhase, SubmissionRequest, Verification,
		VerificationStatus, VoteStatus,
	};

	const PERIOD: u64 = 90_000;

	fn manager(now_ms: u64) -> (AttestationRoundManager, RecordingDispatcher) {
		manager_with(context(), now_ms)
	}

	fn manager_with(
		context: AttesterContext,
		now_ms: u64,
	) -> (AttestationRoundManager, RecordingDispatcher) {
		let dispatcher = RecordingDispatcher::default();
		let manager = AttestationRoundManager::new(
			context,
			HashMap::from([(SourceId::Btc, source_config(100, 100))]),
			AdmissionController::new(vec![admission_config(100)]),
			Box::new(dispatcher.clone()),
			EventBus::new(64),
			now_ms,
		);
		(manager, dispatcher)
	}

	fn answer(
		manager: &mut AttestationRoundManager,
		id: AttestationId,
		verification: Verification,
		now_ms: u64,
	) {
		manager.on_verification(
			VerificationOutcome {
				id,
				source: SourceId::Btc,
				result: Ok(verification),
			},
			now_ms,
		);
	}

	fn submissions(commands: &[CoreCommand]) -> Vec<(RoundId, SubmissionRequest)> {
		commands
			.iter()
			.filter_map(|command| match command {
				CoreCommand::Submit { round_id, request } => Some((*round_id, request.clone())),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn test_round_creation_schedules_timers_and_links() {
		let (mut manager, _) = manager(1_000);
		manager.attestate(request(10, 1), 1_000);
		manager.tick(PERIOD + 1_000);

		let first = manager.round(0).unwrap();
		let second = manager.round(1).unwrap();
		assert_eq!(first.next_round(), Some(1));
		assert_eq!(second.prev_round(), Some(0));
		assert_eq!(first.commit_end_ms(), 170_000);

		let first_commits = manager.scheduler.count_matching(|action| {
			matches!(action, TimerAction::Round(_, RoundTimer::FirstCommit))
		});
		assert_eq!(first_commits, 1);
		assert_eq!(
			manager
				.scheduler
				.count_matching(|action| matches!(action, TimerAction::Round(1, _))),
			5
		);
	}

	#[test]
	fn test_commit_reveal_offsets_line_up() {
		let (mut manager, dispatcher) = manager(1_000);
		let mut events = manager.event_bus.subscribe();
		manager.attestate(request(10, 1), 1_000);
		manager.attestate(request(20, 2), 1_000);
		let jobs = dispatcher.jobs();
		assert_eq!(jobs.len(), 2);
		answer(&mut manager, jobs[0].id, Verification::ok(Hash32([1; 32])), 2_000);
		answer(
			&mut manager,
			jobs[1].id,
			Verification::new(VerificationStatus::NotConfirmed),
			2_000,
		);
		manager.tick(PERIOD + 1_000);
		manager.take_commands();

		// round 0 commits as soon as its commit phase opens
		manager.fire_due(PERIOD);
		assert_eq!(manager.round(0).unwrap().vote_status(), VoteStatus::Committing);
		assert!(matches!(
			manager.take_commands().as_slice(),
			[CoreCommand::PersistRound(result)] if result.valid_transaction_count == Some(1)
		));

		// bootstrap: commit round 0 as buffer 1
		manager.fire_due(175_000);
		let commands = manager.take_commands();
		let first_commit = commands
			.iter()
			.find_map(|command| match command {
				CoreCommand::FirstCommit { round_id: 0, commit } => Some(*commit),
				_ => None,
			})
			.unwrap();
		manager.on_submission_result(0, SubmissionKind::FirstCommit, true);
		assert_eq!(manager.round(0).unwrap().vote_status(), VoteStatus::Committed);

		// round 0 reveal: buffer 2 commits round 1 and reveals round 0
		manager.fire_due(265_000);
		let commands = manager.take_commands();
		let submitted = submissions(&commands);
		assert_eq!(submitted.len(), 1);
		let (round_id, submission) = &submitted[0];
		assert_eq!(*round_id, 0);
		assert_eq!(submission.buffer_number, 2);
		assert_eq!(submission.reveal.merkle_root, first_commit.merkle_root);
		assert_eq!(submission.reveal.random, first_commit.random);
		assert_eq!(
			commit_hash(
				&submission.reveal.merkle_root,
				&submission.reveal.random,
				&manager.context().submitter
			),
			first_commit.masked_merkle_root
		);
		let round1 = manager.round(1).unwrap();
		assert_eq!(round1.vote_status(), VoteStatus::NothingToCommit);
		assert_eq!(submission.commit, round1.commit_data());
		assert_eq!(submission.commit.merkle_root, Hash32::ZERO);

		manager.on_submission_result(0, SubmissionKind::Reveal, true);
		assert_eq!(manager.round(0).unwrap().vote_status(), VoteStatus::Revealed);

		let mut revealed = false;
		while let Ok(event) = events.try_recv() {
			if let AttesterEvent::Round(RoundEvent::Revealed { round_id: 0 }) = event {
				revealed = true;
			}
		}
		assert!(revealed);
	}

	#[test]
	fn test_reveal_commits_next_round_after_successful_submission() {
		let (mut manager, dispatcher) = manager(1_000);
		manager.tick(1_000);
		manager.attestate(request(95, 7), 95_000);
		let job = dispatcher.jobs()[0].clone();
		assert_eq!(job.id.round_id, 1);
		answer(&mut manager, job.id, Verification::ok(Hash32([3; 32])), 96_000);

		manager.fire_due(PERIOD * 2);
		assert_eq!(manager.round(1).unwrap().vote_status(), VoteStatus::Committing);
		let root = manager.round(1).unwrap().merkle_root();

		manager.fire_due(265_000);
		let submitted = submissions(&manager.take_commands());
		assert_eq!(submitted[0].1.commit.merkle_root, root.unwrap());

		manager.on_submission_result(0, SubmissionKind::Reveal, true);
		assert_eq!(manager.round(1).unwrap().vote_status(), VoteStatus::Committed);

		manager.fire_due(355_000);
		let submitted = submissions(&manager.take_commands());
		assert_eq!(submitted[0].0, 1);
		assert_eq!(submitted[0].1.buffer_number, 3);
		assert_eq!(submitted[0].1.reveal.merkle_root, root.unwrap());
	}

	#[test]
	fn test_failed_submission_marks_error() {
		let (mut manager, _) = manager(1_000);
		manager.tick(1_000);
		manager.fire_due(175_000);
		assert_eq!(manager.round(0).unwrap().vote_status(), VoteStatus::NothingToCommit);
		manager.on_submission_result(0, SubmissionKind::FirstCommit, false);
		assert_eq!(manager.round(0).unwrap().vote_status(), VoteStatus::Error);
	}

	#[test]
	fn test_requests_before_start_round_are_ignored() {
		let (mut manager, dispatcher) = manager(5 * PERIOD + 1_000);
		assert_eq!(manager.start_round_id(), 5);

		manager.attestate(request(4 * 90 + 1, 1), 5 * PERIOD + 1_000);
		assert!(manager.round(4).is_none());
		assert!(dispatcher.jobs().is_empty());
	}

	#[test]
	fn test_unknown_ids_and_unsupported_pairs() {
		let (mut manager, dispatcher) = manager(1_000);
		let mut unknown = request(10, 1);
		unknown.source_id = 77;
		manager.attestate(unknown, 1_000);
		assert!(manager.round(0).is_none());

		dispatcher
			.unsupported
			.lock()
			.unwrap()
			.insert((SourceId::Btc, AttestationType::Payment));
		manager.attestate(request(10, 2), 1_000);

		let round = manager.round(0).unwrap();
		assert_eq!(round.attestations()[0].status, AttestationStatus::Failed);
		assert_eq!(round.attestations_processed(), 1);
		assert!(dispatcher.jobs().is_empty());
	}

	#[test]
	fn test_duplicate_request_is_dispatched_once() {
		let (mut manager, dispatcher) = manager(1_000);
		manager.attestate(request(10, 1), 1_000);
		manager.attestate(request(11, 1), 1_000);

		assert_eq!(manager.round(0).unwrap().attestations().len(), 1);
		assert_eq!(dispatcher.jobs().len(), 1);
	}

	#[test]
	fn test_straggler_after_commit_limit_does_not_commit() {
		let (mut manager, dispatcher) = manager(1_000);
		manager.attestate(request(10, 1), 1_000);
		let id = dispatcher.jobs()[0].id;

		manager.fire_due(170_000);
		let round = manager.round(0).unwrap();
		assert_eq!(round.phase(), RoundPhase::Commit);
		assert_eq!(round.vote_status(), VoteStatus::ProcessingTimeout);

		answer(&mut manager, id, Verification::ok(Hash32([1; 32])), 170_500);
		let round = manager.round(0).unwrap();
		assert_eq!(round.attestations_processed(), 1);
		assert_eq!(round.merkle_root(), None);
	}

	#[test]
	fn test_tick_persists_progress_and_cleans_up() {
		let (mut manager, _) = manager(1_000);
		manager.tick(1_000);
		manager.take_commands();

		manager.tick(12 * PERIOD);
		let commands = manager.take_commands();
		assert!(commands.iter().any(|command| matches!(
			command,
			CoreCommand::PersistComment(result) if result.round_id == 12
		)));
		assert!(manager.round(0).is_none());
		assert!(manager.round(12).is_some());
	}

	#[test]
	fn test_request_for_expired_round_is_dropped() {
		let (mut manager, dispatcher) = manager(1_000);
		let now = 20 * PERIOD + 1_000;

		manager.attestate(request(5 * 90 + 1, 1), now);
		assert!(manager.round(5).is_none());
		assert!(dispatcher.jobs().is_empty());

		manager.fire_due(now);
		assert!(submissions(&manager.take_commands()).is_empty());
		assert_eq!(manager.round_ids().count(), 0);
	}

	#[test]
	fn test_overdue_round_timers_do_not_submit() {
		let (mut manager, _) = manager(1_000);
		manager.ensure_round(5);

		manager.fire_due(20 * PERIOD);
		let commands = manager.take_commands();
		assert!(submissions(&commands).is_empty());
		assert!(!commands
			.iter()
			.any(|command| matches!(command, CoreCommand::FirstCommit { .. })));
		assert_eq!(manager.round_ids().collect::<Vec<_>>(), vec![5]);
		assert_eq!(manager.round(5).unwrap().phase(), RoundPhase::Completed);
	}

	#[test]
	fn test_reveal_without_next_round_commits_zeros() {
		let (mut manager, _) = manager(1_000);
		manager.tick(1_000);
		manager.take_commands();

		manager.fire_due(265_000);
		let submitted = submissions(&manager.take_commands());
		assert_eq!(submitted.len(), 1);
		assert_eq!(submitted[0].1.buffer_number, 2);
		assert_eq!(submitted[0].1.commit, CommitData::default());
		assert!(manager.round(1).is_none());
	}

	#[test]
	fn test_reveal_at_period_end_runs_before_completion() {
		let mut context = context();
		context.reveal_time_ms = 0;
		let (mut manager, _) = manager_with(context, 1_000);
		manager.tick(1_000);
		manager.tick(PERIOD + 1_000);
		manager.take_commands();

		manager.fire_due(3 * PERIOD);
		let submitted = submissions(&manager.take_commands());
		assert_eq!(submitted.len(), 1);
		assert_eq!(submitted[0].0, 0);
		assert_eq!(submitted[0].1.buffer_number, 2);
		assert_eq!(manager.round(0).unwrap().phase(), RoundPhase::Completed);
	}
}
