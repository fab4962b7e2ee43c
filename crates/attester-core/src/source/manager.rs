//! Scheduling of verifications for one data source.
//!
//! A [`SourceManager`] keeps every attestation it owns in exactly one of
//! three places: the FIFO `pending` queue, the `processing` set of in-flight
//! verifications, or the `delayed` heap of retries and rechecks keyed by the
//! instant they become due. Dispatches are capped both per wall-clock second
//! and by the number of verifications in flight.

use crate::attestation::AttestationArena;
use crate::dispatch::{VerificationDispatcher, VerificationJob};
use crate::epoch::AttesterContext;
use crate::queue::PriorityQueue;
use crate::scheduler::{Scheduler, SourceTimer, TimerAction, TimerId};
use attester_config::SourceConfig;
use attester_types::{AttestationId, AttestationStatus, SourceId, Verification, VerificationStatus};
use attester_verification::VerificationError;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, warn};

/// Wake-up delay when the rate limit blocks and nothing is in flight.
pub const HEARTBEAT_MS: u64 = 100;

/// Everything a source manager touches outside its own queues.
pub struct SourceContext<'a> {
	pub now_ms: u64,
	pub arena: &'a mut dyn AttestationArena,
	pub scheduler: &'a mut Scheduler,
	pub dispatcher: &'a dyn VerificationDispatcher,
	pub context: &'a AttesterContext,
	/// Attestations that reached a final status; the caller forwards them to
	/// their rounds.
	pub completed: &'a mut Vec<AttestationId>,
}

pub struct SourceManager {
	source: SourceId,
	config: SourceConfig,
	pending: VecDeque<AttestationId>,
	processing: HashSet<AttestationId>,
	delayed: PriorityQueue<AttestationId>,
	/// Armed delay-queue timer and its fire time.
	delay_timer: Option<(TimerId, u64)>,
	heartbeat: Option<TimerId>,
	request_second: u64,
	requests_in_second: u32,
}

impl SourceManager {
	pub fn new(source: SourceId, config: SourceConfig) -> Self {
		Self {
			source,
			config,
			pending: VecDeque::new(),
			processing: HashSet::new(),
			delayed: PriorityQueue::new(),
			delay_timer: None,
			heartbeat: None,
			request_second: u64::MAX,
			requests_in_second: 0,
		}
	}

	pub fn source(&self) -> SourceId {
		self.source
	}

	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	pub fn processing_len(&self) -> usize {
		self.processing.len()
	}

	pub fn delayed_len(&self) -> usize {
		self.delayed.len()
	}

	/// Number of queues holding `id`; never more than one.
	pub fn placements(&self, id: AttestationId) -> usize {
		usize::from(self.pending.contains(&id))
			+ usize::from(self.processing.contains(&id))
			+ self.delayed.iter().filter(|queued| **queued == id).count()
	}

	fn can_add_request(&self, now_ms: u64) -> bool {
		now_ms / 1000 != self.request_second
			|| self.requests_in_second < self.config.max_requests_per_second
	}

	fn count_request(&mut self, now_ms: u64) {
		let second = now_ms / 1000;
		if second == self.request_second {
			self.requests_in_second += 1;
		} else {
			self.request_second = second;
			self.requests_in_second = 1;
		}
	}

	pub fn can_process(&self, now_ms: u64) -> bool {
		self.can_add_request(now_ms) && self.processing.len() < self.config.max_processing_transactions
	}

	/// Dispatches the attestation right away if capacity allows, otherwise
	/// queues it.
	pub fn validate(&mut self, id: AttestationId, cx: &mut SourceContext<'_>) {
		if self.can_process(cx.now_ms) {
			self.process(id, cx);
		} else {
			if let Some(attestation) = cx.arena.attestation_mut(id) {
				attestation.status = AttestationStatus::Queued;
			}
			self.pending.push_back(id);
			self.arm_heartbeat(cx);
		}
	}

	fn process(&mut self, id: AttestationId, cx: &mut SourceContext<'_>) {
		let Some(commit_end_ms) = cx.arena.commit_end_ms(id.round_id) else {
			debug!(attestation = %id, "Round gone, dropping attestation");
			return;
		};

		if cx.now_ms > commit_end_ms {
			debug!(attestation = %id, source = %self.source, "Attestation too late");
			self.complete(id, AttestationStatus::TooLate, None, cx);
			return;
		}

		let Some(attestation) = cx.arena.attestation_mut(id) else {
			return;
		};
		attestation.status = AttestationStatus::Processing;
		attestation.process_start_ms = Some(cx.now_ms);
		let request = attestation.verification_request();

		self.count_request(cx.now_ms);
		self.processing.insert(id);
		cx.dispatcher.dispatch(VerificationJob { id, request });
	}

	/// Handles a verifier answer for an in-flight attestation.
	pub fn on_verification(
		&mut self,
		id: AttestationId,
		result: Result<Verification, VerificationError>,
		cx: &mut SourceContext<'_>,
	) {
		if !self.processing.remove(&id) {
			debug!(attestation = %id, "Stale verification outcome ignored");
			return;
		}

		match result {
			Ok(verification) if verification.status == VerificationStatus::RecheckLater => {
				self.recheck_later(id, verification, cx);
			}
			Ok(verification) if verification.status == VerificationStatus::SystemFailure => {
				error!(
					attestation = %id,
					source = %self.source,
					"Verifier reported SYSTEM_FAILURE"
				);
				self.complete(id, AttestationStatus::Invalid, Some(verification), cx);
			}
			Ok(verification) => {
				let status = match (&verification.status, verification.hash) {
					(VerificationStatus::Ok, Some(_)) => AttestationStatus::Valid,
					(VerificationStatus::Ok, None) => {
						warn!(attestation = %id, "Valid verification without a hash");
						AttestationStatus::Invalid
					}
					_ => AttestationStatus::Invalid,
				};
				self.complete(id, status, Some(verification), cx);
			}
			Err(e) if e.is_permanent() => {
				warn!(attestation = %id, "Verification rejected request: {}", e);
				self.complete(id, AttestationStatus::Invalid, None, cx);
			}
			Err(e) => self.retry_or_fail(id, e, cx),
		}
	}

	fn recheck_later(
		&mut self,
		id: AttestationId,
		verification: Verification,
		cx: &mut SourceContext<'_>,
	) {
		let now_ms = cx.now_ms;
		let offset_ms = self.config.reverification_time_offset_sec * 1000;
		let retry_delay_ms = self.config.delay_before_retry_sec * 1000;
		let target = cx
			.context
			.commit_end_ms(id.round_id)
			.saturating_sub(offset_ms);

		let Some(attestation) = cx.arena.attestation_mut(id) else {
			return;
		};
		// A second "too early" must not spin on a recheck time already past.
		let at = if attestation.reverification {
			target.max(now_ms + retry_delay_ms)
		} else {
			target
		};
		attestation.reverification = true;
		attestation.status = AttestationStatus::Queued;
		attestation.verification = Some(verification);

		debug!(attestation = %id, recheck_at = at, "Verification rescheduled");
		self.delay(id, at, cx);
	}

	fn retry_or_fail(&mut self, id: AttestationId, e: VerificationError, cx: &mut SourceContext<'_>) {
		let now_ms = cx.now_ms;
		let max_retry = self.config.max_failed_retry;
		let retry_at = now_ms + self.config.delay_before_retry_sec * 1000;

		let Some(attestation) = cx.arena.attestation_mut(id) else {
			return;
		};
		attestation.process_end_ms = Some(now_ms);

		if attestation.retry < max_retry {
			attestation.retry += 1;
			attestation.status = AttestationStatus::Queued;
			warn!(
				attestation = %id,
				retry = attestation.retry,
				"Verification error, retrying: {}",
				e
			);
			self.delay(id, retry_at, cx);
		} else {
			error!(attestation = %id, "Verification failed permanently: {}", e);
			self.complete(id, AttestationStatus::Invalid, None, cx);
		}
	}

	fn delay(&mut self, id: AttestationId, at: u64, cx: &mut SourceContext<'_>) {
		self.pending.retain(|queued| *queued != id);
		self.processing.remove(&id);
		self.delayed.push(at, id);
		self.arm_delay_timer(cx);
		self.start_next(cx);
	}

	/// Makes sure a timer fires when the delayed head becomes due. An armed
	/// timer is only replaced by an earlier one.
	fn arm_delay_timer(&mut self, cx: &mut SourceContext<'_>) {
		let Some(head) = self.delayed.peek_key() else {
			return;
		};
		let fire_at = head.max(cx.now_ms);

		match self.delay_timer {
			Some((_, armed_at)) if armed_at <= fire_at => {}
			armed => {
				if let Some((timer, _)) = armed {
					cx.scheduler.cancel(timer);
				}
				let timer = cx.scheduler.schedule(
					fire_at,
					TimerAction::Source(self.source, SourceTimer::DelayQueue),
				);
				self.delay_timer = Some((timer, fire_at));
			}
		}
	}

	fn complete(
		&mut self,
		id: AttestationId,
		status: AttestationStatus,
		verification: Option<Verification>,
		cx: &mut SourceContext<'_>,
	) {
		self.processing.remove(&id);
		if let Some(attestation) = cx.arena.attestation_mut(id) {
			attestation.status = status;
			attestation.process_end_ms = Some(cx.now_ms);
			if verification.is_some() {
				attestation.verification = verification;
			}
		}
		cx.completed.push(id);

		if status != AttestationStatus::TooLate {
			self.start_next(cx);
		}
	}

	/// Pulls due delayed work first, then pending work, while capacity lasts.
	pub fn start_next(&mut self, cx: &mut SourceContext<'_>) {
		let now_ms = cx.now_ms;

		if !self.can_process(now_ms) {
			self.arm_heartbeat(cx);
			return;
		}

		while self.can_process(now_ms) {
			match self.delayed.peek_key() {
				Some(at) if at <= now_ms => {}
				_ => break,
			}
			if let Some(id) = self.delayed.pop() {
				self.process(id, cx);
			}
		}
		self.arm_delay_timer(cx);

		while self.can_process(now_ms) {
			let Some(id) = self.pending.pop_front() else {
				break;
			};
			self.process(id, cx);
		}
	}

	/// Nothing in flight will wake a rate-limited manager, so a short timer
	/// has to.
	fn arm_heartbeat(&mut self, cx: &mut SourceContext<'_>) {
		let has_work = !self.pending.is_empty() || !self.delayed.is_empty();
		if self.processing.is_empty() && has_work && self.heartbeat.is_none() {
			debug!(source = %self.source, "Rate limited, arming heartbeat");
			self.heartbeat = Some(cx.scheduler.schedule(
				cx.now_ms + HEARTBEAT_MS,
				TimerAction::Source(self.source, SourceTimer::Heartbeat),
			));
		}
	}

	pub fn on_timer(&mut self, timer: SourceTimer, cx: &mut SourceContext<'_>) {
		match timer {
			SourceTimer::DelayQueue => self.delay_timer = None,
			SourceTimer::Heartbeat => self.heartbeat = None,
		}
		self.start_next(cx);
	}
}
