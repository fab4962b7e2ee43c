//! Timers driving the round state machine and the source managers.
//!
//! The engine sleeps until [`Scheduler::next_deadline`] and then drains
//! [`Scheduler::pop_due`]. Cancelled timers stay in the heap and are skipped
//! when they reach the top.

use crate::queue::PriorityQueue;
use attester_types::{RoundId, SourceId};
use std::collections::HashSet;

pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTimer {
	StartCommit,
	StartReveal,
	CommitLimit,
	FirstCommit,
	Reveal,
	Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTimer {
	/// Earliest delayed attestation became due.
	DelayQueue,
	/// Retry after the rate limiter blocked with nothing in flight.
	Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
	Round(RoundId, RoundTimer),
	Source(SourceId, SourceTimer),
}

#[derive(Debug, Default)]
pub struct Scheduler {
	timers: PriorityQueue<(TimerId, TimerAction)>,
	cancelled: HashSet<TimerId>,
	next_id: TimerId,
}

impl Scheduler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn schedule(&mut self, fire_at_ms: u64, action: TimerAction) -> TimerId {
		let id = self.next_id;
		self.next_id += 1;
		self.timers.push(fire_at_ms, (id, action));
		id
	}

	pub fn cancel(&mut self, id: TimerId) {
		self.cancelled.insert(id);
	}

	pub fn next_deadline(&mut self) -> Option<u64> {
		self.discard_cancelled();
		self.timers.peek_key()
	}

	/// Pops the earliest timer if it is due at `now_ms`.
	pub fn pop_due(&mut self, now_ms: u64) -> Option<TimerAction> {
		self.discard_cancelled();
		match self.timers.peek_key() {
			Some(at) if at <= now_ms => self.timers.pop().map(|(_, action)| action),
			_ => None,
		}
	}

	/// Live timers whose action matches `filter`.
	pub fn count_matching(&self, filter: impl Fn(&TimerAction) -> bool) -> usize {
		self.timers
			.iter()
			.filter(|(id, action)| !self.cancelled.contains(id) && filter(action))
			.count()
	}

	fn discard_cancelled(&mut self) {
		while let Some((id, _)) = self.timers.peek() {
			let id = *id;
			if !self.cancelled.remove(&id) {
				break;
			}
			self.timers.pop();
		}
	}
}
