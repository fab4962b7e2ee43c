//! Round timing.
//!
//! Rounds are fixed windows of `period` starting at `first_epoch_start`. Round
//! `R` collects requests during `[S, S + p)`, commits during `[S + p, S + 2p)`
//! and reveals during `[S + 2p, S + 3p)` where `S = first + R * p`.

use attester_config::{AttesterConfig, ConfigError};
use attester_types::{Address, RoundId};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
	chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSettings {
	first_epoch_start_ms: u64,
	period_ms: u64,
}

impl EpochSettings {
	pub fn new(first_epoch_start_sec: u64, period_sec: u64) -> Result<Self, ConfigError> {
		if period_sec == 0 {
			return Err(ConfigError::ValidationError(
				"Epoch period must be positive".into(),
			));
		}

		Ok(Self {
			first_epoch_start_ms: first_epoch_start_sec * 1000,
			period_ms: period_sec * 1000,
		})
	}

	pub fn period_ms(&self) -> u64 {
		self.period_ms
	}

	/// Round whose collect window contains `time_ms`. Times before the first
	/// epoch map to round 0.
	pub fn round_id_for_time(&self, time_ms: u64) -> RoundId {
		time_ms.saturating_sub(self.first_epoch_start_ms) / self.period_ms
	}

	pub fn round_start_ms(&self, round_id: RoundId) -> u64 {
		self.first_epoch_start_ms + round_id * self.period_ms
	}

	pub fn commit_start_ms(&self, round_id: RoundId) -> u64 {
		self.round_start_ms(round_id) + self.period_ms
	}

	pub fn reveal_start_ms(&self, round_id: RoundId) -> u64 {
		self.round_start_ms(round_id) + 2 * self.period_ms
	}

	pub fn reveal_end_ms(&self, round_id: RoundId) -> u64 {
		self.round_start_ms(round_id) + 3 * self.period_ms
	}
}

/// Settings every core component reads; built once from configuration and
/// passed down by reference.
#[derive(Debug, Clone)]
pub struct AttesterContext {
	pub epoch: EpochSettings,
	/// Commit deadline distance from the start of the reveal phase.
	pub commit_time_ms: u64,
	/// How long before a buffer window closes submissions are sent.
	pub reveal_time_ms: u64,
	pub submitter: Address,
}

impl AttesterContext {
	pub fn from_config(config: &AttesterConfig) -> Result<Self, ConfigError> {
		Ok(Self {
			epoch: EpochSettings::new(config.first_epoch_start_time, config.round_duration_sec)?,
			commit_time_ms: config.commit_time_sec * 1000,
			reveal_time_ms: config.reveal_time_sec * 1000,
			submitter: config.submitter_address,
		})
	}

	/// Attestations still processing after this instant are too late.
	pub fn commit_end_ms(&self, round_id: RoundId) -> u64 {
		self.epoch
			.reveal_start_ms(round_id)
			.saturating_sub(self.commit_time_ms)
	}

	/// Bootstrap commit for a round with no predecessor.
	pub fn first_commit_ms(&self, round_id: RoundId) -> u64 {
		self.epoch
			.reveal_start_ms(round_id)
			.saturating_sub(self.reveal_time_ms)
	}

	pub fn reveal_ms(&self, round_id: RoundId) -> u64 {
		self.epoch
			.reveal_end_ms(round_id)
			.saturating_sub(self.reveal_time_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_zero_period_is_rejected() {
		assert!(matches!(
			EpochSettings::new(1_000, 0),
			Err(ConfigError::ValidationError(_))
		));
	}

	#[test]
	fn test_round_boundaries() {
		let epoch = EpochSettings::new(1_000, 90).unwrap();

		assert_eq!(epoch.round_id_for_time(1_000_000), 0);
		assert_eq!(epoch.round_id_for_time(1_089_999), 0);
		assert_eq!(epoch.round_id_for_time(1_090_000), 1);
		assert_eq!(epoch.round_id_for_time(500), 0);

		assert_eq!(epoch.round_start_ms(2), 1_180_000);
		assert_eq!(epoch.commit_start_ms(2), 1_270_000);
		assert_eq!(epoch.reveal_start_ms(2), 1_360_000);
		assert_eq!(epoch.reveal_end_ms(2), 1_450_000);
		assert_eq!(epoch.round_id_for_time(epoch.round_start_ms(7)), 7);
	}

	#[test]
	fn test_context_deadlines() {
		let context = AttesterContext {
			epoch: EpochSettings::new(0, 90).unwrap(),
			commit_time_ms: 10_000,
			reveal_time_ms: 5_000,
			submitter: Address::ZERO,
		};

		assert_eq!(context.commit_end_ms(0), 170_000);
		assert_eq!(context.first_commit_ms(0), 175_000);
		assert_eq!(context.reveal_ms(0), 265_000);
	}
}
