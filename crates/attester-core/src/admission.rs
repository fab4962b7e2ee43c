//! Weighted admission of attestations per round and source.
//!
//! Each (round, source) pair gets a [`SourceHandler`] the first time an
//! attestation for it arrives. The handler snapshots the limits of the config
//! active for that round, so a later reload never re-evaluates a round that
//! already started admitting.

use crate::epoch::{now_ms, EpochSettings};
use arc_swap::ArcSwap;
use attester_config::{
	admission_dir_fingerprint, load_admission_dir, AttestationConfig, SourceLimiterConfig,
};
use attester_types::{AttestationStatus, AttestationType, RoundId, SourceId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Admission configs ordered by descending start round, shared with the
/// reload task.
pub type AdmissionConfigs = Arc<ArcSwap<Vec<AttestationConfig>>>;

pub struct SourceHandler {
	limiter: SourceLimiterConfig,
	used_weight: u64,
}

impl SourceHandler {
	pub fn new(limiter: SourceLimiterConfig) -> Self {
		Self {
			limiter,
			used_weight: 0,
		}
	}

	pub fn used_weight(&self) -> u64 {
		self.used_weight
	}

	/// Charges the type's weight against the round budget.
	pub fn admit(&mut self, attestation_type: AttestationType) -> Result<(), AttestationStatus> {
		let weight = *self
			.limiter
			.type_weights
			.get(&attestation_type)
			.ok_or(AttestationStatus::Error)?;

		if self.used_weight + weight > self.limiter.max_total_round_weight {
			return Err(AttestationStatus::OverLimit);
		}

		self.used_weight += weight;
		Ok(())
	}
}

pub struct AdmissionController {
	configs: AdmissionConfigs,
	handlers: HashMap<(RoundId, SourceId), Option<SourceHandler>>,
}

impl AdmissionController {
	pub fn new(configs: Vec<AttestationConfig>) -> Self {
		Self {
			configs: Arc::new(ArcSwap::from_pointee(sorted(configs))),
			handlers: HashMap::new(),
		}
	}

	/// Handle for the reload task.
	pub fn shared_configs(&self) -> AdmissionConfigs {
		self.configs.clone()
	}

	pub fn replace(&self, configs: Vec<AttestationConfig>) {
		self.configs.store(Arc::new(sorted(configs)));
	}

	/// The config with the highest start round not after `round_id`.
	pub fn config_for_round(&self, round_id: RoundId) -> Option<AttestationConfig> {
		self.configs
			.load()
			.iter()
			.find(|config| config.start_round_id <= round_id)
			.cloned()
	}

	/// Admits an attestation or returns the status it should be closed with:
	/// `OverLimit` once the budget is spent, `Error` when no weight is
	/// configured for the pair.
	pub fn admit(
		&mut self,
		round_id: RoundId,
		source: SourceId,
		attestation_type: AttestationType,
	) -> Result<(), AttestationStatus> {
		if !self.handlers.contains_key(&(round_id, source)) {
			let handler = self
				.config_for_round(round_id)
				.and_then(|config| config.source_limiters.get(&source).cloned())
				.map(SourceHandler::new);
			if handler.is_none() {
				error!(round_id, %source, "No admission config for source");
			}
			self.handlers.insert((round_id, source), handler);
		}

		match self.handlers.get_mut(&(round_id, source)) {
			Some(Some(handler)) => handler.admit(attestation_type),
			_ => Err(AttestationStatus::Error),
		}
	}

	pub fn used_weight(&self, round_id: RoundId, source: SourceId) -> u64 {
		match self.handlers.get(&(round_id, source)) {
			Some(Some(handler)) => handler.used_weight(),
			_ => 0,
		}
	}

	/// Drops handlers of rounds up to and including `last_round`.
	pub fn cleanup(&mut self, last_round: RoundId) {
		self.handlers.retain(|(round_id, _), _| *round_id > last_round);
	}
}

fn sorted(mut configs: Vec<AttestationConfig>) -> Vec<AttestationConfig> {
	configs.sort_by(|a, b| b.start_round_id.cmp(&a.start_round_id));
	configs
}

/// Warns about configs that become active in the current or the next round,
/// which leaves other attesters little time to pick them up.
pub fn warn_almost_alive(configs: &[AttestationConfig], current_round: RoundId) {
	for config in configs {
		if config.start_round_id == current_round || config.start_round_id == current_round + 1 {
			warn!(
				start_round = config.start_round_id,
				current_round, "Admission config almost alive"
			);
		}
	}
}

/// Polls the admission directory and swaps in the new configs whenever the
/// set of files or their modification times change. A directory that fails
/// to load keeps the previous configs.
pub async fn watch_admission_dir(
	dir: PathBuf,
	interval: Duration,
	configs: AdmissionConfigs,
	epoch: EpochSettings,
) {
	let mut last_seen = admission_dir_fingerprint(&dir).await.ok();
	let mut ticker = tokio::time::interval(interval);
	ticker.tick().await;

	loop {
		ticker.tick().await;

		let fingerprint = match admission_dir_fingerprint(&dir).await {
			Ok(fingerprint) => fingerprint,
			Err(e) => {
				warn!("Cannot read admission config dir {}: {}", dir.display(), e);
				continue;
			}
		};
		if last_seen.as_ref() == Some(&fingerprint) {
			continue;
		}
		last_seen = Some(fingerprint);

		match load_admission_dir(&dir).await {
			Ok(loaded) => {
				warn_almost_alive(&loaded, epoch.round_id_for_time(now_ms()));
				info!("Reloaded {} admission configs", loaded.len());
				configs.store(Arc::new(sorted(loaded)));
			}
			Err(e) => {
				error!("Admission config reload failed, keeping previous: {}", e);
			}
		}
	}
}
