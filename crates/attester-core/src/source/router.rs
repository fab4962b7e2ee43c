use super::manager::{SourceContext, SourceManager};
use crate::scheduler::SourceTimer;
use attester_config::SourceConfig;
use attester_types::{AttestationId, AttestationStatus, SourceId, Verification};
use attester_verification::VerificationError;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Routes attestations to the [`SourceManager`] of their source, creating
/// managers on first use.
pub struct SourceRouter {
	configs: HashMap<SourceId, SourceConfig>,
	managers: HashMap<SourceId, SourceManager>,
}

impl SourceRouter {
	pub fn new(configs: HashMap<SourceId, SourceConfig>) -> Self {
		Self {
			configs,
			managers: HashMap::new(),
		}
	}

	pub fn manager(&self, source: SourceId) -> Option<&SourceManager> {
		self.managers.get(&source)
	}

	fn manager_mut(&mut self, source: SourceId) -> Option<&mut SourceManager> {
		if !self.managers.contains_key(&source) {
			let config = self.configs.get(&source)?.clone();
			debug!(%source, "Creating source manager");
			self.managers
				.insert(source, SourceManager::new(source, config));
		}
		self.managers.get_mut(&source)
	}

	/// Hands an admitted attestation to its source. Sources without
	/// configuration close the attestation as invalid.
	pub fn validate_attestation(
		&mut self,
		id: AttestationId,
		source: SourceId,
		cx: &mut SourceContext<'_>,
	) {
		match self.manager_mut(source) {
			Some(manager) => manager.validate(id, cx),
			None => {
				warn!(attestation = %id, %source, "No source manager configured");
				if let Some(attestation) = cx.arena.attestation_mut(id) {
					attestation.status = AttestationStatus::Invalid;
				}
				cx.completed.push(id);
			}
		}
	}

	pub fn on_verification(
		&mut self,
		id: AttestationId,
		source: SourceId,
		result: Result<Verification, VerificationError>,
		cx: &mut SourceContext<'_>,
	) {
		match self.managers.get_mut(&source) {
			Some(manager) => manager.on_verification(id, result, cx),
			None => debug!(attestation = %id, %source, "Outcome for unknown source"),
		}
	}

	pub fn on_timer(&mut self, source: SourceId, timer: SourceTimer, cx: &mut SourceContext<'_>) {
		if let Some(manager) = self.managers.get_mut(&source) {
			manager.on_timer(timer, cx);
		}
	}
}
