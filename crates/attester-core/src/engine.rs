//! The event loop driving the attester.
//!
//! A single task owns the [`AttestationRoundManager`] and is the only writer
//! of round and source state. Inbound requests, verifier answers, submission
//! results and timers all arrive as messages on this loop; storage writes and
//! chain submissions requested by the state machine run from here.

use crate::admission::{watch_admission_dir, AdmissionConfigs};
use crate::dispatch::VerificationOutcome;
use crate::epoch::now_ms;
use crate::event_bus::EventBus;
use crate::manager::{AttestationRoundManager, SubmissionKind};
use crate::round::CoreCommand;
use crate::AttesterError;
use attester_config::Config;
use attester_delivery::DeliveryService;
use attester_discovery::DiscoveryService;
use attester_storage::AttesterState;
use attester_types::{
	AttesterEvent, CommitData, RevealData, RoundId, SubmissionEvent, SubmissionReceipt,
	SubmissionRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Round creation, progress snapshots and cleanup run this often.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a submission task.
#[derive(Debug)]
pub struct SubmissionOutcome {
	pub round_id: RoundId,
	pub kind: SubmissionKind,
	pub buffer_number: u64,
	pub result: Result<SubmissionReceipt, String>,
}

pub struct AttesterEngine {
	pub(crate) config: Config,
	pub(crate) manager: AttestationRoundManager,
	pub(crate) state: Arc<AttesterState>,
	pub(crate) delivery: Arc<DeliveryService>,
	pub(crate) discovery: Arc<DiscoveryService>,
	pub(crate) outcome_rx: mpsc::UnboundedReceiver<VerificationOutcome>,
	pub(crate) submission_tx: mpsc::UnboundedSender<SubmissionOutcome>,
	pub(crate) submission_rx: mpsc::UnboundedReceiver<SubmissionOutcome>,
	pub(crate) admission_configs: AdmissionConfigs,
	pub(crate) event_bus: EventBus,
}

impl AttesterEngine {
	/// Runs until `shutdown` resolves.
	pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), AttesterError> {
		let (request_tx, mut request_rx) = mpsc::unbounded_channel();
		self.discovery
			.start_all(request_tx)
			.await
			.map_err(|e| AttesterError::Service(e.to_string()))?;

		let attester = &self.config.attester;
		let watcher = tokio::spawn(watch_admission_dir(
			attester.admission_config_dir.clone(),
			Duration::from_secs(attester.admission_reload_interval_sec.max(1)),
			self.admission_configs.clone(),
			self.manager.context().epoch.clone(),
		));

		info!(
			name = %attester.name,
			start_round_id = self.manager.start_round_id(),
			sources = self.discovery.source_count(),
			"Attester running"
		);

		let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
		tokio::pin!(shutdown);

		loop {
			let deadline = self.manager.next_deadline();

			tokio::select! {
				Some(request) = request_rx.recv() => {
					self.manager.attestate(request, now_ms());
				}

				Some(outcome) = self.outcome_rx.recv() => {
					self.manager.on_verification(outcome, now_ms());
				}

				Some(outcome) = self.submission_rx.recv() => {
					self.handle_submission_outcome(outcome);
				}

				_ = sleep_until_ms(deadline) => {
					self.manager.fire_due(now_ms());
				}

				_ = maintenance.tick() => {
					self.manager.tick(now_ms());
				}

				_ = &mut shutdown => {
					info!("Shutting down attester");
					break;
				}
			}

			self.execute_commands().await;
		}

		watcher.abort();
		self.discovery
			.stop_all()
			.await
			.map_err(|e| AttesterError::Service(e.to_string()))?;

		Ok(())
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn manager(&self) -> &AttestationRoundManager {
		&self.manager
	}

	/// Runs the commands the state machine produced since the last call.
	pub(crate) async fn execute_commands(&mut self) {
		for command in self.manager.take_commands() {
			match command {
				CoreCommand::PersistRound(result) => {
					if let Err(e) = self.state.save_round(&result).await {
						error!(round_id = result.round_id, "Failed to persist round: {}", e);
					}
				}
				CoreCommand::PersistComment(result) => {
					let saved = self
						.state
						.save_round_comment(
							result.round_id,
							result.transaction_count.unwrap_or_default(),
							result.valid_transaction_count.unwrap_or_default(),
						)
						.await;
					if let Err(e) = saved {
						warn!(round_id = result.round_id, "Failed to persist round progress: {}", e);
					}
				}
				CoreCommand::FirstCommit { round_id, commit } => {
					let request = self.first_commit_request(round_id, commit).await;
					self.spawn_submission(round_id, SubmissionKind::FirstCommit, request);
				}
				CoreCommand::Submit { round_id, request } => {
					self.spawn_submission(round_id, SubmissionKind::Reveal, request);
				}
			}
		}
	}

	/// Commit for `round_id` as buffer `round_id + 1`, revealing whatever an
	/// earlier run stored for the previous round.
	async fn first_commit_request(&self, round_id: RoundId, commit: CommitData) -> SubmissionRequest {
		let reveal = match round_id.checked_sub(1) {
			Some(prev) => match self.state.get_round(prev).await {
				Ok(Some(stored)) => stored.reveal_data(),
				Ok(None) => RevealData::default(),
				Err(e) => {
					warn!(round_id = prev, "Cannot read stored round, revealing zeros: {}", e);
					RevealData::default()
				}
			},
			None => RevealData::default(),
		};

		SubmissionRequest {
			action: format!(
				"Commit round {} (first commit, buffer {})",
				round_id,
				round_id + 1
			),
			buffer_number: round_id + 1,
			commit,
			reveal,
		}
	}

	fn spawn_submission(&self, round_id: RoundId, kind: SubmissionKind, request: SubmissionRequest) {
		let delivery = self.delivery.clone();
		let outcomes = self.submission_tx.clone();

		debug!(round_id, buffer_number = request.buffer_number, "{}", request.action);
		tokio::spawn(async move {
			let result = delivery.submit(&request).await.map_err(|e| e.to_string());
			let outcome = SubmissionOutcome {
				round_id,
				kind,
				buffer_number: request.buffer_number,
				result,
			};
			if outcomes.send(outcome).is_err() {
				debug!(round_id, "Submission finished after shutdown");
			}
		});
	}

	pub(crate) fn handle_submission_outcome(&mut self, outcome: SubmissionOutcome) {
		let event = match &outcome.result {
			Ok(receipt) => SubmissionEvent::Submitted {
				round_id: outcome.round_id,
				buffer_number: outcome.buffer_number,
				tx_hash: receipt.tx_hash.clone(),
			},
			Err(e) => {
				error!(
					round_id = outcome.round_id,
					buffer_number = outcome.buffer_number,
					"Submission failed: {}",
					e
				);
				SubmissionEvent::Failed {
					round_id: outcome.round_id,
					buffer_number: outcome.buffer_number,
					error: e.clone(),
				}
			}
		};
		self.event_bus.publish(AttesterEvent::Submission(event)).ok();

		self.manager
			.on_submission_result(outcome.round_id, outcome.kind, outcome.result.is_ok());
	}
}

async fn sleep_until_ms(deadline: Option<u64>) {
	match deadline {
		Some(at) => {
			let wait = at.saturating_sub(now_ms());
			tokio::time::sleep(Duration::from_millis(wait)).await;
		}
		None => futures::future::pending::<()>().await,
	}
}
