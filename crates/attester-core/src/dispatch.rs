//! Hand-off of verification work out of the state machine.
//!
//! The round and source managers never await. They hand a
//! [`VerificationJob`] to a [`VerificationDispatcher`] and later receive the
//! matching [`VerificationOutcome`] as a message.

use attester_types::{AttestationId, AttestationType, SourceId, Verification};
use attester_verification::{VerificationError, VerificationRequest, VerifierRouter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VerificationJob {
	pub id: AttestationId,
	pub request: VerificationRequest,
}

#[derive(Debug)]
pub struct VerificationOutcome {
	pub id: AttestationId,
	pub source: SourceId,
	pub result: Result<Verification, VerificationError>,
}

pub trait VerificationDispatcher: Send + Sync {
	/// Whether any verifier handles the pair.
	fn supports(&self, source: SourceId, attestation_type: AttestationType) -> bool;

	/// Starts verification; must not block.
	fn dispatch(&self, job: VerificationJob);
}

/// Runs each verification on its own tokio task and reports back on a
/// channel read by the engine.
pub struct TaskDispatcher {
	router: Arc<VerifierRouter>,
	outcomes: mpsc::UnboundedSender<VerificationOutcome>,
}

impl TaskDispatcher {
	pub fn new(
		router: Arc<VerifierRouter>,
		outcomes: mpsc::UnboundedSender<VerificationOutcome>,
	) -> Self {
		Self { router, outcomes }
	}
}

impl VerificationDispatcher for TaskDispatcher {
	fn supports(&self, source: SourceId, attestation_type: AttestationType) -> bool {
		self.router.is_supported(source, attestation_type)
	}

	fn dispatch(&self, job: VerificationJob) {
		let router = self.router.clone();
		let outcomes = self.outcomes.clone();

		tokio::spawn(async move {
			let result = router.verify(&job.request).await;
			let outcome = VerificationOutcome {
				id: job.id,
				source: job.request.source_id,
				result,
			};
			if outcomes.send(outcome).is_err() {
				debug!(attestation = %job.id, "Verification finished after shutdown");
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use attester_types::Hash32;
	use attester_verification::VerifierInterface;

	struct EchoVerifier;

	#[async_trait]
	impl VerifierInterface for EchoVerifier {
		async fn verify(
			&self,
			request: &VerificationRequest,
		) -> Result<Verification, VerificationError> {
			Ok(Verification::ok(attester_types::keccak256(&request.request)))
		}
	}

	#[tokio::test]
	async fn test_outcome_is_sent_back() {
		let router = VerifierRouter::new().with_route(
			SourceId::Ltc,
			AttestationType::Payment,
			Arc::new(EchoVerifier),
		);
		let (tx, mut rx) = mpsc::unbounded_channel();
		let dispatcher = TaskDispatcher::new(Arc::new(router), tx);

		assert!(dispatcher.supports(SourceId::Ltc, AttestationType::Payment));
		assert!(!dispatcher.supports(SourceId::Btc, AttestationType::Payment));

		let id = AttestationId::new(4, 2);
		dispatcher.dispatch(VerificationJob {
			id,
			request: VerificationRequest {
				round_id: 4,
				source_id: SourceId::Ltc,
				attestation_type: AttestationType::Payment,
				request: vec![9],
				recheck: false,
			},
		});

		let outcome = rx.recv().await.unwrap();
		assert_eq!(outcome.id, id);
		assert_eq!(outcome.source, SourceId::Ltc);
		let verification = outcome.result.unwrap();
		assert_eq!(verification.hash, Some(attester_types::keccak256([9u8])));
		assert_ne!(verification.hash, Some(Hash32::ZERO));
	}
}
