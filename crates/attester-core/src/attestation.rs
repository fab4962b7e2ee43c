//! A single attestation request as tracked inside a round.

use attester_types::{
	AttestationId, AttestationRequest, AttestationStatus, AttestationType, Hash32, RoundId,
	SourceId, Verification,
};
use attester_verification::VerificationRequest;

#[derive(Debug, Clone)]
pub struct Attestation {
	pub round_id: RoundId,
	pub source: SourceId,
	pub attestation_type: AttestationType,
	pub request: AttestationRequest,
	/// Dedup key within a round.
	pub request_id: Hash32,
	pub status: AttestationStatus,
	pub retry: u32,
	/// Set once the verifier asked to check again later.
	pub reverification: bool,
	pub verification: Option<Verification>,
	pub process_start_ms: Option<u64>,
	pub process_end_ms: Option<u64>,
	pub(crate) counted: bool,
}

impl Attestation {
	/// Builds an attestation from an inbound request. Requests with unknown
	/// source or type ids yield `None`.
	pub fn from_request(round_id: RoundId, request: AttestationRequest) -> Option<Self> {
		let source = SourceId::from_id(request.source_id)?;
		let attestation_type = AttestationType::from_id(request.attestation_type)?;

		Some(Self {
			round_id,
			source,
			attestation_type,
			request_id: request.request_id(),
			request,
			status: AttestationStatus::Queued,
			retry: 0,
			reverification: false,
			verification: None,
			process_start_ms: None,
			process_end_ms: None,
			counted: false,
		})
	}

	/// Verification hash of a valid attestation.
	pub fn vote_hash(&self) -> Option<Hash32> {
		match self.status {
			AttestationStatus::Valid => self.verification.as_ref().and_then(|v| v.hash),
			_ => None,
		}
	}

	pub fn verification_request(&self) -> VerificationRequest {
		VerificationRequest {
			round_id: self.round_id,
			source_id: self.source,
			attestation_type: self.attestation_type,
			request: self.request.request.clone(),
			recheck: self.reverification,
		}
	}
}

/// Lookup of attestations by their stable id.
pub trait AttestationArena {
	fn attestation(&self, id: AttestationId) -> Option<&Attestation>;

	fn attestation_mut(&mut self, id: AttestationId) -> Option<&mut Attestation>;

	/// Instant after which attestations of the round are too late.
	fn commit_end_ms(&self, round_id: RoundId) -> Option<u64>;
}
