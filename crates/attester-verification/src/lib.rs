//! Verification of attestation requests.
//!
//! The attester never inspects external chains itself. A [`VerifierInterface`]
//! implementation answers whether a request is valid, and the
//! [`VerifierRouter`] picks the implementation for each (source, type) pair.

use async_trait::async_trait;
use attester_types::{AttestationType, RoundId, SourceId, Verification};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod implementations {
	pub mod http;
}

#[derive(Debug, Error)]
pub enum VerificationError {
	#[error("No verifier for source {0}")]
	WrongSourceId(SourceId),
	#[error("Source {0} does not support attestation type {1}")]
	WrongAttestationType(SourceId, AttestationType),
	#[error("Request could not be parsed: {0}")]
	RequestParse(String),
	#[error("Verifier returned an error: {0}")]
	Verifier(String),
	#[error("Transport error: {0}")]
	Transport(String),
	#[error("Configuration error: {0}")]
	Config(String),
}

impl VerificationError {
	/// Errors that will not go away by asking again. Parse failures are
	/// retried like any other verifier error.
	pub fn is_permanent(&self) -> bool {
		matches!(
			self,
			VerificationError::WrongSourceId(_)
				| VerificationError::WrongAttestationType(_, _)
				| VerificationError::Config(_)
		)
	}
}

/// A single verification call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
	pub round_id: RoundId,
	pub source_id: SourceId,
	#[serde(rename = "type")]
	pub attestation_type: AttestationType,
	#[serde(with = "attester_types::common::hex_bytes")]
	pub request: Vec<u8>,
	/// Set on a second attempt after an earlier "too early" answer.
	pub recheck: bool,
}

#[async_trait]
pub trait VerifierInterface: Send + Sync {
	/// Verifies one request. Must be safe to call again with the same input.
	async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<Verification, VerificationError>;
}

/// Routes verification calls to the verifier configured for the request's
/// source and attestation type.
#[derive(Default, Clone)]
pub struct VerifierRouter {
	routes: HashMap<(SourceId, AttestationType), Arc<dyn VerifierInterface>>,
}

impl VerifierRouter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_route(
		&mut self,
		source: SourceId,
		attestation_type: AttestationType,
		verifier: Arc<dyn VerifierInterface>,
	) {
		debug!(%source, %attestation_type, "Registering verifier route");
		self.routes.insert((source, attestation_type), verifier);
	}

	pub fn with_route(
		mut self,
		source: SourceId,
		attestation_type: AttestationType,
		verifier: Arc<dyn VerifierInterface>,
	) -> Self {
		self.add_route(source, attestation_type, verifier);
		self
	}

	pub fn is_supported(&self, source: SourceId, attestation_type: AttestationType) -> bool {
		self.routes.contains_key(&(source, attestation_type))
	}

	pub async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<Verification, VerificationError> {
		let key = (request.source_id, request.attestation_type);
		match self.routes.get(&key) {
			Some(verifier) => verifier.verify(request).await,
			None if self.routes.keys().any(|(s, _)| *s == request.source_id) => Err(
				VerificationError::WrongAttestationType(request.source_id, request.attestation_type),
			),
			None => Err(VerificationError::WrongSourceId(request.source_id)),
		}
	}
}

/// Creates a verifier backend by name.
pub fn create_verifier(
	backend: &str,
	config: &toml::Value,
) -> Result<Arc<dyn VerifierInterface>, VerificationError> {
	match backend {
		"http" => Ok(Arc::new(implementations::http::HttpVerifier::from_config(
			config,
		)?)),
		other => Err(VerificationError::Config(format!(
			"Unknown verifier backend: {}",
			other
		))),
	}
}
