//! Verification results returned by verifiers.

use crate::Hash32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported by a verifier for a single request.
///
/// Serialized as the upper snake case string the verifiers use. Strings this
/// client does not know are kept verbatim and treated as a negative result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VerificationStatus {
	Ok,
	NotConfirmed,
	RecheckLater,
	SystemFailure,
	NeedsMoreChecks,
	NonExistentTransaction,
	NonExistentBlock,
	NotPayment,
	ReferencedTransactionExists,
	ZeroPaymentReferenceUnsupported,
	Other(String),
}

impl VerificationStatus {
	pub fn as_str(&self) -> &str {
		match self {
			VerificationStatus::Ok => "OK",
			VerificationStatus::NotConfirmed => "NOT_CONFIRMED",
			VerificationStatus::RecheckLater => "RECHECK_LATER",
			VerificationStatus::SystemFailure => "SYSTEM_FAILURE",
			VerificationStatus::NeedsMoreChecks => "NEEDS_MORE_CHECKS",
			VerificationStatus::NonExistentTransaction => "NON_EXISTENT_TRANSACTION",
			VerificationStatus::NonExistentBlock => "NON_EXISTENT_BLOCK",
			VerificationStatus::NotPayment => "NOT_PAYMENT",
			VerificationStatus::ReferencedTransactionExists => "REFERENCED_TRANSACTION_EXISTS",
			VerificationStatus::ZeroPaymentReferenceUnsupported => {
				"ZERO_PAYMENT_REFERENCE_UNSUPPORTED"
			}
			VerificationStatus::Other(s) => s,
		}
	}
}

impl From<String> for VerificationStatus {
	fn from(s: String) -> Self {
		match s.as_str() {
			"OK" => VerificationStatus::Ok,
			"NOT_CONFIRMED" => VerificationStatus::NotConfirmed,
			"RECHECK_LATER" => VerificationStatus::RecheckLater,
			"SYSTEM_FAILURE" => VerificationStatus::SystemFailure,
			"NEEDS_MORE_CHECKS" => VerificationStatus::NeedsMoreChecks,
			"NON_EXISTENT_TRANSACTION" => VerificationStatus::NonExistentTransaction,
			"NON_EXISTENT_BLOCK" => VerificationStatus::NonExistentBlock,
			"NOT_PAYMENT" => VerificationStatus::NotPayment,
			"REFERENCED_TRANSACTION_EXISTS" => VerificationStatus::ReferencedTransactionExists,
			"ZERO_PAYMENT_REFERENCE_UNSUPPORTED" => {
				VerificationStatus::ZeroPaymentReferenceUnsupported
			}
			_ => VerificationStatus::Other(s),
		}
	}
}

impl From<VerificationStatus> for String {
	fn from(status: VerificationStatus) -> Self {
		status.as_str().to_string()
	}
}

impl fmt::Display for VerificationStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Result of verifying one attestation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
	pub status: VerificationStatus,
	/// Attestation hash; the Merkle leaf for valid attestations.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hash: Option<Hash32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response: Option<serde_json::Value>,
}

impl Verification {
	pub fn new(status: VerificationStatus) -> Self {
		Self {
			status,
			hash: None,
			response: None,
		}
	}

	pub fn ok(hash: Hash32) -> Self {
		Self {
			status: VerificationStatus::Ok,
			hash: Some(hash),
			response: None,
		}
	}
}
