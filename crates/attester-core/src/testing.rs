//! Fixtures shared by the state machine tests.

use crate::dispatch::{VerificationDispatcher, VerificationJob};
use crate::epoch::{AttesterContext, EpochSettings};
use attester_config::{AttestationConfig, SourceConfig, SourceLimiterConfig, VerifierConfig};
use attester_types::{Address, AttestationRequest, AttestationType, SourceId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Rounds of 90s starting at the unix epoch, commit deadline 10s and
/// submissions 5s before the end of a phase.
pub fn context() -> AttesterContext {
	AttesterContext {
		epoch: EpochSettings::new(0, 90).unwrap(),
		commit_time_ms: 10_000,
		reveal_time_ms: 5_000,
		submitter: Address([0x5a; 20]),
	}
}

pub fn source_config(max_requests_per_second: u32, max_processing_transactions: usize) -> SourceConfig {
	SourceConfig {
		max_requests_per_second,
		max_processing_transactions,
		max_failed_retry: 1,
		delay_before_retry_sec: 2,
		reverification_time_offset_sec: 10,
		verifier: VerifierConfig {
			backend: "http".into(),
			attestation_types: vec![AttestationType::Payment],
			config: toml::Value::Table(toml::map::Map::new()),
		},
	}
}

pub fn admission_config(max_total_round_weight: u64) -> AttestationConfig {
	let limiter = SourceLimiterConfig {
		max_total_round_weight,
		type_weights: HashMap::from([(AttestationType::Payment, 1)]),
	};
	AttestationConfig {
		start_round_id: 0,
		source_limiters: HashMap::from([(SourceId::Btc, limiter)]),
	}
}

pub fn request(timestamp_sec: u64, payload: u8) -> AttestationRequest {
	AttestationRequest {
		attestation_type: AttestationType::Payment.id(),
		source_id: SourceId::Btc.id(),
		timestamp: timestamp_sec,
		request: vec![payload],
		block_number: 100,
		log_index: payload as u64,
	}
}

/// Dispatcher that only records jobs; tests feed outcomes back by hand.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
	pub jobs: Arc<Mutex<Vec<VerificationJob>>>,
	pub unsupported: Arc<Mutex<HashSet<(SourceId, AttestationType)>>>,
}

impl RecordingDispatcher {
	pub fn jobs(&self) -> Vec<VerificationJob> {
		self.jobs.lock().unwrap().clone()
	}
}

impl VerificationDispatcher for RecordingDispatcher {
	fn supports(&self, source: SourceId, attestation_type: AttestationType) -> bool {
		!self
			.unsupported
			.lock()
			.unwrap()
			.contains(&(source, attestation_type))
	}

	fn dispatch(&self, job: VerificationJob) {
		self.jobs.lock().unwrap().push(job);
	}
}
