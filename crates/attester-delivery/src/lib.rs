//! Submission of commit/reveal data to the home chain.
//!
//! A [`SubmitterInterface`] backend sends one submission. The
//! [`DeliveryService`] wraps it with exponential-backoff retries and, once
//! retries are exhausted, calls the retry-failure hook supplied by the host
//! application before returning the error.

use async_trait::async_trait;
use attester_types::{SubmissionReceipt, SubmissionRequest};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub mod implementations {
	pub mod dry_run;
	pub mod relayer;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("Network error: {0}")]
	Network(String),
	#[error("Submission rejected: {0}")]
	Rejected(String),
	#[error("Submission failed after {attempts} attempts: {last_error}")]
	RetriesExhausted { attempts: u32, last_error: String },
	#[error("Configuration error: {0}")]
	Config(String),
}

#[async_trait]
pub trait SubmitterInterface: Send + Sync {
	async fn submit(&self, request: &SubmissionRequest)
		-> Result<SubmissionReceipt, DeliveryError>;
}

/// Called once a submission has failed every retry.
pub type RetryFailureHook = Arc<dyn Fn(&SubmissionRequest, &DeliveryError) + Send + Sync>;

pub struct DeliveryService {
	submitter: Box<dyn SubmitterInterface>,
	max_retries: u32,
	backoff: ExponentialBackoff,
	on_retry_failure: Option<RetryFailureHook>,
}

impl DeliveryService {
	pub fn new(submitter: Box<dyn SubmitterInterface>, max_retries: u32, max_elapsed: Duration) -> Self {
		let backoff = ExponentialBackoffBuilder::new()
			.with_max_elapsed_time(Some(max_elapsed))
			.build();

		Self {
			submitter,
			max_retries,
			backoff,
			on_retry_failure: None,
		}
	}

	pub fn with_initial_interval(mut self, interval: Duration) -> Self {
		self.backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(interval)
			.with_max_interval(interval * 8)
			.with_max_elapsed_time(self.backoff.max_elapsed_time)
			.build();
		self
	}

	pub fn with_retry_failure_hook(mut self, hook: RetryFailureHook) -> Self {
		self.on_retry_failure = Some(hook);
		self
	}

	/// Submits with retries. Rejections are not retried.
	pub async fn submit(
		&self,
		request: &SubmissionRequest,
	) -> Result<SubmissionReceipt, DeliveryError> {
		let mut backoff = self.backoff.clone();
		backoff.reset();
		let mut attempts = 0;

		let error = loop {
			match self.submitter.submit(request).await {
				Ok(receipt) => {
					info!(
						buffer_number = request.buffer_number,
						tx_hash = %receipt.tx_hash,
						"{} submitted",
						request.action
					);
					return Ok(receipt);
				}
				Err(DeliveryError::Rejected(reason)) => {
					break DeliveryError::Rejected(reason);
				}
				Err(e) => {
					attempts += 1;

					if attempts > self.max_retries {
						warn!(
							"Submission failed after {} attempts, giving up: {}",
							attempts, e
						);
						break DeliveryError::RetriesExhausted {
							attempts,
							last_error: e.to_string(),
						};
					}

					match backoff.next_backoff() {
						Some(delay) => {
							warn!(
								"Submission failed, attempt {}/{}, retrying in {:?}: {}",
								attempts, self.max_retries, delay, e
							);
							tokio::time::sleep(delay).await;
						}
						None => {
							warn!(
								"Submission failed, backoff exhausted after {} attempts: {}",
								attempts, e
							);
							break DeliveryError::RetriesExhausted {
								attempts,
								last_error: e.to_string(),
							};
						}
					}
				}
			}
		};

		if let Some(hook) = &self.on_retry_failure {
			hook(request, &error);
		}
		Err(error)
	}
}

/// Creates a submitter backend by name.
pub fn create_submitter(
	backend: &str,
	config: &toml::Value,
) -> Result<Box<dyn SubmitterInterface>, DeliveryError> {
	match backend {
		"relayer" => Ok(Box::new(
			implementations::relayer::RelayerSubmitter::from_config(config)?,
		)),
		"dry_run" => Ok(implementations::dry_run::create_submitter(config)),
		other => Err(DeliveryError::Config(format!(
			"Unknown delivery backend: {}",
			other
		))),
	}
}
