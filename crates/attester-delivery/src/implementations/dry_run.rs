//! Submitter that only logs what it would send.

use crate::{DeliveryError, SubmitterInterface};
use async_trait::async_trait;
use attester_types::{keccak256, SubmissionReceipt, SubmissionRequest};
use tracing::info;

pub struct DryRunSubmitter;

#[async_trait]
impl SubmitterInterface for DryRunSubmitter {
	async fn submit(
		&self,
		request: &SubmissionRequest,
	) -> Result<SubmissionReceipt, DeliveryError> {
		info!(
			buffer_number = request.buffer_number,
			commit_masked_root = %request.commit.masked_merkle_root,
			reveal_root = %request.reveal.merkle_root,
			"[dry run] {}",
			request.action
		);

		let payload =
			serde_json::to_vec(request).map_err(|e| DeliveryError::Config(e.to_string()))?;
		Ok(SubmissionReceipt {
			tx_hash: keccak256(payload).to_string(),
			block_number: None,
		})
	}
}

pub fn create_submitter(_config: &toml::Value) -> Box<dyn SubmitterInterface> {
	Box::new(DryRunSubmitter)
}
