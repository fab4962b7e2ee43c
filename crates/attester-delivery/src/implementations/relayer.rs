//! Submission through an HTTP transaction relayer.
//!
//! The relayer owns the signing key and the chain connection; this client
//! posts the submission payload as JSON and reads back the transaction hash.

use crate::{DeliveryError, SubmitterInterface};
use async_trait::async_trait;
use attester_types::{SubmissionReceipt, SubmissionRequest};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

pub struct RelayerSubmitter {
	client: Client,
	url: String,
	api_key: Option<String>,
}

impl RelayerSubmitter {
	pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, DeliveryError> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| DeliveryError::Config(e.to_string()))?;

		Ok(Self {
			client,
			url: url.into(),
			api_key,
		})
	}

	/// Configuration parameters:
	/// - `url`: relayer submission endpoint (required)
	/// - `api_key`: bearer token, optional
	/// - `timeout_ms`: request timeout (default: 30000)
	pub fn from_config(config: &toml::Value) -> Result<Self, DeliveryError> {
		let url = config
			.get("url")
			.and_then(|v| v.as_str())
			.ok_or_else(|| DeliveryError::Config("Relayer requires a url".into()))?;
		let api_key = config
			.get("api_key")
			.and_then(|v| v.as_str())
			.map(String::from);
		let timeout_ms = config
			.get("timeout_ms")
			.and_then(|v| v.as_integer())
			.unwrap_or(30_000)
			.max(1) as u64;

		Self::new(url, api_key, Duration::from_millis(timeout_ms))
	}
}

#[async_trait]
impl SubmitterInterface for RelayerSubmitter {
	async fn submit(
		&self,
		request: &SubmissionRequest,
	) -> Result<SubmissionReceipt, DeliveryError> {
		debug!(
			buffer_number = request.buffer_number,
			"Posting submission to relayer"
		);

		let mut call = self.client.post(&self.url).json(request);
		if let Some(key) = &self.api_key {
			call = call.bearer_auth(key);
		}

		let response = call
			.send()
			.await
			.map_err(|e| DeliveryError::Network(e.to_string()))?;

		let status = response.status();
		if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
			let body = response.text().await.unwrap_or_default();
			return Err(DeliveryError::Rejected(format!("HTTP {}: {}", status, body)));
		}
		if !status.is_success() {
			return Err(DeliveryError::Network(format!("HTTP {}", status)));
		}

		response
			.json::<SubmissionReceipt>()
			.await
			.map_err(|e| DeliveryError::Network(e.to_string()))
	}
}
