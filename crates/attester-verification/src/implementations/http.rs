//! HTTP verifier client.
//!
//! Posts the request to `{url}/query` and expects a JSON envelope
//! `{"status": "OK", "data": <Verification>}`; any other envelope status is
//! reported as a verifier error carrying `errorMessage`.

use crate::{VerificationError, VerificationRequest, VerifierInterface};
use async_trait::async_trait;
use attester_types::Verification;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
	status: String,
	#[serde(default)]
	data: Option<Verification>,
	#[serde(default)]
	error_message: Option<String>,
}

pub struct HttpVerifier {
	client: Client,
	url: String,
	api_key: Option<String>,
}

impl HttpVerifier {
	pub fn new(
		url: impl Into<String>,
		api_key: Option<String>,
		timeout: Duration,
	) -> Result<Self, VerificationError> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| VerificationError::Config(e.to_string()))?;

		Ok(Self {
			client,
			url: url.into().trim_end_matches('/').to_string(),
			api_key,
		})
	}

	/// Configuration parameters:
	/// - `url`: verifier base url (required)
	/// - `api_key`: sent as `X-API-KEY` when present
	/// - `timeout_ms`: request timeout (default: 10000)
	pub fn from_config(config: &toml::Value) -> Result<Self, VerificationError> {
		let url = config
			.get("url")
			.and_then(|v| v.as_str())
			.ok_or_else(|| VerificationError::Config("HTTP verifier requires a url".into()))?;
		let api_key = config
			.get("api_key")
			.and_then(|v| v.as_str())
			.map(String::from);
		let timeout_ms = config
			.get("timeout_ms")
			.and_then(|v| v.as_integer())
			.unwrap_or(10_000)
			.max(1) as u64;

		Self::new(url, api_key, Duration::from_millis(timeout_ms))
	}
}

#[async_trait]
impl VerifierInterface for HttpVerifier {
	async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<Verification, VerificationError> {
		let mut call = self
			.client
			.post(format!("{}/query", self.url))
			.json(request);
		if let Some(key) = &self.api_key {
			call = call.header("X-API-KEY", key);
		}

		let response = call
			.send()
			.await
			.map_err(|e| VerificationError::Transport(e.to_string()))?;

		let status = response.status();
		if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
			let body = response.text().await.unwrap_or_default();
			return Err(VerificationError::RequestParse(format!(
				"HTTP {}: {}",
				status, body
			)));
		}
		if !status.is_success() {
			return Err(VerificationError::Transport(format!("HTTP {}", status)));
		}

		let envelope: ApiResponse = response
			.json()
			.await
			.map_err(|e| VerificationError::Transport(e.to_string()))?;

		debug!(
			round_id = request.round_id,
			source = %request.source_id,
			status = %envelope.status,
			"Verifier response"
		);

		match (envelope.status.as_str(), envelope.data) {
			("OK", Some(verification)) => Ok(verification),
			("OK", None) => Err(VerificationError::Verifier(
				"response without verification data".into(),
			)),
			(_, _) => Err(VerificationError::Verifier(
				envelope
					.error_message
					.unwrap_or_else(|| envelope.status.clone()),
			)),
		}
	}
}
