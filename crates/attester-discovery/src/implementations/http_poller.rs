//! Polls an HTTP indexer for attestation request events.
//!
//! The indexer answers `GET {url}/requests?from_block=N` with
//! `{"requests": [...], "nextBlock": M}`; the poller resumes from `M` on the
//! next tick.

use crate::{DiscoveryError, DiscoveryInterface};
use async_trait::async_trait;
use attester_types::AttestationRequest;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestsPage {
	#[serde(default)]
	requests: Vec<AttestationRequest>,
	next_block: u64,
}

pub struct HttpPollerDiscovery {
	client: Client,
	url: String,
	poll_interval: Duration,
	/// Next block to ask the indexer for.
	next_block: Arc<Mutex<u64>>,
	is_monitoring: Arc<AtomicBool>,
	stop_signal: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl HttpPollerDiscovery {
	pub fn new(
		url: impl Into<String>,
		start_block: u64,
		poll_interval: Duration,
	) -> Result<Self, DiscoveryError> {
		let client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| DiscoveryError::Config(e.to_string()))?;

		Ok(Self {
			client,
			url: url.into().trim_end_matches('/').to_string(),
			poll_interval,
			next_block: Arc::new(Mutex::new(start_block)),
			is_monitoring: Arc::new(AtomicBool::new(false)),
			stop_signal: Arc::new(Mutex::new(None)),
		})
	}

	/// Configuration parameters:
	/// - `url`: indexer base url (required)
	/// - `start_block`: first block to read (default: 0)
	/// - `poll_interval_ms`: polling period (default: 1000)
	pub fn from_config(config: &toml::Value) -> Result<Self, DiscoveryError> {
		let url = config
			.get("url")
			.and_then(|v| v.as_str())
			.ok_or_else(|| DiscoveryError::Config("HTTP discovery requires a url".into()))?;
		let start_block = config
			.get("start_block")
			.and_then(|v| v.as_integer())
			.unwrap_or(0)
			.max(0) as u64;
		let poll_interval_ms = config
			.get("poll_interval_ms")
			.and_then(|v| v.as_integer())
			.unwrap_or(1000)
			.max(1) as u64;

		Self::new(url, start_block, Duration::from_millis(poll_interval_ms))
	}

	async fn fetch_page(
		client: &Client,
		url: &str,
		from_block: u64,
	) -> Result<RequestsPage, DiscoveryError> {
		let response = client
			.get(format!("{}/requests", url))
			.query(&[("from_block", from_block)])
			.send()
			.await
			.map_err(|e| DiscoveryError::Connection(e.to_string()))?;

		if !response.status().is_success() {
			return Err(DiscoveryError::Connection(format!(
				"HTTP {}",
				response.status()
			)));
		}

		response
			.json()
			.await
			.map_err(|e| DiscoveryError::Connection(e.to_string()))
	}

	async fn monitoring_loop(
		client: Client,
		url: String,
		poll_interval: Duration,
		next_block: Arc<Mutex<u64>>,
		sender: mpsc::UnboundedSender<AttestationRequest>,
		mut stop_rx: mpsc::Receiver<()>,
	) {
		let mut interval = tokio::time::interval(poll_interval);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					let mut next = next_block.lock().await;

					let page = match Self::fetch_page(&client, &url, *next).await {
						Ok(page) => page,
						Err(e) => {
							error!("Failed to poll attestation requests: {}", e);
							continue;
						}
					};

					if !page.requests.is_empty() {
						debug!(
							from_block = *next,
							count = page.requests.len(),
							"Discovered attestation requests"
						);
					}

					for request in page.requests {
						if sender.send(request).is_err() {
							// Receiver gone, the engine is shutting down.
							return;
						}
					}

					*next = page.next_block.max(*next);
				}
				_ = stop_rx.recv() => {
					break;
				}
			}
		}
	}
}

#[async_trait]
impl DiscoveryInterface for HttpPollerDiscovery {
	async fn start_monitoring(
		&self,
		sender: mpsc::UnboundedSender<AttestationRequest>,
	) -> Result<(), DiscoveryError> {
		if self.is_monitoring.load(Ordering::SeqCst) {
			return Err(DiscoveryError::AlreadyMonitoring);
		}

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		let client = self.client.clone();
		let url = self.url.clone();
		let poll_interval = self.poll_interval;
		let next_block = self.next_block.clone();

		tokio::spawn(async move {
			Self::monitoring_loop(client, url, poll_interval, next_block, sender, stop_rx).await;
		});

		self.is_monitoring.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn stop_monitoring(&self) -> Result<(), DiscoveryError> {
		if !self.is_monitoring.load(Ordering::SeqCst) {
			return Ok(());
		}

		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}

		self.is_monitoring.store(false, Ordering::SeqCst);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn event(log_index: u64) -> serde_json::Value {
		serde_json::json!({
			"type": 1,
			"sourceId": 3,
			"timestamp": 1_700_000_000u64,
			"request": format!("0x{:02x}", log_index),
			"blockNumber": 7,
			"logIndex": log_index
		})
	}

	#[tokio::test]
	async fn test_polls_and_advances_block() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/requests"))
			.and(query_param("from_block", "5"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"requests": [event(0), event(1)],
				"nextBlock": 8
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/requests"))
			.and(query_param("from_block", "8"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"requests": [],
				"nextBlock": 8
			})))
			.mount(&server)
			.await;

		let discovery =
			HttpPollerDiscovery::new(server.uri(), 5, Duration::from_millis(20)).unwrap();
		let (tx, mut rx) = mpsc::unbounded_channel();
		discovery.start_monitoring(tx.clone()).await.unwrap();

		assert!(matches!(
			discovery.start_monitoring(tx).await,
			Err(DiscoveryError::AlreadyMonitoring)
		));

		let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.unwrap()
			.unwrap();
		let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(first.log_index, 0);
		assert_eq!(second.log_index, 1);

		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(*discovery.next_block.lock().await, 8);

		discovery.stop_monitoring().await.unwrap();
		assert!(!discovery.is_monitoring.load(Ordering::SeqCst));
	}

	#[test]
	fn test_from_config_defaults() {
		let config: toml::Value = toml::from_str("url = \"http://localhost:9000/\"").unwrap();
		let discovery = HttpPollerDiscovery::from_config(&config).unwrap();
		assert_eq!(discovery.url, "http://localhost:9000");
		assert_eq!(discovery.poll_interval, Duration::from_millis(1000));
	}
}
