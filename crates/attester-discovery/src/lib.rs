//! Discovery of attestation requests.
//!
//! Each [`DiscoveryInterface`] backend watches some origin of attestation
//! requests and pushes them onto a channel read by the attester engine.
//! [`DiscoveryService`] starts and stops every configured backend together.

use async_trait::async_trait;
use attester_types::AttestationRequest;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod implementations {
	pub mod http_poller;
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("Connection error: {0}")]
	Connection(String),
	#[error("Already monitoring")]
	AlreadyMonitoring,
	#[error("Configuration error: {0}")]
	Config(String),
}

#[async_trait]
pub trait DiscoveryInterface: Send + Sync {
	/// Starts pushing discovered requests into `sender` until stopped.
	async fn start_monitoring(
		&self,
		sender: mpsc::UnboundedSender<AttestationRequest>,
	) -> Result<(), DiscoveryError>;

	async fn stop_monitoring(&self) -> Result<(), DiscoveryError>;
}

pub struct DiscoveryService {
	sources: Vec<Box<dyn DiscoveryInterface>>,
}

impl DiscoveryService {
	pub fn new(sources: Vec<Box<dyn DiscoveryInterface>>) -> Self {
		Self { sources }
	}

	pub fn source_count(&self) -> usize {
		self.sources.len()
	}

	pub async fn start_all(
		&self,
		sender: mpsc::UnboundedSender<AttestationRequest>,
	) -> Result<(), DiscoveryError> {
		info!("Starting {} discovery source(s)", self.sources.len());
		for source in &self.sources {
			source.start_monitoring(sender.clone()).await?;
		}
		Ok(())
	}

	/// Stops every source, returning the first error after trying all of them.
	pub async fn stop_all(&self) -> Result<(), DiscoveryError> {
		let mut first_error = None;
		for source in &self.sources {
			if let Err(e) = source.stop_monitoring().await {
				warn!("Failed to stop discovery source: {}", e);
				first_error.get_or_insert(e);
			}
		}
		match first_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

/// Creates a discovery backend by name.
pub fn create_discovery(
	backend: &str,
	config: &toml::Value,
) -> Result<Box<dyn DiscoveryInterface>, DiscoveryError> {
	match backend {
		"http" => Ok(Box::new(
			implementations::http_poller::HttpPollerDiscovery::from_config(config)?,
		)),
		other => Err(DiscoveryError::Config(format!(
			"Unknown discovery backend: {}",
			other
		))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	struct CountingSource {
		started: Arc<AtomicUsize>,
		stopped: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl DiscoveryInterface for CountingSource {
		async fn start_monitoring(
			&self,
			_sender: mpsc::UnboundedSender<AttestationRequest>,
		) -> Result<(), DiscoveryError> {
			self.started.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn stop_monitoring(&self) -> Result<(), DiscoveryError> {
			self.stopped.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_start_and_stop_all_sources() {
		let started = Arc::new(AtomicUsize::new(0));
		let stopped = Arc::new(AtomicUsize::new(0));
		let sources: Vec<Box<dyn DiscoveryInterface>> = (0..3)
			.map(|_| {
				Box::new(CountingSource {
					started: started.clone(),
					stopped: stopped.clone(),
				}) as Box<dyn DiscoveryInterface>
			})
			.collect();
		let service = DiscoveryService::new(sources);

		let (tx, _rx) = mpsc::unbounded_channel();
		service.start_all(tx).await.unwrap();
		service.stop_all().await.unwrap();

		assert_eq!(started.load(Ordering::SeqCst), 3);
		assert_eq!(stopped.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn test_unknown_backend() {
		let config = toml::Value::Table(toml::map::Map::new());
		assert!(matches!(
			create_discovery("websocket", &config),
			Err(DiscoveryError::Config(_))
		));
	}
}
