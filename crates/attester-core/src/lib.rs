//! Core of the attester: the round state machine, per-source scheduling and
//! the engine tying them to storage, verification, delivery and discovery.

use attester_config::{load_admission_dir, Config};
use attester_delivery::{DeliveryService, RetryFailureHook};
use attester_discovery::DiscoveryService;
use attester_storage::{AttesterState, StorageService};
use attester_verification::VerifierRouter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

pub mod admission;
pub mod attestation;
pub mod dispatch;
pub mod engine;
pub mod epoch;
pub mod event_bus;
pub mod manager;
pub mod queue;
pub mod round;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testing;

pub use admission::AdmissionController;
pub use engine::{AttesterEngine, SubmissionOutcome};
pub use epoch::{AttesterContext, EpochSettings};
pub use event_bus::EventBus;
pub use manager::{AttestationRoundManager, SubmissionKind};
pub use round::{AttestationRound, CoreCommand};

#[derive(Debug, Error)]
pub enum AttesterError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

type StorageFactory =
	Box<dyn Fn(&toml::Value) -> Box<dyn attester_storage::StorageInterface> + Send>;
type VerifierFactory = Box<
	dyn Fn(
			&toml::Value,
		) -> Result<
			Arc<dyn attester_verification::VerifierInterface>,
			attester_verification::VerificationError,
		> + Send,
>;
type DeliveryFactory = Box<
	dyn Fn(
			&toml::Value,
		) -> Result<Box<dyn attester_delivery::SubmitterInterface>, attester_delivery::DeliveryError>
		+ Send,
>;
type DiscoveryFactory = Box<
	dyn Fn(
			&toml::Value,
		) -> Result<
			Box<dyn attester_discovery::DiscoveryInterface>,
			attester_discovery::DiscoveryError,
		> + Send,
>;

/// Builds an [`AttesterEngine`] from configuration, with backends created by
/// factories registered under their backend name.
pub struct AttesterBuilder {
	config: Config,
	storage_factories: HashMap<String, StorageFactory>,
	verifier_factories: HashMap<String, VerifierFactory>,
	delivery_factories: HashMap<String, DeliveryFactory>,
	discovery_factories: HashMap<String, DiscoveryFactory>,
	retry_failure_hook: Option<RetryFailureHook>,
}

impl AttesterBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			storage_factories: HashMap::new(),
			verifier_factories: HashMap::new(),
			delivery_factories: HashMap::new(),
			discovery_factories: HashMap::new(),
			retry_failure_hook: None,
		}
	}

	pub fn with_storage_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Box<dyn attester_storage::StorageInterface> + Send + 'static,
	{
		self.storage_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_verifier_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(
				&toml::Value,
			) -> Result<
				Arc<dyn attester_verification::VerifierInterface>,
				attester_verification::VerificationError,
			> + Send
			+ 'static,
	{
		self.verifier_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_delivery_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(
				&toml::Value,
			) -> Result<
				Box<dyn attester_delivery::SubmitterInterface>,
				attester_delivery::DeliveryError,
			> + Send
			+ 'static,
	{
		self.delivery_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_discovery_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(
				&toml::Value,
			) -> Result<
				Box<dyn attester_discovery::DiscoveryInterface>,
				attester_discovery::DiscoveryError,
			> + Send
			+ 'static,
	{
		self.discovery_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	/// Called when a submission exhausted its retries.
	pub fn with_retry_failure_hook(mut self, hook: RetryFailureHook) -> Self {
		self.retry_failure_hook = Some(hook);
		self
	}

	pub async fn build(self) -> Result<AttesterEngine, AttesterError> {
		let config = self.config;
		let context = AttesterContext::from_config(&config.attester)
			.map_err(|e| AttesterError::Config(e.to_string()))?;
		let now = epoch::now_ms();

		// Storage
		let storage_factory = self
			.storage_factories
			.get(&config.storage.backend)
			.ok_or_else(|| {
				AttesterError::Config(format!(
					"Unknown storage backend: {}",
					config.storage.backend
				))
			})?;
		let storage = Arc::new(StorageService::new(storage_factory(&config.storage.config)));
		let state = Arc::new(AttesterState::new(storage));

		// Verifiers, one per source, routed by attestation type
		let source_configs = config
			.source_configs()
			.map_err(|e| AttesterError::Config(e.to_string()))?;
		let mut router = VerifierRouter::new();
		for (source, source_config) in &source_configs {
			let verifier_config = &source_config.verifier;
			let factory = self
				.verifier_factories
				.get(&verifier_config.backend)
				.ok_or_else(|| {
					AttesterError::Config(format!(
						"Unknown verifier backend for {}: {}",
						source, verifier_config.backend
					))
				})?;
			let verifier = factory(&verifier_config.config)
				.map_err(|e| AttesterError::Config(e.to_string()))?;
			for attestation_type in &verifier_config.attestation_types {
				router.add_route(*source, *attestation_type, verifier.clone());
			}
		}

		// Delivery
		let delivery_config = &config.delivery;
		let factory = self
			.delivery_factories
			.get(&delivery_config.backend)
			.ok_or_else(|| {
				AttesterError::Config(format!(
					"Unknown delivery backend: {}",
					delivery_config.backend
				))
			})?;
		let submitter =
			factory(&delivery_config.config).map_err(|e| AttesterError::Config(e.to_string()))?;
		let mut delivery = DeliveryService::new(
			submitter,
			delivery_config.max_retries,
			Duration::from_secs(delivery_config.max_elapsed_sec),
		);
		if let Some(hook) = self.retry_failure_hook {
			delivery = delivery.with_retry_failure_hook(hook);
		}

		// Discovery
		let mut discovery_sources = Vec::new();
		for (name, source_config) in &config.discovery.sources {
			let backend = source_config
				.get("backend")
				.and_then(|v| v.as_str())
				.unwrap_or_default();
			let factory = self.discovery_factories.get(backend).ok_or_else(|| {
				AttesterError::Config(format!(
					"Unknown discovery backend for '{}': {}",
					name, backend
				))
			})?;
			discovery_sources.push(factory(source_config).map_err(|e| AttesterError::Config(e.to_string()))?);
		}

		// Admission
		let admission_configs = load_admission_dir(&config.attester.admission_config_dir)
			.await
			.map_err(|e| AttesterError::Config(e.to_string()))?;
		admission::warn_almost_alive(&admission_configs, context.epoch.round_id_for_time(now));
		let admission = AdmissionController::new(admission_configs);
		let shared_admission = admission.shared_configs();

		let event_bus = EventBus::new(1000);
		let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
		let dispatcher = dispatch::TaskDispatcher::new(Arc::new(router), outcome_tx);
		let manager = AttestationRoundManager::new(
			context,
			source_configs,
			admission,
			Box::new(dispatcher),
			event_bus.clone(),
			now,
		);
		let (submission_tx, submission_rx) = mpsc::unbounded_channel();

		info!(
			name = %config.attester.name,
			storage = %config.storage.backend,
			delivery = %config.delivery.backend,
			"Attester built"
		);

		Ok(AttesterEngine {
			config,
			manager,
			state,
			delivery: Arc::new(delivery),
			discovery: Arc::new(DiscoveryService::new(discovery_sources)),
			outcome_rx,
			submission_tx,
			submission_rx,
			admission_configs: shared_admission,
			event_bus,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use attester_config::ConfigLoader;

	const CONFIG: &str = r#"
[attester]
name = "builder-test"
submitter_address = "0x00000000000000000000000000000000000000aa"
first_epoch_start_time = 0
round_duration_sec = 90
commit_time_sec = 10
reveal_time_sec = 5
admission_config_dir = "./does-not-exist"

[storage]
backend = "memory"

[delivery]
backend = "dry_run"

[sources.XRP]
max_requests_per_second = 5
max_processing_transactions = 10

[sources.XRP.verifier]
backend = "http"
attestation_types = ["Payment"]

[sources.XRP.verifier.config]
url = "http://localhost:9500"
"#;

	fn config() -> Config {
		ConfigLoader::new().load_from_str(CONFIG).unwrap()
	}

	#[tokio::test]
	async fn test_missing_factories_are_config_errors() {
		let err = AttesterBuilder::new(config()).build().await.err().unwrap();
		assert!(matches!(err, AttesterError::Config(ref m) if m.contains("storage")));

		let err = AttesterBuilder::new(config())
			.with_storage_factory("memory", attester_storage::implementations::memory::create_storage)
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, AttesterError::Config(ref m) if m.contains("verifier")));
	}

	#[tokio::test]
	async fn test_missing_admission_dir_fails() {
		let err = AttesterBuilder::new(config())
			.with_storage_factory("memory", attester_storage::implementations::memory::create_storage)
			.with_verifier_factory("http", |config| {
				attester_verification::create_verifier("http", config)
			})
			.with_delivery_factory("dry_run", |config| {
				Ok(attester_delivery::implementations::dry_run::create_submitter(config))
			})
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, AttesterError::Config(_)));
	}
}
