//! Backend constructors registered on the builder, keyed by the backend name
//! used in configuration.

use attester_core::AttesterBuilder;
use attester_delivery::implementations::{dry_run, relayer::RelayerSubmitter};
use attester_delivery::SubmitterInterface;
use attester_discovery::implementations::http_poller::HttpPollerDiscovery;
use attester_discovery::DiscoveryInterface;
use attester_storage::implementations::{file, memory};
use attester_verification::implementations::http::HttpVerifier;
use attester_verification::VerifierInterface;
use std::sync::Arc;

pub fn register_all(builder: AttesterBuilder) -> AttesterBuilder {
	builder
		.with_storage_factory("file", file::create_storage)
		.with_storage_factory("memory", memory::create_storage)
		.with_verifier_factory("http", |config| {
			Ok(Arc::new(HttpVerifier::from_config(config)?) as Arc<dyn VerifierInterface>)
		})
		.with_delivery_factory("relayer", |config| {
			Ok(Box::new(RelayerSubmitter::from_config(config)?) as Box<dyn SubmitterInterface>)
		})
		.with_delivery_factory("dry_run", |config| Ok(dry_run::create_submitter(config)))
		.with_discovery_factory("http", |config| {
			Ok(Box::new(HttpPollerDiscovery::from_config(config)?) as Box<dyn DiscoveryInterface>)
		})
}
