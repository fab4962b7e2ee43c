//! Configuration types for the attester.

use crate::ConfigError;
use attester_types::{Address, AttestationType, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::map::Map::new())
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub attester: AttesterConfig,
	pub storage: StorageConfig,
	pub delivery: DeliveryConfig,
	#[serde(default)]
	pub discovery: DiscoveryConfig,
	/// Per-source scheduling limits and verifier, keyed by source name.
	#[serde(default)]
	pub sources: HashMap<String, SourceConfig>,
}

/// Round timing and identity of this attester instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttesterConfig {
	pub name: String,
	/// Address whose commitments this client produces.
	pub submitter_address: Address,
	/// Start of round 0, unix seconds.
	pub first_epoch_start_time: u64,
	pub round_duration_sec: u64,
	/// Commit deadline lead: verification must finish this long before the
	/// reveal phase starts.
	pub commit_time_sec: u64,
	/// Submission lead: submissions fire this long before the end of their
	/// buffer window.
	pub reveal_time_sec: u64,
	pub admission_config_dir: PathBuf,
	#[serde(default = "default_reload_interval")]
	pub admission_reload_interval_sec: u64,
}

fn default_reload_interval() -> u64 {
	10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
	pub backend: String,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_max_elapsed")]
	pub max_elapsed_sec: u64,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn default_max_retries() -> u32 {
	5
}

fn default_max_elapsed() -> u64 {
	30
}

/// Request sources. Each entry is a table with a `backend` key plus
/// backend specific settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
	#[serde(default)]
	pub sources: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
	pub max_requests_per_second: u32,
	pub max_processing_transactions: usize,
	#[serde(default)]
	pub max_failed_retry: u32,
	#[serde(default = "default_delay_before_retry")]
	pub delay_before_retry_sec: u64,
	#[serde(default)]
	pub reverification_time_offset_sec: u64,
	pub verifier: VerifierConfig,
}

fn default_delay_before_retry() -> u64 {
	2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
	pub backend: String,
	#[serde(default)]
	pub attestation_types: Vec<AttestationType>,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

impl Config {
	/// Source configurations keyed by their parsed source id.
	pub fn source_configs(&self) -> Result<HashMap<SourceId, SourceConfig>, ConfigError> {
		self.sources
			.iter()
			.map(|(name, config)| {
				let source = name
					.parse::<SourceId>()
					.map_err(ConfigError::ValidationError)?;
				Ok((source, config.clone()))
			})
			.collect()
	}
}
