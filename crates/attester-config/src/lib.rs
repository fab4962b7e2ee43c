//! Configuration for the attester.
//!
//! The main configuration is a TOML file. Before parsing, `${VAR}` and
//! `${VAR:-default}` references are substituted from the environment; after
//! parsing, a small set of `ATTESTER_` prefixed variables can override
//! individual settings. Admission limits live in a separate directory of JSON
//! files, see [`admission`].

use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub mod admission;
pub mod types;

pub use admission::{
	admission_dir_fingerprint, load_admission_dir, load_admission_file, parse_admission_config,
	AttestationConfig, SourceLimiterConfig,
};
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "ATTESTER_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		let file_path = self.file_path.as_ref().ok_or_else(|| {
			ConfigError::FileNotFound("No configuration file specified".to_string())
		})?;

		if !Path::new(file_path).exists() {
			return Err(ConfigError::FileNotFound(file_path.clone()));
		}

		let content = tokio::fs::read_to_string(file_path).await?;
		self.load_from_str(&content)
	}

	/// Parses, overrides and validates configuration from TOML text.
	pub fn load_from_str(&self, content: &str) -> Result<Config, ConfigError> {
		let substituted = self.substitute_env_vars(content)?;

		let mut config: Config =
			toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
		let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;

		let mut missing = None;
		let result = re.replace_all(content, |cap: &regex::Captures| {
			let var_name = &cap[1];
			match (env::var(var_name), cap.get(2)) {
				(Ok(value), _) => value,
				(Err(_), Some(default)) => default.as_str().to_string(),
				(Err(_), None) => {
					missing.get_or_insert_with(|| var_name.to_string());
					String::new()
				}
			}
		});

		match missing {
			Some(var_name) => Err(ConfigError::EnvVarNotFound(var_name)),
			None => Ok(result.into_owned()),
		}
	}

	fn apply_env_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
		if let Ok(name) = env::var(format!("{}NAME", self.env_prefix)) {
			debug!("Overriding attester name from environment");
			config.attester.name = name;
		}

		if let Ok(address) = env::var(format!("{}SUBMITTER_ADDRESS", self.env_prefix)) {
			debug!("Overriding submitter address from environment");
			config.attester.submitter_address = address.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid submitter address: {}", e))
			})?;
		}

		if let Ok(start) = env::var(format!("{}FIRST_EPOCH_START_TIME", self.env_prefix)) {
			config.attester.first_epoch_start_time = start.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid first epoch start time: {}", e))
			})?;
		}

		if let Ok(dir) = env::var(format!("{}ADMISSION_CONFIG_DIR", self.env_prefix)) {
			config.attester.admission_config_dir = dir.into();
		}

		Ok(())
	}
}

/// Checks cross-field constraints that serde cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let attester = &config.attester;

	if attester.name.is_empty() {
		return Err(ConfigError::ValidationError(
			"Attester name cannot be empty".into(),
		));
	}

	if attester.round_duration_sec == 0 {
		return Err(ConfigError::ValidationError(
			"Round duration must be positive".into(),
		));
	}

	if attester.commit_time_sec >= attester.round_duration_sec {
		return Err(ConfigError::ValidationError(format!(
			"commit_time_sec ({}) must be shorter than the round duration ({})",
			attester.commit_time_sec, attester.round_duration_sec
		)));
	}

	if attester.reveal_time_sec == 0 {
		return Err(ConfigError::ValidationError(
			"reveal_time_sec must be positive".into(),
		));
	}

	if attester.reveal_time_sec > attester.commit_time_sec {
		return Err(ConfigError::ValidationError(format!(
			"reveal_time_sec ({}) must not exceed commit_time_sec ({})",
			attester.reveal_time_sec, attester.commit_time_sec
		)));
	}

	if config.storage.backend.is_empty() {
		return Err(ConfigError::ValidationError(
			"Storage backend cannot be empty".into(),
		));
	}

	if config.delivery.backend.is_empty() {
		return Err(ConfigError::ValidationError(
			"Delivery backend cannot be empty".into(),
		));
	}

	for (name, source) in &config.discovery.sources {
		if source.get("backend").and_then(|v| v.as_str()).is_none() {
			return Err(ConfigError::ValidationError(format!(
				"Discovery source '{}' is missing a backend",
				name
			)));
		}
	}

	for (name, source) in config.source_configs()? {
		if source.max_requests_per_second == 0 {
			return Err(ConfigError::ValidationError(format!(
				"Source {} must allow at least one request per second",
				name
			)));
		}
		if source.max_processing_transactions == 0 {
			return Err(ConfigError::ValidationError(format!(
				"Source {} must allow at least one transaction in processing",
				name
			)));
		}
		if source.verifier.backend.is_empty() {
			return Err(ConfigError::ValidationError(format!(
				"Source {} has no verifier backend",
				name
			)));
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use attester_types::{AttestationType, SourceId};

	const BASE: &str = r#"
[attester]
name = "attester-test"
submitter_address = "0x0000000000000000000000000000000000000001"
first_epoch_start_time = 1636070400
round_duration_sec = 90
commit_time_sec = 10
reveal_time_sec = 5
admission_config_dir = "./admission"

[storage]
backend = "memory"

[delivery]
backend = "dry_run"

[discovery.sources.main]
backend = "http"
url = "http://localhost:9000"

[sources.BTC]
max_requests_per_second = 5
max_processing_transactions = 20
max_failed_retry = 1
reverification_time_offset_sec = 10

[sources.BTC.verifier]
backend = "http"
attestation_types = ["Payment", "ConfirmedBlockHeightExists"]

[sources.BTC.verifier.config]
url = "http://localhost:9500"
"#;

	#[test]
	fn test_parse_full_config() {
		let config = ConfigLoader::new()
			.with_env_prefix("ATTESTER_TEST_PARSE_")
			.load_from_str(BASE)
			.unwrap();

		assert_eq!(config.attester.name, "attester-test");
		assert_eq!(config.attester.admission_reload_interval_sec, 10);
		assert_eq!(config.delivery.max_retries, 5);

		let sources = config.source_configs().unwrap();
		let btc = &sources[&SourceId::Btc];
		assert_eq!(btc.max_requests_per_second, 5);
		assert_eq!(btc.delay_before_retry_sec, 2);
		assert_eq!(
			btc.verifier.attestation_types,
			vec![
				AttestationType::Payment,
				AttestationType::ConfirmedBlockHeightExists
			]
		);
		assert_eq!(
			btc.verifier.config.get("url").and_then(|v| v.as_str()),
			Some("http://localhost:9500")
		);
	}

	#[test]
	fn test_env_substitution_with_default() {
		let content = BASE.replace(
			"name = \"attester-test\"",
			"name = \"${ATTESTER_TEST_UNSET_NAME_VAR:-fallback}\"",
		);
		let config = ConfigLoader::new()
			.with_env_prefix("ATTESTER_TEST_DEFAULT_")
			.load_from_str(&content)
			.unwrap();
		assert_eq!(config.attester.name, "fallback");
	}

	#[test]
	fn test_missing_env_var_is_reported() {
		let content = BASE.replace(
			"url = \"http://localhost:9500\"",
			"url = \"${ATTESTER_TEST_MISSING_URL_VAR}\"",
		);
		let err = ConfigLoader::new().load_from_str(&content).unwrap_err();
		assert!(
			matches!(err, ConfigError::EnvVarNotFound(ref name) if name == "ATTESTER_TEST_MISSING_URL_VAR")
		);
	}

	#[test]
	fn test_env_override() {
		env::set_var("ATTESTER_TEST_OVERRIDE_NAME", "from-env");
		let config = ConfigLoader::new()
			.with_env_prefix("ATTESTER_TEST_OVERRIDE_")
			.load_from_str(BASE)
			.unwrap();
		assert_eq!(config.attester.name, "from-env");
	}

	#[test]
	fn test_reveal_time_must_not_exceed_commit_time() {
		let content = BASE.replace("reveal_time_sec = 5", "reveal_time_sec = 20");
		let err = ConfigLoader::new().load_from_str(&content).unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[test]
	fn test_zero_reveal_time_rejected() {
		let content = BASE.replace("reveal_time_sec = 5", "reveal_time_sec = 0");
		let err = ConfigLoader::new().load_from_str(&content).unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains("reveal_time_sec")));
	}

	#[test]
	fn test_unknown_source_name_rejected() {
		let content = BASE.replace("[sources.BTC", "[sources.FOO");
		let err = ConfigLoader::new().load_from_str(&content).unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[tokio::test]
	async fn test_load_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("attester.toml");
		std::fs::write(&path, BASE).unwrap();

		let config = ConfigLoader::new().with_file(&path).load().await.unwrap();
		assert_eq!(config.attester.round_duration_sec, 90);

		let missing = ConfigLoader::new()
			.with_file(dir.path().join("nope.toml"))
			.load()
			.await;
		assert!(matches!(missing, Err(ConfigError::FileNotFound(_))));
	}
}
