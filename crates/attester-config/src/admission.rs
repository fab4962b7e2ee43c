//! Versioned admission configuration.
//!
//! Each JSON file in the admission directory describes the per-source weight
//! limits that apply from its `startEpoch` on:
//!
//! ```json
//! {
//!   "startEpoch": 120,
//!   "sourceHandlers": {
//!     "BTC": { "maxTotalRoundWeight": 100, "attestationTypes": { "Payment": 1 } }
//!   }
//! }
//! ```

use crate::ConfigError;
use attester_types::{AttestationType, RoundId, SourceId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Weight budget of one source within a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLimiterConfig {
	pub max_total_round_weight: u64,
	pub type_weights: HashMap<AttestationType, u64>,
}

/// Admission limits valid from `start_round_id` until a newer config starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationConfig {
	pub start_round_id: RoundId,
	pub source_limiters: HashMap<SourceId, SourceLimiterConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationConfigFile {
	start_epoch: RoundId,
	source_handlers: HashMap<String, SourceHandlerFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceHandlerFile {
	max_total_round_weight: u64,
	attestation_types: HashMap<String, u64>,
}

impl TryFrom<AttestationConfigFile> for AttestationConfig {
	type Error = ConfigError;

	fn try_from(file: AttestationConfigFile) -> Result<Self, Self::Error> {
		let mut source_limiters = HashMap::new();
		for (source_name, handler) in file.source_handlers {
			let source = source_name
				.parse::<SourceId>()
				.map_err(ConfigError::ValidationError)?;

			let mut type_weights = HashMap::new();
			for (type_name, weight) in handler.attestation_types {
				let kind = type_name
					.parse::<AttestationType>()
					.map_err(ConfigError::ValidationError)?;
				type_weights.insert(kind, weight);
			}

			source_limiters.insert(
				source,
				SourceLimiterConfig {
					max_total_round_weight: handler.max_total_round_weight,
					type_weights,
				},
			);
		}

		Ok(Self {
			start_round_id: file.start_epoch,
			source_limiters,
		})
	}
}

/// Parses an admission config from JSON text.
pub fn parse_admission_config(content: &str) -> Result<AttestationConfig, ConfigError> {
	let file: AttestationConfigFile =
		serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
	AttestationConfig::try_from(file)
}

pub async fn load_admission_file(path: &Path) -> Result<AttestationConfig, ConfigError> {
	debug!("Loading admission config {:?}", path);
	let content = tokio::fs::read_to_string(path).await?;
	parse_admission_config(&content)
		.map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
}

/// Loads every `.json` file in `dir`, newest start round first.
///
/// Fails if the directory holds no configs or two files share a start round.
pub async fn load_admission_dir(dir: &Path) -> Result<Vec<AttestationConfig>, ConfigError> {
	let mut configs = Vec::new();
	for path in admission_files(dir).await? {
		configs.push(load_admission_file(&path).await?);
	}

	if configs.is_empty() {
		return Err(ConfigError::ValidationError(format!(
			"No admission configs found in {}",
			dir.display()
		)));
	}

	configs.sort_by(|a, b| b.start_round_id.cmp(&a.start_round_id));
	if let Some(pair) = configs
		.windows(2)
		.find(|pair| pair[0].start_round_id == pair[1].start_round_id)
	{
		return Err(ConfigError::ValidationError(format!(
			"Duplicate admission config for start round {}",
			pair[0].start_round_id
		)));
	}

	info!(
		"Loaded {} admission configs from {}",
		configs.len(),
		dir.display()
	);
	Ok(configs)
}

/// Names and modification times of the admission files, used to detect
/// changes in the directory.
pub async fn admission_dir_fingerprint(
	dir: &Path,
) -> Result<Vec<(PathBuf, Option<SystemTime>)>, ConfigError> {
	let mut fingerprint = Vec::new();
	for path in admission_files(dir).await? {
		let modified = tokio::fs::metadata(&path)
			.await
			.ok()
			.and_then(|meta| meta.modified().ok());
		fingerprint.push((path, modified));
	}
	Ok(fingerprint)
}

async fn admission_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	let mut files = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
			files.push(path);
		}
	}
	files.sort();
	Ok(files)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config_json(start: u64, max: u64) -> String {
		format!(
			r#"{{
				"startEpoch": {},
				"sourceHandlers": {{
					"BTC": {{
						"maxTotalRoundWeight": {},
						"attestationTypes": {{ "Payment": 1, "ConfirmedBlockHeightExists": 3 }}
					}}
				}}
			}}"#,
			start, max
		)
	}

	#[test]
	fn test_parse_config() {
		let config = parse_admission_config(&config_json(7, 50)).unwrap();
		assert_eq!(config.start_round_id, 7);
		let btc = &config.source_limiters[&SourceId::Btc];
		assert_eq!(btc.max_total_round_weight, 50);
		assert_eq!(
			btc.type_weights[&AttestationType::ConfirmedBlockHeightExists],
			3
		);
	}

	#[test]
	fn test_unknown_type_rejected() {
		let json = r#"{"startEpoch": 1, "sourceHandlers": {"BTC": {"maxTotalRoundWeight": 1, "attestationTypes": {"Bogus": 1}}}}"#;
		assert!(matches!(
			parse_admission_config(json),
			Err(ConfigError::ValidationError(_))
		));
	}

	#[tokio::test]
	async fn test_load_dir_sorted_newest_first() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.json"), config_json(0, 10)).unwrap();
		std::fs::write(dir.path().join("b.json"), config_json(20, 30)).unwrap();
		std::fs::write(dir.path().join("c.json"), config_json(10, 20)).unwrap();
		std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

		let configs = load_admission_dir(dir.path()).await.unwrap();
		let starts: Vec<_> = configs.iter().map(|c| c.start_round_id).collect();
		assert_eq!(starts, vec![20, 10, 0]);

		let fingerprint = admission_dir_fingerprint(dir.path()).await.unwrap();
		assert_eq!(fingerprint.len(), 3);
	}

	#[tokio::test]
	async fn test_load_dir_rejects_empty_and_duplicates() {
		let dir = tempfile::tempdir().unwrap();
		assert!(load_admission_dir(dir.path()).await.is_err());

		std::fs::write(dir.path().join("a.json"), config_json(5, 10)).unwrap();
		std::fs::write(dir.path().join("b.json"), config_json(5, 20)).unwrap();
		assert!(matches!(
			load_admission_dir(dir.path()).await,
			Err(ConfigError::ValidationError(_))
		));
	}
}
