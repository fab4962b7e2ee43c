//! File-based storage backend.
//!
//! Each key is one file under the base directory. Writes go to a temporary
//! file first and are renamed into place. Expiry times are kept in a sidecar
//! `.ttl` file and checked on read.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

pub struct FileStorage {
	base_path: PathBuf,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace(['/', ':', '\\'], "_");
		self.base_path.join(format!("{}.json", safe_key))
	}

	fn get_ttl_path(&self, key: &str) -> PathBuf {
		self.get_file_path(key).with_extension("ttl")
	}

	async fn is_expired(&self, key: &str) -> bool {
		let Ok(raw) = fs::read_to_string(self.get_ttl_path(key)).await else {
			return false;
		};
		let Ok(expires_at) = raw.trim().parse::<u64>() else {
			return false;
		};
		now_secs() >= expires_at
	}
}

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		if self.is_expired(key).await {
			self.delete(key).await?;
			return Err(StorageError::NotFound);
		}

		match fs::read(self.get_file_path(key)).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.get_file_path(key);

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, value)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let ttl_path = self.get_ttl_path(key);
		match ttl {
			Some(ttl) => {
				let expires_at = now_secs() + ttl.as_secs();
				fs::write(&ttl_path, expires_at.to_string())
					.await
					.map_err(|e| StorageError::Backend(e.to_string()))?;
			}
			None => {
				let _ = fs::remove_file(&ttl_path).await;
			}
		}

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let _ = fs::remove_file(self.get_ttl_path(key)).await;
		match fs::remove_file(self.get_file_path(key)).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		if self.is_expired(key).await {
			return Ok(false);
		}
		Ok(self.get_file_path(key).exists())
	}
}

/// Configuration parameters:
/// - `storage_path`: base directory (default: "./data/attester")
pub fn create_storage(config: &toml::Value) -> Box<dyn StorageInterface> {
	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/attester")
		.to_string();

	Box::new(FileStorage::new(PathBuf::from(storage_path)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_write_read_delete() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("rounds:1", b"one".to_vec(), None)
			.await
			.unwrap();
		assert_eq!(storage.get_bytes("rounds:1").await.unwrap(), b"one");
		assert!(dir.path().join("rounds_1.json").exists());
		assert!(!dir.path().join("rounds_1.tmp").exists());

		storage.delete("rounds:1").await.unwrap();
		assert!(!storage.exists("rounds:1").await.unwrap());
		assert!(matches!(
			storage.get_bytes("rounds:1").await,
			Err(StorageError::NotFound)
		));
		// deleting twice is fine
		storage.delete("rounds:1").await.unwrap();
	}

	#[tokio::test]
	async fn test_expired_entry_is_gone() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("k", b"v".to_vec(), Some(Duration::from_secs(0)))
			.await
			.unwrap();
		assert!(!storage.exists("k").await.unwrap());
		assert!(matches!(
			storage.get_bytes("k").await,
			Err(StorageError::NotFound)
		));
	}
}
