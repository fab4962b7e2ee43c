//! In-memory storage backend, for tests and dry runs.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_expired(&self) -> bool {
		self.expires_at
			.map(|at| Instant::now() >= at)
			.unwrap_or(false)
	}
}

#[derive(Default)]
pub struct MemoryStorage {
	entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let entries = self.entries.read().await;
		match entries.get(key) {
			Some(entry) if !entry.is_expired() => Ok(entry.value.clone()),
			_ => Err(StorageError::NotFound),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let mut entries = self.entries.write().await;
		entries.retain(|_, entry| !entry.is_expired());
		entries.insert(
			key.to_string(),
			Entry {
				value,
				expires_at: ttl.map(|ttl| Instant::now() + ttl),
			},
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.entries.write().await.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let entries = self.entries.read().await;
		Ok(entries.get(key).map(|e| !e.is_expired()).unwrap_or(false))
	}
}

pub fn create_storage(_config: &toml::Value) -> Box<dyn StorageInterface> {
	Box::new(MemoryStorage::new())
}
