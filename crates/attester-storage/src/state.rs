//! Persistent round state.
//!
//! Rounds are stored as [`RoundResult`] records. Saving merges into any
//! existing record, so repeated or partial saves for the same round are
//! safe.

use crate::{StorageError, StorageService};
use attester_types::{RoundId, RoundResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const ROUND_NAMESPACE: &str = "rounds";

pub struct AttesterState {
	storage: Arc<StorageService>,
	/// Serializes read-modify-write upserts.
	write_lock: Mutex<()>,
}

impl AttesterState {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			write_lock: Mutex::new(()),
		}
	}

	/// Inserts the round if absent, otherwise updates the fields present in
	/// `round`.
	pub async fn save_round(&self, round: &RoundResult) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		let id = round.round_id.to_string();

		let record = match self
			.storage
			.retrieve_optional::<RoundResult>(ROUND_NAMESPACE, &id)
			.await?
		{
			Some(mut existing) => {
				existing.merge(round);
				existing
			}
			None => round.clone(),
		};

		self.storage.store(ROUND_NAMESPACE, &id, &record).await?;
		debug!(round_id = round.round_id, "Round state saved");
		Ok(())
	}

	/// Records progress counters for a round without touching its commitment.
	pub async fn save_round_comment(
		&self,
		round_id: RoundId,
		transaction_count: u64,
		valid_transaction_count: u64,
	) -> Result<(), StorageError> {
		let comment = RoundResult {
			transaction_count: Some(transaction_count),
			valid_transaction_count: Some(valid_transaction_count),
			..RoundResult::new(round_id)
		};
		self.save_round(&comment).await
	}

	pub async fn get_round(&self, round_id: RoundId) -> Result<Option<RoundResult>, StorageError> {
		self.storage
			.retrieve_optional(ROUND_NAMESPACE, &round_id.to_string())
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use attester_types::Hash32;

	fn state() -> AttesterState {
		AttesterState::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))))
	}

	#[tokio::test]
	async fn test_save_round_is_upsert() {
		let state = state();
		let round = RoundResult {
			merkle_root: Some(Hash32([1; 32])),
			masked_merkle_root: Some(Hash32([2; 32])),
			random: Some(Hash32([3; 32])),
			transaction_count: Some(4),
			valid_transaction_count: Some(2),
			..RoundResult::new(10)
		};

		state.save_round(&round).await.unwrap();
		state.save_round(&round).await.unwrap();
		assert_eq!(state.get_round(10).await.unwrap(), Some(round.clone()));
	}

	#[tokio::test]
	async fn test_comment_does_not_clear_commitment() {
		let state = state();
		state.save_round_comment(3, 5, 0).await.unwrap();

		let committed = RoundResult {
			merkle_root: Some(Hash32([9; 32])),
			random: Some(Hash32([8; 32])),
			valid_transaction_count: Some(1),
			..RoundResult::new(3)
		};
		state.save_round(&committed).await.unwrap();
		state.save_round_comment(3, 6, 1).await.unwrap();

		let stored = state.get_round(3).await.unwrap().unwrap();
		assert_eq!(stored.merkle_root, Some(Hash32([9; 32])));
		assert_eq!(stored.transaction_count, Some(6));
		assert_eq!(stored.valid_transaction_count, Some(1));
	}

	#[tokio::test]
	async fn test_missing_round() {
		assert_eq!(state().get_round(99).await.unwrap(), None);
	}
}
