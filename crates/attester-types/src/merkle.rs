//! Merkle tree over attestation hashes and the commit hash.
//!
//! Leaves are sorted and deduplicated, then stored in a heap-shaped array of
//! size `2n - 1` with the leaves at the tail. Each internal node is the
//! keccak-256 hash of its two children in ascending order.

use crate::{keccak256, Address, Hash32};

/// Hash of two nodes, ordered so that the smaller one comes first.
fn sorted_hash_pair(x: &Hash32, y: &Hash32) -> Hash32 {
	let (lo, hi) = if x <= y { (x, y) } else { (y, x) };
	let mut buf = [0u8; 64];
	buf[..32].copy_from_slice(lo.as_bytes());
	buf[32..].copy_from_slice(hi.as_bytes());
	keccak256(buf)
}

/// Masked root binding a Merkle root to a random value and the submitter.
///
/// Equivalent to `keccak256(abi.encode(bytes32 root, bytes32 random, address))`.
pub fn commit_hash(merkle_root: &Hash32, random: &Hash32, address: &Address) -> Hash32 {
	let mut buf = [0u8; 96];
	buf[..32].copy_from_slice(merkle_root.as_bytes());
	buf[32..64].copy_from_slice(random.as_bytes());
	buf[76..].copy_from_slice(address.as_bytes());
	keccak256(buf)
}

#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
	tree: Vec<Hash32>,
}

impl MerkleTree {
	pub fn new(values: impl IntoIterator<Item = Hash32>) -> Self {
		let mut hashes: Vec<Hash32> = values.into_iter().collect();
		hashes.sort();
		hashes.dedup();

		let n = hashes.len();
		if n == 0 {
			return Self { tree: Vec::new() };
		}

		let mut tree = vec![Hash32::ZERO; n - 1];
		tree.extend(hashes);
		for i in (0..n - 1).rev() {
			tree[i] = sorted_hash_pair(&tree[2 * i + 1], &tree[2 * i + 2]);
		}

		Self { tree }
	}

	/// Root of the tree, `None` for an empty tree.
	pub fn root(&self) -> Option<Hash32> {
		self.tree.first().copied()
	}
}
