//! Fixed-size byte primitives and hashing helpers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a round (epoch). One per fixed-length time window.
pub type RoundId = u64;

/// Errors produced when parsing hex encoded byte values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexParseError {
	#[error("Invalid hex: {0}")]
	InvalidHex(String),
	#[error("Expected {expected} bytes, got {actual}")]
	InvalidLength { expected: usize, actual: usize },
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HexParseError> {
	let trimmed = s.strip_prefix("0x").unwrap_or(s);
	let bytes = hex::decode(trimmed).map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
	let actual = bytes.len();
	bytes
		.try_into()
		.map_err(|_| HexParseError::InvalidLength {
			expected: N,
			actual,
		})
}

macro_rules! fixed_bytes {
	($(#[$meta:meta])* $name:ident, $len:expr) => {
		$(#[$meta])*
		#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
		pub struct $name(pub [u8; $len]);

		impl $name {
			pub const ZERO: Self = Self([0u8; $len]);

			pub fn as_bytes(&self) -> &[u8; $len] {
				&self.0
			}

			pub fn is_zero(&self) -> bool {
				self.0.iter().all(|b| *b == 0)
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self::ZERO
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "0x{}", hex::encode(self.0))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self)
			}
		}

		impl FromStr for $name {
			type Err = HexParseError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				decode_fixed::<$len>(s).map(Self)
			}
		}

		impl From<[u8; $len]> for $name {
			fn from(bytes: [u8; $len]) -> Self {
				Self(bytes)
			}
		}

		impl Serialize for $name {
			fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(&self.to_string())
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				let s = String::deserialize(deserializer)?;
				s.parse().map_err(serde::de::Error::custom)
			}
		}
	};
}

fixed_bytes!(
	/// A 32-byte hash (Merkle roots, random values, verification hashes).
	Hash32,
	32
);

fixed_bytes!(
	/// A 20-byte account address on the home chain.
	Address,
	20
);

/// Computes the keccak-256 hash of the given bytes.
pub fn keccak256(data: impl AsRef<[u8]>) -> Hash32 {
	let mut hasher = Keccak256::new();
	hasher.update(data.as_ref());
	Hash32(hasher.finalize().into())
}

/// Serde adapter for raw byte vectors carried as `0x` prefixed hex strings.
pub mod hex_bytes {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		let trimmed = s.strip_prefix("0x").unwrap_or(&s);
		hex::decode(trimmed).map_err(serde::de::Error::custom)
	}
}
