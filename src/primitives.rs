//! Hashing and identifier primitives (spec §4.1).

use sha2::{Digest, Sha256};
use log::debug;

/// Plain SHA-256 hex digest, used for general content-addressing (transaction
/// and block identifiers, Merkle nodes).
///
/// ```
/// use shardcore::primitives::calculate_hash;
///
/// let hash = calculate_hash("Hello, Blockchain!");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn calculate_hash<T: AsRef<[u8]>>(data: T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// SHA-256 of the concatenation of several hex strings, used for Merkle
/// internal nodes (`hash(left || right)`).
pub fn calculate_hash_concat(pieces: &[&str]) -> String {
    calculate_hash(pieces.join("").as_bytes())
}

/// Double-SHA-256 with little-endian byte reversal on the output, used for
/// PoW-compatible hashes (§4.1). Distinct from [`calculate_hash`]: PoW mining
/// and validation both go through this function so that the difficulty
/// predicate (leading zero bytes) is checked against the same representation
/// on both sides.
pub fn double_hash_reversed<T: AsRef<[u8]>>(data: T) -> String {
    let first = Sha256::digest(data.as_ref());
    let second = Sha256::digest(first);
    let mut bytes: Vec<u8> = second.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// True if `hash` (hex) has at least `difficulty` leading zero hex digits.
pub fn hash_meets_difficulty(hash: &str, difficulty: u32) -> bool {
    if difficulty == 0 {
        return true;
    }
    let target = "0".repeat(difficulty as usize);
    hash.starts_with(&target)
}

/// Deterministic shard routing (§4.1): SHA-256 of the address, first 8 bytes
/// read big-endian, modulo the shard count. Pure function of `(address,
/// shard_count)`, so two replayers with the same inputs always agree.
///
/// ```
/// use shardcore::primitives::route_shard;
///
/// let a = route_shard("alice_wallet_0x1a2b3c4d5e6f", 4);
/// let b = route_shard("alice_wallet_0x1a2b3c4d5e6f", 4);
/// assert_eq!(a, b);
/// assert!(a < 4);
/// ```
pub fn route_shard(address: &str, shard_count: u32) -> u32 {
    assert!(shard_count > 0, "shard_count must be positive");
    let digest = Sha256::digest(address.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    let value = u64::from_be_bytes(buf);
    (value % shard_count as u64) as u32
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn hex_to_bytes(hex_str: &str) -> crate::Result<Vec<u8>> {
    hex::decode(hex_str).map_err(|e| crate::NodeError::Serialization(e.to_string()))
}

pub fn is_valid_hex(hex_str: &str) -> bool {
    !hex_str.is_empty() && hex_str.chars().all(|c| c.is_ascii_hexdigit())
}

/// Format a UNIX timestamp for log/debug output.
pub fn format_timestamp(timestamp: i64) -> String {
    use chrono::DateTime;
    let dt = DateTime::from_timestamp(timestamp, 0).unwrap_or_default();
    dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn debug_log(prefix: &str, message: &str) {
    debug!("[{}] {}", prefix, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_hash_is_64_hex_chars() {
        let hash = calculate_hash("test");
        assert_eq!(hash.len(), 64);
        assert!(is_valid_hex(&hash));
    }

    #[test]
    fn hash_meets_difficulty_checks_prefix() {
        let hash = "0000abcdef1234567890abcdef1234567890abcdef1234567890abcdef123456";
        assert!(hash_meets_difficulty(hash, 4));
        assert!(!hash_meets_difficulty(hash, 5));
        assert!(hash_meets_difficulty(hash, 0));
    }

    #[test]
    fn double_hash_reversed_differs_from_single_hash() {
        let single = calculate_hash("abc");
        let double = double_hash_reversed("abc");
        assert_ne!(single, double);
        assert_eq!(double.len(), 64);
    }

    #[test]
    fn route_shard_is_deterministic_and_bounded() {
        let a1 = route_shard("alice_wallet_0x1a2b3c4d5e6f", 4);
        let a2 = route_shard("alice_wallet_0x1a2b3c4d5e6f", 4);
        assert_eq!(a1, a2);
        assert!(a1 < 4);
    }

    #[test]
    fn route_shard_matches_manual_derivation() {
        let addr = "bob_wallet_0x4d5e6f7a8b9c";
        let digest = Sha256::digest(addr.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[0..8]);
        let expected = (u64::from_be_bytes(buf) % 4) as u32;
        assert_eq!(route_shard(addr, 4), expected);
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x01, 0x02, 0x03, 0x04];
        let hex_str = bytes_to_hex(&bytes);
        assert_eq!(hex_to_bytes(&hex_str).unwrap(), bytes);
    }
}
