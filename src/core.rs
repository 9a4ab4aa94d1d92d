use std::fmt;
use std::sync::Arc;

/// Atomic reference-counted string type used for file paths and category names.
pub type ArcStr = Arc<str>;

/// Inputs at least this large are hashed on the rayon pool.
const PARALLEL_HASH_THRESHOLD: usize = 128 * 1024;

/// A 32-byte BLAKE3 content hash.
///
/// In `kamado` the hash is the only staleness signal: a file is considered
/// changed exactly when its current hash differs from the one recorded in the
/// [`Manifest`](crate::Manifest). Timestamps are carried along for reporting
/// but never consulted once a hash is available.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = blake3::Hasher::new();

        if buffer.len() >= PARALLEL_HASH_THRESHOLD {
            hasher.update_rayon(buffer);
        } else {
            hasher.update(buffer);
        }

        hasher.finalize().into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Parses a 64 character lowercase or uppercase hex digest.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let bytes = hex.as_bytes();
        if bytes.len() != 64 {
            return None;
        }

        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            out[i] = (hi << 4 | lo) as u8;
        }

        Some(Hash32(out))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"hello");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert_eq!(Hash32::from_hex("abc"), None);
        assert_eq!(Hash32::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn test_hash_is_content_addressed() {
        assert_eq!(Hash32::hash(b"a"), Hash32::hash(b"a"));
        assert_ne!(Hash32::hash(b"a"), Hash32::hash(b"b"));
    }
}
