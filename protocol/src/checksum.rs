//! 128-bit integrity digest over message archives.

use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_SIZE: usize = 16;

/// Truncated SHA-256 of a serialized message archive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Reads a digest from exactly `DIGEST_SIZE` bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Digest(array))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Computes the 128-bit digest of `data`.
pub fn digest128(data: &[u8]) -> Digest {
    let full = Sha256::digest(data);
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&full[..DIGEST_SIZE]);
    Digest(out)
}

/// Recomputes the digest of `data` and compares it to `expected`.
pub fn verify(data: &[u8], expected: &[u8]) -> bool {
    expected.len() == DIGEST_SIZE && digest128(data).0[..] == *expected
}
