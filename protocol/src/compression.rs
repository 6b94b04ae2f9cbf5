//! LZ4 block compression for message archives.
//!
//! Frames carry the sender's compression level so the receiver knows whether the
//! payload is compressed. The LZ4 block format has a single effort setting, so any
//! non-zero level produces the same output.

use crate::error::ProtocolError;
use lz4_flex::block;

/// Compression level used by newly constructed messages.
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 9;

/// Compresses `data`. A `level` of 0 returns the input unchanged.
pub fn compress(data: &[u8], level: u8) -> Vec<u8> {
    if level == 0 {
        return data.to_vec();
    }
    block::compress(data)
}

/// Decompresses `data`, which must expand to exactly `expected_size` bytes.
pub fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let out = block::decompress(data, expected_size)
        .map_err(|e| ProtocolError::Decompress(e.to_string()))?;

    if out.len() != expected_size {
        return Err(ProtocolError::SizeMismatch {
            expected: expected_size,
            actual: out.len(),
        });
    }

    Ok(out)
}
