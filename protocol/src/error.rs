use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
///
/// A decode error always means that no bytes were consumed and no message was
/// produced.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough bytes for a complete frame yet.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The trailing digest does not match the archive.
    #[error("digest mismatch")]
    DigestMismatch,

    /// No decoder is registered for this tag.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Decompressed length differs from the declared length.
    #[error("decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A declared length exceeds the protocol maximum.
    #[error("declared size {0} exceeds maximum message size")]
    TooLarge(usize),

    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The archive passed the digest check but its fields do not parse.
    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// True when more bytes may turn this into a successful decode.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Truncated { .. })
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
