//! # Netplay Wire Protocol
//!
//! Typed messages and the frame format peers use to exchange them. The crate
//! has no socket code; the transport hands it raw bytes and gets typed
//! messages back.
//!
//! ## Frames
//!
//! Each message is written as one self-delimiting frame: a one-byte type tag, a
//! one-byte compression level, then either the raw payload or an LZ4-compressed
//! copy of it with both sizes in front. The payload is a length-prefixed body
//! followed by a 128-bit digest, and the digest is checked before any field of
//! the body is read.
//!
//! Compression is opportunistic. A message starts at level
//! [`DEFAULT_COMPRESSION_LEVEL`]; if its compressed form does not beat the raw
//! form once the two size fields are counted, the level is cleared on the
//! message and it is sent raw from then on.
//!
//! ## Decoding
//!
//! [`Codec::decode`] either returns a complete, verified message together with
//! the number of bytes it used, or an error and consumes nothing. A short read
//! is reported as [`ProtocolError::Truncated`], so the same call can be retried
//! as bytes arrive. [`MessageBuffer`] wraps that loop for stream sockets.
//!
//! Types are resolved through a [`Registry`] built at startup. Unregistered or
//! unknown tags are rejected like any other corrupt frame.
//!
//! ## Usage Example
//!
//! ```rust
//! use protocol::{Codec, Message, MessageBody, Text};
//!
//! let codec = Codec::new();
//! let mut msg = Message::new(Text { text: "PING".to_string() });
//!
//! let frame = codec.encode(&mut msg).unwrap();
//! let (decoded, consumed) = codec.decode(&frame).unwrap();
//!
//! assert_eq!(consumed, frame.len());
//! assert!(matches!(decoded.body(), MessageBody::Text(t) if t.text == "PING"));
//! ```

pub mod buffer;
pub mod checksum;
pub mod codec;
pub mod compression;
pub mod error;
pub mod message;
pub mod registry;

pub use buffer::MessageBuffer;
pub use checksum::{digest128, Digest, DIGEST_SIZE};
pub use codec::Codec;
pub use compression::DEFAULT_COMPRESSION_LEVEL;
pub use error::ProtocolError;
pub use message::{
    BaseType, Bundle, ClientMode, ClientModeKind, ErrorMessage, IpAddrPort, Message, MessageBody,
    MessageType, NetplayConfig, PlayerInputs, Text, Variant, Version,
};
pub use registry::Registry;

/// Largest body or decompressed payload a frame may declare.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;
