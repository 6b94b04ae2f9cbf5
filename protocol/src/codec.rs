//! Frame encoding and decoding.
//!
//! ```text
//! compressed:    [type:u8][level:u8][uncompressedLen:u32][compressedLen:u32][compressedBytes]
//! uncompressed:  [type:u8][level:u8][payload]
//! payload:       [bodyLen:u32][body][digest:16]
//! ```
//!
//! The body is the message's base fields followed by its type-specific fields,
//! serialized with fixed-width little-endian integers. The digest covers the
//! length prefix and the body.

use crate::checksum::{self, Digest, DIGEST_SIZE};
use crate::compression;
use crate::error::ProtocolError;
use crate::message::{BaseType, Message, MessageBody};
use crate::registry::{self, Registry};
use crate::MAX_MESSAGE_SIZE;
use bincode::Options;
use std::borrow::Cow;

const HEADER_SIZE: usize = 2;
const LEN_SIZE: usize = 4;
const COMPRESSED_HEADER_SIZE: usize = HEADER_SIZE + 2 * LEN_SIZE;
/// Largest payload: a maximal body plus its length prefix and digest.
const MAX_PAYLOAD_SIZE: usize = LEN_SIZE + MAX_MESSAGE_SIZE + DIGEST_SIZE;

/// Serialization options shared by encode and decode.
pub(crate) fn archive_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

fn read_u32(bytes: &[u8], at: usize) -> Option<usize> {
    let raw: [u8; LEN_SIZE] = bytes.get(at..at + LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw) as usize)
}

fn require(bytes: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if bytes.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// Reads a length field, rejecting values above `limit`.
fn read_len(bytes: &[u8], at: usize, limit: usize) -> Result<usize, ProtocolError> {
    let size = read_u32(bytes, at).ok_or(ProtocolError::Truncated {
        needed: at + LEN_SIZE,
        available: bytes.len(),
    })?;
    if size > limit {
        return Err(ProtocolError::TooLarge(size));
    }
    Ok(size)
}

/// Encodes and decodes message frames using a tag registry.
#[derive(Clone)]
pub struct Codec {
    registry: Registry,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Codec for all built-in message types.
    pub fn new() -> Self {
        Self::with_registry(Registry::standard())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes `msg` into one frame.
    ///
    /// Computes and caches the digest on first use. If compression does not
    /// pay for its own size fields the message's compression level is cleared
    /// so later encodes skip the attempt.
    pub fn encode(&self, msg: &mut Message) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();
        if msg.base_type() == BaseType::Sequence {
            body.extend_from_slice(&msg.sequence.to_le_bytes());
        }
        self.write_fields(&mut msg.body, &mut body)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(body.len()));
        }

        let mut payload = Vec::with_capacity(LEN_SIZE + body.len() + DIGEST_SIZE);
        payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
        payload.extend_from_slice(&body);

        let digest = *msg
            .digest
            .get_or_insert_with(|| checksum::digest128(&payload));
        payload.extend_from_slice(digest.as_bytes());

        let tag = u8::from(msg.message_type());

        if msg.compression_level != 0 {
            let compressed = compression::compress(&payload, msg.compression_level);

            if 2 * LEN_SIZE + compressed.len() < payload.len() {
                let mut frame = Vec::with_capacity(COMPRESSED_HEADER_SIZE + compressed.len());
                frame.push(tag);
                frame.push(msg.compression_level);
                frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
                frame.extend_from_slice(&compressed);
                return Ok(frame);
            }

            msg.compression_level = 0;
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.push(tag);
        frame.push(0);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes the first frame in `bytes`, returning the message and the
    /// number of bytes it occupied.
    ///
    /// On error nothing is consumed. [`ProtocolError::is_incomplete`] tells a
    /// short read apart from a corrupt stream.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
        require(bytes, HEADER_SIZE)?;
        let tag = bytes[0];
        let level = bytes[1];

        let (payload, consumed): (Cow<'_, [u8]>, usize) = if level != 0 {
            let uncompressed_len = read_len(bytes, HEADER_SIZE, MAX_PAYLOAD_SIZE)?;
            let compressed_len = read_len(bytes, HEADER_SIZE + LEN_SIZE, MAX_PAYLOAD_SIZE)?;

            let end = COMPRESSED_HEADER_SIZE + compressed_len;
            require(bytes, end)?;

            let data = compression::decompress(&bytes[COMPRESSED_HEADER_SIZE..end], uncompressed_len)?;
            (Cow::Owned(data), end)
        } else {
            let body_len = read_len(bytes, HEADER_SIZE, MAX_MESSAGE_SIZE)?;

            let end = HEADER_SIZE + LEN_SIZE + body_len + DIGEST_SIZE;
            require(bytes, end)?;
            (Cow::Borrowed(&bytes[HEADER_SIZE..end]), end)
        };

        let msg = self.decode_payload(tag, level, &payload)?;
        Ok((msg, consumed))
    }

    fn decode_payload(&self, tag: u8, level: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
        if payload.len() < LEN_SIZE + DIGEST_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "payload of {} bytes is shorter than its fixed fields",
                payload.len()
            )));
        }

        let (archive, trailer) = payload.split_at(payload.len() - DIGEST_SIZE);
        if !checksum::verify(archive, trailer) {
            return Err(ProtocolError::DigestMismatch);
        }

        let body = &archive[LEN_SIZE..];
        if read_u32(archive, 0) != Some(body.len()) {
            return Err(ProtocolError::Malformed("body length prefix mismatch".to_string()));
        }

        let (_, base, decode) = self
            .registry
            .lookup(tag)
            .ok_or(ProtocolError::UnknownType(tag))?;

        let (sequence, fields) = match base {
            BaseType::Message => (0, body),
            BaseType::Sequence => {
                let sequence = read_u32(body, 0)
                    .ok_or_else(|| ProtocolError::Malformed("missing sequence number".to_string()))?;
                (sequence as u32, &body[LEN_SIZE..])
            }
        };

        let body = decode(self, fields)?;
        let digest = Digest::from_slice(trailer).ok_or(ProtocolError::DigestMismatch)?;

        Ok(Message {
            body,
            sequence,
            compression_level: level,
            digest: Some(digest),
        })
    }

    fn write_fields(&self, body: &mut MessageBody, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let options = archive_options();
        let result = match body {
            MessageBody::Version(v) => options.serialize_into(&mut *out, v),
            MessageBody::IpAddrPort(v) => options.serialize_into(&mut *out, v),
            MessageBody::ClientMode(v) => options.serialize_into(&mut *out, v),
            MessageBody::NetplayConfig(v) => options.serialize_into(&mut *out, v),
            MessageBody::Text(v) => options.serialize_into(&mut *out, v),
            MessageBody::ErrorMessage(v) => options.serialize_into(&mut *out, v),
            MessageBody::PlayerInputs(v) => options.serialize_into(&mut *out, v),
            MessageBody::Bundle(b) => return registry::encode_bundle(self, b, out),
        };
        result.map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        Bundle, ClientMode, ClientModeKind, ErrorMessage, IpAddrPort, MessageType, NetplayConfig,
        PlayerInputs, Text, Version,
    };
    use rand::Rng;

    fn ping() -> Message {
        Message::new(Text {
            text: "PING".to_string(),
        })
        .with_compression(9)
    }

    fn big_inputs() -> Message {
        Message::new(PlayerInputs {
            start_frame: 1200,
            index: 3,
            inputs: vec![0x0010; 600],
        })
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::new(Version {
                code: "3.0".to_string(),
                revision: "a1b2c3".to_string(),
                build_time: "2024-01-01".to_string(),
            }),
            Message::new(IpAddrPort {
                addr: "192.168.0.10".to_string(),
                port: 7000,
            }),
            Message::new(ClientMode {
                mode: ClientModeKind::Spectate,
                flags: 0b101,
            }),
            Message::new(NetplayConfig {
                delay: 4,
                rollback: 2,
                host_player: 1,
                win_count: 2,
            })
            .with_compression(0),
            ping(),
            Message::new(ErrorMessage {
                error: "version mismatch".to_string(),
            }),
            big_inputs(),
            Message::new(Bundle {
                messages: vec![ping(), big_inputs()],
            })
            .with_sequence(77),
        ]
    }

    #[test]
    fn test_ping_scenario() {
        let codec = Codec::new();
        let mut msg = ping();

        let frame = codec.encode(&mut msg).unwrap();
        assert_eq!(frame[0], 5);

        let (decoded, consumed) = codec.decode(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.message_type(), MessageType::Text);
        match decoded.body() {
            MessageBody::Text(t) => assert_eq!(t.text, "PING"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_all_types() {
        let codec = Codec::new();

        for mut msg in sample_messages() {
            let frame = codec.encode(&mut msg).unwrap();
            let (decoded, consumed) = codec.decode(&frame).unwrap();

            assert_eq!(consumed, frame.len(), "{}", msg.message_type());
            assert_eq!(decoded, msg, "{}", msg.message_type());
            assert!(decoded.is_digest_computed());
        }
    }

    #[test]
    fn test_small_message_falls_back_to_uncompressed() {
        let codec = Codec::new();
        let mut msg = ping();

        let first = codec.encode(&mut msg).unwrap();
        assert_eq!(first[1], 0);
        assert_eq!(msg.compression_level(), 0);

        // level stays cleared and output is stable
        let second = codec.encode(&mut msg).unwrap();
        assert_eq!(msg.compression_level(), 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_large_message_is_compressed() {
        let codec = Codec::new();
        let mut msg = big_inputs();

        let frame = codec.encode(&mut msg).unwrap();
        assert_eq!(frame[1], 9);
        assert_eq!(msg.compression_level(), 9);

        let uncompressed_len = read_u32(&frame, 2).unwrap();
        let compressed_len = read_u32(&frame, 6).unwrap();
        assert_eq!(frame.len(), COMPRESSED_HEADER_SIZE + compressed_len);
        assert!(8 + compressed_len < uncompressed_len);
    }

    #[test]
    fn test_digest_is_computed_once() {
        let codec = Codec::new();
        let mut msg = big_inputs();
        assert!(msg.digest().is_none());

        codec.encode(&mut msg).unwrap();
        let digest = *msg.digest().unwrap();

        codec.encode(&mut msg).unwrap();
        assert_eq!(msg.digest(), Some(&digest));
    }

    #[test]
    fn test_any_flipped_payload_byte_is_rejected() {
        let codec = Codec::new();
        let mut rng = rand::thread_rng();

        for mut msg in [ping(), big_inputs()] {
            let frame = codec.encode(&mut msg).unwrap();

            for i in HEADER_SIZE..frame.len() {
                let mut corrupted = frame.clone();
                corrupted[i] ^= rng.gen_range(1..=255u8);
                assert!(
                    codec.decode(&corrupted).is_err(),
                    "flip at {} of {} accepted",
                    i,
                    frame.len()
                );
            }
        }
    }

    #[test]
    fn test_every_prefix_is_incomplete() {
        let codec = Codec::new();

        for mut msg in [ping(), big_inputs()] {
            let frame = codec.encode(&mut msg).unwrap();

            for len in 0..frame.len() {
                let err = codec.decode(&frame[..len]).unwrap_err();
                assert!(err.is_incomplete(), "prefix {} gave {}", len, err);
            }
        }
    }

    #[test]
    fn test_consumed_stops_at_frame_end() {
        let codec = Codec::new();
        let mut first = ping();
        let mut second = big_inputs();

        let mut stream = codec.encode(&mut first).unwrap();
        let first_len = stream.len();
        stream.extend(codec.encode(&mut second).unwrap());

        let (msg, consumed) = codec.decode(&stream).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(msg, first);

        let (msg, consumed) = codec.decode(&stream[first_len..]).unwrap();
        assert_eq!(consumed, stream.len() - first_len);
        assert_eq!(msg, second);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let codec = Codec::new();
        let mut frame = codec.encode(&mut ping()).unwrap();
        frame[0] = 42;

        match codec.decode(&frame) {
            Err(ProtocolError::UnknownType(42)) => {}
            other => panic!("unexpected result {:?}", other.map(|(m, n)| (m.to_string(), n))),
        }
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let mut registry = Registry::new();
        registry.register::<Version>();
        let narrow = Codec::with_registry(registry);

        let frame = Codec::new().encode(&mut ping()).unwrap();
        assert!(matches!(
            narrow.decode(&frame),
            Err(ProtocolError::UnknownType(5))
        ));
    }

    #[test]
    fn test_declared_size_mismatch_is_rejected() {
        let codec = Codec::new();
        let mut frame = codec.encode(&mut big_inputs()).unwrap();

        let declared = read_u32(&frame, 2).unwrap() as u32 + 1;
        frame[2..6].copy_from_slice(&declared.to_le_bytes());

        let err = codec.decode(&frame).unwrap_err();
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_oversized_length_is_not_incomplete() {
        let codec = Codec::new();
        let mut frame = vec![5u8, 0];
        frame.extend_from_slice(&u32::MAX.to_le_bytes());

        match codec.decode(&frame) {
            Err(ProtocolError::TooLarge(_)) => {}
            other => panic!("unexpected result {:?}", other.map(|(_, n)| n)),
        }
    }

    #[test]
    fn test_valid_digest_with_garbage_body_is_malformed() {
        let codec = Codec::new();

        // archive claims to be a Text but holds a truncated string
        let body = [10u8, 0, 0, 0, 0, 0, 0, 0, b'x'];
        let mut payload = (body.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(&body);
        let digest = checksum::digest128(&payload);
        payload.extend_from_slice(digest.as_bytes());

        let mut frame = vec![5u8, 0];
        frame.extend_from_slice(&payload);

        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_bundle_keeps_sequence_and_children() {
        let codec = Codec::new();
        let mut bundle = Message::new(Bundle {
            messages: vec![ping(), big_inputs(), ping()],
        })
        .with_sequence(12);

        let frame = codec.encode(&mut bundle).unwrap();
        let (decoded, _) = codec.decode(&frame).unwrap();

        assert_eq!(decoded.sequence(), 12);
        match decoded.body() {
            MessageBody::Bundle(b) => {
                assert_eq!(b.messages.len(), 3);
                assert_eq!(b.messages[1], big_inputs_encoded(&codec));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_nested_bundles_are_refused() {
        let codec = Codec::new();
        let inner = Message::new(Bundle::default());
        let mut outer = Message::new(Bundle {
            messages: vec![inner],
        });

        assert!(matches!(
            codec.encode(&mut outer),
            Err(ProtocolError::Encode(_))
        ));
    }

    #[test]
    fn test_largest_body_round_trips() {
        let codec = Codec::new();
        // 4 + 4 + 8 bytes of fixed fields, then two bytes per input
        let count = (MAX_MESSAGE_SIZE - 16) / 2;
        let largest = || {
            Message::new(PlayerInputs {
                start_frame: 0,
                index: 0,
                inputs: vec![0; count],
            })
        };

        for level in [9, 0] {
            let mut msg = largest().with_compression(level);
            let frame = codec.encode(&mut msg).unwrap();
            assert_eq!(frame[1], level);

            let (decoded, consumed) = codec.decode(&frame).unwrap();
            assert_eq!(consumed, frame.len());
            assert_eq!(decoded.body(), msg.body());
        }

        let mut oversized = Message::new(PlayerInputs {
            start_frame: 0,
            index: 0,
            inputs: vec![0; count + 1],
        });
        assert!(matches!(
            codec.encode(&mut oversized),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    /// Uncompressed frame around `body`, with a valid digest.
    fn raw_frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = (body.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(body);
        let digest = checksum::digest128(&payload);
        payload.extend_from_slice(digest.as_bytes());

        let mut frame = vec![tag, 0];
        frame.extend_from_slice(&payload);
        frame
    }

    fn raw_bundle(children: Vec<Vec<u8>>) -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        archive_options().serialize_into(&mut body, &children).unwrap();
        raw_frame(u8::from(MessageType::Bundle), &body)
    }

    #[test]
    fn test_nested_bundle_frame_is_malformed() {
        let codec = Codec::new();
        let child = codec.encode(&mut ping()).unwrap();
        let frame = raw_bundle(vec![raw_bundle(vec![child])]);

        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_deeply_nested_bundles_do_not_recurse() {
        let codec = Codec::new();
        let mut frame = codec.encode(&mut ping()).unwrap();
        for _ in 0..1000 {
            frame = raw_bundle(vec![frame]);
        }
        assert!(frame.len() < MAX_MESSAGE_SIZE);

        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_child_is_corrupt_not_incomplete() {
        let codec = Codec::new();
        let mut child = codec.encode(&mut ping()).unwrap();
        child.truncate(child.len() - 3);
        let frame = raw_bundle(vec![child]);

        let err = codec.decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(!err.is_incomplete());
    }

    fn big_inputs_encoded(codec: &Codec) -> Message {
        let mut msg = big_inputs();
        codec.encode(&mut msg).unwrap();
        msg
    }
}
