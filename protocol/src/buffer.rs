//! Reassembly of messages from a byte stream.

use crate::codec::Codec;
use crate::error::ProtocolError;
use crate::message::Message;

/// Accumulates received bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Decodes the next buffered message.
    ///
    /// Returns `Ok(None)` until a whole frame has arrived. An error means the
    /// stream is corrupt; the buffer is left untouched so the caller decides
    /// whether to drop it or the connection.
    pub fn next_message(&mut self, codec: &Codec) -> Result<Option<Message>, ProtocolError> {
        if self.data.is_empty() {
            return Ok(None);
        }

        match codec.decode(&self.data) {
            Ok((msg, consumed)) => {
                self.data.drain(..consumed);
                Ok(Some(msg))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decodes every complete message currently buffered.
    pub fn drain_messages(&mut self, codec: &Codec) -> Result<Vec<Message>, ProtocolError> {
        let mut messages = Vec::new();
        while let Some(msg) = self.next_message(codec)? {
            messages.push(msg);
        }
        Ok(messages)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PlayerInputs, Text};

    fn frames(codec: &Codec) -> (Vec<u8>, Vec<Message>) {
        let mut originals = vec![
            Message::new(Text {
                text: "hello".to_string(),
            }),
            Message::new(PlayerInputs {
                start_frame: 60,
                index: 0,
                inputs: vec![1; 300],
            }),
            Message::new(Text {
                text: "bye".to_string(),
            }),
        ];

        let mut stream = Vec::new();
        for msg in &mut originals {
            stream.extend(codec.encode(msg).unwrap());
        }
        (stream, originals)
    }

    #[test]
    fn test_byte_by_byte_reassembly() {
        let codec = Codec::new();
        let (stream, originals) = frames(&codec);

        let mut buffer = MessageBuffer::new();
        let mut received = Vec::new();

        for b in &stream {
            buffer.push(std::slice::from_ref(b));
            while let Some(msg) = buffer.next_message(&codec).unwrap() {
                received.push(msg);
            }
        }

        assert_eq!(received, originals);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_leaves_partial_tail() {
        let codec = Codec::new();
        let (stream, originals) = frames(&codec);

        let mut buffer = MessageBuffer::new();
        buffer.push(&stream[..stream.len() - 3]);

        let messages = buffer.drain_messages(&codec).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[..], originals[..2]);
        assert!(!buffer.is_empty());

        buffer.push(&stream[stream.len() - 3..]);
        let messages = buffer.drain_messages(&codec).unwrap();
        assert_eq!(messages, originals[2..].to_vec());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_corrupt_stream_is_reported() {
        let codec = Codec::new();
        let (mut stream, _) = frames(&codec);
        let last = stream.len() - 1;
        stream[last] ^= 0xff;

        let mut buffer = MessageBuffer::new();
        buffer.push(&stream);

        assert!(buffer.next_message(&codec).unwrap().is_some());
        assert!(buffer.next_message(&codec).unwrap().is_some());
        assert!(buffer.next_message(&codec).is_err());

        buffer.clear();
        assert!(buffer.next_message(&codec).unwrap().is_none());
    }
}
