//! Tag → decoder table used by the codec's decode path.

use crate::codec::{archive_options, Codec};
use crate::error::ProtocolError;
use crate::message::{
    BaseType, Bundle, ClientMode, ErrorMessage, IpAddrPort, Message, MessageBody, MessageType,
    NetplayConfig, PlayerInputs, Text, Variant, Version,
};
use bincode::Options;
use std::collections::HashMap;

/// Builds a body from the type-specific bytes of an archive.
pub type DecodeFn = fn(&Codec, &[u8]) -> Result<MessageBody, ProtocolError>;

#[derive(Clone, Copy)]
struct Entry {
    base: BaseType,
    decode: DecodeFn,
}

/// Explicit registration of every decodable message type.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<MessageType, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in message types.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Version>()
            .register::<IpAddrPort>()
            .register::<ClientMode>()
            .register::<NetplayConfig>()
            .register::<Text>()
            .register::<ErrorMessage>()
            .register::<PlayerInputs>()
            .register_with(MessageType::Bundle, BaseType::Sequence, decode_bundle);
        registry
    }

    pub fn register<T: Variant>(&mut self) -> &mut Self {
        self.register_with(T::TYPE, T::BASE, decode_variant::<T>)
    }

    pub fn register_with(&mut self, ty: MessageType, base: BaseType, decode: DecodeFn) -> &mut Self {
        self.entries.insert(ty, Entry { base, decode });
        self
    }

    /// Resolves a wire tag to its type, base kind and decoder.
    pub fn lookup(&self, tag: u8) -> Option<(MessageType, BaseType, DecodeFn)> {
        let ty = MessageType::try_from(tag).ok()?;
        self.entries.get(&ty).map(|e| (ty, e.base, e.decode))
    }

    pub fn contains(&self, ty: MessageType) -> bool {
        self.entries.contains_key(&ty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_variant<T: Variant>(_: &Codec, fields: &[u8]) -> Result<MessageBody, ProtocolError> {
    let value: T = archive_options().deserialize(fields)?;
    Ok(value.into())
}

fn decode_bundle(codec: &Codec, fields: &[u8]) -> Result<MessageBody, ProtocolError> {
    let frames: Vec<Vec<u8>> = archive_options().deserialize(fields)?;
    let mut messages = Vec::with_capacity(frames.len());

    for frame in frames {
        // bundles do not nest; checked before the child is decoded
        let tag = *frame
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty nested frame".to_string()))?;
        if let Some((_, BaseType::Sequence, _)) = codec.registry().lookup(tag) {
            return Err(ProtocolError::Malformed("nested bundle".to_string()));
        }

        // the bundle is complete, so a short child is corruption
        let (message, consumed) = codec
            .decode(&frame)
            .map_err(|err| ProtocolError::Malformed(format!("nested frame: {}", err)))?;
        if consumed != frame.len() {
            return Err(ProtocolError::Malformed(format!(
                "nested frame has {} trailing bytes",
                frame.len() - consumed
            )));
        }
        messages.push(message);
    }

    Ok(Bundle { messages }.into())
}

/// Inverse of [`decode_bundle`]: nested frames in archive form.
pub(crate) fn encode_bundle(
    codec: &Codec,
    bundle: &mut Bundle,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    // bundles do not nest
    if bundle
        .messages
        .iter()
        .any(|m| m.base_type() == BaseType::Sequence)
    {
        return Err(ProtocolError::Encode("nested bundle".to_string()));
    }

    let frames = bundle
        .messages
        .iter_mut()
        .map(|m: &mut Message| codec.encode(m))
        .collect::<Result<Vec<_>, _>>()?;

    archive_options()
        .serialize_into(out, &frames)
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_all_types() {
        let registry = Registry::standard();
        assert_eq!(registry.len(), MessageType::ALL.len());
        for ty in MessageType::ALL {
            assert!(registry.contains(ty), "{} not registered", ty);
        }
    }

    #[test]
    fn test_lookup_reports_base_type() {
        let registry = Registry::standard();

        let (ty, base, _) = registry.lookup(8).unwrap();
        assert_eq!(ty, MessageType::Bundle);
        assert_eq!(base, BaseType::Sequence);

        let (ty, base, _) = registry.lookup(5).unwrap();
        assert_eq!(ty, MessageType::Text);
        assert_eq!(base, BaseType::Message);
    }

    #[test]
    fn test_lookup_unknown_tag() {
        let registry = Registry::standard();
        assert!(registry.lookup(0).is_none());
        assert!(registry.lookup(99).is_none());
    }

    #[test]
    fn test_empty_registry_knows_nothing() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());
        assert!(registry.lookup(5).is_none());

        registry.register::<Text>();
        assert!(registry.lookup(5).is_some());
        assert!(registry.lookup(1).is_none());
    }
}
