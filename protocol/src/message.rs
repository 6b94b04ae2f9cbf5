//! Typed messages exchanged between netplay peers.
//!
//! Every message is identified on the wire by its [`MessageType`] tag. Most
//! variants are plain `serde` structs; [`Bundle`] is the sequence container and
//! carries other messages as nested frames.

use crate::checksum::Digest;
use crate::compression::DEFAULT_COMPRESSION_LEVEL;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Version = 1,
    IpAddrPort = 2,
    ClientMode = 3,
    NetplayConfig = 4,
    Text = 5,
    ErrorMessage = 6,
    PlayerInputs = 7,
    Bundle = 8,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Version,
        MessageType::IpAddrPort,
        MessageType::ClientMode,
        MessageType::NetplayConfig,
        MessageType::Text,
        MessageType::ErrorMessage,
        MessageType::PlayerInputs,
        MessageType::Bundle,
    ];
}

impl From<MessageType> for u8 {
    fn from(ty: MessageType) -> u8 {
        ty as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|ty| *ty as u8 == tag)
            .ok_or(tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Version => "Version",
            MessageType::IpAddrPort => "IpAddrPort",
            MessageType::ClientMode => "ClientMode",
            MessageType::NetplayConfig => "NetplayConfig",
            MessageType::Text => "Text",
            MessageType::ErrorMessage => "ErrorMessage",
            MessageType::PlayerInputs => "PlayerInputs",
            MessageType::Bundle => "Bundle",
        };
        f.write_str(name)
    }
}

/// Structural kind of a message, which decides its base fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// Self-contained message without base fields.
    Message,
    /// Container of messages, prefixed with a `u32` sequence number.
    Sequence,
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseType::Message => f.write_str("SerializableMessage"),
            BaseType::Sequence => f.write_str("SerializableSequence"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub code: String,
    pub revision: String,
    pub build_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddrPort {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientModeKind {
    Host,
    Client,
    Spectate,
    Broadcast,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMode {
    pub mode: ClientModeKind,
    pub flags: u8,
}

/// Session parameters agreed on by both players before a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetplayConfig {
    pub delay: u8,
    pub rollback: u8,
    pub host_player: u8,
    pub win_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

/// A run of controller states starting at `start_frame`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInputs {
    pub start_frame: u32,
    pub index: u32,
    pub inputs: Vec<u16>,
}

/// Sequence container. Each inner message is stored as its own encoded frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bundle {
    pub messages: Vec<Message>,
}

/// A `serde` message variant with a fixed wire tag.
pub trait Variant: Serialize + DeserializeOwned + Into<MessageBody> {
    const TYPE: MessageType;
    const BASE: BaseType = BaseType::Message;
}

macro_rules! variants {
    ($($name:ident),* $(,)?) => {
        $(
            impl Variant for $name {
                const TYPE: MessageType = MessageType::$name;
            }

            impl From<$name> for MessageBody {
                fn from(v: $name) -> Self {
                    MessageBody::$name(v)
                }
            }
        )*
    };
}

variants!(
    Version,
    IpAddrPort,
    ClientMode,
    NetplayConfig,
    Text,
    ErrorMessage,
    PlayerInputs,
);

impl From<Bundle> for MessageBody {
    fn from(b: Bundle) -> Self {
        MessageBody::Bundle(b)
    }
}

/// Type-specific contents of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Version(Version),
    IpAddrPort(IpAddrPort),
    ClientMode(ClientMode),
    NetplayConfig(NetplayConfig),
    Text(Text),
    ErrorMessage(ErrorMessage),
    PlayerInputs(PlayerInputs),
    Bundle(Bundle),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Version(_) => MessageType::Version,
            MessageBody::IpAddrPort(_) => MessageType::IpAddrPort,
            MessageBody::ClientMode(_) => MessageType::ClientMode,
            MessageBody::NetplayConfig(_) => MessageType::NetplayConfig,
            MessageBody::Text(_) => MessageType::Text,
            MessageBody::ErrorMessage(_) => MessageType::ErrorMessage,
            MessageBody::PlayerInputs(_) => MessageType::PlayerInputs,
            MessageBody::Bundle(_) => MessageType::Bundle,
        }
    }

    pub fn base_type(&self) -> BaseType {
        match self {
            MessageBody::Bundle(_) => BaseType::Sequence,
            _ => BaseType::Message,
        }
    }
}

/// A message together with its transport metadata.
///
/// The digest is computed lazily on first encode and cached; once present the
/// message content is frozen. Mutable access through [`Message::body_mut`] or
/// [`Message::set_sequence`] drops the cached digest.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) body: MessageBody,
    pub(crate) sequence: u32,
    pub(crate) compression_level: u8,
    pub(crate) digest: Option<Digest>,
}

impl Message {
    pub fn new(body: impl Into<MessageBody>) -> Self {
        Self {
            body: body.into(),
            sequence: 0,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            digest: None,
        }
    }

    pub fn with_compression(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the sequence number. Only `BaseType::Sequence` messages carry it
    /// on the wire.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.set_sequence(sequence);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn base_type(&self) -> BaseType {
        self.body.base_type()
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut MessageBody {
        self.digest = None;
        &mut self.body
    }

    pub fn into_body(self) -> MessageBody {
        self.body
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.digest = None;
        self.sequence = sequence;
    }

    pub fn compression_level(&self) -> u8 {
        self.compression_level
    }

    pub fn set_compression_level(&mut self, level: u8) {
        self.compression_level = level;
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn is_digest_computed(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::Version(v) => write!(f, "{:?}", v),
            MessageBody::IpAddrPort(v) => write!(f, "{:?}", v),
            MessageBody::ClientMode(v) => write!(f, "{:?}", v),
            MessageBody::NetplayConfig(v) => write!(f, "{:?}", v),
            MessageBody::Text(v) => write!(f, "{:?}", v),
            MessageBody::ErrorMessage(v) => write!(f, "{:?}", v),
            MessageBody::PlayerInputs(v) => write!(f, "{:?}", v),
            MessageBody::Bundle(b) => {
                write!(f, "Bundle[{}] {{ ", self.sequence)?;
                for (i, m) in b.messages.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, " }}")
            }
        }
    }
}
