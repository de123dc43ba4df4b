//! Wire protocol message types.
//!
//! Every record exchanged between two transports is a [`Message`]: a channel
//! name, an opaque payload, a meta tag for protocol bookkeeping and a flag
//! asking the peer to acknowledge receipt.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Channel carrying acknowledgements.
pub const ACK: &str = "__ack";
/// Channel carrying the closing notice.
pub const CLOSING: &str = "__closing";
/// Channel carrying the peer-name assignment.
pub const NAME_CONN: &str = "__name_conn";
/// Channel reserved for bulk (image) payloads.
pub const IMAGE: &str = "__image";
/// Legacy status channel.
pub const STATUS: &str = "__status";

/// Channel names applications may not write to.
pub const RESERVED_CHANNELS: [&str; 5] = [ACK, CLOSING, NAME_CONN, IMAGE, STATUS];

/// Protocol bookkeeping tag carried by every record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Meta {
    /// Ordinary channel data.
    #[default]
    None,
    /// Acknowledges the peer's last ack-required record.
    Acknowledge,
    /// Carries the initiator's peer label.
    NameAssignment,
    /// The peer is closing the connection.
    Closing,
}

impl Meta {
    /// Meta records bypass the write gate.
    pub fn is_control(self) -> bool {
        !matches!(self, Meta::None)
    }

    /// Short tag used by the JSON-lines format.
    pub fn as_tag(self) -> Option<&'static str> {
        match self {
            Meta::None => None,
            Meta::Acknowledge => Some("ack"),
            Meta::NameAssignment => Some("name"),
            Meta::Closing => Some("closing"),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ack" => Some(Meta::Acknowledge),
            "name" => Some(Meta::NameAssignment),
            "closing" => Some(Meta::Closing),
            _ => None,
        }
    }
}

/// A single wire record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Channel name.
    #[serde(rename = "type")]
    pub channel: String,
    /// Opaque payload.
    pub data: Bytes,
    /// Protocol tag.
    #[serde(default)]
    pub meta: Meta,
    /// The receiver must answer with an acknowledgement.
    #[serde(default, rename = "ackRequired")]
    pub ack_required: bool,
}

impl Message {
    /// A channel data record.
    pub fn data(channel: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            meta: Meta::None,
            ack_required: false,
        }
    }

    pub fn ack() -> Self {
        Self {
            channel: ACK.to_string(),
            data: Bytes::new(),
            meta: Meta::Acknowledge,
            ack_required: false,
        }
    }

    pub fn closing() -> Self {
        Self {
            channel: CLOSING.to_string(),
            data: Bytes::new(),
            meta: Meta::Closing,
            ack_required: false,
        }
    }

    pub fn name_assignment(name: &str) -> Self {
        Self {
            channel: NAME_CONN.to_string(),
            data: Bytes::copy_from_slice(name.as_bytes()),
            meta: Meta::NameAssignment,
            ack_required: false,
        }
    }

    /// Bulk payload on the reserved image channel; always acknowledged.
    pub fn image(data: impl Into<Bytes>) -> Self {
        Self {
            channel: IMAGE.to_string(),
            data: data.into(),
            meta: Meta::None,
            ack_required: true,
        }
    }

    /// Whether this record bypasses the write gate.
    pub fn is_control(&self) -> bool {
        self.meta.is_control()
    }
}

/// Why a channel name was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelNameError {
    Empty,
    Reserved,
    Separator,
}

impl std::fmt::Display for ChannelNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "channel name is empty"),
            Self::Reserved => write!(f, "channel name is reserved"),
            Self::Separator => write!(f, "channel name contains a record separator"),
        }
    }
}

/// Check a channel name supplied by the application.
pub fn validate_channel(channel: &str) -> Result<(), ChannelNameError> {
    if channel.is_empty() {
        return Err(ChannelNameError::Empty);
    }
    if channel.contains(['\0', '\n']) {
        return Err(ChannelNameError::Separator);
    }
    if is_reserved(channel) {
        return Err(ChannelNameError::Reserved);
    }
    Ok(())
}

pub fn is_reserved(channel: &str) -> bool {
    RESERVED_CHANNELS.contains(&channel)
}
