//! Chanlink wire protocol: named channels between peer processes.
//!
//! Each duplex TCP connection exposes a set of named channels. Writing a
//! value on one side makes it the latest value of that channel on the other
//! side. A [`Hub`] listens for peers, dials peers, and fans reads and writes
//! out over every connection it owns.
//!
//! ## Architecture
//!
//! - **Transport**: one connection; framing, acknowledgement flow control,
//!   closing handshake and connect retry
//! - **Hub**: listener plus the set of transports it accepted or dialed
//! - **Codec**: MessagePack or legacy JSON-lines records, optional zlib,
//!   delimiter escaping
//! - **Message**: the wire record and its reserved control channels

pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod retry;
pub mod transport;

pub use codec::{Codec, FrameDecoder};
pub use error::{WireError, WireResult};
pub use hub::{FanOutErrors, Hub, Selector};
pub use message::{Message, Meta};
pub use transport::{
    ChannelHandler, Direction, Transport, TransportEvent, TransportInfo, TransportState,
};

pub use chanlink_types::{EngineConfig, HubConfig, RetryConfig, TransportConfig, WireFormat};
