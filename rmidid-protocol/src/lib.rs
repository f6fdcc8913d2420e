//! # rmidid-protocol
//!
//! Wire protocol implementation for the rmidid RTP-MIDI (AppleMIDI)
//! endpoint.
//!
//! This crate provides:
//! - Bounded big-endian cursors over externally owned storage
//! - Control-channel command framing (IN / OK / NO / CK / BY / RS)
//! - RTP-MIDI data-channel framing (truncated RTP header + MIDI section)
//! - The running-status MIDI codec

pub mod buffer;
pub mod command;
pub mod error;
pub mod midi;
pub mod rtp;

pub use buffer::{ByteReader, ByteWriter};
pub use command::{
    ClockSyncPacket, CommandKind, ControlPacket, EndSessionPacket, ExchangePacket,
    ReceiverFeedbackPacket,
};
pub use error::ProtocolError;
pub use midi::{MidiDecoder, MidiEvent};
pub use rtp::{MidiPacket, MidiPacketHeader};

/// AppleMIDI protocol version carried in the invitation exchange.
pub const PROTOCOL_VERSION: u32 = 2;

/// Default control port for RTP-MIDI endpoints.
pub const DEFAULT_PORT: u16 = 5004;

/// Maximum length of a peer display name on the wire.
pub const MAX_NAME_LEN: usize = 255;
