//! AppleMIDI control-channel commands.
//!
//! Every control packet starts with the two-byte magic `0xFF 0xFF` followed
//! by a two-byte ASCII command code:
//!
//! ```text
//! +------+------+---------------------------------------------+
//! | 0xFF | 0xFF | 'I''N' / 'O''K' / 'N''O' / 'C''K' / 'B''Y' /|
//! |      |      | 'R''S' + command body                       |
//! +------+------+---------------------------------------------+
//! ```
//!
//! Invitation exchange body (IN / OK / NO):
//!
//! ```text
//! version (u32, =2) | initiator token (u32) | SSRC (u32) | name NUL-terminated
//! ```
//!
//! Clock sync body (CK):
//!
//! ```text
//! SSRC (u32) | count (u8, 0..=2) | 3 reserved bytes | T0 T1 T2 (u64 each,
//! 1/10 ms ticks)
//! ```
//!
//! End session body (BY): initiator token (u32) | SSRC (u32).
//! Receiver feedback body (RS): SSRC (u32) | sequence (u16) | reserved (u16).

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::ProtocolError;
use crate::{MAX_NAME_LEN, PROTOCOL_VERSION};

/// Magic bytes opening every control-channel packet.
pub const CONTROL_MAGIC: [u8; 2] = [0xFF, 0xFF];

/// Returns whether `data` looks like a control-channel packet.
pub fn is_control(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0xFF && data[1] == 0xFF
}

/// The two-letter command codes of the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `IN` — invitation.
    Invitation,
    /// `OK` — invitation accepted.
    InvitationAccepted,
    /// `NO` — invitation rejected.
    InvitationRejected,
    /// `CK` — clock synchronisation.
    ClockSync,
    /// `BY` — end of session.
    EndSession,
    /// `RS` — receiver feedback (sequence acknowledgement).
    ReceiverFeedback,
}

impl CommandKind {
    pub fn code(&self) -> [u8; 2] {
        match self {
            CommandKind::Invitation => *b"IN",
            CommandKind::InvitationAccepted => *b"OK",
            CommandKind::InvitationRejected => *b"NO",
            CommandKind::ClockSync => *b"CK",
            CommandKind::EndSession => *b"BY",
            CommandKind::ReceiverFeedback => *b"RS",
        }
    }

    pub fn from_code(code: [u8; 2]) -> Result<Self, ProtocolError> {
        match &code {
            b"IN" => Ok(CommandKind::Invitation),
            b"OK" => Ok(CommandKind::InvitationAccepted),
            b"NO" => Ok(CommandKind::InvitationRejected),
            b"CK" => Ok(CommandKind::ClockSync),
            b"BY" => Ok(CommandKind::EndSession),
            b"RS" => Ok(CommandKind::ReceiverFeedback),
            _ => Err(ProtocolError::BadCommand(code)),
        }
    }
}

/// Body shared by the invitation exchange commands (`IN`, `OK`, `NO`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePacket {
    pub command: CommandKind,
    pub initiator_token: u32,
    pub ssrc: u32,
    pub name: String,
}

impl ExchangePacket {
    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), ProtocolError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::NameTooLong(self.name.len()));
        }
        writer.write_bytes(&CONTROL_MAGIC)?;
        writer.write_bytes(&self.command.code())?;
        writer.write_u32(PROTOCOL_VERSION)?;
        writer.write_u32(self.initiator_token)?;
        writer.write_u32(self.ssrc)?;
        writer.write_str_nul(&self.name)
    }

    fn decode_body(command: CommandKind, reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let version = reader.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let initiator_token = reader.read_u32()?;
        let ssrc = reader.read_u32()?;
        // Some stacks omit the NUL terminator on the trailing name; accept
        // both forms.
        let raw = reader.read_bytes(reader.remaining())?;
        let raw = raw.split(|&b| b == 0).next().unwrap_or(raw);
        let name = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_owned();
        Ok(Self {
            command,
            initiator_token,
            ssrc,
            name,
        })
    }
}

/// `CK` clock-synchronisation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncPacket {
    pub ssrc: u32,
    pub count: u8,
    /// T0, T1, T2 in 1/10 ms ticks. Slots past `count` are zero on the wire.
    pub timestamps: [u64; 3],
}

impl ClockSyncPacket {
    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), ProtocolError> {
        if self.count > 2 {
            return Err(ProtocolError::InvalidCkCount(self.count));
        }
        writer.write_bytes(&CONTROL_MAGIC)?;
        writer.write_bytes(&CommandKind::ClockSync.code())?;
        writer.write_u32(self.ssrc)?;
        writer.write_u8(self.count)?;
        writer.write_bytes(&[0, 0, 0])?;
        for t in self.timestamps {
            writer.write_u64(t)?;
        }
        Ok(())
    }

    fn decode_body(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let ssrc = reader.read_u32()?;
        let count = reader.read_u8()?;
        if count > 2 {
            return Err(ProtocolError::InvalidCkCount(count));
        }
        reader.skip(3)?;
        let timestamps = [reader.read_u64()?, reader.read_u64()?, reader.read_u64()?];
        Ok(Self {
            ssrc,
            count,
            timestamps,
        })
    }
}

/// `BY` end-of-session body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndSessionPacket {
    pub initiator_token: u32,
    pub ssrc: u32,
}

impl EndSessionPacket {
    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), ProtocolError> {
        writer.write_bytes(&CONTROL_MAGIC)?;
        writer.write_bytes(&CommandKind::EndSession.code())?;
        writer.write_u32(self.initiator_token)?;
        writer.write_u32(self.ssrc)
    }

    fn decode_body(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            initiator_token: reader.read_u32()?,
            ssrc: reader.read_u32()?,
        })
    }
}

/// `RS` receiver-feedback body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverFeedbackPacket {
    pub ssrc: u32,
    /// Highest sequence number seen by the receiver.
    pub sequence: u16,
}

impl ReceiverFeedbackPacket {
    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<(), ProtocolError> {
        writer.write_bytes(&CONTROL_MAGIC)?;
        writer.write_bytes(&CommandKind::ReceiverFeedback.code())?;
        writer.write_u32(self.ssrc)?;
        writer.write_u16(self.sequence)?;
        writer.write_u16(0)
    }

    fn decode_body(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            ssrc: reader.read_u32()?,
            sequence: reader.read_u16()?,
        })
    }
}

/// A parsed control-channel packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPacket {
    Exchange(ExchangePacket),
    ClockSync(ClockSyncPacket),
    EndSession(EndSessionPacket),
    ReceiverFeedback(ReceiverFeedbackPacket),
}

impl ControlPacket {
    /// Decodes a whole control-channel datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        let magic: [u8; 2] = reader.read_bytes(2)?.try_into().unwrap();
        if magic != CONTROL_MAGIC {
            return Err(ProtocolError::BadCommand(magic));
        }
        let code: [u8; 2] = reader.read_bytes(2)?.try_into().unwrap();
        let kind = CommandKind::from_code(code)?;
        match kind {
            CommandKind::Invitation
            | CommandKind::InvitationAccepted
            | CommandKind::InvitationRejected => {
                Ok(Self::Exchange(ExchangePacket::decode_body(kind, &mut reader)?))
            }
            CommandKind::ClockSync => Ok(Self::ClockSync(ClockSyncPacket::decode_body(&mut reader)?)),
            CommandKind::EndSession => {
                Ok(Self::EndSession(EndSessionPacket::decode_body(&mut reader)?))
            }
            CommandKind::ReceiverFeedback => Ok(Self::ReceiverFeedback(
                ReceiverFeedbackPacket::decode_body(&mut reader)?,
            )),
        }
    }
}
