//! RTP-MIDI data-channel framing.
//!
//! Data packets carry a truncated RTP header followed by a MIDI payload
//! section:
//!
//! ```text
//! +--------+--------+----------+-----------+--------+-------+----------+
//! | V/P/X/ | M + PT | sequence | timestamp | SSRC   | flags | MIDI     |
//! | CC     | (=97)  | 2 bytes  | 4 bytes   | 4 bytes| 1-2 B | payload  |
//! +--------+--------+----------+-----------+--------+-------+----------+
//! ```
//!
//! The flag byte's top nibble is `B J Z P`: `B` selects the 12-bit length
//! form (length low bits then spill into a second byte), `J` announces a
//! trailing recovery journal, `Z` marks the first command as carrying no
//! delta time, and `P` marks running status carried over from the previous
//! packet. This endpoint always sends short form, no journal, `Z` set and
//! `P` clear; on receive it accepts every combination, skipping a leading
//! delta time when `Z` is clear and ignoring any trailing journal.

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::ProtocolError;

/// RTP payload type used by RTP-MIDI streams.
pub const PAYLOAD_TYPE: u8 = 97;

/// Longest MIDI payload expressible in a short-form (B=0) packet.
pub const MAX_SHORT_PAYLOAD: usize = 15;

/// Payload flag bits (top nibble of the flag byte).
pub const FLAG_B: u8 = 0x80;
pub const FLAG_J: u8 = 0x40;
pub const FLAG_Z: u8 = 0x20;
pub const FLAG_P: u8 = 0x10;

/// Returns whether `data` looks like an RTP-MIDI data packet: RTP version 2
/// and payload type 97 (marker bit ignored).
pub fn is_rtp_midi(data: &[u8]) -> bool {
    data.len() >= 13 && (data[0] & 0xC0) == 0x80 && (data[1] & 0x7F) == PAYLOAD_TYPE
}

/// Fixed RTP header fields of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiPacketHeader {
    pub sequence: u16,
    /// Low 32 bits of the sender's 10 kHz clock.
    pub timestamp: u32,
    pub ssrc: u32,
}

/// A decoded data packet; `payload` borrows the MIDI command section.
#[derive(Debug, PartialEq, Eq)]
pub struct MidiPacket<'a> {
    pub header: MidiPacketHeader,
    pub payload: &'a [u8],
}

impl<'a> MidiPacket<'a> {
    pub fn decode(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        let b0 = reader.read_u8()?;
        let b1 = reader.read_u8()?;
        if (b0 & 0xC0) != 0x80 || (b1 & 0x7F) != PAYLOAD_TYPE {
            return Err(ProtocolError::BadRtpHeader);
        }
        let header = MidiPacketHeader {
            sequence: reader.read_u16()?,
            timestamp: reader.read_u32()?,
            ssrc: reader.read_u32()?,
        };

        let flags = reader.read_u8()?;
        let length = if flags & FLAG_B != 0 {
            (((flags & 0x0F) as usize) << 8) | reader.read_u8()? as usize
        } else {
            (flags & 0x0F) as usize
        };
        let mut list = reader.read_bytes(length)?;
        if flags & FLAG_Z == 0 {
            list = skip_delta_time(list)?;
        }
        // Bytes past the command list belong to the journal (J flag); they
        // are left unconsumed and uninterpreted.
        Ok(Self {
            header,
            payload: list,
        })
    }

    /// Encodes a short-form data packet (B=0, J=0, Z=1, P=0).
    pub fn encode(
        header: MidiPacketHeader,
        midi: &[u8],
        writer: &mut ByteWriter<'_>,
    ) -> Result<(), ProtocolError> {
        if midi.len() > MAX_SHORT_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong(midi.len()));
        }
        writer.write_u8(0x80)?; // V=2, no padding, no extension, no CSRC
        writer.write_u8(PAYLOAD_TYPE)?; // marker clear
        writer.write_u16(header.sequence)?;
        writer.write_u32(header.timestamp)?;
        writer.write_u32(header.ssrc)?;
        writer.write_u8(FLAG_Z | midi.len() as u8)?;
        writer.write_bytes(midi)
    }
}

/// Skips the variable-length delta time opening a command list (MSB
/// continuation, at most four bytes).
fn skip_delta_time(list: &[u8]) -> Result<&[u8], ProtocolError> {
    let mut used = 0;
    loop {
        if used >= list.len() {
            return Err(ProtocolError::BufferOverflow {
                needed: used + 1,
                available: list.len(),
            });
        }
        let byte = list[used];
        used += 1;
        if byte & 0x80 == 0 || used == 4 {
            return Ok(&list[used..]);
        }
    }
}
