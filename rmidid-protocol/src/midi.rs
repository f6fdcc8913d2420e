//! MIDI channel-message codec.
//!
//! Translates between structured [`MidiEvent`]s and the running-status byte
//! stream carried in RTP-MIDI payloads. The decoder is lazy: it yields one
//! event per iteration and stops at the first system status byte
//! (`0xF0..=0xFF`). The encoder always emits an explicit status byte per
//! event; running-status compression is never applied on the outbound side.

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::ProtocolError;

/// Status nibbles for the channel voice messages (upper nibble of the
/// status byte; the lower nibble carries the channel).
mod status {
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLY_PRESSURE: u8 = 0xA;
    pub const CONTROL_CHANGE: u8 = 0xB;
    pub const PROGRAM_CHANGE: u8 = 0xC;
    pub const CHANNEL_PRESSURE: u8 = 0xD;
    pub const PITCH_BEND: u8 = 0xE;
}

/// Centre value of the 14-bit pitch-bend range; subtracted on decode and
/// restored on encode so `value` is signed around zero.
const PITCH_BEND_BIAS: i16 = 8192;

/// A decoded MIDI channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyPressure { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, value: i16 },
}

impl MidiEvent {
    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOff { channel, .. }
            | MidiEvent::NoteOn { channel, .. }
            | MidiEvent::PolyPressure { channel, .. }
            | MidiEvent::ControlChange { channel, .. }
            | MidiEvent::ProgramChange { channel, .. }
            | MidiEvent::ChannelPressure { channel, .. }
            | MidiEvent::PitchBend { channel, .. } => channel,
        }
    }

    fn status_byte(&self) -> u8 {
        let nibble = match self {
            MidiEvent::NoteOff { .. } => status::NOTE_OFF,
            MidiEvent::NoteOn { .. } => status::NOTE_ON,
            MidiEvent::PolyPressure { .. } => status::POLY_PRESSURE,
            MidiEvent::ControlChange { .. } => status::CONTROL_CHANGE,
            MidiEvent::ProgramChange { .. } => status::PROGRAM_CHANGE,
            MidiEvent::ChannelPressure { .. } => status::CHANNEL_PRESSURE,
            MidiEvent::PitchBend { .. } => status::PITCH_BEND,
        };
        (nibble << 4) | (self.channel() & 0x0F)
    }

    /// Bytes this event occupies on the wire (status included).
    pub fn encoded_len(&self) -> usize {
        match self {
            MidiEvent::ProgramChange { .. } | MidiEvent::ChannelPressure { .. } => 2,
            _ => 3,
        }
    }
}

/// Lazy running-status decoder over a MIDI payload.
pub struct MidiDecoder<'a> {
    reader: ByteReader<'a>,
    running_status: Option<u8>,
    done: bool,
}

impl<'a> MidiDecoder<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            reader: ByteReader::new(payload),
            running_status: None,
            done: false,
        }
    }

    fn decode_one(&mut self, status: u8, data1: u8) -> Result<MidiEvent, ProtocolError> {
        let channel = status & 0x0F;
        let event = match status >> 4 {
            status::NOTE_OFF => MidiEvent::NoteOff {
                channel,
                key: data1,
                velocity: self.reader.read_u8()?,
            },
            status::NOTE_ON => {
                let velocity = self.reader.read_u8()?;
                // NoteOn at velocity zero is the running-status idiom for
                // NoteOff; normalise it so consumers see one shape.
                if velocity == 0 {
                    MidiEvent::NoteOff {
                        channel,
                        key: data1,
                        velocity,
                    }
                } else {
                    MidiEvent::NoteOn {
                        channel,
                        key: data1,
                        velocity,
                    }
                }
            }
            status::POLY_PRESSURE => MidiEvent::PolyPressure {
                channel,
                key: data1,
                pressure: self.reader.read_u8()?,
            },
            status::CONTROL_CHANGE => MidiEvent::ControlChange {
                channel,
                controller: data1,
                value: self.reader.read_u8()?,
            },
            status::PROGRAM_CHANGE => MidiEvent::ProgramChange {
                channel,
                program: data1,
            },
            status::CHANNEL_PRESSURE => MidiEvent::ChannelPressure {
                channel,
                pressure: data1,
            },
            status::PITCH_BEND => {
                let data2 = self.reader.read_u8()?;
                let raw = ((data2 as i16) << 7) | data1 as i16;
                MidiEvent::PitchBend {
                    channel,
                    value: raw - PITCH_BEND_BIAS,
                }
            }
            _ => unreachable!("status nibbles below 0x8 never reach decode_one"),
        };
        Ok(event)
    }
}

impl Iterator for MidiDecoder<'_> {
    type Item = Result<MidiEvent, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.reader.remaining() == 0 {
            return None;
        }
        let first = match self.reader.read_u8() {
            Ok(b) => b,
            Err(_) => return None,
        };
        let (status, data1) = if first & 0x80 != 0 {
            // System messages terminate the payload for this packet.
            if first >= 0xF0 {
                self.done = true;
                return None;
            }
            self.running_status = Some(first);
            match self.reader.read_u8() {
                Ok(d1) => (first, d1),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        } else {
            match self.running_status {
                Some(status) => (status, first),
                None => {
                    self.done = true;
                    return Some(Err(ProtocolError::OrphanDataByte(first)));
                }
            }
        };
        match self.decode_one(status, data1) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Encodes events into `writer`, one explicit status byte per event.
///
/// An upstream `NoteOff` always goes out with NoteOff status, even at
/// velocity zero.
pub fn encode_events(events: &[MidiEvent], writer: &mut ByteWriter<'_>) -> Result<(), ProtocolError> {
    for event in events {
        writer.write_u8(event.status_byte())?;
        match *event {
            MidiEvent::NoteOff { key, velocity, .. } | MidiEvent::NoteOn { key, velocity, .. } => {
                writer.write_u8(key)?;
                writer.write_u8(velocity)?;
            }
            MidiEvent::PolyPressure { key, pressure, .. } => {
                writer.write_u8(key)?;
                writer.write_u8(pressure)?;
            }
            MidiEvent::ControlChange {
                controller, value, ..
            } => {
                writer.write_u8(controller)?;
                writer.write_u8(value)?;
            }
            MidiEvent::ProgramChange { program, .. } => {
                writer.write_u8(program)?;
            }
            MidiEvent::ChannelPressure { pressure, .. } => {
                writer.write_u8(pressure)?;
            }
            MidiEvent::PitchBend { value, .. } => {
                let raw = (value + PITCH_BEND_BIAS) as u16;
                writer.write_u8((raw & 0x7F) as u8)?;
                writer.write_u8((raw >> 7) as u8)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(payload: &[u8]) -> Vec<MidiEvent> {
        MidiDecoder::new(payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn encode_all(events: &[MidiEvent]) -> Vec<u8> {
        let mut storage = [0u8; 256];
        let mut w = ByteWriter::new(&mut storage);
        encode_events(events, &mut w).unwrap();
        let len = w.written();
        storage[..len].to_vec()
    }

    #[test]
    fn test_decode_explicit_status() {
        let events = decode_all(&[0x90, 60, 100, 0x80, 60, 0]);
        assert_eq!(
            events,
            vec![
                MidiEvent::NoteOn {
                    channel: 0,
                    key: 60,
                    velocity: 100
                },
                MidiEvent::NoteOff {
                    channel: 0,
                    key: 60,
                    velocity: 0
                },
            ]
        );
    }

    #[test]
    fn test_decode_running_status() {
        // One status byte, three note-ons.
        let events = decode_all(&[0x93, 60, 100, 64, 101, 67, 102]);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            MidiEvent::NoteOn {
                channel: 3,
                key: 67,
                velocity: 102
            }
        );
    }

    #[test]
    fn test_note_on_velocity_zero_is_note_off() {
        let events = decode_all(&[0x90, 60, 0]);
        assert_eq!(
            events,
            vec![MidiEvent::NoteOff {
                channel: 0,
                key: 60,
                velocity: 0
            }]
        );
    }

    #[test]
    fn test_pitch_bend_bias() {
        // Centre position: data = 0x00, 0x40 -> raw 8192 -> value 0.
        let events = decode_all(&[0xE5, 0x00, 0x40]);
        assert_eq!(
            events,
            vec![MidiEvent::PitchBend {
                channel: 5,
                value: 0
            }]
        );

        let events = decode_all(&[0xE0, 0x00, 0x00]);
        assert_eq!(
            events,
            vec![MidiEvent::PitchBend {
                channel: 0,
                value: -8192
            }]
        );
    }

    #[test]
    fn test_single_data_byte_kinds() {
        let events = decode_all(&[0xC2, 17, 0xD4, 99]);
        assert_eq!(
            events,
            vec![
                MidiEvent::ProgramChange {
                    channel: 2,
                    program: 17
                },
                MidiEvent::ChannelPressure {
                    channel: 4,
                    pressure: 99
                },
            ]
        );
    }

    #[test]
    fn test_system_status_terminates() {
        let events = decode_all(&[0x90, 60, 100, 0xF8, 0x90, 61, 100]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_orphan_data_byte() {
        let mut decoder = MidiDecoder::new(&[60, 100]);
        assert!(matches!(
            decoder.next(),
            Some(Err(ProtocolError::OrphanDataByte(60)))
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn test_truncated_event() {
        let mut decoder = MidiDecoder::new(&[0x90, 60]);
        assert!(matches!(
            decoder.next(),
            Some(Err(ProtocolError::BufferOverflow { .. }))
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn test_encode_is_explicit_status() {
        let events = [
            MidiEvent::NoteOn {
                channel: 1,
                key: 60,
                velocity: 100,
            },
            MidiEvent::NoteOn {
                channel: 1,
                key: 64,
                velocity: 100,
            },
        ];
        let bytes = encode_all(&events);
        assert_eq!(bytes, vec![0x91, 60, 100, 0x91, 64, 100]);
    }

    #[test]
    fn test_note_off_encodes_as_note_off() {
        let events = [MidiEvent::NoteOff {
            channel: 0,
            key: 60,
            velocity: 0,
        }];
        assert_eq!(encode_all(&events), vec![0x80, 60, 0]);
    }

    #[test]
    fn test_roundtrip_alphabet() {
        let alphabet = [
            MidiEvent::NoteOff {
                channel: 0,
                key: 60,
                velocity: 40,
            },
            MidiEvent::NoteOn {
                channel: 15,
                key: 127,
                velocity: 1,
            },
            MidiEvent::PolyPressure {
                channel: 3,
                key: 10,
                pressure: 70,
            },
            MidiEvent::ControlChange {
                channel: 7,
                controller: 64,
                value: 127,
            },
            MidiEvent::ProgramChange {
                channel: 9,
                program: 42,
            },
            MidiEvent::ChannelPressure {
                channel: 11,
                pressure: 3,
            },
            MidiEvent::PitchBend {
                channel: 14,
                value: 8191,
            },
            MidiEvent::PitchBend {
                channel: 2,
                value: -8192,
            },
        ];

        // Every pair of alphabet events must round-trip through the codec.
        for a in alphabet {
            for b in alphabet {
                let sequence = [a, b];
                let decoded = decode_all(&encode_all(&sequence));
                assert_eq!(decoded, sequence, "roundtrip failed for {sequence:?}");
            }
        }
    }

    #[test]
    fn test_encoded_len_matches_wire() {
        let events = [
            MidiEvent::ProgramChange {
                channel: 0,
                program: 1,
            },
            MidiEvent::NoteOn {
                channel: 0,
                key: 60,
                velocity: 100,
            },
        ];
        let total: usize = events.iter().map(MidiEvent::encoded_len).sum();
        assert_eq!(encode_all(&events).len(), total);
    }
}
