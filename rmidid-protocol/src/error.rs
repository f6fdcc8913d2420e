//! Protocol error types.

use thiserror::Error;

/// Errors raised by the framing and codec layers.
///
/// Everything here is recoverable at the packet boundary: callers log the
/// error and drop the offending packet, they never tear down a session over
/// a malformed datagram.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer overflow: needed {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("unrecognised control command: {0:02X?}")]
    BadCommand([u8; 2]),

    #[error("unsupported protocol version: {0} (must be {})", crate::PROTOCOL_VERSION)]
    VersionMismatch(u32),

    #[error("peer name too long: {0} bytes (max {})", crate::MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("invalid clock-sync count: {0}")]
    InvalidCkCount(u8),

    #[error("not an RTP-MIDI data packet")]
    BadRtpHeader,

    #[error("MIDI payload too long for a short-form packet: {0} bytes")]
    PayloadTooLong(usize),

    #[error("data byte {0:#04x} with no running status in effect")]
    OrphanDataByte(u8),

    #[error("invalid UTF-8 in peer name")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferOverflow {
            needed: 4,
            available: 2,
        };
        assert!(err.to_string().contains("needed 4"));

        let err = ProtocolError::BadCommand(*b"XX");
        assert!(err.to_string().contains("58"));

        let err = ProtocolError::VersionMismatch(3);
        assert!(err.to_string().contains('3'));

        let err = ProtocolError::OrphanDataByte(0x40);
        assert!(err.to_string().contains("0x40"));
    }
}
