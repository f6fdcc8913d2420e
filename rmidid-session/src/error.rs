//! Session error types.

use crate::peer::SessionState;
use rmidid_protocol::{CommandKind, ProtocolError};
use thiserror::Error;

/// Errors raised while driving a session peer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("initiator token mismatch: expected {expected:#010x}, got {got:#010x}")]
    TokenMismatch { expected: u32, got: u32 },

    #[error("unexpected SSRC {got:#010x} (session peer is {expected:#010x})")]
    SsrcMismatch { expected: u32, got: u32 },

    #[error("{operation} is invalid in state {state:?}")]
    BadState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("unexpected {command:?} in state {state:?}")]
    UnexpectedCommand {
        command: CommandKind,
        state: SessionState,
    },

    #[error("MIDI data on the control channel")]
    MidiOnControlChannel,
}
