//! # rmidid-session
//!
//! The RTP-MIDI session peer: a sans-I/O protocol state machine covering
//! the invitation handshake (initiator and responder), clock
//! synchronisation, MIDI ingress/egress with wrap-aware sequence tracking,
//! receiver feedback and session teardown.
//!
//! The peer talks to the world exclusively through signals and explicit
//! entry points, so the same state machine runs against real UDP sockets
//! and against scripted byte streams in tests.

pub mod clock;
pub mod error;
pub mod peer;

pub use clock::SessionClock;
pub use error::SessionError;
pub use peer::{sequence_newer, DisconnectReason, PortKind, RtpPeer, SessionState};
