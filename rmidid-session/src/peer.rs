//! RTP-MIDI session peer.
//!
//! [`RtpPeer`] is the protocol state machine for one session: it frames and
//! parses every control and data packet, runs the two-step invitation
//! handshake (as initiator or responder), answers and evaluates clock-sync
//! exchanges, and translates MIDI between the wire and [`MidiEvent`]s.
//!
//! The peer performs no I/O and owns no timers. Outbound bytes leave
//! through the [`RtpPeer::send`] signal and inbound datagrams enter through
//! [`RtpPeer::on_packet`]; the owning driver routes both and calls the
//! timeout entry points when its timers fire. Subscribers of a peer signal
//! must not call back into the peer from inside the emission.

use bytes::Bytes;

use rmidid_protocol::buffer::ByteWriter;
use rmidid_protocol::command::is_control;
use rmidid_protocol::rtp::{self, is_rtp_midi};
use rmidid_protocol::{
    ClockSyncPacket, CommandKind, ControlPacket, EndSessionPacket, ExchangePacket, MidiDecoder,
    MidiEvent, MidiPacket, MidiPacketHeader, ProtocolError, ReceiverFeedbackPacket,
};
use rmidid_reactor::Signal;

use crate::clock::{SessionClock, TICKS_PER_MS};
use crate::error::SessionError;

/// Largest datagram the peer frames or accepts; matches the usual Ethernet
/// MTU bound the original daemon uses.
pub const MAX_PACKET: usize = 1500;

/// Which of the session's two UDP channels a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Control,
    Midi,
}

/// Session life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    /// Initiator: control-channel invitation sent, awaiting `OK`.
    ControlConnecting,
    /// Responder: control-channel invitation accepted, awaiting the
    /// data-channel invitation.
    ControlConnected,
    /// Initiator: data-channel invitation sent, awaiting `OK`.
    MidiConnecting,
    Connected,
    Disconnected,
}

/// Why a session ended; carried by the `disconnected` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local `disconnect()` call.
    Requested,
    ConnectionRejected,
    Timeout,
    PeerShutdown,
    CkTimeout,
    NetworkError(i32),
    AllEndpointsUnreachable,
}

/// Wrap-aware RTP sequence comparison: `candidate` is newer than `last`
/// within a half-window of 2^15.
pub fn sequence_newer(last: u16, candidate: u16) -> bool {
    (candidate.wrapping_sub(last) as i16) > 0
}

/// Protocol state machine for one RTP-MIDI session.
pub struct RtpPeer {
    state: SessionState,
    local_name: String,
    initiator_token: u32,
    local_ssrc: u32,
    remote_ssrc: Option<u32>,
    remote_name: Option<String>,
    /// Next outbound RTP sequence number.
    sequence: u16,
    /// Highest inbound sequence accepted so far.
    remote_sequence: Option<u16>,
    /// Our highest sequence the remote has acknowledged via `RS`.
    acked_sequence: Option<u16>,
    clock: SessionClock,
    // Framing scratch, part of the struct so sends never allocate for the
    // wire image itself.
    scratch: [u8; MAX_PACKET],

    /// Outbound wire bytes for the driver to route.
    pub send: Signal<(Bytes, PortKind)>,
    /// Raw inbound data packet, pre-decode, for inspection and tracing.
    pub midi_event: Signal<(PortKind, Bytes)>,
    /// Decoded inbound MIDI events, in arrival order.
    pub decoded_midi: Signal<Vec<MidiEvent>>,
    /// Control-channel handshake accepted (initiator side); the
    /// data-channel invitation has just gone out. Drivers use this to
    /// restart their invitation timer for the second stage.
    pub control_connected: Signal<String>,
    /// Session established; carries the remote display name.
    pub connected: Signal<String>,
    pub disconnected: Signal<DisconnectReason>,
    /// Clock-sync round trip completed; carries the RTT in milliseconds.
    pub ck: Signal<f64>,
}

impl RtpPeer {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            state: SessionState::NotConnected,
            local_name: local_name.into(),
            initiator_token: rand::random(),
            local_ssrc: rand::random(),
            remote_ssrc: None,
            remote_name: None,
            sequence: rand::random(),
            remote_sequence: None,
            acked_sequence: None,
            clock: SessionClock::new(),
            scratch: [0; MAX_PACKET],
            send: Signal::new(),
            midi_event: Signal::new(),
            decoded_midi: Signal::new(),
            control_connected: Signal::new(),
            connected: Signal::new(),
            disconnected: Signal::new(),
            ck: Signal::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    pub fn initiator_token(&self) -> u32 {
        self.initiator_token
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    /// Our highest sequence number the remote has acknowledged.
    pub fn acked_sequence(&self) -> Option<u16> {
        self.acked_sequence
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Rewinds a spent peer to `NotConnected` as a fresh session: new
    /// initiator token, SSRC and sequence number, estimates cleared.
    pub fn reset(&mut self) {
        tracing::debug!("resetting session identity");
        self.state = SessionState::NotConnected;
        self.initiator_token = rand::random();
        self.local_ssrc = rand::random();
        self.sequence = rand::random();
        self.remote_ssrc = None;
        self.remote_name = None;
        self.remote_sequence = None;
        self.acked_sequence = None;
        self.clock.restart();
    }

    /// Starts the handshake: sends `IN` on the control channel. The owner
    /// is expected to arm an invitation timer and call
    /// [`RtpPeer::connect_timeout`] if no reply arrives.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::NotConnected {
            return Err(SessionError::BadState {
                operation: "connect",
                state: self.state,
            });
        }
        tracing::debug!(
            "inviting remote peer (initiator {:#010x}, ssrc {:#010x})",
            self.initiator_token,
            self.local_ssrc
        );
        self.state = SessionState::ControlConnecting;
        self.send_exchange(CommandKind::Invitation, PortKind::Control)
    }

    /// Ends the session locally: sends `BY` and emits
    /// `disconnected(Requested)`.
    pub fn disconnect(&mut self) {
        self.shutdown(DisconnectReason::Requested, true);
    }

    /// Driver timer entry point: the pending invitation went unanswered.
    pub fn connect_timeout(&mut self) {
        if matches!(
            self.state,
            SessionState::ControlConnecting | SessionState::MidiConnecting
        ) {
            tracing::warn!("invitation timed out in {:?}", self.state);
            self.shutdown(DisconnectReason::Timeout, false);
        }
    }

    /// Driver timer entry point: no clock-sync reply inside the liveness
    /// window.
    pub fn ck_timeout(&mut self) {
        if self.state == SessionState::Connected {
            tracing::warn!("no clock-sync reply from remote peer");
            self.shutdown(DisconnectReason::CkTimeout, false);
        }
    }

    /// Driver entry point for a fatal socket error.
    pub fn network_error(&mut self, errno: i32) {
        if self.state != SessionState::Disconnected {
            self.shutdown(DisconnectReason::NetworkError(errno), false);
        }
    }

    /// Sends a `CK0` ping stamped with the current session time.
    pub fn send_ck0(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::BadState {
                operation: "send_ck0",
                state: self.state,
            });
        }
        let now = self.clock.now_ticks();
        self.send_clock_sync(0, [now, 0, 0])
    }

    /// Encodes `events` and sends them as one or more data packets, each
    /// within the short-form payload bound.
    pub fn send_midi(&mut self, events: &[MidiEvent]) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::BadState {
                operation: "send_midi",
                state: self.state,
            });
        }
        let mut start = 0;
        while start < events.len() {
            let mut end = start;
            let mut size = 0;
            while end < events.len() && size + events[end].encoded_len() <= rtp::MAX_SHORT_PAYLOAD {
                size += events[end].encoded_len();
                end += 1;
            }
            let end = end.max(start + 1);
            self.send_data_packet(&events[start..end])?;
            start = end;
        }
        Ok(())
    }

    /// Demultiplexes one inbound datagram. Malformed or out-of-place
    /// packets are logged and dropped; they never end the session by
    /// themselves.
    pub fn on_packet(&mut self, port: PortKind, data: &[u8]) {
        if let Err(err) = self.dispatch(port, data) {
            tracing::warn!("dropping packet on {:?} channel: {}", port, err);
        }
    }

    fn dispatch(&mut self, port: PortKind, data: &[u8]) -> Result<(), SessionError> {
        if is_control(data) {
            let packet = match ControlPacket::decode(data) {
                Ok(packet) => packet,
                Err(ProtocolError::VersionMismatch(version)) if self.in_handshake() => {
                    tracing::error!("remote peer speaks protocol version {version}, rejecting");
                    self.shutdown(DisconnectReason::ConnectionRejected, false);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            match packet {
                ControlPacket::Exchange(p) => self.on_exchange(port, p),
                ControlPacket::ClockSync(p) => self.on_clock_sync(p),
                ControlPacket::EndSession(p) => self.on_end_session(p),
                ControlPacket::ReceiverFeedback(p) => self.on_feedback(p),
            }
        } else if is_rtp_midi(data) {
            self.on_midi_packet(port, data)
        } else {
            let mut code = [0u8; 2];
            for (slot, byte) in code.iter_mut().zip(data) {
                *slot = *byte;
            }
            Err(ProtocolError::BadCommand(code).into())
        }
    }

    fn in_handshake(&self) -> bool {
        matches!(
            self.state,
            SessionState::ControlConnecting
                | SessionState::MidiConnecting
                | SessionState::ControlConnected
        )
    }

    fn on_exchange(&mut self, port: PortKind, packet: ExchangePacket) -> Result<(), SessionError> {
        use CommandKind::*;
        use SessionState::*;
        match (packet.command, self.state, port) {
            // Initiator flow.
            (InvitationAccepted, ControlConnecting, PortKind::Control) => {
                if !self.token_matches(&packet) {
                    return Ok(());
                }
                tracing::debug!(
                    "control invitation accepted by \"{}\" (ssrc {:#010x})",
                    packet.name,
                    packet.ssrc
                );
                self.remote_ssrc = Some(packet.ssrc);
                let name = packet.name.clone();
                self.remote_name = Some(packet.name);
                self.state = MidiConnecting;
                let result = self.send_exchange(Invitation, PortKind::Midi);
                self.control_connected.emit(&name);
                result
            }
            (InvitationAccepted, MidiConnecting, PortKind::Midi) => {
                if !self.token_matches(&packet) {
                    return Ok(());
                }
                self.state = Connected;
                let name = self.remote_name.clone().unwrap_or_default();
                tracing::info!("session established with \"{name}\"");
                self.connected.emit(&name);
                self.send_ck0()
            }
            (InvitationRejected, ControlConnecting | MidiConnecting, _) => {
                tracing::info!("invitation rejected by remote peer");
                self.shutdown(DisconnectReason::ConnectionRejected, false);
                Ok(())
            }
            // Responder flow: a remote initiator invites us.
            (Invitation, NotConnected, PortKind::Control) => {
                tracing::debug!(
                    "invitation from \"{}\" (initiator {:#010x}, ssrc {:#010x})",
                    packet.name,
                    packet.initiator_token,
                    packet.ssrc
                );
                self.initiator_token = packet.initiator_token;
                self.remote_ssrc = Some(packet.ssrc);
                self.remote_name = Some(packet.name);
                self.state = ControlConnected;
                self.send_exchange(InvitationAccepted, PortKind::Control)
            }
            (Invitation, ControlConnected, PortKind::Midi) => {
                if packet.initiator_token != self.initiator_token
                    || Some(packet.ssrc) != self.remote_ssrc
                {
                    tracing::warn!("data-channel invitation for a different session, rejecting");
                    self.send_exchange(InvitationRejected, PortKind::Midi)?;
                    self.shutdown(DisconnectReason::ConnectionRejected, false);
                    return Ok(());
                }
                self.send_exchange(InvitationAccepted, PortKind::Midi)?;
                self.state = Connected;
                let name = self.remote_name.clone().unwrap_or_default();
                tracing::info!("session established with \"{name}\"");
                self.connected.emit(&name);
                Ok(())
            }
            (command, state, _) => Err(SessionError::UnexpectedCommand { command, state }),
        }
    }

    /// Validates the initiator token on a handshake reply; a mismatch
    /// rejects the session (the reply belongs to someone else's
    /// invitation).
    fn token_matches(&mut self, packet: &ExchangePacket) -> bool {
        if packet.initiator_token == self.initiator_token {
            return true;
        }
        tracing::error!(
            "handshake reply token {:#010x} does not match outstanding invitation {:#010x}",
            packet.initiator_token,
            self.initiator_token
        );
        self.shutdown(DisconnectReason::ConnectionRejected, false);
        false
    }

    fn on_clock_sync(&mut self, packet: ClockSyncPacket) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::UnexpectedCommand {
                command: CommandKind::ClockSync,
                state: self.state,
            });
        }
        let remote = self.remote_ssrc.unwrap_or_default();
        if packet.ssrc != remote {
            return Err(SessionError::SsrcMismatch {
                expected: remote,
                got: packet.ssrc,
            });
        }

        let now = self.clock.now_ticks();
        let [t0, t1, t2] = packet.timestamps;
        match packet.count {
            // Remote ping: echo T0, stamp T1 with our time.
            0 => self.send_clock_sync(1, [t0, now, 0]),
            // Echo of our ping: close the loop and reply with T2.
            1 => {
                let rtt = now as i64 - t0 as i64;
                let offset = t1 as i64 - (t0 as i64 + rtt / 2);
                self.record_ck(rtt, offset);
                self.send_clock_sync(2, [t0, t1, now])
            }
            // Final reply to a ping the remote originated.
            2 => {
                let rtt = now as i64 - t1 as i64;
                let offset = t2 as i64 - (t1 as i64 + rtt / 2);
                self.record_ck(rtt, offset);
                Ok(())
            }
            count => Err(ProtocolError::InvalidCkCount(count).into()),
        }
    }

    fn record_ck(&mut self, rtt: i64, offset: i64) {
        self.clock.record_estimate(rtt, offset);
        let rtt_ms = rtt as f64 / TICKS_PER_MS as f64;
        tracing::debug!(
            "clock sync: rtt {:.1} ms, offset {:.1} ms",
            rtt_ms,
            offset as f64 / TICKS_PER_MS as f64
        );
        self.ck.emit(&rtt_ms);
    }

    fn on_end_session(&mut self, packet: EndSessionPacket) -> Result<(), SessionError> {
        match self.remote_ssrc {
            Some(remote) if remote == packet.ssrc => {
                tracing::info!("remote peer ended the session");
                self.shutdown(DisconnectReason::PeerShutdown, false);
            }
            _ => {
                tracing::debug!("ignoring BY from unrelated ssrc {:#010x}", packet.ssrc);
            }
        }
        Ok(())
    }

    fn on_feedback(&mut self, packet: ReceiverFeedbackPacket) -> Result<(), SessionError> {
        match self.remote_ssrc {
            Some(remote) if remote == packet.ssrc => {
                tracing::trace!("remote acknowledged sequence {}", packet.sequence);
                self.acked_sequence = Some(packet.sequence);
            }
            _ => {
                tracing::debug!("ignoring RS from unrelated ssrc {:#010x}", packet.ssrc);
            }
        }
        Ok(())
    }

    fn on_midi_packet(&mut self, port: PortKind, data: &[u8]) -> Result<(), SessionError> {
        if port != PortKind::Midi {
            return Err(SessionError::MidiOnControlChannel);
        }
        if self.state != SessionState::Connected {
            return Err(SessionError::BadState {
                operation: "MIDI ingress",
                state: self.state,
            });
        }
        let packet = MidiPacket::decode(data)?;
        let remote = self.remote_ssrc.unwrap_or_default();
        if packet.header.ssrc != remote {
            return Err(SessionError::SsrcMismatch {
                expected: remote,
                got: packet.header.ssrc,
            });
        }

        let sequence = packet.header.sequence;
        if let Some(last) = self.remote_sequence {
            if !sequence_newer(last, sequence) {
                tracing::debug!("dropping reordered data packet (last {last}, got {sequence})");
                return Ok(());
            }
        }
        self.remote_sequence = Some(sequence);

        self.midi_event
            .emit(&(port, Bytes::copy_from_slice(data)));

        let mut events = Vec::new();
        for item in MidiDecoder::new(packet.payload) {
            match item {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!("discarding rest of MIDI payload: {err}");
                    break;
                }
            }
        }
        if !events.is_empty() {
            self.decoded_midi.emit(&events);
        }

        // Acknowledge the new high-water mark on the control channel.
        let feedback = ReceiverFeedbackPacket {
            ssrc: self.local_ssrc,
            sequence,
        };
        let len = {
            let mut writer = ByteWriter::new(&mut self.scratch);
            feedback.encode(&mut writer)?;
            writer.written()
        };
        self.emit_wire(len, PortKind::Control);
        Ok(())
    }

    fn send_exchange(&mut self, command: CommandKind, port: PortKind) -> Result<(), SessionError> {
        let packet = ExchangePacket {
            command,
            initiator_token: self.initiator_token,
            ssrc: self.local_ssrc,
            name: self.local_name.clone(),
        };
        let len = {
            let mut writer = ByteWriter::new(&mut self.scratch);
            packet.encode(&mut writer)?;
            writer.written()
        };
        self.emit_wire(len, port);
        Ok(())
    }

    fn send_clock_sync(&mut self, count: u8, timestamps: [u64; 3]) -> Result<(), SessionError> {
        let packet = ClockSyncPacket {
            ssrc: self.local_ssrc,
            count,
            timestamps,
        };
        let len = {
            let mut writer = ByteWriter::new(&mut self.scratch);
            packet.encode(&mut writer)?;
            writer.written()
        };
        self.emit_wire(len, PortKind::Midi);
        Ok(())
    }

    fn send_data_packet(&mut self, events: &[MidiEvent]) -> Result<(), SessionError> {
        let mut payload = [0u8; rtp::MAX_SHORT_PAYLOAD];
        let payload_len = {
            let mut writer = ByteWriter::new(&mut payload);
            rmidid_protocol::midi::encode_events(events, &mut writer)?;
            writer.written()
        };
        let header = MidiPacketHeader {
            sequence: self.sequence,
            timestamp: self.clock.now_ticks() as u32,
            ssrc: self.local_ssrc,
        };
        let len = {
            let mut writer = ByteWriter::new(&mut self.scratch);
            MidiPacket::encode(header, &payload[..payload_len], &mut writer)?;
            writer.written()
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.emit_wire(len, PortKind::Midi);
        Ok(())
    }

    fn shutdown(&mut self, reason: DisconnectReason, send_by: bool) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if send_by && self.state != SessionState::NotConnected {
            let packet = EndSessionPacket {
                initiator_token: self.initiator_token,
                ssrc: self.local_ssrc,
            };
            let result = {
                let mut writer = ByteWriter::new(&mut self.scratch);
                packet.encode(&mut writer).map(|()| writer.written())
            };
            match result {
                Ok(len) => self.emit_wire(len, PortKind::Control),
                Err(err) => tracing::error!("failed to frame BY: {err}"),
            }
        }
        self.state = SessionState::Disconnected;
        tracing::debug!("session closed: {reason:?}");
        self.disconnected.emit(&reason);
    }

    fn emit_wire(&mut self, len: usize, port: PortKind) {
        let bytes = Bytes::copy_from_slice(&self.scratch[..len]);
        self.send.emit(&(bytes, port));
    }
}
