//! RTP-MIDI connection driver.
//!
//! [`RtpClient`] owns a session peer, its socket pair and every timer the
//! session needs: it resolves endpoints at use time, walks the endpoint
//! list on invitation failures, keeps the session alive with the clock-sync
//! cadence, and reconnects when an established session drops out from
//! under it. All orchestration state lives behind `Rc`/`RefCell` and every
//! reactor callback captures a `Weak` handle, so dropping the client drops
//! its registrations and the reactor never keeps a dead session alive.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use rmidid_protocol::{MidiEvent, DEFAULT_PORT};
use rmidid_reactor::{FdToken, Poller, Signal, SignalToken, TimerToken};
use rmidid_session::peer::MAX_PACKET;
use rmidid_session::{DisconnectReason, PortKind, RtpPeer, SessionState};

use crate::error::ClientError;
use crate::socket::{adapt_family, DatagramSocket, UdpSocketPair};

/// One remote endpoint to invite. The port is kept as a string and parsed
/// at resolve time; empty means the protocol default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub hostname: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: port.into(),
        }
    }

    /// Resolves to the remote control-port address. Resolution happens per
    /// attempt, never at list submission, so DNS changes between retries
    /// are honoured.
    fn resolve(&self) -> io::Result<SocketAddr> {
        let port: u16 = if self.port.is_empty() {
            DEFAULT_PORT
        } else {
            self.port.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid port {:?}", self.port),
                )
            })?
        };
        if port == 0 || port == u16::MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port {port} cannot carry a control/data pair"),
            ));
        }
        (self.hostname.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "hostname did not resolve"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.hostname, self.port)
    }
}

/// Identity and pacing knobs; defaults follow the protocol's standard
/// timings, tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local display name sent in invitations.
    pub name: String,
    /// Even local control port to bind; `None` probes for a free pair.
    pub local_base_port: Option<u16>,
    /// How long each `IN` may wait for its `OK`.
    pub invitation_timeout: Duration,
    /// Pause between consecutive endpoints of one pass.
    pub endpoint_retry_delay: Duration,
    /// Pause between full passes over the endpoint list.
    pub pass_retry_delay: Duration,
    /// Full passes before giving up for good.
    pub max_passes: u32,
    /// Clock-sync cadence right after connecting.
    pub ck_interval_fast: Duration,
    /// Number of fast-cadence pings before slowing down.
    pub ck_fast_sends: u32,
    /// Steady-state clock-sync cadence.
    pub ck_interval_slow: Duration,
    /// Declare the session dead after this long without a CK reply.
    pub ck_timeout: Duration,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_base_port: None,
            invitation_timeout: Duration::from_millis(1000),
            endpoint_retry_delay: Duration::from_millis(200),
            pass_retry_delay: Duration::from_secs(5),
            max_passes: 3,
            ck_interval_fast: Duration::from_secs(1),
            ck_fast_sends: 6,
            ck_interval_slow: Duration::from_secs(10),
            ck_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_local_base_port(mut self, port: u16) -> Self {
        self.local_base_port = Some(port);
        self
    }

    pub fn with_invitation_timeout(mut self, timeout: Duration) -> Self {
        self.invitation_timeout = timeout;
        self
    }

    pub fn with_endpoint_retry_delay(mut self, delay: Duration) -> Self {
        self.endpoint_retry_delay = delay;
        self
    }

    pub fn with_pass_retry_delay(mut self, delay: Duration) -> Self {
        self.pass_retry_delay = delay;
        self
    }

    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes;
        self
    }

    pub fn with_ck_cadence(mut self, fast: Duration, fast_sends: u32, slow: Duration) -> Self {
        self.ck_interval_fast = fast;
        self.ck_fast_sends = fast_sends;
        self.ck_interval_slow = slow;
        self
    }

    pub fn with_ck_timeout(mut self, timeout: Duration) -> Self {
        self.ck_timeout = timeout;
        self
    }
}

struct SocketPairBoxed {
    control: Box<dyn DatagramSocket>,
    midi: Box<dyn DatagramSocket>,
}

impl SocketPairBoxed {
    fn get(&self, port: PortKind) -> &dyn DatagramSocket {
        match port {
            PortKind::Control => self.control.as_ref(),
            PortKind::Midi => self.midi.as_ref(),
        }
    }
}

/// Orchestration state: endpoint walking, remote addresses and every live
/// timer/watcher token.
#[derive(Default)]
struct Driver {
    endpoints: Vec<Endpoint>,
    pending: VecDeque<Endpoint>,
    pass: u32,
    established: bool,
    closed: bool,
    remote_control: Option<SocketAddr>,
    remote_midi: Option<SocketAddr>,
    ck_sends: u32,
    ck_slow: bool,
    connect_timer: Option<TimerToken>,
    retry_timer: Option<TimerToken>,
    ck_timer: Option<TimerToken>,
    ck_timeout_timer: Option<TimerToken>,
    error_timer: Option<TimerToken>,
    fd_tokens: Vec<FdToken>,
    _peer_tokens: Vec<SignalToken>,
}

struct ClientInner {
    poller: Poller,
    config: ClientConfig,
    peer: RefCell<RtpPeer>,
    sockets: RefCell<Option<SocketPairBoxed>>,
    driver: RefCell<Driver>,
    connected: Signal<String>,
    disconnected: Signal<DisconnectReason>,
}

/// A connecting/connected RTP-MIDI client endpoint.
pub struct RtpClient {
    inner: Rc<ClientInner>,
}

impl RtpClient {
    /// Binds a fresh UDP socket pair and builds the client around it.
    pub fn new(poller: &Poller, config: ClientConfig) -> Result<Self, ClientError> {
        let pair = UdpSocketPair::bind(config.local_base_port)?;
        tracing::debug!(
            "bound control port {}, data port {}",
            pair.control.local_addr()?.port(),
            pair.midi.local_addr()?.port()
        );
        Self::with_sockets(poller, config, pair.control, pair.midi)
    }

    /// Builds the client around caller-provided sockets; the even/odd
    /// pairing invariant is checked here.
    pub fn with_sockets(
        poller: &Poller,
        config: ClientConfig,
        control: impl DatagramSocket + 'static,
        midi: impl DatagramSocket + 'static,
    ) -> Result<Self, ClientError> {
        let control_port = control.local_addr()?.port();
        let data_port = midi.local_addr()?.port();
        if control_port % 2 != 0 || data_port != control_port + 1 {
            return Err(ClientError::BadPortPair {
                control: control_port,
                data: data_port,
            });
        }

        let peer = RtpPeer::new(config.name.clone());
        let inner = Rc::new(ClientInner {
            poller: poller.clone(),
            config,
            peer: RefCell::new(peer),
            sockets: RefCell::new(Some(SocketPairBoxed {
                control: Box::new(control),
                midi: Box::new(midi),
            })),
            driver: RefCell::new(Driver::default()),
            connected: Signal::new(),
            disconnected: Signal::new(),
        });
        ClientInner::wire_peer(&inner);
        ClientInner::register_fds(&inner);
        Ok(Self { inner })
    }

    /// Starts inviting `endpoints` in order. Failures walk the list per the
    /// retry pacing; the terminal outcome arrives on the `disconnected`
    /// signal as `AllEndpointsUnreachable`.
    pub fn connect_to(&self, endpoints: Vec<Endpoint>) -> Result<(), ClientError> {
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }
        {
            let mut driver = self.inner.driver.borrow_mut();
            if driver.closed {
                return Err(ClientError::Closed);
            }
            let pending: VecDeque<Endpoint> = endpoints.iter().cloned().collect();
            driver.endpoints = endpoints;
            driver.pending = pending;
            driver.pass = 0;
        }
        ClientInner::start_attempt(&self.inner);
        Ok(())
    }

    /// Ends the session: sends `BY` and emits `disconnected(Requested)`.
    pub fn disconnect(&self) {
        self.inner.peer.borrow_mut().disconnect();
    }

    /// Encodes and sends `events` over the data channel.
    pub fn send_midi(&self, events: &[MidiEvent]) -> Result<(), ClientError> {
        self.inner.peer.borrow_mut().send_midi(events)?;
        Ok(())
    }

    /// Drains both sockets and feeds every datagram to the peer. The fd
    /// watchers call this; tests with fake sockets call it directly.
    pub fn process_incoming(&self) -> io::Result<()> {
        ClientInner::drain(&self.inner, PortKind::Control)?;
        ClientInner::drain(&self.inner, PortKind::Midi)
    }

    pub fn state(&self) -> SessionState {
        self.inner.peer.borrow().state()
    }

    pub fn remote_name(&self) -> Option<String> {
        self.inner.peer.borrow().remote_name().map(str::to_owned)
    }

    /// Local control port, while the sockets are alive.
    pub fn local_base_port(&self) -> Option<u16> {
        let sockets = self.inner.sockets.borrow();
        let pair = sockets.as_ref()?;
        pair.control.local_addr().ok().map(|a| a.port())
    }

    /// Fires once a session is fully established; carries the remote name.
    pub fn connected_signal(&self) -> Signal<String> {
        self.inner.connected.clone()
    }

    /// Fires when the session is over and the driver will not retry.
    pub fn disconnected_signal(&self) -> Signal<DisconnectReason> {
        self.inner.disconnected.clone()
    }

    /// Decoded inbound MIDI, straight from the peer.
    pub fn decoded_midi_signal(&self) -> Signal<Vec<MidiEvent>> {
        self.inner.peer.borrow().decoded_midi.clone()
    }

    /// Raw inbound data packets, for inspection and tracing.
    pub fn midi_event_signal(&self) -> Signal<(PortKind, Bytes)> {
        self.inner.peer.borrow().midi_event.clone()
    }

    /// Clock-sync round trips; carries the RTT in milliseconds.
    pub fn ck_signal(&self) -> Signal<f64> {
        self.inner.peer.borrow().ck.clone()
    }
}

impl ClientInner {
    fn wire_peer(inner: &Rc<Self>) {
        let peer = inner.peer.borrow();
        let mut tokens = Vec::new();

        // Outbound wire routing.
        let weak = Rc::downgrade(inner);
        tokens.push(peer.send.connect(move |packet: &(Bytes, PortKind)| {
            if let Some(inner) = weak.upgrade() {
                Self::send_wire(&inner, packet.1, &packet.0);
            }
        }));

        // Second handshake stage: restart the invitation timer so the
        // data-channel OK gets its own full window.
        let weak = Rc::downgrade(inner);
        tokens.push(peer.control_connected.connect(move |_name: &String| {
            if let Some(inner) = weak.upgrade() {
                Self::arm_connect_timer(&inner);
            }
        }));

        let weak = Rc::downgrade(inner);
        tokens.push(peer.connected.connect(move |name: &String| {
            if let Some(inner) = weak.upgrade() {
                Self::on_peer_connected(&inner, name);
            }
        }));

        let weak = Rc::downgrade(inner);
        tokens.push(peer.disconnected.connect(move |reason: &DisconnectReason| {
            if let Some(inner) = weak.upgrade() {
                Self::on_peer_disconnected(&inner, *reason);
            }
        }));

        // Liveness: every completed round trip pushes the deadline out.
        let weak = Rc::downgrade(inner);
        tokens.push(peer.ck.connect(move |_rtt: &f64| {
            if let Some(inner) = weak.upgrade() {
                Self::arm_ck_timeout(&inner);
            }
        }));

        drop(peer);
        inner.driver.borrow_mut()._peer_tokens = tokens;
    }

    fn register_fds(inner: &Rc<Self>) {
        let mut tokens = Vec::new();
        {
            let sockets = inner.sockets.borrow();
            let Some(pair) = sockets.as_ref() else {
                return;
            };
            for port in [PortKind::Control, PortKind::Midi] {
                if let Some(fd) = pair.get(port).raw_fd() {
                    let weak = Rc::downgrade(inner);
                    tokens.push(inner.poller.add_fd_in(fd, move || {
                        if let Some(inner) = weak.upgrade() {
                            if let Err(err) = Self::drain(&inner, port) {
                                tracing::error!("receive failure on {:?} socket: {}", port, err);
                            }
                        }
                    }));
                }
            }
        }
        inner.driver.borrow_mut().fd_tokens = tokens;
    }

    fn drain(inner: &Rc<Self>, port: PortKind) -> io::Result<()> {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let received = {
                let sockets = inner.sockets.borrow();
                let Some(pair) = sockets.as_ref() else {
                    return Ok(());
                };
                pair.get(port).recv_from(&mut buf)
            };
            match received {
                Ok((len, from)) => {
                    tracing::trace!("{len} bytes from {from} on {port:?} channel");
                    inner.peer.borrow_mut().on_packet(port, &buf[..len]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn send_wire(inner: &Rc<Self>, port: PortKind, bytes: &Bytes) {
        let target = {
            let driver = inner.driver.borrow();
            match port {
                PortKind::Control => driver.remote_control,
                PortKind::Midi => driver.remote_midi,
            }
        };
        let Some(target) = target else {
            tracing::debug!("no remote address for {port:?} channel, dropping packet");
            return;
        };
        let sockets = inner.sockets.borrow();
        let Some(pair) = sockets.as_ref() else {
            tracing::debug!("sockets released, dropping outbound packet");
            return;
        };
        match pair.get(port).send_to(bytes, target) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::warn!("{port:?} socket not writable, dropping packet");
            }
            Err(err) => {
                tracing::error!("send to {target} failed: {err}");
                let errno = err.raw_os_error().unwrap_or(0);
                if errno == libc::EBADF || errno == libc::ENOTSOCK {
                    // The peer may be mid-emission; surface the failure on
                    // the next reactor iteration.
                    let weak = Rc::downgrade(inner);
                    let token = inner.poller.add_timer(Duration::ZERO, move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.peer.borrow_mut().network_error(errno);
                        }
                    });
                    inner.driver.borrow_mut().error_timer = Some(token);
                }
            }
        }
    }

    fn start_attempt(inner: &Rc<Self>) {
        let next = {
            let mut driver = inner.driver.borrow_mut();
            if driver.closed {
                return;
            }
            driver.retry_timer.take();
            driver.pending.pop_front()
        };

        let Some(endpoint) = next else {
            Self::on_pass_exhausted(inner);
            return;
        };

        tracing::debug!("inviting {endpoint}");
        let control_target = match endpoint.resolve() {
            Ok(addr) if addr.port() < u16::MAX => addr,
            Ok(addr) => {
                tracing::warn!("{endpoint} resolved to unpairable port {}", addr.port());
                Self::schedule_retry(inner, inner.config.endpoint_retry_delay);
                return;
            }
            Err(err) => {
                tracing::warn!("failed to resolve {endpoint}: {err}");
                Self::schedule_retry(inner, inner.config.endpoint_retry_delay);
                return;
            }
        };

        let local = {
            let sockets = inner.sockets.borrow();
            match sockets.as_ref() {
                Some(pair) => pair.control.local_addr().ok(),
                None => return,
            }
        };
        let control_target = match local {
            Some(local) => adapt_family(local, control_target),
            None => control_target,
        };
        let mut midi_target = control_target;
        midi_target.set_port(control_target.port() + 1);

        {
            let mut driver = inner.driver.borrow_mut();
            driver.remote_control = Some(control_target);
            driver.remote_midi = Some(midi_target);
        }
        Self::arm_connect_timer(inner);

        let result = {
            let mut peer = inner.peer.borrow_mut();
            if peer.state() != SessionState::NotConnected {
                peer.reset();
            }
            peer.connect()
        };
        if let Err(err) = result {
            tracing::error!("failed to start session with {endpoint}: {err}");
        }
    }

    fn on_pass_exhausted(inner: &Rc<Self>) {
        let give_up = {
            let mut driver = inner.driver.borrow_mut();
            driver.pass += 1;
            if driver.pass >= inner.config.max_passes {
                true
            } else {
                tracing::info!(
                    "endpoint list exhausted (pass {}/{}), retrying in {:?}",
                    driver.pass,
                    inner.config.max_passes,
                    inner.config.pass_retry_delay
                );
                let pending: VecDeque<Endpoint> = driver.endpoints.iter().cloned().collect();
                driver.pending = pending;
                false
            }
        };
        if give_up {
            tracing::error!(
                "giving up after {} passes over the endpoint list",
                inner.config.max_passes
            );
            Self::teardown(inner);
            inner
                .disconnected
                .emit(&DisconnectReason::AllEndpointsUnreachable);
        } else {
            Self::schedule_retry(inner, inner.config.pass_retry_delay);
        }
    }

    fn schedule_retry(inner: &Rc<Self>, delay: Duration) {
        let weak = Rc::downgrade(inner);
        let token = inner.poller.add_timer(delay, move || {
            if let Some(inner) = weak.upgrade() {
                Self::start_attempt(&inner);
            }
        });
        inner.driver.borrow_mut().retry_timer = Some(token);
    }

    fn arm_connect_timer(inner: &Rc<Self>) {
        let weak = Rc::downgrade(inner);
        let token = inner
            .poller
            .add_timer(inner.config.invitation_timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.peer.borrow_mut().connect_timeout();
                }
            });
        inner.driver.borrow_mut().connect_timer = Some(token);
    }

    fn arm_ck_timeout(inner: &Rc<Self>) {
        let weak = Rc::downgrade(inner);
        let token = inner.poller.add_timer(inner.config.ck_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.peer.borrow_mut().ck_timeout();
            }
        });
        inner.driver.borrow_mut().ck_timeout_timer = Some(token);
    }

    fn make_ck_timer(inner: &Rc<Self>, period: Duration) -> TimerToken {
        let weak = Rc::downgrade(inner);
        inner.poller.add_repeat(period, move || {
            if let Some(inner) = weak.upgrade() {
                Self::on_ck_due(&inner);
            }
        })
    }

    fn on_ck_due(inner: &Rc<Self>) {
        let send = {
            let mut driver = inner.driver.borrow_mut();
            if driver.ck_slow {
                true
            } else if driver.ck_sends < inner.config.ck_fast_sends {
                driver.ck_sends += 1;
                true
            } else {
                tracing::debug!(
                    "clock-sync settling done, dropping to {:?} cadence",
                    inner.config.ck_interval_slow
                );
                driver.ck_slow = true;
                driver.ck_timer = Some(Self::make_ck_timer(inner, inner.config.ck_interval_slow));
                false
            }
        };
        if send {
            if let Err(err) = inner.peer.borrow_mut().send_ck0() {
                tracing::debug!("skipping clock-sync ping: {err}");
            }
        }
    }

    fn on_peer_connected(inner: &Rc<Self>, name: &str) {
        tracing::info!("connected to \"{name}\"");
        {
            let mut driver = inner.driver.borrow_mut();
            driver.established = true;
            driver.pass = 0;
            driver.pending.clear();
            driver.connect_timer.take();
            driver.retry_timer.take();
            // The peer already sent its first ping on entering Connected.
            driver.ck_sends = 1;
            driver.ck_slow = false;
            driver.ck_timer = Some(Self::make_ck_timer(inner, inner.config.ck_interval_fast));
        }
        Self::arm_ck_timeout(inner);
        inner.connected.emit(&name.to_owned());
    }

    fn on_peer_disconnected(inner: &Rc<Self>, reason: DisconnectReason) {
        // Timers die before anything else can observe the disconnect.
        let propagate = {
            let mut driver = inner.driver.borrow_mut();
            driver.connect_timer.take();
            driver.ck_timer.take();
            driver.ck_timeout_timer.take();
            driver.ck_slow = false;
            let was_established = driver.established;
            driver.established = false;
            match reason {
                DisconnectReason::Timeout | DisconnectReason::ConnectionRejected
                    if !was_established =>
                {
                    // One endpoint attempt failed; fall through to the next.
                    false
                }
                DisconnectReason::PeerShutdown | DisconnectReason::CkTimeout => {
                    tracing::info!("session lost ({reason:?}), reconnecting");
                    driver.pass = 0;
                    let pending: VecDeque<Endpoint> = driver.endpoints.iter().cloned().collect();
                    driver.pending = pending;
                    false
                }
                _ => true,
            }
        };
        if propagate {
            Self::teardown(inner);
            inner.disconnected.emit(&reason);
        } else {
            Self::schedule_retry(inner, inner.config.endpoint_retry_delay);
        }
    }

    /// Final cleanup: drops every remaining registration and releases both
    /// sockets. Runs before the terminal `disconnected` emission.
    fn teardown(inner: &Rc<Self>) {
        {
            let mut driver = inner.driver.borrow_mut();
            driver.closed = true;
            driver.retry_timer.take();
            driver.error_timer.take();
            driver.fd_tokens.clear();
        }
        *inner.sockets.borrow_mut() = None;
    }
}
