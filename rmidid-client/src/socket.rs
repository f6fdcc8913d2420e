//! Datagram socket seam and the even/odd UDP port pair.
//!
//! The driver talks to the network through [`DatagramSocket`] so the
//! protocol logic can be exercised against in-process fakes; production
//! code uses [`UdpSocketPair`], which binds the control/data twin sockets
//! with the pairing invariant enforced at bind time.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

/// Non-blocking datagram transport.
pub trait DatagramSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// File descriptor for reactor registration; `None` for in-process
    /// fakes, which are pumped explicitly instead.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

/// The bound control/data socket pair (control on an even port, data on
/// control + 1).
#[derive(Debug)]
pub struct UdpSocketPair {
    pub control: UdpSocket,
    pub midi: UdpSocket,
}

impl UdpSocketPair {
    /// Binds the pair. With a base port the caller picked, that exact even
    /// port and its successor are used; otherwise free even/odd pairs are
    /// probed.
    pub fn bind(base_port: Option<u16>) -> io::Result<Self> {
        match base_port {
            Some(port) => {
                if port % 2 != 0 || port == u16::MAX {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("control port must be even, got {port}"),
                    ));
                }
                Self::finish(bind_any(port)?, bind_any(port + 1)?)
            }
            None => {
                for _ in 0..16 {
                    let control = bind_any(0)?;
                    let port = control.local_addr()?.port();
                    if port % 2 != 0 || port == u16::MAX {
                        continue;
                    }
                    match bind_same_family(&control, port + 1) {
                        Ok(midi) => return Self::finish(control, midi),
                        Err(_) => continue,
                    }
                }
                Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "no free even/odd UDP port pair found",
                ))
            }
        }
    }

    fn finish(control: UdpSocket, midi: UdpSocket) -> io::Result<Self> {
        control.set_nonblocking(true)?;
        midi.set_nonblocking(true)?;
        Ok(Self { control, midi })
    }
}

/// Binds a wildcard socket, preferring a dual-stack IPv6 bind so both
/// address families are accepted, with an IPv4 fallback for v6-less hosts.
fn bind_any(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port))
        .or_else(|_| UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)))
}

fn bind_same_family(sibling: &UdpSocket, port: u16) -> io::Result<UdpSocket> {
    match sibling.local_addr()? {
        SocketAddr::V4(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::V6(_) => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)),
    }
}

/// Adapts a resolved target to the socket's address family: an IPv4 target
/// sent through a dual-stack IPv6 socket needs the v4-mapped form.
pub(crate) fn adapt_family(local: SocketAddr, target: SocketAddr) -> SocketAddr {
    match (local, target) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => target,
    }
}
