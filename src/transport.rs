//! Socket capability consumed by discovery and sessions.
//!
//! [`Discoverer`](crate::Discoverer) and [`HeosClient`](crate::HeosClient)
//! never open sockets directly; they go through a [`Transport`]. The default
//! [`TokioTransport`] uses real OS sockets, and tests substitute scripted ones.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

/// Bidirectional byte stream carrying a session
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed session stream returned by [`Transport::connect`]
pub type BoxedStream = Box<dyn ByteStream>;

/// Bound datagram endpoint
///
/// Dropping the socket closes it.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram to `target`.
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Wait for the next datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// TCP and UDP socket operations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream connection to `addr`.
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream>;

    /// Bind a datagram endpoint on `local` (port 0 for an ephemeral port).
    async fn bind(&self, local: SocketAddr) -> io::Result<Box<dyn DatagramSocket>>;
}

/// [`Transport`] backed by tokio sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTransport;

/// UPnP recommends a TTL of 4 for SSDP multicast
const MULTICAST_TTL: u32 = 4;

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        Ok(Box::new(stream))
    }

    async fn bind(&self, local: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(bind_udp(local)?))
    }
}

/// Create a non-blocking UDP socket suitable for sending SSDP probes.
fn bind_udp(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        tracing::warn!("Failed to set SO_REUSEADDR on {}: {}", local, e);
    }

    if local.is_ipv4() {
        if let Err(e) = socket.set_multicast_ttl_v4(MULTICAST_TTL) {
            tracing::warn!("Failed to set multicast TTL on {}: {}", local, e);
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}
