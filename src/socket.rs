//! Control-plane socket handle.
//!
//! A thin wrapper over a connected datagram socket carrying the L2TP
//! control channel for one tunnel. The transport owns the handle
//! exclusively: its reader task reads, its main loop writes, and the
//! socket closes when the transport drops its references on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

/// Size of the receive buffer used by the transport's reader task.
/// Control messages are small; a page-sized buffer covers the largest
/// AVP payloads with room to spare.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Datagram socket for a tunnel's control plane.
///
/// The handle is address-family agnostic: any datagram socket that can
/// be expressed as a [`UdpSocket`] (including an L2TP-over-IP socket
/// converted from a raw fd) can be injected via [`from_socket`].
///
/// [`from_socket`]: Self::from_socket
#[derive(Debug)]
pub struct ControlPlane {
    socket: Arc<UdpSocket>,
}

impl ControlPlane {
    /// Bind a control-plane socket to the given local address.
    ///
    /// The socket is unconnected; call [`connect`] or use
    /// [`ControlPlane::connect`] when the peer address is known, since
    /// [`write`] requires a connected socket.
    ///
    /// [`connect`]: UdpSocket::connect
    /// [`write`]: Self::write
    pub async fn bind(local: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket))
    }

    /// Bind to `local` and connect to `peer`.
    pub async fn connect(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing datagram socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive a datagram, returning its length and source address.
    pub async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Send a datagram to the connected peer.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }
}
