//! Closable UDP socket shared by the receiving and sending adapters.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::{MulticastConfig, MulticastSendConfig};

/// A tokio `UdpSocket` with an explicit close.
///
/// [`close`](Self::close) wakes every pending [`recv_from`](Self::recv_from)
/// with `None` and makes later receives and sends fail immediately. It is the
/// only way to interrupt a receive.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    closed: watch::Sender<bool>,
}

impl DatagramSocket {
    fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            closed: watch::Sender::new(false),
        })
    }

    /// Binds a unicast socket to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the address cannot be bound.
    pub fn bind(addr: SocketAddr, so_receive_buffer_size: Option<usize>) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = so_receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        socket.bind(&addr.into())?;
        Self::from_std(socket.into())
    }

    /// Binds `0.0.0.0:port` with `SO_REUSEADDR` and joins the multicast group.
    ///
    /// # Errors
    ///
    /// Returns the OS error if binding or joining fails.
    pub fn bind_multicast(
        port: u16,
        multicast: &MulticastConfig,
        so_receive_buffer_size: Option<usize>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Some(size) = so_receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into())?;
        socket.join_multicast_v4(
            &multicast.group,
            &multicast.interface.unwrap_or(Ipv4Addr::UNSPECIFIED),
        )?;
        Self::from_std(socket.into())
    }

    /// Binds a sending socket, applying the outgoing multicast options if set.
    ///
    /// # Errors
    ///
    /// Returns the OS error if binding or setting an option fails.
    pub fn bind_sender(
        addr: SocketAddr,
        multicast: Option<&MulticastSendConfig>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(multicast) = multicast {
            if let Some(interface) = multicast.interface {
                socket.set_multicast_if_v4(&interface)?;
            }
            socket.set_multicast_ttl_v4(multicast.time_to_live)?;
            socket.set_multicast_loop_v4(multicast.loopback)?;
        }
        socket.bind(&addr.into())?;
        Self::from_std(socket.into())
    }

    /// Receives one datagram into `buf`.
    ///
    /// Returns `None` once the socket is closed. A datagram longer than `buf`
    /// is truncated.
    ///
    /// # Errors
    ///
    /// Returns the OS error of a failed receive on an open socket.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Ok(None),
            received = self.socket.recv_from(buf) => received.map(Some),
        }
    }

    /// Sends `data` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotConnected`] if the socket is closed, or the
    /// OS error of a failed send.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed"));
        }
        self.socket.send_to(data, target).await
    }

    /// Closes the socket. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// # Errors
    ///
    /// Returns the OS error if the address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
