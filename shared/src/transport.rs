//! UDP sockets of a node.
//!
//! A node owns one unicast socket for all point-to-point traffic. The same
//! socket sources multicast announcements so that listeners can answer the
//! announcing port directly. Nodes that discover games additionally listen
//! on the shared multicast group through a second, port-reusing socket.

use crate::config::NetOptions;
use crate::protocol::{multicast_addr, MULTICAST_GROUP, MULTICAST_PORT};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Receives take `&self` and a caller-owned buffer, so one select loop can
/// wait on both sockets at once.
pub struct Transport {
    unicast: UdpSocket,
    multicast: Option<UdpSocket>,
}

impl Transport {
    /// Binds the unicast socket and, when requested, the discovery socket.
    ///
    /// Failing to join the multicast group is not fatal: the node simply
    /// runs without discovery.
    pub async fn bind(options: NetOptions, listen_multicast: bool) -> io::Result<Self> {
        let port = options.port.unwrap_or(0);
        let unicast = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        if let Err(e) = unicast.set_multicast_loop_v4(true) {
            debug!("Could not enable multicast loopback: {}", e);
        }
        if let Err(e) = unicast.set_multicast_ttl_v4(1) {
            debug!("Could not set multicast TTL: {}", e);
        }

        let multicast = if options.multicast && listen_multicast {
            match bind_multicast() {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("Discovery disabled, cannot join {}: {}", multicast_addr(), e);
                    None
                }
            }
        } else {
            None
        };

        info!("Unicast socket bound to {}", unicast.local_addr()?);

        Ok(Self { unicast, multicast })
    }

    /// Binds `preferred` if it is free, otherwise lets the OS pick a port.
    pub async fn bind_preferring(
        options: NetOptions,
        preferred: u16,
        listen_multicast: bool,
    ) -> io::Result<Self> {
        let wanted = NetOptions {
            port: Some(preferred),
            ..options
        };
        match Self::bind(wanted, listen_multicast).await {
            Ok(transport) => Ok(transport),
            Err(e) => {
                warn!("Port {} unavailable ({}), using an ephemeral port", preferred, e);
                Self::bind(NetOptions { port: None, ..options }, listen_multicast).await
            }
        }
    }

    pub fn unicast_address(&self) -> io::Result<SocketAddr> {
        self.unicast.local_addr()
    }

    pub fn unicast_port(&self) -> u16 {
        self.unicast.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn multicast_enabled(&self) -> bool {
        self.multicast.is_some()
    }

    pub async fn send_unicast(&self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.unicast.send_to(data, addr).await?;
        Ok(())
    }

    /// Sends to the discovery group from the unicast port.
    pub async fn send_multicast(&self, data: &[u8]) -> io::Result<()> {
        self.unicast.send_to(data, multicast_addr()).await?;
        Ok(())
    }

    pub async fn recv_unicast(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.unicast.recv_from(buffer).await
    }

    /// Next datagram from the discovery group.
    ///
    /// Never resolves while discovery is disabled. Callers that get an
    /// error should [`disable_multicast`](Self::disable_multicast) rather
    /// than take the node down.
    pub async fn recv_multicast(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.multicast.as_ref() {
            Some(socket) => socket.recv_from(buffer).await,
            None => std::future::pending().await,
        }
    }

    pub fn disable_multicast(&mut self) {
        if self.multicast.take().is_some() {
            warn!("Discovery socket closed");
        }
    }

    /// Drops both sockets. Pending sends are abandoned.
    pub fn close(self) {
        debug!("Closing transport on port {}", self.unicast_port());
    }
}

fn bind_multicast() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
