//! UDP sockets over the stack's socket set.

use smoltcp::iface::SocketHandle;
use smoltcp::socket::udp as smol_udp;
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};
use std::future::poll_fn;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};
use tracing::{debug, trace};

use super::Stack;
use crate::addr::{addr_from_address, endpoint_from_socket_addr, socket_addr_from_endpoint};
use crate::error::StackError;
use crate::link::{NetworkProtocol, TransportProtocol};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// A UDP socket, optionally associated with a single peer.
pub struct UdpConn {
    stack: Stack,
    handle: SocketHandle,
    local_addr: SocketAddr,
    peer: Option<IpEndpoint>,
    max_payload: usize,
}

impl UdpConn {
    /// Bind to `local` (any local address when `None`) and `port`, where port
    /// `0` picks an ephemeral one.
    pub(crate) fn bind(
        stack: &Stack,
        protocol: NetworkProtocol,
        local: Option<IpAddress>,
        port: u16,
        peer: Option<IpEndpoint>,
    ) -> Result<Self, StackError> {
        let options = stack.options();
        let mut inner = stack.lock();
        if inner.closed {
            return Err(StackError::Closed);
        }
        options.require_transport(TransportProtocol::Udp)?;
        inner.check_local(local)?;
        let mtu = inner.nic_mut()?.mtu;
        let port = inner.reserve_port(port)?;

        let rx = smol_udp::PacketBuffer::new(
            vec![smol_udp::PacketMetadata::EMPTY; options.udp_packet_slots],
            vec![0u8; options.udp_rx_buffer_size],
        );
        let tx = smol_udp::PacketBuffer::new(
            vec![smol_udp::PacketMetadata::EMPTY; options.udp_packet_slots],
            vec![0u8; options.udp_tx_buffer_size],
        );
        let mut socket = smol_udp::Socket::new(rx, tx);
        if let Err(e) = socket.bind(IpListenEndpoint { addr: local, port }) {
            inner.release_port(port);
            return Err(e.into());
        }
        let header_len = match protocol {
            NetworkProtocol::Ipv4 => IPV4_HEADER_LEN,
            NetworkProtocol::Ipv6 => IPV6_HEADER_LEN,
        } + UDP_HEADER_LEN;
        let max_payload = socket
            .payload_send_capacity()
            .min(mtu.saturating_sub(header_len));
        let handle = inner.sockets.add(socket);

        let ip = match (local, protocol) {
            (Some(addr), _) => addr_from_address(addr),
            (None, NetworkProtocol::Ipv4) => Ipv4Addr::UNSPECIFIED.into(),
            (None, NetworkProtocol::Ipv6) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let local_addr = SocketAddr::new(ip, port);
        debug!("UDP bound {} (peer {:?})", local_addr, peer);

        Ok(Self {
            stack: stack.clone(),
            handle,
            local_addr,
            peer,
            max_payload,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The associated peer, if the socket was dialed.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.map(socket_addr_from_endpoint)
    }

    /// Largest datagram payload that fits one packet on the link.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, StackError> {
        let target = endpoint_from_socket_addr(target);
        poll_fn(|cx| self.poll_send_to(cx, data, target)).await
    }

    /// Send to the associated peer.
    pub async fn send(&self, data: &[u8]) -> Result<usize, StackError> {
        let peer = self.peer.ok_or(StackError::NotConnected)?;
        poll_fn(|cx| self.poll_send_to(cx, data, peer)).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), StackError> {
        let (n, from) = poll_fn(|cx| self.poll_recv_from(cx, buf, None)).await?;
        Ok((n, socket_addr_from_endpoint(from)))
    }

    /// Receive from the associated peer, discarding datagrams from anyone else.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, StackError> {
        let peer = self.peer.ok_or(StackError::NotConnected)?;
        let (n, _) = poll_fn(|cx| self.poll_recv_from(cx, buf, Some(peer))).await?;
        Ok(n)
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        target: IpEndpoint,
    ) -> Poll<Result<usize, StackError>> {
        if data.len() > self.max_payload {
            return Poll::Ready(Err(StackError::MessageTooLong {
                len: data.len(),
                capacity: self.max_payload,
            }));
        }
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed));
        }
        let socket = inner.sockets.get_mut::<smol_udp::Socket>(self.handle);
        match socket.send_slice(data, target) {
            Ok(()) => {
                drop(inner);
                self.stack.wake_driver();
                Poll::Ready(Ok(data.len()))
            }
            Err(smol_udp::SendError::BufferFull) => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
        from: Option<IpEndpoint>,
    ) -> Poll<Result<(usize, IpEndpoint), StackError>> {
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed));
        }
        let socket = inner.sockets.get_mut::<smol_udp::Socket>(self.handle);
        while socket.can_recv() {
            let (n, meta) = match socket.recv_slice(buf) {
                Ok(received) => received,
                Err(e) => return Poll::Ready(Err(e.into())),
            };
            match from {
                Some(peer) if peer != meta.endpoint => {
                    trace!("UDP {} dropped datagram from {}", self.local_addr, meta.endpoint);
                }
                _ => return Poll::Ready(Ok((n, meta.endpoint))),
            }
        }
        socket.register_recv_waker(cx.waker());
        Poll::Pending
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        let mut inner = self.stack.lock();
        inner.sockets.remove(self.handle);
        inner.release_port(self.local_addr.port());
    }
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer)
            .finish()
    }
}
