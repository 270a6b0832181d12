//! TCP streams and listeners over the stack's socket set.

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp as smol_tcp;
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use super::{Stack, StackInner, StackOptions};
use crate::addr::socket_addr_from_endpoint;
use crate::error::StackError;
use crate::link::TransportProtocol;

fn new_socket(options: &StackOptions) -> smol_tcp::Socket<'static> {
    let rx = smol_tcp::SocketBuffer::new(vec![0u8; options.tcp_rx_buffer_size]);
    let tx = smol_tcp::SocketBuffer::new(vec![0u8; options.tcp_tx_buffer_size]);
    smol_tcp::Socket::new(rx, tx)
}

fn unspecified_like(remote: &IpEndpoint) -> SocketAddr {
    let ip = match remote.addr {
        IpAddress::Ipv4(_) => std::net::Ipv4Addr::UNSPECIFIED.into(),
        IpAddress::Ipv6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

/// A connected TCP stream
pub struct TcpStream {
    stack: Stack,
    handle: SocketHandle,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    /// Ephemeral port reserved for this stream, if it owns one
    port: Option<u16>,
}

impl TcpStream {
    /// Open a connection from `local` (any local address when `None`) to
    /// `remote` and wait until it is established.
    pub(crate) async fn connect(
        stack: &Stack,
        local: Option<IpAddress>,
        local_port: u16,
        remote: IpEndpoint,
    ) -> Result<Self, StackError> {
        let stream = Self::start_connect(stack, local, local_port, remote)?;
        stack.wake_driver();

        let timeout = stack.options().tcp_connect_timeout;
        let established =
            tokio::time::timeout(timeout, poll_fn(|cx| stream.poll_established(cx))).await;
        match established {
            Ok(Ok(())) => {
                debug!("TCP {} -> {} established", stream.local_addr, stream.peer_addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StackError::TimedOut),
        }
    }

    fn start_connect(
        stack: &Stack,
        local: Option<IpAddress>,
        local_port: u16,
        remote: IpEndpoint,
    ) -> Result<Self, StackError> {
        let mut inner = stack.lock();
        if inner.closed {
            return Err(StackError::Closed);
        }
        stack.options().require_transport(TransportProtocol::Tcp)?;
        inner.check_local(local)?;
        let port = inner.reserve_port(local_port)?;
        let socket = new_socket(stack.options());
        let handle = inner.sockets.add(socket);

        let StackInner { nic, sockets, .. } = &mut *inner;
        let connected = match nic.as_mut() {
            Some(nic) => sockets
                .get_mut::<smol_tcp::Socket>(handle)
                .connect(
                    nic.iface.context(),
                    remote,
                    IpListenEndpoint { addr: local, port },
                )
                .map_err(StackError::from),
            None => Err(StackError::UnknownNic(0)),
        };
        if let Err(e) = connected {
            inner.sockets.remove(handle);
            inner.release_port(port);
            return Err(e);
        }

        let local_addr = inner
            .sockets
            .get::<smol_tcp::Socket>(handle)
            .local_endpoint()
            .map(socket_addr_from_endpoint)
            .unwrap_or_else(|| unspecified_like(&remote));
        trace!("TCP connecting {} -> {}", local_addr, remote);

        Ok(Self {
            stack: stack.clone(),
            handle,
            local_addr,
            peer_addr: socket_addr_from_endpoint(remote),
            port: Some(port),
        })
    }

    fn poll_established(&self, cx: &mut Context<'_>) -> Poll<Result<(), StackError>> {
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed));
        }
        let socket = inner.sockets.get_mut::<smol_tcp::Socket>(self.handle);
        match socket.state() {
            smol_tcp::State::Established | smol_tcp::State::CloseWait => Poll::Ready(Ok(())),
            smol_tcp::State::Closed | smol_tcp::State::TimeWait => {
                Poll::Ready(Err(StackError::ConnectionRefused))
            }
            _ => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed.into()));
        }
        let socket = inner.sockets.get_mut::<smol_tcp::Socket>(self.handle);
        if socket.can_recv() {
            let n = socket
                .recv_slice(buf.initialize_unfilled())
                .map_err(|e| io::Error::from(StackError::from(e)))?;
            buf.advance(n);
            drop(inner);
            // Window update
            self.stack.wake_driver();
            return Poll::Ready(Ok(()));
        }
        if !socket.may_recv() {
            return Poll::Ready(Ok(()));
        }
        socket.register_recv_waker(cx.waker());
        Poll::Pending
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed.into()));
        }
        let socket = inner.sockets.get_mut::<smol_tcp::Socket>(self.handle);
        if !socket.may_send() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed for send",
            )));
        }
        if socket.can_send() {
            let n = socket
                .send_slice(data)
                .map_err(|e| io::Error::from(StackError::from(e)))?;
            drop(inner);
            self.stack.wake_driver();
            return Poll::Ready(Ok(n));
        }
        socket.register_send_waker(cx.waker());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.stack.lock();
        if !inner.closed {
            inner.sockets.get_mut::<smol_tcp::Socket>(self.handle).close();
        }
        drop(inner);
        self.stack.wake_driver();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let mut inner = self.stack.lock();
        if let Some(port) = self.port {
            inner.release_port(port);
        }
        if inner.closed {
            inner.sockets.remove(self.handle);
        } else {
            // Finish the close in the background; the driver reaps it.
            inner.sockets.get_mut::<smol_tcp::Socket>(self.handle).close();
            inner.closing.push(self.handle);
        }
        drop(inner);
        self.stack.wake_driver();
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Accepts inbound TCP connections on one port of every local address.
///
/// Holds a fixed backlog of listening sockets; a socket that completes its
/// handshake is handed out by [`accept`](Self::accept) and replaced.
pub struct TcpListener {
    stack: Stack,
    port: u16,
    backlog: Vec<SocketHandle>,
}

impl TcpListener {
    pub(crate) fn bind(stack: &Stack, port: u16) -> Result<Self, StackError> {
        let mut inner = stack.lock();
        if inner.closed {
            return Err(StackError::Closed);
        }
        stack.options().require_transport(TransportProtocol::Tcp)?;
        let port = inner.reserve_port(port)?;
        let mut backlog = Vec::with_capacity(stack.options().tcp_listen_backlog.max(1));
        for _ in 0..backlog.capacity() {
            match listening_socket(stack.options(), port) {
                Ok(socket) => backlog.push(inner.sockets.add(socket)),
                Err(e) => {
                    for handle in backlog {
                        inner.sockets.remove(handle);
                    }
                    inner.release_port(port);
                    return Err(e);
                }
            }
        }
        debug!("TCP listening on port {}", port);
        Ok(Self {
            stack: stack.clone(),
            port,
            backlog,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&mut self) -> Result<TcpStream, StackError> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<TcpStream, StackError>> {
        let mut inner = self.stack.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed));
        }
        for slot in 0..self.backlog.len() {
            let handle = self.backlog[slot];
            let socket = inner.sockets.get_mut::<smol_tcp::Socket>(handle);
            match socket.state() {
                smol_tcp::State::Established | smol_tcp::State::CloseWait => {
                    let local = socket.local_endpoint();
                    let remote = socket.remote_endpoint();
                    let replacement = listening_socket(self.stack.options(), self.port)?;
                    self.backlog[slot] = inner.sockets.add(replacement);
                    let (Some(local), Some(remote)) = (local, remote) else {
                        inner.sockets.remove(handle);
                        continue;
                    };
                    trace!("TCP accepted {} on port {}", remote, self.port);
                    return Poll::Ready(Ok(TcpStream {
                        stack: self.stack.clone(),
                        handle,
                        local_addr: socket_addr_from_endpoint(local),
                        peer_addr: socket_addr_from_endpoint(remote),
                        port: None,
                    }));
                }
                smol_tcp::State::Closed => {
                    // Reset during the handshake.
                    socket.listen(self.port).map_err(StackError::from)?;
                    socket.register_recv_waker(cx.waker());
                }
                _ => socket.register_recv_waker(cx.waker()),
            }
        }
        Poll::Pending
    }
}

fn listening_socket(
    options: &StackOptions,
    port: u16,
) -> Result<smol_tcp::Socket<'static>, StackError> {
    let mut socket = new_socket(options);
    socket.listen(port)?;
    Ok(socket)
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut inner = self.stack.lock();
        for handle in self.backlog.drain(..) {
            inner.sockets.remove(handle);
        }
        inner.release_port(self.port);
    }
}
