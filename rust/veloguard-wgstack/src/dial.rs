//! Outbound connection helpers.
//!
//! Thin wrappers that open TCP streams and UDP associations on a [`Stack`]
//! with an explicit local binding.

use smoltcp::wire::{IpAddress, IpEndpoint};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{StackError, WgStackError};
use crate::link::NetworkProtocol;
use crate::stack::{NicId, Stack, TcpStream, UdpConn};

/// Network kinds accepted by `dial_context`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_stream(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl FromStr for Network {
    type Err = WgStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(WgStackError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NIC, address and port identifying one side of a connection.
///
/// An unset address lets the stack choose the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullAddress {
    pub nic: NicId,
    pub addr: Option<IpAddress>,
    pub port: u16,
}

impl FullAddress {
    fn endpoint(&self) -> Result<IpEndpoint, StackError> {
        let addr = self
            .addr
            .ok_or_else(|| StackError::BadAddress("missing remote address".into()))?;
        Ok(IpEndpoint::new(addr, self.port))
    }
}

fn check_family(addr: Option<IpAddress>, protocol: NetworkProtocol) -> Result<(), StackError> {
    match (addr, protocol) {
        (None, _)
        | (Some(IpAddress::Ipv4(_)), NetworkProtocol::Ipv4)
        | (Some(IpAddress::Ipv6(_)), NetworkProtocol::Ipv6) => Ok(()),
        (Some(addr), protocol) => Err(StackError::BadAddress(format!(
            "{} is not an {} address",
            addr,
            protocol.name()
        ))),
    }
}

fn check_nic(stack: &Stack, nic: NicId) -> Result<(), StackError> {
    match stack.nic_id() {
        Some(id) if id == nic => Ok(()),
        _ => Err(StackError::UnknownNic(nic)),
    }
}

/// Connect to `remote` from the local binding `bind`.
pub async fn dial_tcp_with_bind(
    stack: &Stack,
    bind: FullAddress,
    remote: FullAddress,
    protocol: NetworkProtocol,
) -> Result<TcpStream, StackError> {
    check_nic(stack, bind.nic)?;
    check_family(bind.addr, protocol)?;
    check_family(remote.addr, protocol)?;
    let remote = remote.endpoint()?;
    TcpStream::connect(stack, bind.addr, bind.port, remote).await
}

/// Open a UDP socket on `bind`, associated with `remote` when given.
pub fn dial_udp(
    stack: &Stack,
    bind: FullAddress,
    remote: Option<FullAddress>,
    protocol: NetworkProtocol,
) -> Result<UdpConn, StackError> {
    check_nic(stack, bind.nic)?;
    check_family(bind.addr, protocol)?;
    let peer = match remote {
        Some(remote) => {
            check_family(remote.addr, protocol)?;
            Some(remote.endpoint()?)
        }
        None => None,
    };
    UdpConn::bind(stack, protocol, bind.addr, bind.port, peer)
}

/// A connection opened through the stack
#[derive(Debug)]
pub enum NetConn {
    Tcp(TcpStream),
    Udp(UdpConn),
}

impl NetConn {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            NetConn::Tcp(stream) => stream.local_addr(),
            NetConn::Udp(conn) => conn.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            NetConn::Tcp(stream) => Some(stream.peer_addr()),
            NetConn::Udp(conn) => conn.peer_addr(),
        }
    }

    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            NetConn::Tcp(stream) => Some(stream),
            NetConn::Udp(_) => None,
        }
    }

    pub fn into_udp(self) -> Option<UdpConn> {
        match self {
            NetConn::Udp(conn) => Some(conn),
            NetConn::Tcp(_) => None,
        }
    }
}
