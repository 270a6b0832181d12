//! Conversions between `std::net` addresses used on the tunnel side and the
//! `smoltcp` wire types used inside the stack.

use cidr::IpInet;
use smoltcp::wire::{IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::link::NetworkProtocol;

pub fn address_from_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

pub fn addr_from_address(address: IpAddress) -> IpAddr {
    match address {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
    }
}

pub fn endpoint_from_socket_addr(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(address_from_addr(addr.ip()), addr.port())
}

pub fn socket_addr_from_endpoint(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(addr_from_address(endpoint.addr), endpoint.port)
}

/// Host address plus prefix length, keeping the host bits.
pub fn cidr_from_inet(inet: IpInet) -> IpCidr {
    IpCidr::new(address_from_addr(inet.address()), inet.network_length())
}

pub fn network_protocol_of(addr: IpAddr) -> NetworkProtocol {
    match addr {
        IpAddr::V4(_) => NetworkProtocol::Ipv4,
        IpAddr::V6(_) => NetworkProtocol::Ipv6,
    }
}
