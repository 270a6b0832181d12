//! Link-layer contract between the stack and whatever carries its packets.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StackError;
use crate::packet::{PacketBuffer, PacketBufferList};

/// Network-layer protocol of a raw packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Classify a packet by the version nibble of its first byte.
    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            4 => Some(NetworkProtocol::Ipv4),
            6 => Some(NetworkProtocol::Ipv6),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkProtocol::Ipv4 => "ipv4",
            NetworkProtocol::Ipv6 => "ipv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl TransportProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
            TransportProtocol::Icmp => "icmp",
        }
    }
}

/// Hardware type reported to the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpHardwareType {
    None,
}

/// Media hardware address; raw IP links have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddress(pub [u8; 6]);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkEndpointCapabilities(u32);

impl LinkEndpointCapabilities {
    /// No checksum offload, no loopback
    pub const NONE: Self = Self(0);
}

/// Receives inbound packets on behalf of the stack.
///
/// Supplied by the stack when a NIC is attached; the link only borrows it.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer);
}

/// Link layer the stack transmits through
#[async_trait]
pub trait LinkEndpoint: Send + Sync {
    fn mtu(&self) -> u32;

    fn max_header_length(&self) -> u16;

    fn link_address(&self) -> Option<LinkAddress>;

    fn capabilities(&self) -> LinkEndpointCapabilities;

    /// Attach (`Some`) or detach (`None`) the inbound dispatcher.
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    fn is_attached(&self) -> bool;

    /// Wait for any link-owned workers to finish.
    fn wait(&self);

    fn arp_hardware_type(&self) -> ArpHardwareType;

    fn add_header(&self, packet: &mut PacketBuffer);

    fn parse_header(&self, packet: &PacketBuffer) -> bool;

    /// Take ownership of `packets` and transmit them in order.
    ///
    /// May wait for room. Returns the number of packets accepted, or
    /// [`StackError::ClosedForSend`] carrying the count accepted before the
    /// link shut down.
    async fn write_packets(&self, packets: PacketBufferList) -> Result<usize, StackError>;
}
