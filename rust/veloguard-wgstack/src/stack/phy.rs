//! smoltcp `Device` view over the stack's inbound queue and egress batch.

use bytes::BytesMut;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use crate::link::{LinkEndpoint, TransportProtocol};
use crate::packet::{PacketAccounting, PacketBuffer};

/// Upper bound on packets handed to the link in one `write_packets` call
pub const MAX_EGRESS_BATCH: usize = 64;

pub(crate) struct LinkPhy<'a> {
    pub rx: &'a mut VecDeque<PacketBuffer>,
    pub tx: &'a mut Vec<PacketBuffer>,
    pub link: &'a dyn LinkEndpoint,
    pub mtu: usize,
    pub accounting: &'a Arc<PacketAccounting>,
}

impl<'a> Device for LinkPhy<'a> {
    type RxToken<'b> = LinkRxToken where Self: 'b;
    type TxToken<'b> = LinkTxToken<'b> where Self: 'b;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        // Leave inbound queued until the current batch is flushed.
        if self.tx.len() >= MAX_EGRESS_BATCH {
            return None;
        }
        let packet = loop {
            let packet = self.rx.pop_front()?;
            if self.link.parse_header(&packet) {
                break packet;
            }
            trace!("link rejected inbound packet of {} bytes", packet.len());
            packet.release();
        };
        Some((
            LinkRxToken { packet },
            LinkTxToken {
                tx: &mut *self.tx,
                link: self.link,
                accounting: self.accounting,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.tx.len() >= MAX_EGRESS_BATCH {
            return None;
        }
        Some(LinkTxToken {
            tx: &mut *self.tx,
            link: self.link,
            accounting: self.accounting,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.max_burst_size = Some(MAX_EGRESS_BATCH);
        caps
    }
}

pub(crate) struct LinkRxToken {
    packet: PacketBuffer,
}

impl RxToken for LinkRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut data = self.packet.into_contiguous();
        f(&mut data[..])
    }
}

pub(crate) struct LinkTxToken<'a> {
    tx: &'a mut Vec<PacketBuffer>,
    link: &'a dyn LinkEndpoint,
    accounting: &'a Arc<PacketAccounting>,
}

impl<'a> TxToken for LinkTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut data = BytesMut::zeroed(len);
        let result = f(&mut data[..]);
        let mut packet = PacketBuffer::new(data).tracked(self.accounting);
        self.link.add_header(&mut packet);
        self.tx.push(packet);
        result
    }
}

/// Destination address of a raw IP packet.
pub(crate) fn destination_of(packet: &PacketBuffer) -> Option<IpAddress> {
    let data = packet.as_slices().next()?;
    match packet.ip_version()? {
        4 => Ipv4Packet::new_checked(data)
            .ok()
            .map(|p| IpAddress::Ipv4(p.dst_addr())),
        6 => Ipv6Packet::new_checked(data)
            .ok()
            .map(|p| IpAddress::Ipv6(p.dst_addr())),
        _ => None,
    }
}

/// Transport protocol carried by a raw IP packet, when it is one the stack
/// can disable.
pub(crate) fn transport_of(packet: &PacketBuffer) -> Option<TransportProtocol> {
    let data = packet.as_slices().next()?;
    let next_header = match packet.ip_version()? {
        4 => Ipv4Packet::new_checked(data).ok()?.next_header(),
        6 => Ipv6Packet::new_checked(data).ok()?.next_header(),
        _ => return None,
    };
    match next_header {
        IpProtocol::Tcp => Some(TransportProtocol::Tcp),
        IpProtocol::Udp => Some(TransportProtocol::Udp),
        IpProtocol::Icmp | IpProtocol::Icmpv6 => Some(TransportProtocol::Icmp),
        _ => None,
    }
}
