//! Raw IP packet builders shared by unit and integration tests.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
};

pub const ECHO_PAYLOAD: &[u8] = b"veloguard";

/// ICMPv4 echo request from `src` to `dst`.
pub fn icmp_echo_request(src: [u8; 4], dst: [u8; 4], ident: u16, seq_no: u16) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data: ECHO_PAYLOAD,
    };
    let ip = Ipv4Repr {
        src_addr: Ipv4Address(src),
        dst_addr: Ipv4Address(dst),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    let mut bytes = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
    let checksum = ChecksumCapabilities::default();
    let mut packet = Ipv4Packet::new_unchecked(&mut bytes[..]);
    ip.emit(&mut packet, &checksum);
    icmp.emit(
        &mut Icmpv4Packet::new_unchecked(packet.payload_mut()),
        &checksum,
    );
    bytes
}

/// Identifier and sequence number of an echo reply from `src` to `dst`.
pub fn parse_echo_reply(bytes: &[u8], src: [u8; 4], dst: [u8; 4]) -> Option<(u16, u16)> {
    let packet = Ipv4Packet::new_checked(bytes).ok()?;
    if packet.src_addr() != Ipv4Address(src)
        || packet.dst_addr() != Ipv4Address(dst)
        || packet.next_header() != IpProtocol::Icmp
    {
        return None;
    }
    let icmp = Icmpv4Packet::new_checked(packet.payload()).ok()?;
    if icmp.msg_type() != Icmpv4Message::EchoReply || icmp.data() != ECHO_PAYLOAD {
        return None;
    }
    Some((icmp.echo_ident(), icmp.echo_seq_no()))
}
