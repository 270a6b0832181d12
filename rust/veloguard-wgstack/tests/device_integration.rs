//! End-to-end tests driving the device from the engine side and from the
//! stack's socket API.

mod common;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Packet, Ipv6Packet, TcpPacket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use veloguard_wgstack::{
    LinkEndpoint, PacketAccounting, PacketBuffer, StackDevice, StackError, TunDevice, TunEvent,
    WgStackError,
};

use common::{dual_stack_device, icmp_echo_request, parse_echo_reply, read_packet, READ_TIMEOUT};

// =============================================================================
// Engine side
// =============================================================================

#[tokio::test]
async fn test_echo_request_answered() {
    common::init_tracing();
    let device = StackDevice::new(&["10.0.0.2/32".parse().unwrap()], 1420).unwrap();
    let mut events = device.events().unwrap();
    device.start().unwrap();
    assert_eq!(events.recv().await, Some(TunEvent::Up));
    assert!(events.try_recv().is_err());

    let request = icmp_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 0x1234, 7);
    assert_eq!(device.write(&[&request[..]], 0).unwrap(), 1);

    let reply = read_packet(&device).await;
    assert_eq!(
        parse_echo_reply(&reply, [10, 0, 0, 2], [10, 0, 0, 1]),
        Some((0x1234, 7))
    );

    let stats = device.stats();
    assert_eq!(stats.packets_written, 1);
    assert_eq!(stats.packets_read, 1);

    device.close().await.unwrap();
    assert_eq!(events.recv().await, Some(TunEvent::Down));
}

#[tokio::test]
async fn test_write_honors_offset() {
    let device = dual_stack_device();
    let request = icmp_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 1, 1);
    let mut framed = vec![0xaa; 16];
    framed.extend_from_slice(&request);

    assert_eq!(device.write(&[&framed[..]], 16).unwrap(), 1);
    let reply = read_packet(&device).await;
    assert!(parse_echo_reply(&reply, [10, 0, 0, 2], [10, 0, 0, 1]).is_some());
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_outbound_queue_applies_backpressure() {
    let device = dual_stack_device();
    let endpoint = device.new_endpoint();
    let accounting = PacketAccounting::new();

    let packets: Vec<PacketBuffer> = (0..300u16)
        .map(|i| {
            let [hi, lo] = i.to_be_bytes();
            PacketBuffer::copy_from_slice(&[0x45, 0, hi, lo]).tracked(&accounting)
        })
        .collect();
    let writer = tokio::spawn(async move { endpoint.write_packets(packets).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer.is_finished());
    assert_eq!(device.stats().packets_queued, 256);

    for i in 0..300u16 {
        let packet = read_packet(&device).await;
        assert_eq!(packet, [0x45, 0, (i >> 8) as u8, i as u8]);
    }
    assert_eq!(writer.await.unwrap().unwrap(), 300);
    assert_eq!(accounting.outstanding(), 0);
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_close_unblocks_pending_writer() {
    let device = dual_stack_device();
    let endpoint = device.new_endpoint();
    let accounting = PacketAccounting::new();

    let packets: Vec<PacketBuffer> = (0..300)
        .map(|_| PacketBuffer::copy_from_slice(&[0x45, 0, 0, 20]).tracked(&accounting))
        .collect();
    let writer = tokio::spawn(async move { endpoint.write_packets(packets).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    device.close().await.unwrap();
    let result = timeout(READ_TIMEOUT, writer).await.unwrap().unwrap();
    assert_eq!(result, Err(StackError::ClosedForSend { written: 256 }));
    assert_eq!(accounting.allocated(), 300);
    assert_eq!(accounting.outstanding(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_with_blocked_reader() {
    let device = Arc::new(dual_stack_device());

    let reader = {
        let device = device.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            let mut sizes = [0usize; 1];
            device.read(&mut [&mut buf[..]], &mut sizes, 0).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());

    let (first, second) = tokio::join!(device.close(), device.close());
    assert!(first.is_ok() != second.is_ok());
    assert!(matches!(device.close().await, Err(WgStackError::Closed)));

    let read = timeout(READ_TIMEOUT, reader).await.unwrap().unwrap();
    assert!(matches!(read, Err(WgStackError::Closed)));

    let request = icmp_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 1, 1);
    assert!(device.write(&[&request[..]], 0).unwrap_err().is_closed());
}

#[tokio::test]
async fn test_close_releases_stack_buffers() {
    let device = dual_stack_device();
    for seq in 0..8 {
        let request = icmp_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 9, seq);
        device.write(&[&request[..]], 0).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let accounting = device.packet_accounting();
    device.close().await.unwrap();
    assert!(accounting.allocated() > 0);
    assert_eq!(accounting.outstanding(), 0);
}

// =============================================================================
// Socket API
// =============================================================================

#[tokio::test]
async fn test_udp_dial_binds_family_address() {
    let device = dual_stack_device();

    let v4 = device
        .dial_context("udp", "10.0.0.1:53".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(v4.local_addr().ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    assert_eq!(v4.peer_addr(), Some("10.0.0.1:53".parse().unwrap()));

    let v6 = device
        .dial_context("udp6", "[fd00::1]:53".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        v6.local_addr().ip(),
        IpAddr::V6("fd00::2".parse::<Ipv6Addr>().unwrap())
    );
    assert_ne!(v4.local_addr().port(), 0);

    drop((v4, v6));
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_dial_rejects_bad_network() {
    let device = dual_stack_device();

    let err = device
        .dial_context("sctp", "10.0.0.1:80".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, WgStackError::UnknownNetwork(ref n) if n == "sctp"));

    let err = device
        .dial_context("tcp6", "10.0.0.1:80".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, WgStackError::InvalidArgument(_)));

    device.close().await.unwrap();
}

#[tokio::test]
async fn test_tcp_dial_emits_syn_from_local_address() {
    let device = Arc::new(dual_stack_device());

    let dial = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .dial_context("tcp", "10.0.0.1:80".parse().unwrap())
                .await
        })
    };

    let packet = read_packet(&device).await;
    let ip = Ipv4Packet::new_checked(&packet[..]).unwrap();
    assert_eq!(ip.src_addr(), Ipv4Address::new(10, 0, 0, 2));
    assert_eq!(ip.dst_addr(), Ipv4Address::new(10, 0, 0, 1));
    assert_eq!(ip.next_header(), IpProtocol::Tcp);

    let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
    assert!(tcp.syn());
    assert!(!tcp.ack());
    assert_eq!(tcp.dst_port(), 80);
    assert!(tcp.src_port() >= 49152);

    dial.abort();
    let _ = dial.await;
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_tcp6_dial_emits_syn_from_local_address() {
    let device = Arc::new(dual_stack_device());

    let dial = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .dial_context("tcp6", "[fd00::1]:443".parse().unwrap())
                .await
        })
    };

    let packet = read_packet(&device).await;
    let ip = Ipv6Packet::new_checked(&packet[..]).unwrap();
    assert_eq!(Ipv6Addr::from(ip.src_addr()), "fd00::2".parse::<Ipv6Addr>().unwrap());
    assert_eq!(Ipv6Addr::from(ip.dst_addr()), "fd00::1".parse::<Ipv6Addr>().unwrap());
    assert_eq!(ip.next_header(), IpProtocol::Tcp);

    let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
    assert!(tcp.syn());
    assert!(!tcp.ack());
    assert_eq!(tcp.dst_port(), 443);
    assert!(tcp.src_port() >= 49152);

    dial.abort();
    let _ = dial.await;
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_udp_local_delivery() {
    let device = dual_stack_device();

    let server = device
        .listen_packet("10.0.0.2:0".parse().unwrap())
        .unwrap();
    let server_addr = server.local_addr();
    assert_eq!(server_addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

    let client = device
        .dial_context("udp", server_addr)
        .await
        .unwrap()
        .into_udp()
        .unwrap();
    client.send(b"ping").await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(READ_TIMEOUT, server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, client.local_addr());

    server.send_to(b"pong", from).await.unwrap();
    let n = timeout(READ_TIMEOUT, client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");

    drop((client, server));
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_tcp_local_echo() {
    let device = dual_stack_device();

    let mut listener = device.listen_tcp(0).unwrap();
    let port = listener.port();
    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await?;
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await?;
        stream.write_all(&buf).await?;
        Ok::<_, std::io::Error>((listener, stream))
    });

    let destination = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port);
    let mut client = timeout(READ_TIMEOUT, device.dial_context("tcp", destination))
        .await
        .unwrap()
        .unwrap()
        .into_tcp()
        .unwrap();
    assert_eq!(client.peer_addr(), destination);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(READ_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    let (listener, accepted) = server.await.unwrap().unwrap();
    assert_eq!(accepted.peer_addr(), client.local_addr());
    drop((client, accepted, listener));
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_sockets_fail_after_close() {
    let device = dual_stack_device();
    device.close().await.unwrap();

    assert!(device.listen_tcp(8080).is_err());
    assert!(device
        .listen_packet("10.0.0.2:0".parse().unwrap())
        .is_err());
    assert!(device
        .dial_context("udp", "10.0.0.1:53".parse().unwrap())
        .await
        .is_err());
}
