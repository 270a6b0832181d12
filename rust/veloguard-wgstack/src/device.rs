//! Tunnel device backed by the in-process stack.
//!
//! One [`DeviceState`] is shared by two views: [`StackDevice`], the tunnel
//! side driven by the WireGuard engine, and [`WireEndpoint`], the link side
//! the stack transmits through. Packets the stack emits are queued by the
//! endpoint and handed out by [`StackDevice::read`](TunDevice::read);
//! packets written to the device go straight to the stack's dispatcher.
//!
//! # Example
//!
//! ```no_run
//! use veloguard_wgstack::{StackDevice, TunDevice};
//!
//! # async fn example() -> veloguard_wgstack::Result<()> {
//! let device = StackDevice::new(&["10.0.0.2/32".parse().unwrap()], 1420)?;
//! device.start()?;
//!
//! let mut buf = vec![0u8; 1500];
//! let mut sizes = [0usize; 1];
//! let n = device.read(&mut [&mut buf[..]], &mut sizes, 0).await?;
//! assert_eq!(n, 1);
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use cidr::IpInet;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::addr::{address_from_addr, cidr_from_inet, network_protocol_of};
use crate::config::WgStackConfig;
use crate::dial::{dial_tcp_with_bind, dial_udp, FullAddress, NetConn, Network};
use crate::error::{Result, StackError, WgStackError};
use crate::link::{
    ArpHardwareType, LinkAddress, LinkEndpoint, LinkEndpointCapabilities, NetworkDispatcher,
    NetworkProtocol,
};
use crate::packet::{PacketAccounting, PacketBuffer, PacketBufferList};
use crate::stack::{
    NicId, ProtocolAddress, Route, Stack, TcpListener, TcpOption, UdpConn,
};
use crate::stats::{DeviceStats, DeviceStatsSnapshot};
use crate::tun::{TunDevice, TunEvent};

/// Identifier of the single NIC registered on the stack
pub const DEFAULT_NIC: NicId = 1;

const EVENT_CHANNEL_CAPACITY: usize = 1;

struct DeviceState {
    mtu: u32,
    name: String,
    outbound_tx: mpsc::Sender<PacketBuffer>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<PacketBuffer>>,
    events_tx: mpsc::Sender<TunEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TunEvent>>>,
    /// Fired once the stack has quiesced during close
    done: CancellationToken,
    closing: AtomicBool,
    addr4: Option<Ipv4Addr>,
    addr6: Option<Ipv6Addr>,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
    stats: DeviceStats,
}

impl DeviceState {
    fn is_closed(&self) -> bool {
        self.done.is_cancelled() || self.closing.load(Ordering::Acquire)
    }
}

/// Tunnel device whose packets are processed by an in-process stack
pub struct StackDevice {
    state: Arc<DeviceState>,
    stack: Stack,
}

impl StackDevice {
    /// Create a device with `local_prefixes` assigned to its NIC.
    ///
    /// Must be called within a tokio runtime. When several prefixes share a
    /// family, the last one becomes the source address for that family.
    pub fn new(local_prefixes: &[IpInet], mtu: u32) -> Result<Self> {
        Self::with_config(WgStackConfig::new(local_prefixes, mtu))
    }

    pub fn with_config(config: WgStackConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| WgStackError::Runtime)?;

        let mut addr4 = None;
        let mut addr6 = None;
        for prefix in &config.local_addresses {
            match prefix.address() {
                IpAddr::V4(addr) => addr4 = Some(addr),
                IpAddr::V6(addr) => addr6 = Some(addr),
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(DeviceState {
            mtu: config.mtu,
            name: config.name.clone(),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            done: CancellationToken::new(),
            closing: AtomicBool::new(false),
            addr4,
            addr6,
            dispatcher: RwLock::new(None),
            stats: DeviceStats::default(),
        });

        let stack = Stack::new(config.stack_options(), runtime);
        stack
            .create_nic(DEFAULT_NIC, Arc::new(WireEndpoint::new(state.clone())))
            .map_err(WgStackError::CreateNic)?;

        for prefix in &config.local_addresses {
            let address = ProtocolAddress {
                protocol: network_protocol_of(prefix.address()),
                address: cidr_from_inet(*prefix),
            };
            stack
                .add_protocol_address(DEFAULT_NIC, address)
                .map_err(|source| WgStackError::AddAddress {
                    prefix: *prefix,
                    source,
                })?;
        }

        stack.set_tcp_option(TcpOption::SelectiveAck(config.tcp.selective_ack));
        stack.set_tcp_option(TcpOption::CongestionControl(
            config.tcp.congestion_control.into(),
        ));

        stack.add_route(Route::default_ipv4(DEFAULT_NIC))?;
        stack.add_route(Route::default_ipv6(DEFAULT_NIC))?;

        info!(
            "{}: created (mtu {}, ipv4 {:?}, ipv6 {:?})",
            config.name, config.mtu, addr4, addr6
        );
        Ok(Self { state, stack })
    }

    /// The link-endpoint view of this device.
    pub fn new_endpoint(&self) -> WireEndpoint {
        WireEndpoint::new(self.state.clone())
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn packet_accounting(&self) -> Arc<PacketAccounting> {
        self.stack.packet_accounting()
    }

    pub fn inet4_address(&self) -> Option<Ipv4Addr> {
        self.state.addr4
    }

    pub fn inet6_address(&self) -> Option<Ipv6Addr> {
        self.state.addr6
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.state.stats.snapshot()
    }

    fn local_binding(&self, destination: IpAddr) -> (NetworkProtocol, FullAddress) {
        let addr = match destination {
            IpAddr::V4(_) => self.state.addr4.map(IpAddr::V4),
            IpAddr::V6(_) => self.state.addr6.map(IpAddr::V6),
        };
        (
            network_protocol_of(destination),
            FullAddress {
                nic: DEFAULT_NIC,
                addr: addr.map(address_from_addr),
                port: 0,
            },
        )
    }

    /// Open a connection to `destination` from the local address of its family.
    ///
    /// `network` is one of `tcp`, `tcp4`, `tcp6`, `udp`, `udp4` or `udp6`.
    pub async fn dial_context(&self, network: &str, destination: SocketAddr) -> Result<NetConn> {
        let network: Network = network.parse()?;
        let family_ok = match network {
            Network::Tcp4 | Network::Udp4 => destination.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => destination.is_ipv6(),
            Network::Tcp | Network::Udp => true,
        };
        if !family_ok {
            return Err(WgStackError::InvalidArgument(
                "destination family does not match network",
            ));
        }

        let (protocol, bind) = self.local_binding(destination.ip());
        let remote = FullAddress {
            nic: DEFAULT_NIC,
            addr: Some(address_from_addr(destination.ip())),
            port: destination.port(),
        };
        trace!("{}: dial {} {}", self.state.name, network, destination);

        if network.is_stream() {
            let stream = dial_tcp_with_bind(&self.stack, bind, remote, protocol).await?;
            Ok(NetConn::Tcp(stream))
        } else {
            let conn = dial_udp(&self.stack, bind, Some(remote), protocol)?;
            Ok(NetConn::Udp(conn))
        }
    }

    /// UDP socket on the local address of `destination`'s family, open to any peer.
    pub fn listen_packet(&self, destination: SocketAddr) -> Result<UdpConn> {
        let (protocol, bind) = self.local_binding(destination.ip());
        Ok(dial_udp(&self.stack, bind, None, protocol)?)
    }

    /// TCP listener on `port` of every local address; `0` picks a free port.
    pub fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.stack, port)?)
    }
}

#[async_trait]
impl TunDevice for StackDevice {
    fn start(&self) -> Result<()> {
        if let Err(e) = self.state.events_tx.try_send(TunEvent::Up) {
            debug!("{}: up event not delivered: {}", self.state.name, e);
        }
        Ok(())
    }

    async fn read(
        &self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize> {
        if bufs.is_empty() || sizes.is_empty() {
            return Err(WgStackError::InvalidArgument("read needs a buffer and a size slot"));
        }
        if offset > bufs[0].len() {
            return Err(WgStackError::InvalidArgument("offset beyond buffer"));
        }

        let state = &self.state;
        let packet = tokio::select! {
            biased;
            _ = state.done.cancelled() => None,
            packet = async { state.outbound_rx.lock().await.recv().await } => packet,
        };
        let Some(packet) = packet else {
            return Err(WgStackError::Closed);
        };

        let dst = &mut bufs[0][offset..];
        if packet.len() > dst.len() {
            let needed = packet.len();
            packet.release();
            state.stats.record_read_error();
            return Err(WgStackError::ShortBuffer {
                needed,
                available: dst.len(),
            });
        }
        let n = packet.copy_to(dst);
        packet.release();
        sizes[0] = n;
        state.stats.record_read(n);
        Ok(1)
    }

    fn write(&self, bufs: &[&[u8]], offset: usize) -> Result<usize> {
        if self.state.is_closed() {
            return Err(WgStackError::Closed);
        }
        let dispatcher = self
            .state
            .dispatcher
            .read()
            .clone()
            .ok_or(WgStackError::NotAttached)?;
        let accounting = self.stack.packet_accounting();

        let mut count = 0;
        for buf in bufs {
            let data = match buf.get(offset..) {
                Some(data) if !data.is_empty() => data,
                _ => continue,
            };
            let Some(protocol) = NetworkProtocol::from_version(data[0] >> 4) else {
                trace!(
                    "{}: dropping packet with IP version {}",
                    self.state.name,
                    data[0] >> 4
                );
                self.state.stats.record_inbound_drop();
                continue;
            };
            let packet = PacketBuffer::copy_from_slice(data).tracked(&accounting);
            dispatcher.deliver_network_packet(protocol, packet);
            self.state.stats.record_write(data.len());
            count += 1;
        }
        Ok(count)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn mtu(&self) -> Result<u32> {
        Ok(self.state.mtu)
    }

    fn name(&self) -> Result<String> {
        Ok(self.state.name.clone())
    }

    fn events(&self) -> Option<mpsc::Receiver<TunEvent>> {
        self.state.events_rx.lock().take()
    }

    fn batch_size(&self) -> usize {
        1
    }

    async fn close(&self) -> Result<()> {
        if self.state.closing.swap(true, Ordering::AcqRel) {
            return Err(WgStackError::Closed);
        }

        self.stack.close();
        for endpoint in self.stack.cleanup_endpoints() {
            endpoint.abort();
        }
        self.stack.wait().await;
        self.state.done.cancel();

        let mut queue = self.state.outbound_rx.lock().await;
        queue.close();
        let mut released = 0usize;
        while let Ok(packet) = queue.try_recv() {
            packet.release();
            released += 1;
        }
        drop(queue);

        if let Err(e) = self.state.events_tx.try_send(TunEvent::Down) {
            trace!("{}: down event not delivered: {}", self.state.name, e);
        }
        info!(
            "{}: closed, released {} queued packets",
            self.state.name, released
        );
        Ok(())
    }
}

/// Link-layer view of a [`StackDevice`]
#[derive(Clone)]
pub struct WireEndpoint {
    state: Arc<DeviceState>,
}

impl WireEndpoint {
    fn new(state: Arc<DeviceState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl LinkEndpoint for WireEndpoint {
    fn mtu(&self) -> u32 {
        self.state.mtu
    }

    fn max_header_length(&self) -> u16 {
        0
    }

    fn link_address(&self) -> Option<LinkAddress> {
        None
    }

    fn capabilities(&self) -> LinkEndpointCapabilities {
        LinkEndpointCapabilities::NONE
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        let attached = dispatcher.is_some();
        *self.state.dispatcher.write() = dispatcher;
        debug!(
            "{}: dispatcher {}",
            self.state.name,
            if attached { "attached" } else { "detached" }
        );
    }

    fn is_attached(&self) -> bool {
        self.state.dispatcher.read().is_some()
    }

    fn wait(&self) {}

    fn arp_hardware_type(&self) -> ArpHardwareType {
        ArpHardwareType::None
    }

    fn add_header(&self, _packet: &mut PacketBuffer) {}

    fn parse_header(&self, _packet: &PacketBuffer) -> bool {
        true
    }

    async fn write_packets(&self, packets: PacketBufferList) -> std::result::Result<usize, StackError> {
        let mut written = 0;
        let mut packets = packets.into_iter();
        while let Some(packet) = packets.next() {
            let sent = tokio::select! {
                biased;
                _ = self.state.done.cancelled() => false,
                result = self.state.outbound_tx.send(packet) => match result {
                    Ok(()) => true,
                    Err(mpsc::error::SendError(packet)) => {
                        packet.release();
                        false
                    }
                },
            };
            if !sent {
                packets.for_each(PacketBuffer::release);
                return Err(StackError::ClosedForSend { written });
            }
            written += 1;
            self.state.stats.record_queued();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::CongestionControl;

    fn device() -> StackDevice {
        StackDevice::new(
            &["10.0.0.2/24".parse().unwrap(), "fd00::2/64".parse().unwrap()],
            1420,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_device_properties() {
        let device = device();
        assert_eq!(device.mtu().unwrap(), 1420);
        assert_eq!(device.name().unwrap(), "veloguard-wireguard");
        assert_eq!(device.batch_size(), 1);
        assert!(device.flush().is_ok());
        assert_eq!(device.inet4_address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(device.inet6_address(), Some("fd00::2".parse().unwrap()));
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_view() {
        let device = device();
        let endpoint = device.new_endpoint();
        assert_eq!(endpoint.mtu(), 1420);
        assert_eq!(endpoint.max_header_length(), 0);
        assert_eq!(endpoint.link_address(), None);
        assert_eq!(endpoint.capabilities(), LinkEndpointCapabilities::NONE);
        assert_eq!(endpoint.arp_hardware_type(), ArpHardwareType::None);
        assert!(endpoint.is_attached());
        assert!(endpoint.parse_header(&PacketBuffer::copy_from_slice(&[0x45])));

        device.close().await.unwrap();
        assert!(!endpoint.is_attached());
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let device = device();
        let mut events = device.events().unwrap();
        assert!(device.events().is_none());
        device.start().unwrap();
        // A second start with a full channel is dropped, not an error.
        device.start().unwrap();
        assert_eq!(events.recv().await, Some(TunEvent::Up));
        assert!(events.try_recv().is_err());
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_skips_empty_and_unknown_versions() {
        let device = device();
        let empty: &[u8] = &[];
        let bogus: &[u8] = &[0x00, 0x50, 0x20, 0x00];
        let short: &[u8] = &[0xff];
        let n = device.write(&[empty, bogus, short], 1).unwrap();
        assert_eq!(n, 0);
        assert_eq!(device.stats().inbound_dropped, 1);
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let device = device();
        device.close().await.unwrap();
        let packet = crate::tests::icmp_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 1, 1);
        assert!(matches!(
            device.write(&[&packet[..]], 0),
            Err(WgStackError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_argument_checks() {
        let device = device();
        let mut sizes = [0usize; 1];
        let err = device.read(&mut [], &mut sizes, 0).await;
        assert!(matches!(err, Err(WgStackError::InvalidArgument(_))));

        let mut buf = [0u8; 4];
        let err = device.read(&mut [&mut buf[..]], &mut sizes, 5).await;
        assert!(matches!(err, Err(WgStackError::InvalidArgument(_))));
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_short_buffer_releases_packet() {
        let device = device();
        let accounting = PacketAccounting::new();
        let endpoint = device.new_endpoint();
        endpoint
            .write_packets(vec![PacketBuffer::copy_from_slice(&[0x45; 64]).tracked(&accounting)])
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let mut sizes = [0usize; 1];
        let err = device.read(&mut [&mut buf[..]], &mut sizes, 0).await;
        assert!(matches!(
            err,
            Err(WgStackError::ShortBuffer {
                needed: 64,
                available: 32
            })
        ));
        assert_eq!(accounting.outstanding(), 0);
        assert_eq!(device.stats().read_errors, 1);
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_options_from_config() {
        let device = device();
        assert!(device.stack().selective_ack());
        assert_eq!(device.stack().congestion_control(), CongestionControl::Cubic);
        device.close().await.unwrap();

        let config = WgStackConfig::from_yaml(
            "local_addresses: [10.0.0.2/32]\ntcp:\n  selective_ack: false\n  congestion_control: reno\n",
        )
        .unwrap();
        let device = StackDevice::with_config(config).unwrap();
        assert!(!device.stack().selective_ack());
        assert_eq!(device.stack().congestion_control(), CongestionControl::Reno);
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_address_limit() {
        let prefixes: Vec<IpInet> = (2..=9)
            .map(|i| format!("10.0.0.{}/24", i).parse().unwrap())
            .collect();
        let device = StackDevice::new(&prefixes, 1420).unwrap();
        assert_eq!(device.inet4_address(), Some(Ipv4Addr::new(10, 0, 0, 9)));
        device.close().await.unwrap();

        let mut prefixes = prefixes;
        prefixes.push("fd00::2/64".parse().unwrap());
        let err = StackDevice::new(&prefixes, 1420);
        assert!(matches!(err, Err(WgStackError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = StackDevice::new(&["fd00::2/64".parse().unwrap()], 1000);
        assert!(matches!(err, Err(WgStackError::Config(_))));
    }

    #[test]
    fn test_requires_runtime() {
        let err = StackDevice::new(&["10.0.0.2/32".parse().unwrap()], 1420);
        assert!(matches!(err, Err(WgStackError::Runtime)));
    }
}
