//! In-process TCP/IP stack built on smoltcp.
//!
//! A [`Stack`] owns one smoltcp [`Interface`] per registered NIC together with
//! the socket set. A background driver task feeds inbound packets delivered
//! through the NIC's [`NetworkDispatcher`], polls the interface, and hands
//! egress to the NIC's [`LinkEndpoint`] in batches, awaiting the link when it
//! applies backpressure.

mod phy;
pub mod tcp;
pub mod udp;

pub use phy::MAX_EGRESS_BATCH;
pub use tcp::{TcpListener, TcpStream};
pub use udp::UdpConn;

use parking_lot::Mutex;
use rand::Rng;
use smoltcp::iface::{Config, Interface, Route as SmolRoute, SocketHandle, SocketSet};
use smoltcp::socket::{tcp as smol_tcp, Socket};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::StackError;
use crate::link::{LinkEndpoint, NetworkDispatcher, NetworkProtocol, TransportProtocol};
use crate::packet::{PacketAccounting, PacketBuffer};
use phy::{destination_of, transport_of, LinkPhy};

pub type NicId = u32;

pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Inbound packets held for the driver before new ones are dropped
const INBOUND_QUEUE_LIMIT: usize = 1024;
/// Rounds of local re-delivery per driver pass
const MAX_LOOPBACK_ROUNDS: usize = 16;
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stack construction options
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocol>,
    pub transport_protocols: Vec<TransportProtocol>,
    /// Deliver packets addressed to a local address without leaving the stack
    pub handle_local: bool,
    pub tcp_rx_buffer_size: usize,
    pub tcp_tx_buffer_size: usize,
    pub udp_rx_buffer_size: usize,
    pub udp_tx_buffer_size: usize,
    pub udp_packet_slots: usize,
    /// Pending connections a listener can hold before accept
    pub tcp_listen_backlog: usize,
    pub tcp_connect_timeout: Duration,
}

impl StackOptions {
    pub fn transport_enabled(&self, protocol: TransportProtocol) -> bool {
        self.transport_protocols.contains(&protocol)
    }

    /// Fail with [`StackError::ProtocolDisabled`] unless `protocol` is enabled.
    pub(crate) fn require_transport(&self, protocol: TransportProtocol) -> Result<(), StackError> {
        if self.transport_enabled(protocol) {
            Ok(())
        } else {
            Err(StackError::ProtocolDisabled(protocol.name()))
        }
    }
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![
                TransportProtocol::Tcp,
                TransportProtocol::Udp,
                TransportProtocol::Icmp,
            ],
            handle_local: true,
            tcp_rx_buffer_size: 64 * 1024,
            tcp_tx_buffer_size: 64 * 1024,
            udp_rx_buffer_size: 64 * 1024,
            udp_tx_buffer_size: 64 * 1024,
            udp_packet_slots: 64,
            tcp_listen_backlog: 8,
            tcp_connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Address assigned to a NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolAddress {
    pub protocol: NetworkProtocol,
    pub address: IpCidr,
}

/// Route table entry sending `destination` out of `nic`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: IpCidr,
    pub nic: NicId,
}

impl Route {
    pub fn default_ipv4(nic: NicId) -> Self {
        Self {
            destination: IpCidr::new(IpAddress::Ipv4(Ipv4Address::UNSPECIFIED), 0),
            nic,
        }
    }

    pub fn default_ipv6(nic: NicId) -> Self {
        Self {
            destination: IpCidr::new(IpAddress::Ipv6(Ipv6Address::UNSPECIFIED), 0),
            nic,
        }
    }
}

/// Congestion control policy requested for TCP.
///
/// smoltcp 0.11 has no pluggable congestion controller, so the policy is
/// recorded on the stack and reported by [`Stack::congestion_control`] without
/// changing socket behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    None,
    Reno,
    #[default]
    Cubic,
}

/// Stack-wide TCP options applied to sockets created afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    SelectiveAck(bool),
    CongestionControl(CongestionControl),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpSettings {
    pub selective_ack: bool,
    pub congestion_control: CongestionControl,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            selective_ack: false,
            congestion_control: CongestionControl::None,
        }
    }
}

pub(crate) struct Nic {
    pub id: NicId,
    pub iface: Interface,
    pub link: Arc<dyn LinkEndpoint>,
    pub mtu: usize,
}

pub(crate) struct StackInner {
    pub nic: Option<Nic>,
    pub sockets: SocketSet<'static>,
    pub tcp: TcpSettings,
    /// TCP sockets released by their owner and still finishing their close
    pub closing: Vec<SocketHandle>,
    pub ports: HashSet<u16>,
    pub closed: bool,
}

impl StackInner {
    pub(crate) fn allocate_port(&mut self) -> Result<u16, StackError> {
        let span = (EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) as u32 + 1;
        let offset = rand::thread_rng().gen_range(0..span);
        for i in 0..span {
            let port = EPHEMERAL_PORT_START + ((offset + i) % span) as u16;
            if self.ports.insert(port) {
                return Ok(port);
            }
        }
        Err(StackError::PortExhausted)
    }

    pub(crate) fn reserve_port(&mut self, port: u16) -> Result<u16, StackError> {
        if port == 0 {
            return self.allocate_port();
        }
        if !self.ports.insert(port) {
            return Err(StackError::PortInUse(port));
        }
        Ok(port)
    }

    pub(crate) fn release_port(&mut self, port: u16) {
        self.ports.remove(&port);
    }

    pub(crate) fn nic_mut(&mut self) -> Result<&mut Nic, StackError> {
        self.nic.as_mut().ok_or(StackError::UnknownNic(0))
    }

    /// Fail unless `address` is unset or assigned to the NIC.
    pub(crate) fn check_local(&self, address: Option<IpAddress>) -> Result<(), StackError> {
        match (address, &self.nic) {
            (None, _) => Ok(()),
            (Some(addr), Some(nic)) if nic.iface.has_ip_addr(addr) => Ok(()),
            (Some(addr), _) => Err(StackError::BadAddress(format!(
                "{} is not a local address",
                addr
            ))),
        }
    }
}

struct StackShared {
    inner: Mutex<StackInner>,
    inbound: Mutex<VecDeque<PacketBuffer>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    accounting: Arc<PacketAccounting>,
    options: StackOptions,
}

impl Drop for StackShared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the protocol stack; clones share the same stack.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<StackShared>,
}

impl Stack {
    /// Create a stack whose driver runs on `runtime`.
    pub fn new(options: StackOptions, runtime: Handle) -> Self {
        let sockets = SocketSet::new(Vec::new());
        Self {
            shared: Arc::new(StackShared {
                inner: Mutex::new(StackInner {
                    nic: None,
                    sockets,
                    tcp: TcpSettings::default(),
                    closing: Vec::new(),
                    ports: HashSet::new(),
                    closed: false,
                }),
                inbound: Mutex::new(VecDeque::new()),
                notify: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                driver: Mutex::new(None),
                runtime,
                accounting: PacketAccounting::new(),
                options,
            }),
        }
    }

    pub fn options(&self) -> &StackOptions {
        &self.shared.options
    }

    pub fn packet_accounting(&self) -> Arc<PacketAccounting> {
        self.shared.accounting.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn protocol_enabled(&self, protocol: NetworkProtocol) -> bool {
        self.shared.options.network_protocols.contains(&protocol)
    }

    /// Register a NIC backed by `link` and start driving it.
    pub fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), StackError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(StackError::Closed);
        }
        if let Some(nic) = &inner.nic {
            return Err(if nic.id == id {
                StackError::DuplicateNic(id)
            } else {
                StackError::InvalidState
            });
        }

        let mtu = link.mtu() as usize;
        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let interface = {
            let mut rx = VecDeque::new();
            let mut tx = Vec::new();
            let mut phy = LinkPhy {
                rx: &mut rx,
                tx: &mut tx,
                link: link.as_ref(),
                mtu,
                accounting: &self.shared.accounting,
            };
            Interface::new(config, &mut phy, Instant::now())
        };

        inner.nic = Some(Nic {
            id,
            iface: interface,
            link: link.clone(),
            mtu,
        });
        drop(inner);

        link.attach(Some(Arc::new(NicDispatcher {
            stack: Arc::downgrade(&self.shared),
        })));

        let driver = self.shared.runtime.spawn(run_driver(
            Arc::downgrade(&self.shared),
            self.shared.notify.clone(),
            self.shared.shutdown.clone(),
        ));
        *self.shared.driver.lock() = Some(driver);

        info!("NIC {} created (mtu {})", id, mtu);
        Ok(())
    }

    pub fn add_protocol_address(
        &self,
        id: NicId,
        address: ProtocolAddress,
    ) -> Result<(), StackError> {
        if !self.protocol_enabled(address.protocol) {
            return Err(StackError::ProtocolDisabled(address.protocol.name()));
        }
        let family_matches = matches!(
            (address.protocol, address.address),
            (NetworkProtocol::Ipv4, IpCidr::Ipv4(_)) | (NetworkProtocol::Ipv6, IpCidr::Ipv6(_))
        );
        if !family_matches {
            return Err(StackError::BadAddress(format!(
                "{} is not an {} address",
                address.address,
                address.protocol.name()
            )));
        }
        if address.address.address().is_unspecified() {
            return Err(StackError::BadAddress(format!(
                "{} is unspecified",
                address.address
            )));
        }

        let mut inner = self.shared.inner.lock();
        let nic = lookup_nic(&mut inner, id)?;
        let mut pushed = Ok(());
        nic.iface.update_ip_addrs(|addrs| {
            pushed = addrs
                .push(address.address)
                .map_err(|_| StackError::AddressExhausted);
        });
        pushed?;
        debug!("NIC {}: added address {}", id, address.address);
        Ok(())
    }

    pub fn selective_ack(&self) -> bool {
        self.shared.inner.lock().tcp.selective_ack
    }

    pub fn congestion_control(&self) -> CongestionControl {
        self.shared.inner.lock().tcp.congestion_control
    }

    pub fn set_tcp_option(&self, option: TcpOption) {
        let mut inner = self.shared.inner.lock();
        match option {
            TcpOption::SelectiveAck(enabled) => inner.tcp.selective_ack = enabled,
            TcpOption::CongestionControl(cc) => inner.tcp.congestion_control = cc,
        }
        debug!("TCP option set: {:?}", option);
    }

    pub fn add_route(&self, route: Route) -> Result<(), StackError> {
        let mut inner = self.shared.inner.lock();
        let nic = lookup_nic(&mut inner, route.nic)?;
        // Raw IP links have no next hop; the gateway only selects the NIC.
        let via_router = match route.destination {
            IpCidr::Ipv4(_) => IpAddress::Ipv4(Ipv4Address::UNSPECIFIED),
            IpCidr::Ipv6(_) => IpAddress::Ipv6(Ipv6Address::UNSPECIFIED),
        };
        let mut pushed = Ok(());
        nic.iface.routes_mut().update(|routes| {
            pushed = routes
                .push(SmolRoute {
                    cidr: route.destination,
                    via_router,
                    preferred_until: None,
                    expires_at: None,
                })
                .map(|_| ())
                .map_err(|_| StackError::AddressExhausted);
        });
        pushed?;
        debug!("NIC {}: route {} installed", route.nic, route.destination);
        Ok(())
    }

    pub fn nic_id(&self) -> Option<NicId> {
        self.shared.inner.lock().nic.as_ref().map(|nic| nic.id)
    }

    /// Whether `address` is assigned to the NIC.
    pub fn has_address(&self, address: IpAddress) -> bool {
        self.shared
            .inner
            .lock()
            .nic
            .as_ref()
            .map(|nic| nic.iface.has_ip_addr(address))
            .unwrap_or(false)
    }

    /// Close every socket and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.shared.closed.store(true, Ordering::Release);
        for (_, socket) in inner.sockets.iter_mut() {
            #[allow(unreachable_patterns)]
            match socket {
                Socket::Tcp(s) => s.close(),
                Socket::Udp(s) => s.close(),
                _ => {}
            }
        }
        drop(inner);
        self.shared.notify.notify_one();
        info!("stack closed");
    }

    /// Endpoints released by their owners that have not finished closing.
    pub fn cleanup_endpoints(&self) -> Vec<Endpoint> {
        let mut inner = self.shared.inner.lock();
        let StackInner {
            sockets, closing, ..
        } = &mut *inner;
        closing
            .iter()
            .filter(|handle| sockets.get::<smol_tcp::Socket>(**handle).state() != smol_tcp::State::Closed)
            .map(|handle| Endpoint {
                stack: self.clone(),
                handle: *handle,
            })
            .collect()
    }

    /// Stop the driver and detach from the link.
    ///
    /// Call after [`close`](Self::close); sockets still parked are woken and
    /// observe the closed stack.
    pub async fn wait(&self) {
        self.shared.shutdown.cancel();
        let driver = self.shared.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                debug!("stack driver ended abnormally: {}", e);
            }
        }

        let link = {
            let mut inner = self.shared.inner.lock();
            for (_, socket) in inner.sockets.iter_mut() {
                #[allow(unreachable_patterns)]
                match socket {
                    Socket::Tcp(s) => s.abort(),
                    Socket::Udp(s) => s.close(),
                    _ => {}
                }
            }
            inner.nic.as_ref().map(|nic| nic.link.clone())
        };
        if let Some(link) = link {
            link.attach(None);
            link.wait();
        }

        let dropped: Vec<PacketBuffer> = self.shared.inbound.lock().drain(..).collect();
        if !dropped.is_empty() {
            debug!("released {} undelivered inbound packets", dropped.len());
        }
        dropped.into_iter().for_each(PacketBuffer::release);
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, StackInner> {
        self.shared.inner.lock()
    }

    /// Wake the driver after socket state changed outside a poll.
    pub(crate) fn wake_driver(&self) {
        self.shared.notify.notify_one();
    }
}

fn lookup_nic(inner: &mut StackInner, id: NicId) -> Result<&mut Nic, StackError> {
    match inner.nic.as_mut() {
        Some(nic) if nic.id == id => Ok(nic),
        _ => Err(StackError::UnknownNic(id)),
    }
}

/// A transport endpoint tracked by the stack
pub struct Endpoint {
    stack: Stack,
    handle: SocketHandle,
}

impl Endpoint {
    /// Reset the connection and drop its state.
    pub fn abort(&self) {
        let mut inner = self.stack.lock();
        if !inner.closing.contains(&self.handle) {
            return;
        }
        inner.sockets.get_mut::<smol_tcp::Socket>(self.handle).abort();
        trace!("aborted endpoint {}", self.handle);
        drop(inner);
        self.stack.wake_driver();
    }
}

struct NicDispatcher {
    stack: Weak<StackShared>,
}

impl NetworkDispatcher for NicDispatcher {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer) {
        let Some(shared) = self.stack.upgrade() else {
            packet.release();
            return;
        };
        if shared.closed.load(Ordering::Acquire) {
            packet.release();
            return;
        }
        if !shared.options.network_protocols.contains(&protocol) {
            trace!("dropping {} packet: protocol disabled", protocol.name());
            packet.release();
            return;
        }
        if let Some(transport) = transport_of(&packet) {
            if !shared.options.transport_enabled(transport) {
                trace!("dropping {} packet: protocol disabled", transport.name());
                packet.release();
                return;
            }
        }
        {
            let mut inbound = shared.inbound.lock();
            if inbound.len() >= INBOUND_QUEUE_LIMIT {
                drop(inbound);
                debug!("inbound queue full, dropping {} bytes", packet.len());
                packet.release();
                return;
            }
            inbound.push_back(packet);
        }
        shared.notify.notify_one();
    }
}

struct DriveOutcome {
    link: Arc<dyn LinkEndpoint>,
    egress: Vec<PacketBuffer>,
    delay: Duration,
}

impl StackShared {
    /// One synchronous pass: ingest, poll, loop back, reap.
    fn drive(&self) -> Option<DriveOutcome> {
        let mut inner = self.inner.lock();
        let StackInner {
            nic,
            sockets,
            closing,
            ..
        } = &mut *inner;
        let nic = nic.as_mut()?;

        let mut rx = std::mem::take(&mut *self.inbound.lock());
        let mut tx = Vec::new();
        for _ in 0..MAX_LOOPBACK_ROUNDS {
            let now = Instant::now();
            let mut phy = LinkPhy {
                rx: &mut rx,
                tx: &mut tx,
                link: nic.link.as_ref(),
                mtu: nic.mtu,
                accounting: &self.accounting,
            };
            nic.iface.poll(now, &mut phy, sockets);

            if !self.options.handle_local {
                break;
            }
            let before = rx.len();
            let mut remote = Vec::with_capacity(tx.len());
            for packet in tx.drain(..) {
                match destination_of(&packet) {
                    Some(dst) if nic.iface.has_ip_addr(dst) => rx.push_back(packet),
                    _ => remote.push(packet),
                }
            }
            tx = remote;
            if rx.len() == before || tx.len() >= MAX_EGRESS_BATCH {
                break;
            }
        }

        closing.retain(|handle| {
            let state = sockets.get::<smol_tcp::Socket>(*handle).state();
            if matches!(state, smol_tcp::State::Closed | smol_tcp::State::TimeWait) {
                sockets.remove(*handle);
                false
            } else {
                true
            }
        });

        let backlog = !rx.is_empty();
        if backlog {
            let mut inbound = self.inbound.lock();
            for packet in rx.into_iter().rev() {
                inbound.push_front(packet);
            }
        }

        let delay = if backlog || tx.len() >= MAX_EGRESS_BATCH {
            Duration::ZERO
        } else {
            nic.iface
                .poll_delay(Instant::now(), sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(IDLE_POLL_INTERVAL)
        };

        Some(DriveOutcome {
            link: nic.link.clone(),
            egress: tx,
            delay,
        })
    }
}

async fn run_driver(stack: Weak<StackShared>, notify: Arc<Notify>, shutdown: CancellationToken) {
    debug!("stack driver started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let outcome = match stack.upgrade() {
            Some(shared) => shared.drive(),
            None => break,
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = notify.notified() => {}
                }
                continue;
            }
        };

        if !outcome.egress.is_empty() {
            let count = outcome.egress.len();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = outcome.link.write_packets(outcome.egress) => match result {
                    Ok(written) => trace!("link accepted {}/{} packets", written, count),
                    Err(StackError::ClosedForSend { written }) => {
                        debug!("link closed after {} of {} packets", written, count);
                        break;
                    }
                    Err(e) => debug!("link write failed: {}", e),
                },
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(outcome.delay) => {}
        }
    }
    debug!("stack driver stopped");
}
