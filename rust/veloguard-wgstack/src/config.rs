use cidr::IpInet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WgStackError};
use crate::link::{NetworkProtocol, TransportProtocol};
use crate::stack::{CongestionControl, StackOptions};

pub const DEFAULT_MTU: u32 = 1420;
pub const DEFAULT_NAME: &str = "veloguard-wireguard";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Addresses a NIC can hold; matches smoltcp's `iface-max-addr-count-8`
pub const MAX_LOCAL_ADDRESSES: usize = 8;

const MIN_MTU: u32 = 576;
const MIN_IPV6_MTU: u32 = 1280;
const MAX_MTU: u32 = 65535;

/// Tunnel device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgStackConfig {
    /// Local addresses with prefix length, e.g. `10.0.0.2/24`
    #[serde(default)]
    pub local_addresses: Vec<IpInet>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_name")]
    pub name: String,
    /// Outbound packets buffered for `read` before the stack is throttled
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
}

impl Default for WgStackConfig {
    fn default() -> Self {
        Self {
            local_addresses: Vec::new(),
            mtu: default_mtu(),
            name: default_name(),
            queue_capacity: default_queue_capacity(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl WgStackConfig {
    pub fn new(local_addresses: &[IpInet], mtu: u32) -> Self {
        Self {
            local_addresses: local_addresses.to_vec(),
            mtu,
            ..Default::default()
        }
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(WgStackError::Config(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }
        if self.local_addresses.len() > MAX_LOCAL_ADDRESSES {
            return Err(WgStackError::Config(format!(
                "{} local addresses exceed the limit of {}",
                self.local_addresses.len(),
                MAX_LOCAL_ADDRESSES
            )));
        }
        let has_ipv6 = self.local_addresses.iter().any(|a| a.is_ipv6());
        if has_ipv6 && self.mtu < MIN_IPV6_MTU {
            return Err(WgStackError::Config(format!(
                "mtu {} below the IPv6 minimum of {}",
                self.mtu, MIN_IPV6_MTU
            )));
        }
        if self.queue_capacity == 0 {
            return Err(WgStackError::Config("queue_capacity must be non-zero".into()));
        }
        if self.name.is_empty() {
            return Err(WgStackError::Config("name must not be empty".into()));
        }
        self.tcp.validate()?;
        self.udp.validate()?;
        Ok(())
    }

    pub(crate) fn stack_options(&self) -> StackOptions {
        StackOptions {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![
                TransportProtocol::Tcp,
                TransportProtocol::Udp,
                TransportProtocol::Icmp,
            ],
            handle_local: true,
            tcp_rx_buffer_size: self.tcp.rx_buffer_size,
            tcp_tx_buffer_size: self.tcp.tx_buffer_size,
            udp_rx_buffer_size: self.udp.rx_buffer_size,
            udp_tx_buffer_size: self.udp.tx_buffer_size,
            udp_packet_slots: self.udp.packet_slots,
            tcp_listen_backlog: self.tcp.listen_backlog,
            tcp_connect_timeout: Duration::from_secs(self.tcp.connect_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_buffer_size")]
    pub rx_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub tx_buffer_size: usize,
    #[serde(default = "default_true")]
    pub selective_ack: bool,
    #[serde(default)]
    pub congestion_control: CongestionControlConfig,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: default_buffer_size(),
            tx_buffer_size: default_buffer_size(),
            selective_ack: true,
            congestion_control: CongestionControlConfig::default(),
            listen_backlog: default_listen_backlog(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TcpConfig {
    fn validate(&self) -> Result<()> {
        if self.rx_buffer_size == 0 || self.tx_buffer_size == 0 {
            return Err(WgStackError::Config("tcp buffer sizes must be non-zero".into()));
        }
        if self.listen_backlog == 0 {
            return Err(WgStackError::Config("tcp listen_backlog must be non-zero".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(WgStackError::Config(
                "tcp connect_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControlConfig {
    None,
    Reno,
    #[default]
    Cubic,
}

impl From<CongestionControlConfig> for CongestionControl {
    fn from(value: CongestionControlConfig) -> Self {
        match value {
            CongestionControlConfig::None => CongestionControl::None,
            CongestionControlConfig::Reno => CongestionControl::Reno,
            CongestionControlConfig::Cubic => CongestionControl::Cubic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_buffer_size")]
    pub rx_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub tx_buffer_size: usize,
    /// Datagrams each socket can hold per direction
    #[serde(default = "default_packet_slots")]
    pub packet_slots: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: default_buffer_size(),
            tx_buffer_size: default_buffer_size(),
            packet_slots: default_packet_slots(),
        }
    }
}

impl UdpConfig {
    fn validate(&self) -> Result<()> {
        if self.rx_buffer_size == 0 || self.tx_buffer_size == 0 || self.packet_slots == 0 {
            return Err(WgStackError::Config(
                "udp buffer sizes and packet_slots must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_packet_slots() -> usize {
    64
}

fn default_listen_backlog() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
