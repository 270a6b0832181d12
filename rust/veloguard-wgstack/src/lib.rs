//! VeloGuard WireGuard Stack Device
//!
//! A tunnel device for a WireGuard-style engine that needs no operating system
//! TUN interface. Packets the engine writes are handed to an in-process
//! TCP/IP stack (smoltcp); packets the stack emits are queued for the engine
//! to read, encrypt and send.
//!
//! This crate provides:
//! - [`StackDevice`], implementing the [`TunDevice`] contract
//! - [`WireEndpoint`], the link layer the stack transmits through
//! - TCP dial/listen and UDP dial/listen over the stack's own addresses
//! - YAML configuration and per-device statistics
//!
//! # Example
//!
//! ```rust,no_run
//! use veloguard_wgstack::{StackDevice, TunDevice};
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = StackDevice::new(
//!         &["10.0.0.2/24".parse()?, "fd00::2/64".parse()?],
//!         1420,
//!     )?;
//!     device.start()?;
//!
//!     // Outbound connection through the tunnel
//!     let conn = device.dial_context("tcp", "10.0.0.1:80".parse()?).await?;
//!     println!("connected from {}", conn.local_addr());
//!
//!     // Engine side: drain packets the stack wants sent
//!     let mut buf = vec![0u8; 1500];
//!     let mut sizes = [0usize; 1];
//!     device.read(&mut [&mut buf[..]], &mut sizes, 0).await?;
//!
//!     device.close().await?;
//!     Ok(())
//! }
//! ```

pub mod addr;
pub mod config;
pub mod device;
pub mod dial;
pub mod error;
pub mod link;
pub mod packet;
pub mod stack;
pub mod stats;
pub mod tun;

#[cfg(test)]
mod tests;

// Re-exports
pub use config::{CongestionControlConfig, TcpConfig, UdpConfig, WgStackConfig};
pub use device::{StackDevice, WireEndpoint, DEFAULT_NIC};
pub use dial::{dial_tcp_with_bind, dial_udp, FullAddress, NetConn, Network};
pub use error::{Result, StackError, WgStackError};
pub use link::{LinkEndpoint, NetworkDispatcher, NetworkProtocol};
pub use packet::{PacketAccounting, PacketBuffer};
pub use stack::{Stack, StackOptions, TcpListener, TcpStream, UdpConn};
pub use stats::DeviceStatsSnapshot;
pub use tun::{TunDevice, TunEvent};
