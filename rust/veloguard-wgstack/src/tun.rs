//! Tunnel device contract consumed by a WireGuard-style engine.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Device state change reported on the event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
}

/// Packet-oriented tunnel device.
///
/// The engine writes each decrypted IP packet with [`write`](Self::write) and
/// drains outbound packets with [`read`](Self::read). A closed error from
/// either is terminal.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Bring the device up.
    fn start(&self) -> Result<()>;

    /// Wait for one outbound packet and copy it into `bufs[0][offset..]`.
    ///
    /// Returns the number of packets read and records each length in `sizes`.
    async fn read(&self, bufs: &mut [&mut [u8]], sizes: &mut [usize], offset: usize)
        -> Result<usize>;

    /// Hand every non-empty `buf[offset..]` to the network stack.
    ///
    /// Returns the number of packets delivered.
    fn write(&self, bufs: &[&[u8]], offset: usize) -> Result<usize>;

    fn flush(&self) -> Result<()>;

    fn mtu(&self) -> Result<u32>;

    fn name(&self) -> Result<String>;

    /// Receiver for device events. Only the first call gets it.
    fn events(&self) -> Option<mpsc::Receiver<TunEvent>>;

    /// Maximum packets moved by one `read` or `write`
    fn batch_size(&self) -> usize;

    async fn close(&self) -> Result<()>;
}
