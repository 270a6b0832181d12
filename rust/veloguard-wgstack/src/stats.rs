use std::sync::atomic::{AtomicU64, Ordering};

/// Tunnel device statistics
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Packets handed to readers
    pub packets_read: AtomicU64,
    /// Packets delivered to the stack from writers
    pub packets_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Packets the stack placed on the outbound queue
    pub packets_queued: AtomicU64,
    /// Inbound buffers dropped before reaching the stack
    pub inbound_dropped: AtomicU64,
    pub read_errors: AtomicU64,
}

impl DeviceStats {
    pub fn record_read(&self, bytes: usize) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.packets_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_drop(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of device statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatsSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets_queued: u64,
    pub inbound_dropped: u64,
    pub read_errors: u64,
}
