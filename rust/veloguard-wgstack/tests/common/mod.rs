//! Helpers shared by the integration tests.

#![allow(dead_code)]

mod packets;

pub use packets::{icmp_echo_request, parse_echo_reply};

use std::time::Duration;

use veloguard_wgstack::{StackDevice, TunDevice};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Device with one IPv4 and one IPv6 address.
pub fn dual_stack_device() -> StackDevice {
    init_tracing();
    StackDevice::new(
        &["10.0.0.2/24".parse().unwrap(), "fd00::2/64".parse().unwrap()],
        1420,
    )
    .unwrap()
}

/// Read one packet from the device, failing the test after [`READ_TIMEOUT`].
pub async fn read_packet(device: &StackDevice) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let mut sizes = [0usize; 1];
    let n = tokio::time::timeout(READ_TIMEOUT, device.read(&mut [&mut buf[..]], &mut sizes, 0))
        .await
        .expect("read timed out")
        .expect("read failed");
    assert_eq!(n, 1);
    buf.truncate(sizes[0]);
    buf
}
