//! Shared test helpers.


#[path = "../../tests/common/packets.rs"]
mod packets;

pub(crate) use packets::{icmp_echo_request, parse_echo_reply};
