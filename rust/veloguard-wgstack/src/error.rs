use std::io;
use thiserror::Error;

/// Errors raised by the in-process network stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("stack is closed")]
    Closed,

    #[error("endpoint is closed for send ({written} packets written)")]
    ClosedForSend { written: usize },

    #[error("NIC {0} already exists")]
    DuplicateNic(u32),

    #[error("unknown NIC {0}")]
    UnknownNic(u32),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("no room left for another address or route")]
    AddressExhausted,

    #[error("network protocol {0} is not enabled")]
    ProtocolDisabled(&'static str),

    #[error("no ephemeral port available")]
    PortExhausted,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("connection timed out")]
    TimedOut,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("no local address can reach the destination")]
    Unaddressable,

    #[error("endpoint is in an invalid state")]
    InvalidState,

    #[error("not connected")]
    NotConnected,

    #[error("message too long: {len} bytes exceeds {capacity}")]
    MessageTooLong { len: usize, capacity: usize },

    #[error("TCP error: {0}")]
    Tcp(String),

    #[error("UDP error: {0}")]
    Udp(String),
}

impl From<smoltcp::socket::tcp::RecvError> for StackError {
    fn from(e: smoltcp::socket::tcp::RecvError) -> Self {
        StackError::Tcp(format!("recv: {:?}", e))
    }
}

impl From<smoltcp::socket::tcp::SendError> for StackError {
    fn from(e: smoltcp::socket::tcp::SendError) -> Self {
        StackError::Tcp(format!("send: {:?}", e))
    }
}

impl From<smoltcp::socket::tcp::ConnectError> for StackError {
    fn from(e: smoltcp::socket::tcp::ConnectError) -> Self {
        match e {
            smoltcp::socket::tcp::ConnectError::Unaddressable => StackError::Unaddressable,
            #[allow(unreachable_patterns)]
            _ => StackError::InvalidState,
        }
    }
}

impl From<smoltcp::socket::tcp::ListenError> for StackError {
    fn from(e: smoltcp::socket::tcp::ListenError) -> Self {
        StackError::Tcp(format!("listen: {:?}", e))
    }
}

impl From<smoltcp::socket::udp::BindError> for StackError {
    fn from(e: smoltcp::socket::udp::BindError) -> Self {
        StackError::Udp(format!("bind: {:?}", e))
    }
}

impl From<smoltcp::socket::udp::SendError> for StackError {
    fn from(e: smoltcp::socket::udp::SendError) -> Self {
        match e {
            smoltcp::socket::udp::SendError::Unaddressable => StackError::Unaddressable,
            #[allow(unreachable_patterns)]
            other => StackError::Udp(format!("send: {:?}", other)),
        }
    }
}

impl From<smoltcp::socket::udp::RecvError> for StackError {
    fn from(e: smoltcp::socket::udp::RecvError) -> Self {
        StackError::Udp(format!("recv: {:?}", e))
    }
}

impl From<StackError> for io::Error {
    fn from(e: StackError) -> Self {
        let kind = match &e {
            StackError::Closed | StackError::ClosedForSend { .. } => io::ErrorKind::BrokenPipe,
            StackError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            StackError::Unaddressable => io::ErrorKind::AddrNotAvailable,
            StackError::PortExhausted | StackError::PortInUse(_) => io::ErrorKind::AddrInUse,
            StackError::TimedOut => io::ErrorKind::TimedOut,
            StackError::NotConnected | StackError::InvalidState => io::ErrorKind::NotConnected,
            StackError::MessageTooLong { .. } | StackError::BadAddress(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Errors surfaced by the tunnel device
#[derive(Error, Debug)]
pub enum WgStackError {
    #[error("create NIC: {0}")]
    CreateNic(StackError),

    #[error("parse local address {prefix}: {source}")]
    AddAddress {
        prefix: cidr::IpInet,
        #[source]
        source: StackError,
    },

    #[error("file already closed")]
    Closed,

    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("no network dispatcher attached")]
    NotAttached,

    #[error("short buffer: packet of {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no tokio runtime available to drive the stack")]
    Runtime,

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WgStackError {
    /// Whether the error reports a closed device, which callers treat as terminal.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            WgStackError::Closed
                | WgStackError::Stack(StackError::Closed)
                | WgStackError::Stack(StackError::ClosedForSend { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, WgStackError>;
