use std::io;

use thiserror::Error;

/// Failure kinds reported inside worker notices.
///
/// These never cross the thread boundary as `Err` values; they ride along in
/// [`Notice`](crate::event::Notice) fields next to the raw OS error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NetError {
    /// The socket pool has no free slot.
    #[error("socket pool exhausted")]
    AllocFailed,
    /// Creating, binding or listening on a socket failed.
    #[error("listen failed")]
    ListenFailed,
    /// The outbound connection could not be established.
    #[error("connect failed")]
    ConnectFailed,
    /// A frame header declared more bytes than the receive limit, or a
    /// datagram exceeded it.
    #[error("invalid packet size")]
    InvalidPacketSize,
    /// An OS call failed outside of send/recv.
    #[error("system error")]
    SysError,
    #[error("send failed")]
    SendFailed,
    #[error("receive failed")]
    RecvFailed,
    #[error("send buffer overflow")]
    SendBuffOverflow,
    #[error("receive buffer overflow")]
    RecvBuffOverflow,
    /// The network type is not served by this engine.
    #[error("invalid network type")]
    InvalidNetType,
    /// A connection id named a worker that does not exist.
    #[error("invalid worker thread index")]
    InvalidThreadIndex,
    /// A command did not apply to the socket it named.
    #[error("invalid event")]
    InvalidEvent,
    /// A UDP session saw no traffic for longer than the idle limit.
    #[error("session idle timeout")]
    Timeout,
}

/// Errors returned synchronously by [`NetworkChannel`](crate::channel::NetworkChannel) calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network channel not started")]
    NotStarted,
    #[error("network channel already started")]
    AlreadyStarted,
    /// The worker's command queue is full; the command was not enqueued.
    #[error("command queue full")]
    QueueFull,
    #[error("network type {0:?} is not enabled")]
    InvalidNetType(crate::event::NetType),
    #[error("worker index {0} out of range")]
    InvalidThreadIndex(usize),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Raw OS error number of `err`, or 0 when it carries none.
pub fn sys_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// A fatal condition on one socket: what failed and the OS error behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub code: NetError,
    pub sys_err: i32,
}

impl Fault {
    pub const fn new(code: NetError) -> Self {
        Self { code, sys_err: 0 }
    }

    pub fn io(code: NetError, err: &io::Error) -> Self {
        Self { code, sys_err: sys_errno(err) }
    }
}

impl From<NetError> for Fault {
    fn from(code: NetError) -> Self {
        Self::new(code)
    }
}
