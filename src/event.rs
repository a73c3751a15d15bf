//! Values exchanged between the main thread and the workers
//!
//! Commands flow main → worker, notices flow worker → main. Both are plain
//! enums moved through the SPSC queues; any payload travels inside the value
//! and belongs to whoever popped it.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::conn_id::ConnectionId;
use crate::error::NetError;

/// Caller-chosen tag echoed back on every notice derived from one
/// `accept`/`connect` request.
pub type Opaque = u64;

/// Transport served by a network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetType {
    Tcp,
    Udp,
    /// KCP reliable stream over UDP datagrams.
    Kcp,
}

impl NetType {
    pub const ALL: [NetType; 3] = [NetType::Tcp, NetType::Udp, NetType::Kcp];

    pub fn name(self) -> &'static str {
        match self {
            NetType::Tcp => "tcp",
            NetType::Udp => "udp",
            NetType::Kcp => "kcp",
        }
    }
}

/// Per-request socket parameters. A size of 0 selects the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub send_buf: usize,
    pub recv_buf: usize,
}

/// Main → worker.
#[derive(Debug)]
pub enum Command {
    Listen { opaque: Opaque, endpoint: Endpoint },
    Connect { opaque: Opaque, endpoint: Endpoint },
    Close { conn_id: ConnectionId },
    Send { conn_id: ConnectionId, data: Bytes },
    SimulateNagle { packet_count: u32, timeout: Duration },
}

/// Worker → main.
#[derive(Debug)]
pub enum Notice {
    /// A listener is bound and registered.
    Bound { opaque: Opaque, conn_id: ConnectionId, addr: SocketAddr },
    /// A peer socket was observed but is not yet registered for readiness.
    Accepting { opaque: Opaque, listener: ConnectionId, conn_id: ConnectionId, peer: SocketAddr },
    /// The peer socket is registered and ready for traffic.
    Accepted { opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr },
    Connected { opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr },
    ConnectFailed { opaque: Opaque, code: NetError, sys_err: i32 },
    /// A request failed without producing a live connection, e.g. a failed
    /// listen or an exhausted pool.
    Errored { opaque: Opaque, conn_id: ConnectionId, code: NetError, sys_err: i32 },
    /// Terminal notice of a live socket. `code` is `None` for orderly closes.
    Closed { opaque: Opaque, conn_id: ConnectionId, code: Option<NetError>, sys_err: i32 },
    Received { opaque: Opaque, conn_id: ConnectionId, data: Bytes },
}

impl Notice {
    pub fn opaque(&self) -> Opaque {
        match self {
            Notice::Bound { opaque, .. }
            | Notice::Accepting { opaque, .. }
            | Notice::Accepted { opaque, .. }
            | Notice::Connected { opaque, .. }
            | Notice::ConnectFailed { opaque, .. }
            | Notice::Errored { opaque, .. }
            | Notice::Closed { opaque, .. }
            | Notice::Received { opaque, .. } => *opaque,
        }
    }
}
