//! Engine configuration and socket tuning
//!
//! [`NetConfig`] carries two kinds of settings. Engine settings size the
//! per-worker pools, queues and poll loop. [`SocketOptions`] are applied to
//! every OS socket before it is bound or connected.
//!
//! # Examples
//!
//! ```rust
//! use horizon_net::{NetConfig, NetType};
//! use std::time::Duration;
//!
//! let config = NetConfig {
//!     networks: vec![NetType::Tcp],
//!     poll_timeout: Duration::from_millis(1),
//!     ..NetConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::io;
use std::time::Duration;

use crate::conn_id::MAX_SLOTS;
use crate::error::{Error, Result};
use crate::event::NetType;
use crate::kcp::KcpConfig;
use crate::nagle::NagleConfig;
use crate::raw::{self, SockOpt};

/// Buffer size used when a request passes 0.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Options applied to each OS socket at creation.
///
/// Platform-specific options are ignored where unsupported.
#[derive(Clone, Debug, PartialEq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm in the kernel for stream sockets.
    ///
    /// This is independent of the engine's own Nagle simulation.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// TCP_QUICKACK (Linux only).
    ///
    /// **Default**: `true`
    pub tcp_quickack: bool,

    /// SO_REUSEPORT (Unix only). Lets several workers bind the same port.
    ///
    /// **Default**: `true`
    pub reuse_port: bool,

    /// TCP_DEFER_ACCEPT on listeners (Linux only): a peer is only reported
    /// once it has sent data.
    ///
    /// **Default**: `false`
    pub defer_accept: bool,

    /// SO_BUSY_POLL in microseconds (Linux only).
    ///
    /// **Default**: `None`
    pub busy_poll: Option<u32>,

    /// IP TOS / IPv6 traffic class.
    ///
    /// **Default**: `None`
    pub tos: Option<u32>,

    /// IPV6_V6ONLY on IPv6 sockets. `None` keeps the system default.
    ///
    /// **Default**: `Some(false)` (dual-stack)
    pub ipv6_only: Option<bool>,

    /// IPv6 unicast hop limit.
    ///
    /// **Default**: `None`
    pub hop_limit: Option<i32>,

    /// Listen backlog.
    ///
    /// **Default**: `1024`
    pub tcp_backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            reuse_port: true,
            defer_accept: false,
            busy_poll: None,
            tos: None,
            ipv6_only: Some(false),
            hop_limit: None,
            tcp_backlog: 1024,
        }
    }
}

/// Engine configuration shared by every worker.
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// Network types each worker hosts. Requests for other types are rejected.
    ///
    /// **Default**: TCP, UDP and KCP
    pub networks: Vec<NetType>,

    /// Socket pool size of each network on each worker, clamped to 65535.
    ///
    /// **Default**: `4096`
    pub max_sockets: usize,

    /// Readiness events collected per poll.
    ///
    /// **Default**: `1024`
    pub max_events: usize,

    /// Upper bound on one worker loop iteration's total poll wait. It is split
    /// evenly between the worker's networks.
    ///
    /// **Default**: `2ms`
    pub poll_timeout: Duration,

    /// Period of the maintenance tick (KCP updates, Nagle timeouts, idle UDP
    /// sessions).
    ///
    /// **Default**: `10ms`
    pub tick_interval: Duration,

    /// Capacity of each command and notice queue.
    ///
    /// **Default**: `8192`
    pub queue_capacity: usize,

    /// Send/receive buffer size used when a request passes 0.
    ///
    /// **Default**: 256 KiB
    pub default_buffer_size: usize,

    /// Accepted UDP and KCP sessions silent for longer than this are closed
    /// with `NetError::Timeout`. `None` keeps them until closed explicitly.
    ///
    /// **Default**: `Some(60s)`
    pub udp_session_idle: Option<Duration>,

    /// Worker `i` is pinned to `worker_cpus[i % len]`. Empty disables pinning.
    ///
    /// **Default**: empty
    pub worker_cpus: Vec<usize>,

    /// Initial Nagle simulation settings of the TCP networks.
    ///
    /// **Default**: disabled
    pub nagle: NagleConfig,

    pub kcp: KcpConfig,

    pub socket: SocketOptions,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            networks: NetType::ALL.to_vec(),
            max_sockets: 4096,
            max_events: 1024,
            poll_timeout: Duration::from_millis(2),
            tick_interval: Duration::from_millis(10),
            queue_capacity: 8192,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            udp_session_idle: Some(Duration::from_secs(60)),
            worker_cpus: Vec::new(),
            nagle: NagleConfig::default(),
            kcp: KcpConfig::default(),
            socket: SocketOptions::default(),
        }
    }
}

impl NetConfig {
    /// Short poll waits, busy polling and a fast KCP profile.
    ///
    /// Spins harder and uses more CPU than the default.
    pub fn low_latency() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1),
            tick_interval: Duration::from_millis(5),
            kcp: KcpConfig::fast(),
            socket: SocketOptions {
                busy_poll: Some(50),
                tos: Some(0x10),
                tcp_backlog: 512,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Large buffers and event batches for bulk transfer.
    pub fn high_throughput() -> Self {
        Self {
            max_events: 4096,
            poll_timeout: Duration::from_millis(10),
            queue_capacity: 65536,
            default_buffer_size: 4 << 20,
            socket: SocketOptions {
                tcp_quickack: false,
                tos: Some(0x08),
                tcp_backlog: 2048,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Long poll waits and a slow tick to keep wakeups down.
    pub fn power_efficient() -> Self {
        Self {
            poll_timeout: Duration::from_millis(50),
            tick_interval: Duration::from_millis(50),
            default_buffer_size: 64 * 1024,
            socket: SocketOptions {
                tcp_quickack: false,
                reuse_port: false,
                tcp_backlog: 256,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Checks the settings a worker cannot run without.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_owned()));
        if self.networks.is_empty() {
            return invalid("no network type enabled");
        }
        for (i, net) in self.networks.iter().enumerate() {
            if self.networks[..i].contains(net) {
                return Err(Error::InvalidConfig(format!("network {:?} listed twice", net)));
            }
        }
        if self.max_sockets == 0 {
            return invalid("max_sockets must be positive");
        }
        if self.max_events == 0 {
            return invalid("max_events must be positive");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be positive");
        }
        if self.tick_interval.is_zero() {
            return invalid("tick_interval must be positive");
        }
        if self.default_buffer_size < 16 {
            return invalid("default_buffer_size must be at least 16 bytes");
        }
        self.kcp.validate()
    }

    /// Pool size actually used per network.
    pub fn pool_size(&self) -> usize {
        self.max_sockets.min(MAX_SLOTS)
    }

    /// Maps a requested buffer size to the effective one.
    pub fn buffer_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_buffer_size
        } else {
            requested
        }
    }
}

/// Applies `opts` and the kernel buffer sizes to a freshly created socket.
///
/// Must run before bind/connect. Busy poll and quick ack are advisory and
/// their failures are ignored.
pub fn apply_socket_options(
    os: raw::OsSocket,
    domain: raw::Domain,
    ty: raw::Type,
    opts: &SocketOptions,
    send_buf: usize,
    recv_buf: usize,
) -> io::Result<()> {
    let clamp = |sz: usize| sz.min(i32::MAX as usize) as i32;
    let mut required = vec![SockOpt::RecvBuffer(clamp(recv_buf)), SockOpt::SendBuffer(clamp(send_buf))];
    let mut advisory = Vec::new();

    if let Some(tos) = opts.tos {
        required.push(SockOpt::TrafficClass(domain, tos.min(i32::MAX as u32) as i32));
    }
    if domain == raw::Domain::Ipv6 {
        required.extend(opts.ipv6_only.map(SockOpt::V6Only));
        required.extend(opts.hop_limit.map(SockOpt::HopLimit));
    }
    if opts.reuse_port {
        required.push(SockOpt::ReusePort(true));
    }
    advisory.extend(opts.busy_poll.map(SockOpt::BusyPoll));
    if ty == raw::Type::Stream {
        if opts.tcp_nodelay {
            required.push(SockOpt::NoDelay(true));
        }
        if opts.tcp_quickack {
            advisory.push(SockOpt::QuickAck(true));
        }
    }

    for opt in required {
        raw::set(os, opt)?;
    }
    for opt in advisory {
        if let Err(e) = raw::set(os, opt) {
            log::debug!("advisory socket option {:?} not applied: {}", opt, e);
        }
    }
    Ok(())
}
