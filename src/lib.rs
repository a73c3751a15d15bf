#![deny(unsafe_op_in_unsafe_fn)]
//! Multi-transport network engine
//!
//! Worker threads own the sockets and run one readiness loop each; the main
//! thread talks to them only through bounded queues, via [`NetworkChannel`].
//! TCP streams are length-prefix framed, UDP carries raw datagrams, and KCP
//! layers a reliable stream over UDP.

pub mod affinity;
pub mod channel;
pub mod config;
pub mod conn_id;
pub mod datagram;
pub mod error;
pub mod event;
pub mod framing;
pub mod kcp;
pub mod nagle;
pub mod network;
pub mod poller; // epoll/kqueue/IOCP through mio, or io_uring
pub mod pool;
pub mod queue;
pub mod raw; // OS-level socket helpers (Unix/Windows)
pub mod ring_buffer;
pub mod socket;
pub mod worker;

/// Convenience re-exports
pub use channel::{EventHandler, NetworkChannel};
pub use config::{NetConfig, SocketOptions};
pub use conn_id::ConnectionId;
pub use error::{Error, NetError, Result};
pub use event::{NetType, Opaque};
pub use crate::kcp::KcpConfig;
pub use nagle::NagleConfig;
pub use ring_buffer::RingBuffer;
