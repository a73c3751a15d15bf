//! Readiness multiplexing behind one interface
//!
//! Each network owns one [`Poller`]. Sockets are registered under their
//! [`ConnectionId`], and `wait` reports which of them became readable,
//! writable or failed. The back-end is chosen at compile time:
//!
//! - **Linux** with feature `uring-poller`: io_uring `POLL_ADD` requests
//! - **everything else**: `mio` (epoll, kqueue or IOCP)

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use crate::conn_id::ConnectionId;

/// Set of readiness conditions, used both as registered interest and as the
/// condition reported by [`Multiplexer::wait`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const RECV: Ready = Ready(1);
    pub const SEND: Ready = Ready(2);
    /// Only ever reported, never registered.
    pub const ERR: Ready = Ready(4);

    #[inline]
    pub const fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns the current set and leaves this one empty.
    #[inline]
    pub fn take(&mut self) -> Ready {
        std::mem::take(self)
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(3);
        if self.contains(Ready::RECV) {
            names.push("RECV");
        }
        if self.contains(Ready::SEND) {
            names.push("SEND");
        }
        if self.contains(Ready::ERR) {
            names.push("ERR");
        }
        write!(f, "Ready({})", names.join("|"))
    }
}

/// One reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: ConnectionId,
    pub ready: Ready,
}

/// A per-network readiness multiplexer.
///
/// Interest always includes [`Ready::RECV`]; `SEND` is added while a socket
/// has queued output or a connect in flight.
pub trait Multiplexer: Sized {
    fn with_capacity(max_events: usize) -> io::Result<Self>;

    fn register<S: PollSource + ?Sized>(&mut self, source: &mut S, token: ConnectionId, interest: Ready) -> io::Result<()>;

    fn reregister<S: PollSource + ?Sized>(&mut self, source: &mut S, token: ConnectionId, interest: Ready) -> io::Result<()>;

    fn deregister<S: PollSource + ?Sized>(&mut self, source: &mut S, token: ConnectionId) -> io::Result<()>;

    /// Blocks up to `timeout` and appends the reported events to `out`.
    /// An interrupted wait reports zero events.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<usize>;
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "uring-poller"))] {
        mod uring;
        pub use self::uring::UringPoller;

        /// Anything the active back-end can watch.
        pub trait PollSource: std::os::fd::AsRawFd {}
        impl<T: std::os::fd::AsRawFd + ?Sized> PollSource for T {}

        pub type Poller = UringPoller;
    } else {
        mod mio;
        pub use self::mio::MioPoller;

        /// Anything the active back-end can watch.
        pub trait PollSource: ::mio::event::Source {}
        impl<T: ::mio::event::Source + ?Sized> PollSource for T {}

        pub type Poller = MioPoller;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener as StdListener, UdpSocket as StdUdp};
    use std::time::Instant;

    #[test]
    fn test_ready_set_ops() {
        let mut r = Ready::RECV | Ready::SEND;
        assert!(r.contains(Ready::RECV));
        assert!(r.contains(Ready::SEND));
        assert!(!r.contains(Ready::ERR));
        assert!(!r.contains(Ready::EMPTY));
        r.remove(Ready::RECV);
        assert_eq!(r, Ready::SEND);
        assert_eq!(r.take(), Ready::SEND);
        assert!(r.is_empty());
    }

    fn wait_for(poller: &mut Poller, token: ConnectionId, want: Ready) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.clear();
            poller.wait(Some(Duration::from_millis(20)), &mut events).unwrap();
            if events.iter().any(|e| e.token == token && e.ready.contains(want)) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_udp_readable_reports_full_token() {
        let mut poller = Poller::with_capacity(64).unwrap();
        let std_sock = StdUdp::bind("127.0.0.1:0").unwrap();
        std_sock.set_nonblocking(true).unwrap();
        let addr = std_sock.local_addr().unwrap();
        let mut sock = ::mio::net::UdpSocket::from_std(std_sock);

        // a high cycle byte must survive the round trip through the back-end
        let token = ConnectionId::new(0xC3, 7, 42);
        poller.register(&mut sock, token, Ready::RECV).unwrap();

        let sender = StdUdp::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello", addr).unwrap();
        assert!(wait_for(&mut poller, token, Ready::RECV));

        poller.deregister(&mut sock, token).unwrap();
    }

    #[test]
    fn test_send_interest_toggles() {
        let mut poller = Poller::with_capacity(64).unwrap();
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut server = ::mio::net::TcpStream::from_std(server);

        let token = ConnectionId::new(1, 0, 3);
        poller.register(&mut server, token, Ready::RECV | Ready::SEND).unwrap();
        assert!(wait_for(&mut poller, token, Ready::SEND));

        poller.reregister(&mut server, token, Ready::RECV).unwrap();
        client.write_all(b"x").unwrap();
        assert!(wait_for(&mut poller, token, Ready::RECV));
    }
}
