//! Pooled UDP socket: listener, connector or accepted session
//!
//! Listeners and connectors own an OS socket and a [`DatagramQueue`] for
//! sends that would block. Sessions own nothing but their peer address; they
//! send through the listener that accepted them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::UdpSocket as MioUdpSocket;

use super::{bind_datagram, connect_datagram, is_would_block, SocketState};
use crate::config::SocketOptions;
use crate::conn_id::ConnectionId;
use crate::datagram::DatagramQueue;
use crate::error::{Fault, NetError};
use crate::event::Opaque;
use crate::kcp::KcpSession;
use crate::poller::{Multiplexer, Poller, Ready};
use crate::pool::Pooled;

/// Tag bit separating hashed IPv6 ids from the 48-bit IPv4 ids.
const V6_TAG: u64 = 1 << 63;

/// Maps a peer address to the 64-bit id its session is filed under.
///
/// IPv4 peers map to `ip << 16 | port`, which is collision-free. IPv6 peers
/// fold into a tagged hash.
pub fn address_id(peer: &SocketAddr) -> u64 {
    match peer {
        SocketAddr::V4(v4) => (u64::from(u32::from(*v4.ip())) << 16) | u64::from(v4.port()),
        SocketAddr::V6(v6) => {
            let mut h = DefaultHasher::new();
            v6.ip().hash(&mut h);
            v6.port().hash(&mut h);
            V6_TAG | (h.finish() & !V6_TAG)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
    Session,
}

#[derive(Debug, Default)]
enum Kind {
    #[default]
    None,
    Listener {
        socket: MioUdpSocket,
        sessions: HashMap<u64, ConnectionId>,
        queue: DatagramQueue,
    },
    Connector {
        socket: MioUdpSocket,
        peer: SocketAddr,
        queue: DatagramQueue,
    },
    Session {
        listener: ConnectionId,
        peer: SocketAddr,
    },
}

pub struct UdpSocket {
    conn_id: ConnectionId,
    opaque: Opaque,
    state: SocketState,
    kind: Kind,
    kcp: Option<KcpSession>,
    last_active: Instant,
    interest: Ready,
    send_buf: usize,
    recv_buf: usize,
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self {
            conn_id: ConnectionId::INVALID,
            opaque: 0,
            state: SocketState::Invalid,
            kind: Kind::None,
            kcp: None,
            last_active: Instant::now(),
            interest: Ready::EMPTY,
            send_buf: 0,
            recv_buf: 0,
        }
    }
}

impl Pooled for UdpSocket {
    fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    fn set_conn_id(&mut self, id: ConnectionId) {
        self.conn_id = id;
    }

    fn reset(&mut self) {
        self.kind = Kind::None;
        self.kcp = None;
        self.opaque = 0;
        self.state = SocketState::Invalid;
        self.interest = Ready::EMPTY;
        self.send_buf = 0;
        self.recv_buf = 0;
    }
}

impl UdpSocket {
    pub fn opaque(&self) -> Opaque {
        self.opaque
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        match self.kind {
            Kind::None => None,
            Kind::Listener { .. } => Some(Role::Listener),
            Kind::Connector { .. } => Some(Role::Connector),
            Kind::Session { .. } => Some(Role::Session),
        }
    }

    /// Largest datagram (or KCP delivery) accepted.
    pub fn max_recv(&self) -> usize {
        self.recv_buf
    }

    /// Bytes that may wait for the OS before the socket overflows.
    pub fn max_send(&self) -> usize {
        self.send_buf
    }

    pub fn buffer_sizes(&self) -> (usize, usize) {
        (self.send_buf, self.recv_buf)
    }

    pub fn kcp_mut(&mut self) -> Option<&mut KcpSession> {
        self.kcp.as_mut()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn idle_since(&self) -> Instant {
        self.last_active
    }

    /// Listener and peer of an accepted session.
    pub fn session_of(&self) -> Option<(ConnectionId, SocketAddr)> {
        match self.kind {
            Kind::Session { listener, peer } => Some((listener, peer)),
            _ => None,
        }
    }

    /// Peer a session or connector talks to.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self.kind {
            Kind::Session { peer, .. } | Kind::Connector { peer, .. } => Some(peer),
            _ => None,
        }
    }

    /// Binds a listener. The state stays `Invalid` unless every step succeeds.
    pub fn listen(
        &mut self,
        poller: &mut Poller,
        opaque: Opaque,
        addr: SocketAddr,
        opts: &SocketOptions,
        send_buf: usize,
        recv_buf: usize,
    ) -> Result<SocketAddr, Fault> {
        self.opaque = opaque;
        self.send_buf = send_buf;
        self.recv_buf = recv_buf;

        let fail = |e: io::Error| Fault::io(NetError::ListenFailed, &e);
        let mut socket = bind_datagram(addr, opts, send_buf, recv_buf).map_err(fail)?;
        let local = socket.local_addr().map_err(fail)?;
        poller.register(&mut socket, self.conn_id, Ready::RECV).map_err(fail)?;

        self.kind = Kind::Listener { socket, sessions: HashMap::new(), queue: DatagramQueue::default() };
        self.interest = Ready::RECV;
        self.state = SocketState::Listening;
        Ok(local)
    }

    /// Binds an ephemeral socket connected to `peer`. There is no handshake;
    /// the socket is established as soon as this returns.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        poller: &mut Poller,
        opaque: Opaque,
        peer: SocketAddr,
        opts: &SocketOptions,
        send_buf: usize,
        recv_buf: usize,
        kcp: Option<KcpSession>,
        now: Instant,
    ) -> Result<(), Fault> {
        self.opaque = opaque;
        self.send_buf = send_buf;
        self.recv_buf = recv_buf;
        self.state = SocketState::Connecting;

        let fail = |e: io::Error| Fault::io(NetError::ConnectFailed, &e);
        let mut socket = connect_datagram(peer, opts, send_buf, recv_buf).map_err(fail)?;
        poller.register(&mut socket, self.conn_id, Ready::RECV).map_err(fail)?;

        self.kind = Kind::Connector { socket, peer, queue: DatagramQueue::default() };
        self.kcp = kcp;
        self.interest = Ready::RECV;
        self.last_active = now;
        self.state = SocketState::Established;
        Ok(())
    }

    /// Turns this slot into a session accepted by `listener` for `peer`.
    #[allow(clippy::too_many_arguments)]
    pub fn open_session(
        &mut self,
        opaque: Opaque,
        listener: ConnectionId,
        peer: SocketAddr,
        send_buf: usize,
        recv_buf: usize,
        kcp: Option<KcpSession>,
        now: Instant,
    ) {
        self.opaque = opaque;
        self.send_buf = send_buf;
        self.recv_buf = recv_buf;
        self.kind = Kind::Session { listener, peer };
        self.kcp = kcp;
        self.last_active = now;
        self.state = SocketState::Established;
    }

    /// Session filed under `address_id` on this listener.
    pub fn find_session(&self, address_id: u64) -> Option<ConnectionId> {
        match &self.kind {
            Kind::Listener { sessions, .. } => sessions.get(&address_id).copied(),
            _ => None,
        }
    }

    pub fn insert_session(&mut self, address_id: u64, id: ConnectionId) {
        if let Kind::Listener { sessions, .. } = &mut self.kind {
            sessions.insert(address_id, id);
        }
    }

    /// Forgets the session for `peer` and drops its queued datagrams.
    pub fn remove_session(&mut self, peer: SocketAddr) {
        if let Kind::Listener { sessions, queue, .. } = &mut self.kind {
            sessions.remove(&address_id(&peer));
            queue.discard_to(peer);
        }
    }

    pub fn session_ids(&self) -> Vec<ConnectionId> {
        match &self.kind {
            Kind::Listener { sessions, .. } => sessions.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Receives one datagram into `buf`. `Ok(None)` once the socket is drained.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            let res = match &self.kind {
                Kind::Listener { socket, .. } => socket.recv_from(buf),
                Kind::Connector { socket, peer, .. } => socket.recv(buf).map(|n| (n, *peer)),
                _ => return Ok(None),
            };
            match res {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) if is_would_block(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends one datagram through this listener or connector, queueing it if
    /// the OS would block or earlier datagrams are still waiting.
    ///
    /// Returns `true` when the datagram was queued.
    pub fn transmit(&mut self, data: &[u8], to: Option<SocketAddr>) -> Result<bool, Fault> {
        let (socket, queue) = match &mut self.kind {
            Kind::Listener { socket, queue, .. } | Kind::Connector { socket, queue, .. } => (socket, queue),
            _ => return Err(NetError::InvalidEvent.into()),
        };
        if !queue.is_empty() {
            queue.push(data, to);
            return Ok(true);
        }
        loop {
            let res = match to {
                Some(addr) => socket.send_to(data, addr),
                None => socket.send(data),
            };
            match res {
                Ok(_) => return Ok(false),
                Err(e) if is_would_block(&e) => {
                    queue.push(data, to);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(NetError::SendFailed, &e)),
            }
        }
    }

    /// Bytes waiting in this owner's queue; only those addressed to `to` when given.
    pub fn queued(&self, to: Option<SocketAddr>) -> usize {
        match (&self.kind, to) {
            (Kind::Listener { queue, .. }, Some(addr)) => queue.bytes_to(addr),
            (Kind::Listener { queue, .. }, None) | (Kind::Connector { queue, .. }, _) => queue.bytes(),
            _ => 0,
        }
    }

    /// Sends queued datagrams until the OS would block.
    ///
    /// On a hard error the failing datagram's destination is returned so the
    /// caller can fail the session it belongs to.
    pub fn flush_queue(&mut self) -> Result<bool, (Option<SocketAddr>, Fault)> {
        let (socket, queue) = match &mut self.kind {
            Kind::Listener { socket, queue, .. } | Kind::Connector { socket, queue, .. } => (socket, queue),
            _ => return Ok(true),
        };
        let mut failed_to = None;
        queue
            .flush(|data, to| {
                failed_to = to;
                match to {
                    Some(addr) => socket.send_to(data, addr),
                    None => socket.send(data),
                }
            })
            .map_err(|e| (failed_to, Fault::io(NetError::SendFailed, &e)))
    }

    /// Registers SEND interest while datagrams are queued.
    pub fn sync_interest(&mut self, poller: &mut Poller) -> Result<(), Fault> {
        let interest = if self.queued(None) > 0 { Ready::RECV | Ready::SEND } else { Ready::RECV };
        if interest == self.interest {
            return Ok(());
        }
        let id = self.conn_id;
        let res = match &mut self.kind {
            Kind::Listener { socket, .. } | Kind::Connector { socket, .. } => poller.reregister(socket, id, interest),
            _ => return Ok(()),
        };
        res.map_err(|e| Fault::io(NetError::SysError, &e))?;
        self.interest = interest;
        Ok(())
    }

    /// Pending OS error, reported as `code`.
    pub fn take_error(&self, code: NetError) -> Fault {
        let err = match &self.kind {
            Kind::Listener { socket, .. } | Kind::Connector { socket, .. } => socket.take_error(),
            _ => Ok(None),
        };
        match err {
            Ok(Some(e)) | Err(e) => Fault::io(code, &e),
            Ok(None) => Fault::new(code),
        }
    }

    pub fn deregister(&mut self, poller: &mut Poller) {
        if self.interest.is_empty() {
            return;
        }
        let id = self.conn_id;
        if let Kind::Listener { socket, .. } | Kind::Connector { socket, .. } = &mut self.kind {
            if let Err(e) = poller.deregister(socket, id) {
                log::debug!("deregister {:?} failed: {}", id, e);
            }
        }
        self.interest = Ready::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddrV6};
    use std::time::Duration;

    fn opts() -> SocketOptions {
        SocketOptions { reuse_port: false, ..SocketOptions::default() }
    }

    #[test]
    fn test_address_id_layout() {
        let v4: SocketAddr = "10.1.2.3:4660".parse().unwrap();
        assert_eq!(address_id(&v4), (0x0A01_0203u64 << 16) | 0x1234);

        let v6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4660, 0, 0));
        let id = address_id(&v6);
        assert_ne!(id & V6_TAG, 0);
        assert_eq!(id, address_id(&v6));
        let other = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4661, 0, 0));
        assert_ne!(id, address_id(&other));
    }

    #[test]
    fn test_listener_and_connector_exchange() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let mut listener = UdpSocket::default();
        listener.set_conn_id(ConnectionId::new(0, 0, 0));
        let local = listener
            .listen(&mut poller, 1, "127.0.0.1:0".parse().unwrap(), &opts(), 4096, 4096)
            .unwrap();
        assert_eq!(listener.role(), Some(Role::Listener));

        let mut connector = UdpSocket::default();
        connector.set_conn_id(ConnectionId::new(0, 0, 1));
        connector
            .connect(&mut poller, 2, local, &opts(), 4096, 4096, None, Instant::now())
            .unwrap();
        assert_eq!(connector.state(), SocketState::Established);
        assert!(!connector.transmit(b"hello", None).unwrap());

        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (n, from) = loop {
            if let Some(pair) = listener.recv(&mut buf).unwrap() {
                break pair;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(&buf[..n], b"hello");

        assert!(!listener.transmit(b"back", Some(from)).unwrap());
        let deadline = Instant::now() + Duration::from_secs(2);
        let (n, _) = loop {
            if let Some(pair) = connector.recv(&mut buf).unwrap() {
                break pair;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_session_bookkeeping() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let mut listener = UdpSocket::default();
        listener.set_conn_id(ConnectionId::new(0, 0, 0));
        listener
            .listen(&mut poller, 1, "127.0.0.1:0".parse().unwrap(), &opts(), 4096, 4096)
            .unwrap();

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let sid = ConnectionId::new(0, 0, 5);
        listener.insert_session(address_id(&peer), sid);
        assert_eq!(listener.find_session(address_id(&peer)), Some(sid));
        assert_eq!(listener.session_ids(), vec![sid]);
        listener.remove_session(peer);
        assert_eq!(listener.find_session(address_id(&peer)), None);

        let mut session = UdpSocket::default();
        session.open_session(1, listener.conn_id(), peer, 512, 512, None, Instant::now());
        assert_eq!(session.role(), Some(Role::Session));
        assert_eq!(session.session_of(), Some((listener.conn_id(), peer)));
        assert_eq!(session.max_recv(), 512);
        assert!(session.transmit(b"x", None).is_err());
    }
}
