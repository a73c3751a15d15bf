//! UDP network, raw datagrams or KCP streams
//!
//! The same network serves [`NetType::Udp`] and [`NetType::Kcp`]. In raw
//! mode every datagram is one `Received`. In KCP mode each session and
//! connector carries a [`KcpSession`]; datagrams feed it and its output is
//! sent back through the owning OS socket.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::conn_id::ConnectionId;
use crate::error::{Fault, NetError};
use crate::event::{Command, Endpoint, NetType, Notice, Opaque};
use crate::kcp::{self, Input, KcpSession};
use crate::poller::{Multiplexer, Readiness, Ready};
use crate::pool::{Pooled, SocketPool};
use crate::socket::udp::{address_id, Role};
use crate::socket::{SocketState, UdpSocket};

use super::{NetContext, Network};

/// Large enough for any UDP payload.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpNetwork {
    ctx: NetContext,
    pool: SocketPool<UdpSocket>,
    events: Vec<Readiness>,
    kcp: bool,
    scratch: Vec<u8>,
    outgoing: Vec<Vec<u8>>,
    /// Origin of the millisecond clock handed to KCP.
    epoch: Instant,
}

impl UdpNetwork {
    pub fn new(ctx: NetContext, kcp: bool) -> Self {
        let pool = SocketPool::new(ctx.config.pool_size(), ctx.thread_index);
        Self {
            pool,
            events: Vec::with_capacity(ctx.config.max_events),
            kcp,
            scratch: vec![0u8; MAX_DATAGRAM],
            outgoing: Vec::new(),
            epoch: Instant::now(),
            ctx,
        }
    }

    fn now_ms(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    fn new_kcp(&self, now: Instant) -> Result<Option<KcpSession>, Fault> {
        if !self.kcp {
            return Ok(None);
        }
        KcpSession::new(&self.ctx.config.kcp, self.now_ms(now)).map(Some).map_err(|e| {
            log::warn!("kcp session setup failed: {}", e);
            Fault::new(NetError::SysError)
        })
    }

    fn listen(&mut self, opaque: Opaque, endpoint: Endpoint) {
        let net = self.ctx.net;
        let Some(sock) = self.pool.alloc() else {
            log::warn!("{} listen on {}: socket pool exhausted", net.name(), endpoint.addr);
            self.ctx.outbox.post(Notice::Errored {
                opaque,
                conn_id: ConnectionId::INVALID,
                code: NetError::AllocFailed,
                sys_err: 0,
            });
            return;
        };
        let id = sock.conn_id();
        let cfg = &self.ctx.config;
        let (send_buf, recv_buf) = (cfg.buffer_size(endpoint.send_buf), cfg.buffer_size(endpoint.recv_buf));
        match sock.listen(&mut self.ctx.poller, opaque, endpoint.addr, &cfg.socket, send_buf, recv_buf) {
            Ok(addr) => {
                log::debug!("{} {:?} bound to {}", net.name(), id, addr);
                self.ctx.outbox.post(Notice::Bound { opaque, conn_id: id, addr });
            }
            Err(fault) => {
                log::warn!("{} bind on {} failed: errno {}", net.name(), endpoint.addr, fault.sys_err);
                self.fail(id, fault);
            }
        }
    }

    fn connect(&mut self, opaque: Opaque, endpoint: Endpoint, now: Instant) {
        let net = self.ctx.net;
        let kcp = match self.new_kcp(now) {
            Ok(kcp) => kcp,
            Err(fault) => {
                self.ctx.outbox.post(Notice::ConnectFailed { opaque, code: fault.code, sys_err: fault.sys_err });
                return;
            }
        };
        let Some(sock) = self.pool.alloc() else {
            log::warn!("{} connect to {}: socket pool exhausted", net.name(), endpoint.addr);
            self.ctx.outbox.post(Notice::ConnectFailed { opaque, code: NetError::AllocFailed, sys_err: 0 });
            return;
        };
        let id = sock.conn_id();
        let cfg = &self.ctx.config;
        let (send_buf, recv_buf) = (cfg.buffer_size(endpoint.send_buf), cfg.buffer_size(endpoint.recv_buf));
        match sock.connect(&mut self.ctx.poller, opaque, endpoint.addr, &cfg.socket, send_buf, recv_buf, kcp, now) {
            Ok(()) => {
                log::debug!("{} {:?} connected to {}", net.name(), id, endpoint.addr);
                self.ctx.outbox.post(Notice::Connected { opaque, conn_id: id, peer: endpoint.addr });
            }
            Err(fault) => self.fail(id, fault),
        }
    }

    fn send(&mut self, id: ConnectionId, data: &[u8]) {
        let Some(sock) = self.pool.get_mut(id) else {
            log::debug!("{} send to stale {:?} dropped", self.ctx.net.name(), id);
            return;
        };
        if sock.state() != SocketState::Established || sock.role() == Some(Role::Listener) {
            log::debug!("{} send on {:?} ignored: not a connection", self.ctx.net.name(), id);
            return;
        }
        let streamed = match sock.kcp_mut() {
            Some(kcp) => kcp.send(data).map(|()| true).map_err(Fault::from),
            None => Ok(false),
        };
        let res = match streamed {
            Ok(true) => self.pump_kcp(id),
            Ok(false) => self.transmit_from(id, data),
            Err(fault) => Err(fault),
        };
        if let Err(fault) = res {
            self.fail(id, fault);
        }
    }

    /// Sends a datagram on behalf of a connector or session, through the OS
    /// socket that owns it.
    fn transmit_from(&mut self, id: ConnectionId, data: &[u8]) -> Result<(), Fault> {
        let sock = self.pool.get(id).ok_or(Fault::new(NetError::InvalidEvent))?;
        let limit = sock.max_send();
        let (owner, to) = match (sock.role(), sock.session_of()) {
            (Some(Role::Session), Some((listener, peer))) => (listener, Some(peer)),
            (Some(Role::Connector), _) => (id, None),
            _ => return Err(NetError::InvalidEvent.into()),
        };
        let owner = self.pool.get_mut(owner).ok_or(Fault::new(NetError::SendFailed))?;
        if owner.transmit(data, to)? {
            if owner.queued(to) > limit {
                return Err(NetError::SendBuffOverflow.into());
            }
            owner.sync_interest(&mut self.ctx.poller)?;
        }
        Ok(())
    }

    /// Transmits everything the KCP session of `id` has produced.
    fn pump_kcp(&mut self, id: ConnectionId) -> Result<(), Fault> {
        let mut out = std::mem::take(&mut self.outgoing);
        if let Some(kcp) = self.pool.get_mut(id).and_then(UdpSocket::kcp_mut) {
            while let Some(dgram) = kcp.pop_output() {
                out.push(dgram);
            }
        }
        let mut res = Ok(());
        for dgram in out.drain(..) {
            if res.is_ok() {
                res = self.transmit_from(id, &dgram);
            }
        }
        self.outgoing = out;
        res
    }

    /// Hands one inbound datagram to connection `id`.
    fn deliver(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<(), Fault> {
        let net = self.ctx.net;
        let Some(sock) = self.pool.get_mut(id) else { return Ok(()) };
        sock.touch(now);
        let (opaque, max_recv) = (sock.opaque(), sock.max_recv());

        let Some(kcp) = sock.kcp_mut() else {
            if data.len() > max_recv {
                log::warn!("{} {:?}: {} byte datagram exceeds {}", net.name(), id, data.len(), max_recv);
                return Err(NetError::InvalidPacketSize.into());
            }
            let data = Bytes::copy_from_slice(data);
            self.ctx.outbox.post(Notice::Received { opaque, conn_id: id, data });
            return Ok(());
        };
        match kcp.input(data) {
            Input::Accepted => {}
            Input::ConvMismatch(conv) => {
                log::warn!("kcp {:?}: dropping segment for conversation {:#x}", id, conv);
                return Ok(());
            }
            Input::Malformed => {
                log::debug!("kcp {:?}: dropping malformed datagram", id);
                return Ok(());
            }
        }
        while let Some(data) = kcp.drain(max_recv)? {
            self.ctx.outbox.post(Notice::Received { opaque, conn_id: id, data });
        }
        self.pump_kcp(id)
    }

    /// Creates the session for a peer seen for the first time on `lid`.
    fn accept_session(
        &mut self,
        lid: ConnectionId,
        peer: SocketAddr,
        first: &[u8],
        now: Instant,
    ) -> Option<ConnectionId> {
        let net = self.ctx.net;
        if self.kcp && kcp::conv_of(first) != Some(self.ctx.config.kcp.conv) {
            log::warn!("kcp {:?}: ignoring {} with foreign conversation {:?}", lid, peer, kcp::conv_of(first));
            return None;
        }
        let listener = self.pool.get(lid)?;
        let opaque = listener.opaque();
        let (send_buf, recv_buf) = listener.buffer_sizes();
        let kcp = match self.new_kcp(now) {
            Ok(kcp) => kcp,
            Err(fault) => {
                self.ctx.outbox.post(Notice::Errored { opaque, conn_id: lid, code: fault.code, sys_err: fault.sys_err });
                return None;
            }
        };

        let Some(session) = self.pool.alloc() else {
            log::warn!("{} {:?}: socket pool exhausted, ignoring {}", net.name(), lid, peer);
            self.ctx.outbox.post(Notice::Errored { opaque, conn_id: lid, code: NetError::AllocFailed, sys_err: 0 });
            return None;
        };
        let sid = session.conn_id();
        session.open_session(opaque, lid, peer, send_buf, recv_buf, kcp, now);
        if let Some(listener) = self.pool.get_mut(lid) {
            listener.insert_session(address_id(&peer), sid);
        }
        log::debug!("{} {:?} accepted {} on {:?}", net.name(), sid, peer, lid);
        self.ctx.outbox.post(Notice::Accepting { opaque, listener: lid, conn_id: sid, peer });
        self.ctx.outbox.post(Notice::Accepted { opaque, conn_id: sid, peer });
        Some(sid)
    }

    /// Resolves the session a datagram from `peer` belongs to.
    fn route(&mut self, lid: ConnectionId, peer: SocketAddr, data: &[u8], now: Instant) -> Option<ConnectionId> {
        let found = self.pool.get(lid)?.find_session(address_id(&peer));
        match found.and_then(|sid| self.pool.get(sid)) {
            Some(session) if session.peer() == Some(peer) => Some(session.conn_id()),
            Some(_) => {
                log::warn!("{} {:?}: address id collision for {}, datagram dropped", self.ctx.net.name(), lid, peer);
                None
            }
            None => self.accept_session(lid, peer, data, now),
        }
    }

    fn on_readable(&mut self, id: ConnectionId, role: Role, now: Instant) {
        let mut scratch = std::mem::take(&mut self.scratch);
        loop {
            let Some(sock) = self.pool.get(id) else { break };
            let (n, peer) = match sock.recv(&mut scratch) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                // ICMP feedback for an earlier send; it names no session
                Err(e) if role == Role::Listener && is_icmp_feedback(&e) => continue,
                Err(e) => {
                    self.fail(id, Fault::io(NetError::RecvFailed, &e));
                    break;
                }
            };
            let target = match role {
                Role::Listener => self.route(id, peer, &scratch[..n], now),
                _ => Some(id),
            };
            if let Some(target) = target {
                if let Err(fault) = self.deliver(target, &scratch[..n], now) {
                    self.fail(target, fault);
                }
            }
        }
        self.scratch = scratch;
    }

    fn on_writable(&mut self, id: ConnectionId) {
        loop {
            let Some(sock) = self.pool.get_mut(id) else { return };
            let failed = match sock.flush_queue() {
                Ok(_) => {
                    if let Err(fault) = sock.sync_interest(&mut self.ctx.poller) {
                        self.fail(id, fault);
                    }
                    return;
                }
                Err(failed) => failed,
            };
            match (sock.role(), failed) {
                (Some(Role::Listener), (Some(peer), fault)) => match sock.find_session(address_id(&peer)) {
                    Some(sid) => self.fail(sid, fault),
                    None => sock.remove_session(peer),
                },
                (_, (_, fault)) => {
                    self.fail(id, fault);
                    return;
                }
            }
        }
    }

    fn on_ready(&mut self, id: ConnectionId, ready: Ready, now: Instant) {
        let Some(sock) = self.pool.get(id) else { return };
        let Some(role) = sock.role() else { return };
        if ready.contains(Ready::ERR) {
            let fault = sock.take_error(NetError::SysError);
            if role == Role::Connector {
                self.fail(id, fault);
                return;
            }
            log::warn!("{} {:?}: socket error, errno {}", self.ctx.net.name(), id, fault.sys_err);
        }
        if ready.contains(Ready::RECV) {
            self.on_readable(id, role, now);
        }
        if ready.contains(Ready::SEND) {
            self.on_writable(id);
        }
    }

    /// Releases `id` and posts its terminal notice. A listener takes its
    /// sessions down with it, each with its own notice.
    fn close(&mut self, id: ConnectionId, code: Option<NetError>, sys_err: i32) {
        let Some(sock) = self.pool.get(id) else {
            log::debug!("{} close of stale {:?} ignored", self.ctx.net.name(), id);
            return;
        };
        for sid in sock.session_ids() {
            self.close(sid, code, sys_err);
        }
        let Some(sock) = self.pool.get(id) else { return };
        if let Some((lid, peer)) = sock.session_of() {
            if let Some(listener) = self.pool.get_mut(lid) {
                listener.remove_session(peer);
            }
        }

        let Some(sock) = self.pool.get_mut(id) else { return };
        sock.deregister(&mut self.ctx.poller);
        let opaque = sock.opaque();
        let notice = match sock.state() {
            SocketState::Connecting => Notice::ConnectFailed {
                opaque,
                code: code.unwrap_or(NetError::ConnectFailed),
                sys_err,
            },
            SocketState::Invalid => Notice::Errored {
                opaque,
                conn_id: id,
                code: code.unwrap_or(NetError::InvalidEvent),
                sys_err,
            },
            SocketState::Listening | SocketState::Established => Notice::Closed { opaque, conn_id: id, code, sys_err },
        };
        self.pool.free(id);
        log::debug!("{} {:?} closed ({:?}, errno {})", self.ctx.net.name(), id, code, sys_err);
        self.ctx.outbox.post(notice);
    }

    fn fail(&mut self, id: ConnectionId, fault: Fault) {
        self.close(id, Some(fault.code), fault.sys_err);
    }
}

fn is_icmp_feedback(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused)
}

impl Network for UdpNetwork {
    fn net_type(&self) -> NetType {
        self.ctx.net
    }

    fn next_command(&mut self) -> Option<Command> {
        self.ctx.commands.pop()
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Listen { opaque, endpoint } => self.listen(opaque, endpoint),
            Command::Connect { opaque, endpoint } => self.connect(opaque, endpoint, Instant::now()),
            Command::Close { conn_id } => self.close(conn_id, None, 0),
            Command::Send { conn_id, data } => self.send(conn_id, &data),
            Command::SimulateNagle { .. } => {
                log::debug!("{} network ignores nagle simulation", self.ctx.net.name());
            }
        }
    }

    fn poll(&mut self, timeout: Duration) -> io::Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let res = self.ctx.poller.wait(Some(timeout), &mut events);
        let now = Instant::now();
        for ev in &events {
            self.on_ready(ev.token, ev.ready, now);
        }
        self.events = events;
        res
    }

    fn tick(&mut self, now: Instant) {
        let idle = self.ctx.config.udp_session_idle;
        let mut expired = Vec::new();
        let mut streams = Vec::new();
        self.pool.for_each(|sock| {
            if sock.state() != SocketState::Established {
                return true;
            }
            let id = sock.conn_id();
            let timed_out = sock.role() == Some(Role::Session)
                && idle.is_some_and(|idle| now.saturating_duration_since(sock.idle_since()) > idle);
            if timed_out {
                expired.push(id);
            } else if sock.kcp_mut().is_some() {
                streams.push(id);
            }
            true
        });

        for id in expired {
            log::debug!("{} {:?} idle, closing", self.ctx.net.name(), id);
            self.close(id, Some(NetError::Timeout), 0);
        }
        let now_ms = self.now_ms(now);
        for id in streams {
            let Some(kcp) = self.pool.get_mut(id).and_then(UdpSocket::kcp_mut) else { continue };
            let res = kcp.update(now_ms).map_err(Fault::from).and_then(|()| self.pump_kcp(id));
            if let Err(fault) = res {
                self.fail(id, fault);
            }
        }
    }

    fn shutdown(&mut self) {
        for id in self.pool.ids() {
            self.close(id, None, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetConfig, SocketOptions};
    use crate::queue::{spsc, Consumer, Producer};
    use std::sync::Arc;

    struct Harness {
        net: UdpNetwork,
        commands: Producer<Command>,
        notices: Consumer<Notice>,
    }

    fn harness(net: NetType, config: NetConfig) -> Harness {
        let (commands, cmd_rx) = spsc(64);
        let (notice_tx, notices) = spsc(1024);
        let ctx = NetContext::new(net, 0, Arc::new(config), cmd_rx, notice_tx).unwrap();
        Harness { net: UdpNetwork::new(ctx, net == NetType::Kcp), commands, notices }
    }

    fn config() -> NetConfig {
        NetConfig {
            max_sockets: 16,
            socket: SocketOptions { reuse_port: false, ..SocketOptions::default() },
            ..NetConfig::default()
        }
    }

    fn endpoint(addr: &str, size: usize) -> Endpoint {
        Endpoint { addr: addr.parse().unwrap(), send_buf: size, recv_buf: size }
    }

    impl Harness {
        fn run(&mut self, cmd: Command) {
            self.commands.push(cmd).unwrap();
            self.net.drain_commands(16);
        }

        fn pump(&mut self, seen: &mut Vec<Notice>) {
            self.net.poll(Duration::from_millis(2)).unwrap();
            self.net.tick(Instant::now());
            while let Some(n) = self.notices.pop() {
                seen.push(n);
            }
        }

        fn bind(&mut self, size: usize) -> (ConnectionId, SocketAddr) {
            self.run(Command::Listen { opaque: 1, endpoint: endpoint("127.0.0.1:0", size) });
            match self.notices.pop() {
                Some(Notice::Bound { conn_id, addr, .. }) => (conn_id, addr),
                other => panic!("expected Bound, got {:?}", other),
            }
        }
    }

    fn wait_until<F: FnMut() -> bool>(mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
        }
    }

    #[test]
    fn test_first_datagram_accepts_session() {
        let mut h = harness(NetType::Udp, config());
        let (lid, addr) = h.bind(1024);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"one", addr).unwrap();
        client.send_to(b"two", addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            seen.iter().filter(|n| matches!(n, Notice::Received { .. })).count() == 2
        });
        let sid = match &seen[0] {
            Notice::Accepting { listener, conn_id, peer, .. } => {
                assert_eq!(*listener, lid);
                assert_eq!(*peer, client.local_addr().unwrap());
                *conn_id
            }
            other => panic!("expected Accepting, got {:?}", other),
        };
        assert!(matches!(seen[1], Notice::Accepted { conn_id, .. } if conn_id == sid));
        assert_eq!(seen.iter().filter(|n| matches!(n, Notice::Accepting { .. })).count(), 1);

        // the session answers through the listener socket
        h.run(Command::Send { conn_id: sid, data: Bytes::from_static(b"reply") });
        let mut buf = [0u8; 16];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, addr);
    }

    #[test]
    fn test_oversized_datagram_closes_session() {
        let mut h = harness(NetType::Udp, config());
        let (_, addr) = h.bind(16);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&[0u8; 64], addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            seen.iter().any(|n| matches!(n, Notice::Closed { .. }))
        });
        assert!(seen
            .iter()
            .any(|n| matches!(n, Notice::Closed { code: Some(NetError::InvalidPacketSize), .. })));
    }

    #[test]
    fn test_closing_listener_closes_sessions() {
        let mut h = harness(NetType::Udp, config());
        let (lid, addr) = h.bind(1024);
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        a.send_to(b"a", addr).unwrap();
        b.send_to(b"b", addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            seen.iter().filter(|n| matches!(n, Notice::Accepted { .. })).count() == 2
        });
        seen.clear();
        h.run(Command::Close { conn_id: lid });
        h.pump(&mut seen);
        let closed: Vec<ConnectionId> = seen
            .iter()
            .filter_map(|n| match n {
                Notice::Closed { conn_id, .. } => Some(*conn_id),
                _ => None,
            })
            .collect();
        assert_eq!(closed.len(), 3);
        assert_eq!(closed.last(), Some(&lid));
    }

    #[test]
    fn test_idle_session_times_out() {
        let cfg = NetConfig { udp_session_idle: Some(Duration::from_millis(20)), ..config() };
        let mut h = harness(NetType::Udp, cfg);
        let (_, addr) = h.bind(1024);
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hi", addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            seen.iter().any(|n| matches!(n, Notice::Closed { code: Some(NetError::Timeout), .. }))
        });
    }

    #[test]
    fn test_exhausted_pool_reports_on_listener() {
        let mut h = harness(NetType::Udp, NetConfig { max_sockets: 1, ..config() });
        let (lid, addr) = h.bind(1024);
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hello", addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            !seen.is_empty()
        });
        assert!(matches!(
            seen[0],
            Notice::Errored { opaque: 1, conn_id, code: NetError::AllocFailed, sys_err: 0 } if conn_id == lid
        ));
        assert!(!seen.iter().any(|n| matches!(n, Notice::Accepted { .. } | Notice::Closed { .. })));

        // the listener is still bound and reports the next peer too
        seen.clear();
        client.send_to(b"again", addr).unwrap();
        wait_until(|| {
            h.pump(&mut seen);
            !seen.is_empty()
        });
        assert!(matches!(seen[0], Notice::Errored { code: NetError::AllocFailed, .. }));
    }

    #[test]
    fn test_kcp_setup_failure_reports_on_listener() {
        let cfg = NetConfig { kcp: crate::kcp::KcpConfig { mtu: 10, ..crate::kcp::KcpConfig::default() }, ..config() };
        let conv = cfg.kcp.conv;
        let mut h = harness(NetType::Kcp, cfg);
        let (lid, addr) = h.bind(1024);

        let mut segment = vec![0u8; crate::kcp::KCP_OVERHEAD];
        segment[..4].copy_from_slice(&conv.to_le_bytes());
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&segment, addr).unwrap();

        let mut seen = Vec::new();
        wait_until(|| {
            h.pump(&mut seen);
            !seen.is_empty()
        });
        assert!(matches!(
            seen[0],
            Notice::Errored { opaque: 1, conn_id, code: NetError::SysError, .. } if conn_id == lid
        ));
        assert!(!seen.iter().any(|n| matches!(n, Notice::Accepted { .. })));
    }

    #[test]
    fn test_connector_emits_connected_immediately() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut h = harness(NetType::Udp, config());
        h.run(Command::Connect { opaque: 8, endpoint: endpoint(&peer.local_addr().unwrap().to_string(), 0) });
        let conn_id = match h.notices.pop() {
            Some(Notice::Connected { opaque: 8, conn_id, .. }) => conn_id,
            other => panic!("expected Connected, got {:?}", other),
        };
        h.run(Command::Send { conn_id, data: Bytes::from_static(b"datagram") });
        let mut buf = [0u8; 16];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }

    #[test]
    fn test_kcp_round_trip() {
        let mut server = harness(NetType::Kcp, config());
        let mut client = harness(NetType::Kcp, config());
        let (_, addr) = server.bind(4096);

        client.run(Command::Connect { opaque: 2, endpoint: endpoint(&addr.to_string(), 4096) });
        let conn_id = match client.notices.pop() {
            Some(Notice::Connected { conn_id, .. }) => conn_id,
            other => panic!("expected Connected, got {:?}", other),
        };
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        client.run(Command::Send { conn_id, data: Bytes::from(payload.clone()) });

        let mut server_seen = Vec::new();
        let mut client_seen = Vec::new();
        let mut got = Vec::new();
        wait_until(|| {
            server.pump(&mut server_seen);
            client.pump(&mut client_seen);
            for n in server_seen.drain(..) {
                if let Notice::Received { data, .. } = n {
                    got.extend_from_slice(&data);
                }
            }
            got.len() >= payload.len()
        });
        assert_eq!(got, payload);
    }
}
