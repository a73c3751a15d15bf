//! TCP network: listeners and framed stream connections

use std::io;
use std::time::{Duration, Instant};

use crate::conn_id::ConnectionId;
use crate::error::{Fault, NetError};
use crate::event::{Command, Endpoint, NetType, Notice, Opaque};
use crate::nagle::NagleConfig;
use crate::poller::{Multiplexer, Readiness, Ready};
use crate::pool::{Pooled, SocketPool};
use crate::socket::stream::{ReadStatus, SendStatus};
use crate::socket::{SocketState, TcpSocket};

use super::{NetContext, Network};

pub struct TcpNetwork {
    ctx: NetContext,
    pool: SocketPool<TcpSocket>,
    events: Vec<Readiness>,
    /// Set while batching is on, and for one tick after it is switched off so
    /// that held-back bytes and readiness are released.
    batching: bool,
}

impl TcpNetwork {
    pub fn new(ctx: NetContext) -> Self {
        let pool = SocketPool::new(ctx.config.pool_size(), ctx.thread_index);
        let batching = ctx.nagle.is_enabled();
        Self { pool, events: Vec::with_capacity(ctx.config.max_events), batching, ctx }
    }

    fn listen(&mut self, opaque: Opaque, endpoint: Endpoint) {
        let Some(sock) = self.pool.alloc() else {
            log::warn!("tcp listen on {}: socket pool exhausted", endpoint.addr);
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
                log::debug!("tcp {:?} listening on {}", id, addr);
                self.ctx.outbox.post(Notice::Bound { opaque, conn_id: id, addr });
            }
            Err(fault) => {
                log::warn!("tcp listen on {} failed: errno {}", endpoint.addr, fault.sys_err);
                self.fail(id, fault);
            }
        }
    }

    fn connect(&mut self, opaque: Opaque, endpoint: Endpoint) {
        let Some(sock) = self.pool.alloc() else {
            log::warn!("tcp connect to {}: socket pool exhausted", endpoint.addr);
            self.ctx.outbox.post(Notice::ConnectFailed { opaque, code: NetError::AllocFailed, sys_err: 0 });
            return;
        };
        let id = sock.conn_id();
        let cfg = &self.ctx.config;
        let (send_buf, recv_buf) = (cfg.buffer_size(endpoint.send_buf), cfg.buffer_size(endpoint.recv_buf));
        match sock.connect(&mut self.ctx.poller, opaque, endpoint.addr, &cfg.socket, send_buf, recv_buf) {
            Ok(()) => log::debug!("tcp {:?} connecting to {}", id, endpoint.addr),
            Err(fault) => self.fail(id, fault),
        }
    }

    fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) {
        let Some(sock) = self.pool.get_mut(id) else {
            log::debug!("tcp send to stale {:?} dropped", id);
            return;
        };
        if !matches!(sock.state(), SocketState::Established | SocketState::Connecting) {
            log::debug!("tcp send on {:?} ignored: not a connection", id);
            return;
        }
        let res = sock
            .send(data, &self.ctx.nagle, now)
            .and_then(|status| sock.sync_interest(&mut self.ctx.poller, status));
        if let Err(fault) = res {
            self.fail(id, fault);
        }
    }

    fn set_nagle(&mut self, cfg: NagleConfig) {
        log::debug!("tcp worker {} nagle simulation: {:?}", self.ctx.thread_index, cfg);
        self.ctx.nagle = cfg;
        self.batching |= cfg.is_enabled();
    }

    /// Releases the slot and posts the terminal notice matching the socket's
    /// state. Unknown or stale IDs are ignored.
    fn close(&mut self, id: ConnectionId, code: Option<NetError>, sys_err: i32) {
        let Some(sock) = self.pool.get_mut(id) else {
            log::debug!("tcp close of stale {:?} ignored", id);
            return;
        };
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
        log::debug!("tcp {:?} closed ({:?}, errno {})", id, code, sys_err);
        self.ctx.outbox.post(notice);
    }

    fn fail(&mut self, id: ConnectionId, fault: Fault) {
        self.close(id, Some(fault.code), fault.sys_err);
    }

    fn on_ready(&mut self, id: ConnectionId, ready: Ready, now: Instant) {
        let Some(sock) = self.pool.get_mut(id) else {
            return;
        };
        match sock.state() {
            SocketState::Listening if ready.contains(Ready::ERR) => {
                let fault = sock.take_error(NetError::SysError);
                self.fail(id, fault);
            }
            SocketState::Listening => {
                if ready.contains(Ready::RECV) {
                    self.accept_all(id);
                }
            }
            SocketState::Connecting => self.on_connecting(id, ready),
            SocketState::Established => {
                if self.ctx.nagle.is_enabled() && sock.nagle_mut().defer(&self.ctx.nagle, ready, now) {
                    return;
                }
                self.service(id, ready, now);
            }
            SocketState::Invalid => {}
        }
    }

    fn accept_all(&mut self, lid: ConnectionId) {
        loop {
            let Some(listener) = self.pool.get_mut(lid) else { return };
            let opaque = listener.opaque();
            let (send_buf, recv_buf) = listener.buffer_sizes();
            let (stream, peer) = match listener.accept() {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    // e.g. EMFILE; the listener itself stays usable
                    log::warn!("tcp accept on {:?} failed: {}", lid, e);
                    return;
                }
            };
            let Some(child) = self.pool.alloc() else {
                log::warn!("tcp accept of {}: socket pool exhausted, dropping peer", peer);
                drop(stream);
                self.ctx.outbox.post(Notice::Errored { opaque, conn_id: lid, code: NetError::AllocFailed, sys_err: 0 });
                continue;
            };
            let cid = child.conn_id();
            self.ctx.outbox.post(Notice::Accepting { opaque, listener: lid, conn_id: cid, peer });
            match child.adopt(&mut self.ctx.poller, opaque, stream, peer, &self.ctx.config.socket, send_buf, recv_buf) {
                Ok(()) => {
                    log::debug!("tcp {:?} accepted {} on {:?}", cid, peer, lid);
                    self.ctx.outbox.post(Notice::Accepted { opaque, conn_id: cid, peer });
                }
                Err(fault) => self.fail(cid, fault),
            }
        }
    }

    fn on_connecting(&mut self, id: ConnectionId, ready: Ready) {
        let Some(sock) = self.pool.get_mut(id) else { return };
        if ready.contains(Ready::ERR) {
            let fault = sock.take_error(NetError::ConnectFailed);
            self.fail(id, fault);
            return;
        }
        let peer = match sock.on_connect_ready() {
            Ok(Some(peer)) => peer,
            Ok(None) => return,
            Err(fault) => {
                self.fail(id, fault);
                return;
            }
        };
        let opaque = sock.opaque();
        log::debug!("tcp {:?} connected to {}", id, peer);
        self.ctx.outbox.post(Notice::Connected { opaque, conn_id: id, peer });

        // bytes sent while connecting go out now
        let res = sock.flush().and_then(|status| sock.sync_interest(&mut self.ctx.poller, status));
        if let Err(fault) = res {
            self.fail(id, fault);
        }
    }

    fn service(&mut self, id: ConnectionId, ready: Ready, now: Instant) {
        let Some(sock) = self.pool.get_mut(id) else { return };
        match service_socket(sock, &mut self.ctx, ready, now) {
            Ok(ReadStatus::Drained) => {}
            Ok(ReadStatus::Closed) => self.close(id, None, 0),
            Err(fault) => self.fail(id, fault),
        }
    }
}

/// Runs one round of I/O on an established connection.
fn service_socket(sock: &mut TcpSocket, ctx: &mut NetContext, ready: Ready, now: Instant) -> Result<ReadStatus, Fault> {
    if ready.contains(Ready::ERR) {
        return Err(sock.take_error(NetError::SysError));
    }
    sock.nagle_mut().touch(now);
    if ready.contains(Ready::RECV) {
        let (opaque, conn_id) = (sock.opaque(), sock.conn_id());
        let outbox = &mut ctx.outbox;
        let status = sock.on_readable(|data| outbox.post(Notice::Received { opaque, conn_id, data }))?;
        if status == ReadStatus::Closed {
            return Ok(status);
        }
    }
    if ready.contains(Ready::SEND) && sock.has_pending_output() {
        let status = sock.flush()?;
        if status == SendStatus::Sent {
            sock.nagle_mut().on_flushed();
        }
        sock.sync_interest(&mut ctx.poller, status)?;
    }
    Ok(ReadStatus::Drained)
}

impl Network for TcpNetwork {
    fn net_type(&self) -> NetType {
        NetType::Tcp
    }

    fn next_command(&mut self) -> Option<Command> {
        self.ctx.commands.pop()
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Listen { opaque, endpoint } => self.listen(opaque, endpoint),
            Command::Connect { opaque, endpoint } => self.connect(opaque, endpoint),
            Command::Close { conn_id } => self.close(conn_id, None, 0),
            Command::Send { conn_id, data } => self.send(conn_id, &data, Instant::now()),
            Command::SimulateNagle { packet_count, timeout } => self.set_nagle(NagleConfig::new(packet_count, timeout)),
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
        if !self.batching {
            return;
        }
        let nagle = self.ctx.nagle;
        self.batching = nagle.is_enabled();

        let mut due = Vec::new();
        let mut faults = Vec::new();
        let ctx = &mut self.ctx;
        self.pool.for_each(|sock| {
            if sock.state() != SocketState::Established {
                return true;
            }
            let id = sock.conn_id();
            if sock.nagle_mut().flush_due(&nagle, now) {
                sock.nagle_mut().on_flushed();
                if let Err(fault) = sock.flush().and_then(|status| sock.sync_interest(&mut ctx.poller, status)) {
                    faults.push((id, fault));
                    return true;
                }
            }
            let ready = sock.nagle_mut().take_due(&nagle, now);
            if !ready.is_empty() {
                due.push((id, ready));
            }
            true
        });
        for (id, fault) in faults {
            self.fail(id, fault);
        }
        for (id, ready) in due {
            self.service(id, ready, now);
        }
    }

    fn shutdown(&mut self) {
        for id in self.pool.ids() {
            self.close(id, None, 0);
        }
    }
}
