//! Pooled TCP socket: listener or connection
//!
//! A [`TcpSocket`] performs the I/O for one slot and reports fatal conditions
//! as [`Fault`]s. Turning a fault into a terminal notice and releasing the
//! slot is left to the owning network.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};

use super::stream::{Inbound, Outbound, ReadStatus, SendStatus};
use super::{bind_listener, is_would_block, start_connect, SocketState};
use crate::config::SocketOptions;
use crate::conn_id::ConnectionId;
use crate::error::{Fault, NetError};
use crate::event::Opaque;
use crate::nagle::{NagleConfig, NagleState};
use crate::poller::{Multiplexer, Poller, Ready};
use crate::pool::Pooled;
use crate::raw::{self, AsOs, SockOpt};

#[derive(Debug, Default)]
enum Handle {
    #[default]
    None,
    Listener(TcpListener),
    Stream(TcpStream),
}

#[derive(Debug, Default)]
pub struct TcpSocket {
    conn_id: ConnectionId,
    opaque: Opaque,
    state: SocketState,
    handle: Handle,
    peer: Option<SocketAddr>,
    inbound: Inbound,
    outbound: Outbound,
    /// Interest currently registered with the poller; empty when unregistered.
    interest: Ready,
    nagle: NagleState,
    send_buf: usize,
    recv_buf: usize,
}

impl Pooled for TcpSocket {
    fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    fn set_conn_id(&mut self, id: ConnectionId) {
        self.conn_id = id;
    }

    fn reset(&mut self) {
        // dropping the handle closes the descriptor
        self.handle = Handle::None;
        self.opaque = 0;
        self.state = SocketState::Invalid;
        self.peer = None;
        self.interest = Ready::EMPTY;
        self.send_buf = 0;
        self.recv_buf = 0;
    }
}

impl TcpSocket {
    pub fn opaque(&self) -> Opaque {
        self.opaque
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Buffer sizes (send, recv) this socket was opened with; accepted peers
    /// inherit them from their listener.
    pub fn buffer_sizes(&self) -> (usize, usize) {
        (self.send_buf, self.recv_buf)
    }

    pub fn nagle_mut(&mut self) -> &mut NagleState {
        &mut self.nagle
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Binds, listens and registers for RECV. The state stays `Invalid`
    /// unless every step succeeds.
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
        let mut listener = bind_listener(addr, opts, send_buf, recv_buf).map_err(fail)?;
        let local = listener.local_addr().map_err(fail)?;
        poller.register(&mut listener, self.conn_id, Ready::RECV).map_err(fail)?;

        self.handle = Handle::Listener(listener);
        self.interest = Ready::RECV;
        self.state = SocketState::Listening;
        Ok(local)
    }

    /// Starts a non-blocking connect and registers for RECV|SEND. Completion
    /// is picked up by [`on_connect_ready`](Self::on_connect_ready).
    pub fn connect(
        &mut self,
        poller: &mut Poller,
        opaque: Opaque,
        addr: SocketAddr,
        opts: &SocketOptions,
        send_buf: usize,
        recv_buf: usize,
    ) -> Result<(), Fault> {
        self.opaque = opaque;
        self.send_buf = send_buf;
        self.recv_buf = recv_buf;
        self.peer = Some(addr);
        self.inbound.reset(recv_buf);
        self.outbound.reset(send_buf);
        self.nagle.reset(Instant::now());
        self.state = SocketState::Connecting;

        let fail = |e: io::Error| Fault::io(NetError::ConnectFailed, &e);
        let mut stream = start_connect(addr, opts, send_buf, recv_buf).map_err(fail)?;
        let interest = Ready::RECV | Ready::SEND;
        poller.register(&mut stream, self.conn_id, interest).map_err(fail)?;
        self.handle = Handle::Stream(stream);
        self.interest = interest;
        Ok(())
    }

    /// Takes ownership of a freshly accepted stream and registers it for RECV.
    pub fn adopt(
        &mut self,
        poller: &mut Poller,
        opaque: Opaque,
        mut stream: TcpStream,
        peer: SocketAddr,
        opts: &SocketOptions,
        send_buf: usize,
        recv_buf: usize,
    ) -> Result<(), Fault> {
        self.opaque = opaque;
        self.send_buf = send_buf;
        self.recv_buf = recv_buf;
        self.peer = Some(peer);
        self.inbound.reset(recv_buf);
        self.outbound.reset(send_buf);
        self.nagle.reset(Instant::now());

        if opts.tcp_nodelay {
            // accepted sockets do not reliably inherit it from the listener
            if let Err(e) = raw::set(stream.os(), SockOpt::NoDelay(true)) {
                log::debug!("{:?}: TCP_NODELAY on accepted socket failed: {}", self.conn_id, e);
            }
        }
        poller
            .register(&mut stream, self.conn_id, Ready::RECV)
            .map_err(|e| Fault::io(NetError::SysError, &e))?;
        self.handle = Handle::Stream(stream);
        self.interest = Ready::RECV;
        self.state = SocketState::Established;
        Ok(())
    }

    /// Accepts one pending peer. `Ok(None)` once the backlog is drained.
    pub fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let Handle::Listener(listener) = &self.handle else {
            return Ok(None);
        };
        loop {
            match listener.accept() {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) if is_would_block(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // the peer went away between SYN and accept
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Checks whether an in-flight connect finished.
    ///
    /// Returns the peer once connected, `None` while still pending.
    pub fn on_connect_ready(&mut self) -> Result<Option<SocketAddr>, Fault> {
        let Handle::Stream(stream) = &self.handle else {
            return Err(NetError::ConnectFailed.into());
        };
        match stream.take_error() {
            Ok(Some(e)) | Err(e) => return Err(Fault::io(NetError::ConnectFailed, &e)),
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(peer) => {
                self.peer = Some(peer);
                self.state = SocketState::Established;
                Ok(Some(peer))
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || is_would_block(&e) => Ok(None),
            Err(e) => Err(Fault::io(NetError::ConnectFailed, &e)),
        }
    }

    /// Pending OS error, reported as `code`.
    pub fn take_error(&self, code: NetError) -> Fault {
        let err = match &self.handle {
            Handle::Stream(s) => s.take_error(),
            Handle::Listener(l) => l.take_error(),
            Handle::None => Ok(None),
        };
        match err {
            Ok(Some(e)) | Err(e) => Fault::io(code, &e),
            Ok(None) => Fault::new(code),
        }
    }

    /// Reads until would-block, handing each complete frame to `on_frame`.
    pub fn on_readable<F: FnMut(Bytes)>(&mut self, on_frame: F) -> Result<ReadStatus, Fault> {
        match &mut self.handle {
            Handle::Stream(stream) => self.inbound.fill(stream, on_frame),
            _ => Ok(ReadStatus::Drained),
        }
    }

    /// Drains the send buffer.
    pub fn flush(&mut self) -> Result<SendStatus, Fault> {
        match &mut self.handle {
            Handle::Stream(stream) => self.outbound.flush(stream),
            _ => Ok(SendStatus::Sent),
        }
    }

    /// Sends `data` verbatim. While connecting it is only buffered.
    pub fn send(&mut self, data: &[u8], nagle: &NagleConfig, now: Instant) -> Result<SendStatus, Fault> {
        match (&mut self.handle, self.state) {
            (_, SocketState::Connecting) => {
                self.outbound.queue(data)?;
                Ok(SendStatus::Deferred)
            }
            (Handle::Stream(stream), SocketState::Established) => {
                self.outbound.send_batched(stream, data, nagle, &mut self.nagle, now)
            }
            _ => Err(NetError::InvalidEvent.into()),
        }
    }

    /// Updates the registered interest if it differs from `interest`.
    pub fn set_interest(&mut self, poller: &mut Poller, interest: Ready) -> Result<(), Fault> {
        if interest == self.interest {
            return Ok(());
        }
        let id = self.conn_id;
        let res = match &mut self.handle {
            Handle::Stream(s) => poller.reregister(s, id, interest),
            Handle::Listener(l) => poller.reregister(l, id, interest),
            Handle::None => return Ok(()),
        };
        res.map_err(|e| Fault::io(NetError::SysError, &e))?;
        self.interest = interest;
        Ok(())
    }

    /// Adjusts interest after a send or flush: SEND is armed while bytes wait
    /// for the OS and dropped once they are gone. Deferred output leaves the
    /// registration alone.
    pub fn sync_interest(&mut self, poller: &mut Poller, status: SendStatus) -> Result<(), Fault> {
        let interest = match status {
            SendStatus::Deferred => return Ok(()),
            SendStatus::Queued => Ready::RECV | Ready::SEND,
            SendStatus::Sent if self.state == SocketState::Connecting => Ready::RECV | Ready::SEND,
            SendStatus::Sent => Ready::RECV,
        };
        self.set_interest(poller, interest)
    }

    /// Removes the socket from the poller. Errors are logged; the handle is
    /// about to be dropped anyway.
    pub fn deregister(&mut self, poller: &mut Poller) {
        if self.interest.is_empty() {
            return;
        }
        let id = self.conn_id;
        let res = match &mut self.handle {
            Handle::Stream(s) => poller.deregister(s, id),
            Handle::Listener(l) => poller.deregister(l, id),
            Handle::None => Ok(()),
        };
        if let Err(e) = res {
            log::debug!("deregister {:?} failed: {}", id, e);
        }
        self.interest = Ready::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing;
    use crate::pool::SocketPool;
    use crate::poller::Readiness;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn opts() -> SocketOptions {
        SocketOptions { reuse_port: false, ..SocketOptions::default() }
    }

    fn wait_for(poller: &mut Poller, id: ConnectionId, want: Ready) -> Ready {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.clear();
            poller.wait(Some(Duration::from_millis(20)), &mut events).unwrap();
            let got = events
                .iter()
                .filter(|ev: &&Readiness| ev.token == id)
                .fold(Ready::EMPTY, |acc, ev| acc | ev.ready);
            if got.contains(want) {
                return got;
            }
        }
        panic!("{:?} never became {:?}", id, want);
    }

    #[test]
    fn test_listen_accept_and_read_frames() {
        let mut poller = Poller::with_capacity(64).unwrap();
        let mut pool: SocketPool<TcpSocket> = SocketPool::new(8, 0);

        let listener = pool.alloc().unwrap();
        let lid = listener.conn_id();
        let local = listener
            .listen(&mut poller, 7, "127.0.0.1:0".parse().unwrap(), &opts(), 4096, 4096)
            .unwrap();
        assert_eq!(listener.state(), SocketState::Listening);

        let mut client = std::net::TcpStream::connect(local).unwrap();
        let mut wire = framing::encode(b"ping").to_vec();
        wire.extend_from_slice(&framing::encode(b"pong"));
        client.write_all(&wire).unwrap();

        wait_for(&mut poller, lid, Ready::RECV);
        let (stream, peer) = pool.get_mut(lid).unwrap().accept().unwrap().expect("pending peer");

        let child = pool.alloc().unwrap();
        let cid = child.conn_id();
        child.adopt(&mut poller, 7, stream, peer, &opts(), 4096, 4096).unwrap();
        assert_eq!(child.state(), SocketState::Established);

        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.len() < 2 && Instant::now() < deadline {
            wait_for(&mut poller, cid, Ready::RECV);
            let status = pool.get_mut(cid).unwrap().on_readable(|f| frames.push(f)).unwrap();
            assert_eq!(status, ReadStatus::Drained);
        }
        assert_eq!(frames, vec![Bytes::from_static(b"ping"), Bytes::from_static(b"pong")]);

        // orderly close from the client side
        drop(client);
        wait_for(&mut poller, cid, Ready::RECV);
        let status = pool.get_mut(cid).unwrap().on_readable(|_| {}).unwrap();
        assert_eq!(status, ReadStatus::Closed);
    }

    #[test]
    fn test_connect_completes_and_flushes_queued_bytes() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut poller = Poller::with_capacity(64).unwrap();
        let mut sock = TcpSocket::default();
        sock.set_conn_id(ConnectionId::new(0, 0, 1));
        sock.connect(&mut poller, 9, addr, &opts(), 4096, 4096).unwrap();
        assert_eq!(sock.state(), SocketState::Connecting);

        let status = sock.send(b"early", &NagleConfig::DISABLED, Instant::now()).unwrap();
        assert_eq!(status, SendStatus::Deferred);
        assert!(sock.has_pending_output());

        wait_for(&mut poller, sock.conn_id(), Ready::SEND);
        let deadline = Instant::now() + Duration::from_secs(2);
        let peer = loop {
            if let Some(peer) = sock.on_connect_ready().unwrap() {
                break peer;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(peer, addr);
        assert_eq!(sock.state(), SocketState::Established);
        assert_eq!(sock.flush().unwrap(), SendStatus::Sent);

        let (mut accepted, _) = server.accept().unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"early");
    }

    #[test]
    fn test_reset_releases_descriptor() {
        let mut poller = Poller::with_capacity(8).unwrap();
        let mut sock = TcpSocket::default();
        sock.set_conn_id(ConnectionId::new(0, 0, 2));
        let local = sock
            .listen(&mut poller, 1, "127.0.0.1:0".parse().unwrap(), &opts(), 4096, 4096)
            .unwrap();
        sock.deregister(&mut poller);
        sock.reset();
        assert_eq!(sock.state(), SocketState::Invalid);
        // the port is free again
        std::net::TcpListener::bind(local).unwrap();
    }
}
