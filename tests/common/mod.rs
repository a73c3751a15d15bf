#![allow(dead_code)]

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use horizon_net::{ConnectionId, EventHandler, NetError, NetType, NetworkChannel, Opaque};

pub const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum Event {
    Bound { net: NetType, opaque: Opaque, conn_id: ConnectionId, addr: SocketAddr },
    Accepted { net: NetType, opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr },
    Connected { net: NetType, opaque: Opaque, conn_id: ConnectionId },
    ConnectFailed { net: NetType, opaque: Opaque, code: NetError },
    Errored { net: NetType, opaque: Opaque, code: NetError },
    Closed { net: NetType, opaque: Opaque, conn_id: ConnectionId, code: Option<NetError> },
    Received { net: NetType, opaque: Opaque, conn_id: ConnectionId, data: Bytes },
}

/// Records every notice in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl Recorder {
    pub fn bound(&self, opaque: Opaque) -> Option<(ConnectionId, SocketAddr)> {
        self.events.iter().find_map(|e| match e {
            Event::Bound { opaque: o, conn_id, addr, .. } if *o == opaque => Some((*conn_id, *addr)),
            _ => None,
        })
    }

    pub fn connected(&self, opaque: Opaque) -> Option<ConnectionId> {
        self.events.iter().find_map(|e| match e {
            Event::Connected { opaque: o, conn_id, .. } if *o == opaque => Some(*conn_id),
            _ => None,
        })
    }

    pub fn accepted(&self, opaque: Opaque) -> Vec<ConnectionId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Accepted { opaque: o, conn_id, .. } if *o == opaque => Some(*conn_id),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self, conn_id: ConnectionId) -> Vec<Option<NetError>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Closed { conn_id: c, code, .. } if *c == conn_id => Some(*code),
                _ => None,
            })
            .collect()
    }

    /// Payload bytes received on `conn_id`, concatenated.
    pub fn received(&self, conn_id: ConnectionId) -> Vec<u8> {
        let mut out = Vec::new();
        for e in &self.events {
            if let Event::Received { conn_id: c, data, .. } = e {
                if *c == conn_id {
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }
}

impl EventHandler for Recorder {
    fn on_binded(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, addr: SocketAddr) {
        self.events.push(Event::Bound { net, opaque, conn_id, addr });
    }

    fn on_accepted(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr) {
        self.events.push(Event::Accepted { net, opaque, conn_id, peer });
    }

    fn on_connected(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, _peer: SocketAddr) {
        self.events.push(Event::Connected { net, opaque, conn_id });
    }

    fn on_connect_failed(&mut self, net: NetType, opaque: Opaque, code: NetError, _sys_err: i32) {
        self.events.push(Event::ConnectFailed { net, opaque, code });
    }

    fn on_errored(&mut self, net: NetType, opaque: Opaque, _conn_id: ConnectionId, code: NetError, _sys_err: i32) {
        self.events.push(Event::Errored { net, opaque, code });
    }

    fn on_closed(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, code: Option<NetError>, _sys_err: i32) {
        self.events.push(Event::Closed { net, opaque, conn_id, code });
    }

    fn on_received(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, data: Bytes) {
        self.events.push(Event::Received { net, opaque, conn_id, data });
    }
}

/// Pumps `channel` into `rec` until `done` holds, failing after [`DEADLINE`].
pub fn wait_for<F>(channel: &mut NetworkChannel, rec: &mut Recorder, what: &str, mut done: F) -> anyhow::Result<()>
where
    F: FnMut(&Recorder) -> bool,
{
    let deadline = Instant::now() + DEADLINE;
    loop {
        channel.update(rec);
        if done(rec) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {}; events so far: {:?}", what, rec.events);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Opens a listener on an ephemeral loopback port and waits for its address.
pub fn listen(
    channel: &mut NetworkChannel,
    rec: &mut Recorder,
    net: NetType,
    buf: usize,
    opaque: Opaque,
) -> anyhow::Result<(ConnectionId, SocketAddr)> {
    channel.accept(net, "127.0.0.1", 0, buf, buf, opaque)?;
    wait_for(channel, rec, "bound", |r| r.bound(opaque).is_some())?;
    rec.bound(opaque).ok_or_else(|| anyhow::anyhow!("listener {} not bound", opaque))
}
