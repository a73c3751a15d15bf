//! Main-thread façade over the worker pool
//!
//! [`NetworkChannel`] turns API calls into commands on the chosen worker's
//! queue and, on [`update`](NetworkChannel::update), drains every notice queue
//! into an [`EventHandler`]. All methods run on the thread that owns the
//! channel; nothing here blocks except [`stop_wait`](NetworkChannel::stop_wait).
//!
//! ```no_run
//! use horizon_net::{ConnectionId, EventHandler, NetConfig, NetType, NetworkChannel, Opaque};
//! use bytes::Bytes;
//!
//! struct Echo(Vec<(ConnectionId, Bytes)>);
//!
//! impl EventHandler for Echo {
//!     fn on_received(&mut self, _net: NetType, _opaque: Opaque, conn_id: ConnectionId, data: Bytes) {
//!         self.0.push((conn_id, data));
//!     }
//! }
//!
//! let mut channel = NetworkChannel::new(NetConfig::default())?;
//! channel.start(2)?;
//! channel.accept(NetType::Tcp, "0.0.0.0", 7000, 0, 0, 1)?;
//! let mut echo = Echo(Vec::new());
//! loop {
//!     channel.update(&mut echo);
//!     for (conn_id, data) in echo.0.drain(..) {
//!         channel.send(NetType::Tcp, conn_id, horizon_net::framing::encode(&data))?;
//!     }
//! }
//! # Ok::<(), horizon_net::Error>(())
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;

use crate::config::NetConfig;
use crate::conn_id::ConnectionId;
use crate::error::{Error, NetError, Result};
use crate::event::{Command, Endpoint, NetType, Notice, Opaque};
use crate::queue::{spsc, Consumer, Producer};
use crate::worker::{self, WorkerLink};

/// Callbacks for worker notices. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait EventHandler {
    /// A listener is bound to `addr`.
    fn on_binded(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, addr: SocketAddr) {}

    /// `listener` saw a new peer; `conn_id` is not yet registered for I/O.
    fn on_accepting(&mut self, net: NetType, opaque: Opaque, listener: ConnectionId, conn_id: ConnectionId, peer: SocketAddr) {}

    fn on_accepted(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr) {}

    fn on_connected(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, peer: SocketAddr) {}

    fn on_connect_failed(&mut self, net: NetType, opaque: Opaque, code: NetError, sys_err: i32) {}

    /// A request failed without a live connection, e.g. a listen.
    fn on_errored(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, code: NetError, sys_err: i32) {}

    /// Terminal notice of a connection or listener. `code` is `None` for an
    /// orderly close.
    fn on_closed(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, code: Option<NetError>, sys_err: i32) {}

    fn on_received(&mut self, net: NetType, opaque: Opaque, conn_id: ConnectionId, data: Bytes) {}
}

/// Main-thread ends of one network's queues on one worker.
struct Lane {
    net: NetType,
    commands: Producer<Command>,
    notices: Consumer<Notice>,
}

struct Worker {
    lanes: Vec<Lane>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn lane(&mut self, net: NetType) -> Option<&mut Lane> {
        self.lanes.iter_mut().find(|lane| lane.net == net)
    }
}

pub struct NetworkChannel {
    config: Arc<NetConfig>,
    workers: Vec<Worker>,
    stop: Arc<AtomicBool>,
    /// Round-robin cursor for new listeners and connectors.
    next_worker: usize,
}

impl NetworkChannel {
    pub fn new(config: NetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            next_worker: 0,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawns `worker_count` workers, each hosting every configured network.
    pub fn start(&mut self, worker_count: usize) -> Result<()> {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }
        if worker_count == 0 || worker_count > usize::from(u8::MAX) + 1 {
            return Err(Error::InvalidConfig(format!("worker count {} not in 1..=256", worker_count)));
        }
        self.stop.store(false, Ordering::Release);

        for index in 0..worker_count {
            let mut lanes = Vec::with_capacity(self.config.networks.len());
            let mut links = Vec::with_capacity(self.config.networks.len());
            for &net in &self.config.networks {
                let (commands, command_rx) = spsc(self.config.queue_capacity);
                let (notice_tx, notices) = spsc(self.config.queue_capacity);
                lanes.push(Lane { net, commands, notices });
                links.push(WorkerLink { net, commands: command_rx, notices: notice_tx });
            }
            match worker::spawn(index as u8, self.config.clone(), links, self.stop.clone()) {
                Ok(thread) => self.workers.push(Worker { lanes, thread: Some(thread) }),
                Err(e) => {
                    log::error!("spawning worker {} failed: {}", index, e);
                    self.stop_wait();
                    return Err(e.into());
                }
            }
        }
        log::debug!("network channel started with {} worker(s)", worker_count);
        Ok(())
    }

    /// Dispatches every pending notice to `handler`. Returns how many ran.
    pub fn update<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut handled = 0;
        for worker in &mut self.workers {
            for lane in &mut worker.lanes {
                // bounded so a flooding worker cannot pin the main thread here
                let budget = lane.notices.len();
                for _ in 0..budget {
                    let Some(notice) = lane.notices.pop() else { break };
                    dispatch(handler, lane.net, notice);
                    handled += 1;
                }
            }
        }
        handled
    }

    /// Signals every worker to stop and joins it. Undelivered notices are
    /// discarded. Safe to call repeatedly.
    pub fn stop_wait(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("worker {} panicked", index);
                }
            }
        }
        self.workers.clear();
        log::debug!("network channel stopped");
    }

    /// Opens a listener on `ip:port`. Returns `opaque`, which tags every
    /// notice the listener and its accepted peers produce.
    pub fn accept(
        &mut self,
        net: NetType,
        ip: &str,
        port: u16,
        send_buf: usize,
        recv_buf: usize,
        opaque: Opaque,
    ) -> Result<Opaque> {
        let endpoint = Endpoint { addr: parse_addr(ip, port)?, send_buf, recv_buf };
        self.submit_new(net, Command::Listen { opaque, endpoint })?;
        Ok(opaque)
    }

    /// Starts a connection to `ip:port`. Returns `opaque`, echoed back on its
    /// `Connected` or `ConnectFailed` notice.
    pub fn connect(
        &mut self,
        net: NetType,
        ip: &str,
        port: u16,
        send_buf: usize,
        recv_buf: usize,
        opaque: Opaque,
    ) -> Result<Opaque> {
        let endpoint = Endpoint { addr: parse_addr(ip, port)?, send_buf, recv_buf };
        self.submit_new(net, Command::Connect { opaque, endpoint })?;
        Ok(opaque)
    }

    /// Queues `data` on `conn_id`. The bytes are sent verbatim; TCP callers
    /// frame their messages with [`framing::encode`](crate::framing::encode).
    pub fn send(&mut self, net: NetType, conn_id: ConnectionId, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.submit_to(net, conn_id, Command::Send { conn_id, data })
    }

    pub fn close(&mut self, net: NetType, conn_id: ConnectionId) -> Result<()> {
        self.submit_to(net, conn_id, Command::Close { conn_id })
    }

    /// Turns Nagle simulation on for every TCP network, or off when both
    /// thresholds are zero.
    pub fn set_simulate_nagle(&mut self, packet_count: u32, timeout: Duration) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        for worker in &mut self.workers {
            let lane = worker.lane(NetType::Tcp).ok_or(Error::InvalidNetType(NetType::Tcp))?;
            lane.commands
                .push(Command::SimulateNagle { packet_count, timeout })
                .map_err(|_| Error::QueueFull)?;
        }
        Ok(())
    }

    /// Notices workers had to drop because a notice queue was full.
    pub fn dropped_notices(&self) -> u64 {
        self.workers
            .iter()
            .flat_map(|w| w.lanes.iter())
            .map(|lane| lane.notices.rejected())
            .sum()
    }

    /// Sends a command that creates a socket to the next worker in turn.
    fn submit_new(&mut self, net: NetType, cmd: Command) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let index = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        self.push(index, net, cmd)
    }

    /// Sends a command to the worker that owns `conn_id`.
    fn submit_to(&mut self, net: NetType, conn_id: ConnectionId, cmd: Command) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let index = usize::from(conn_id.thread_index());
        if !conn_id.is_valid() || index >= self.workers.len() {
            return Err(Error::InvalidThreadIndex(index));
        }
        self.push(index, net, cmd)
    }

    fn push(&mut self, index: usize, net: NetType, cmd: Command) -> Result<()> {
        let lane = self.workers[index].lane(net).ok_or(Error::InvalidNetType(net))?;
        lane.commands.push(cmd).map_err(|_| Error::QueueFull)
    }
}

impl Drop for NetworkChannel {
    fn drop(&mut self) {
        self.stop_wait();
    }
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = ip.parse().map_err(|_| Error::InvalidAddress(ip.to_owned()))?;
    Ok(SocketAddr::new(ip, port))
}

fn dispatch<H: EventHandler + ?Sized>(handler: &mut H, net: NetType, notice: Notice) {
    match notice {
        Notice::Bound { opaque, conn_id, addr } => handler.on_binded(net, opaque, conn_id, addr),
        Notice::Accepting { opaque, listener, conn_id, peer } => handler.on_accepting(net, opaque, listener, conn_id, peer),
        Notice::Accepted { opaque, conn_id, peer } => handler.on_accepted(net, opaque, conn_id, peer),
        Notice::Connected { opaque, conn_id, peer } => handler.on_connected(net, opaque, conn_id, peer),
        Notice::ConnectFailed { opaque, code, sys_err } => handler.on_connect_failed(net, opaque, code, sys_err),
        Notice::Errored { opaque, conn_id, code, sys_err } => handler.on_errored(net, opaque, conn_id, code, sys_err),
        Notice::Closed { opaque, conn_id, code, sys_err } => handler.on_closed(net, opaque, conn_id, code, sys_err),
        Notice::Received { opaque, conn_id, data } => handler.on_received(net, opaque, conn_id, data),
    }
}
