//! Per-transport network instances hosted by a worker
//!
//! A worker owns one [`Network`] per enabled [`NetType`]. Each network has a
//! private poller and socket pool, pops its [`Command`]s from one SPSC queue
//! and posts its [`Notice`]s to another.

pub mod tcp;
pub mod udp;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NetConfig;
use crate::event::{Command, NetType, Notice};
use crate::nagle::NagleConfig;
use crate::poller::{Multiplexer, Poller};
use crate::queue::{Consumer, Producer};

pub use self::tcp::TcpNetwork;
pub use self::udp::UdpNetwork;

/// One transport on one worker thread.
pub trait Network {
    fn net_type(&self) -> NetType;

    fn next_command(&mut self) -> Option<Command>;

    fn handle_command(&mut self, cmd: Command);

    /// Handles up to `budget` queued commands. Returns how many ran.
    fn drain_commands(&mut self, budget: usize) -> usize {
        let mut n = 0;
        while n < budget {
            let Some(cmd) = self.next_command() else { break };
            self.handle_command(cmd);
            n += 1;
        }
        n
    }

    /// Waits up to `timeout` for readiness and services it.
    fn poll(&mut self, timeout: Duration) -> io::Result<usize>;

    /// Periodic maintenance: timers, batching deadlines, idle sessions.
    fn tick(&mut self, now: Instant);

    /// Closes every socket. Notices posted here may never be read.
    fn shutdown(&mut self);
}

/// Notice producer that sheds load instead of blocking the worker.
pub struct Outbox {
    producer: Producer<Notice>,
    dropped: u64,
}

impl Outbox {
    pub fn new(producer: Producer<Notice>) -> Self {
        Self { producer, dropped: 0 }
    }

    pub fn post(&mut self, notice: Notice) {
        if let Err(notice) = self.producer.push(notice) {
            self.dropped += 1;
            log::warn!("notice queue full, dropping {:?} ({} dropped so far)", notice_kind(&notice), self.dropped);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn notice_kind(notice: &Notice) -> &'static str {
    match notice {
        Notice::Bound { .. } => "Bound",
        Notice::Accepting { .. } => "Accepting",
        Notice::Accepted { .. } => "Accepted",
        Notice::Connected { .. } => "Connected",
        Notice::ConnectFailed { .. } => "ConnectFailed",
        Notice::Errored { .. } => "Errored",
        Notice::Closed { .. } => "Closed",
        Notice::Received { .. } => "Received",
    }
}

/// State every network carries besides its socket pool.
pub struct NetContext {
    pub net: NetType,
    pub thread_index: u8,
    pub poller: Poller,
    pub outbox: Outbox,
    pub commands: Consumer<Command>,
    pub config: Arc<NetConfig>,
    pub nagle: NagleConfig,
}

impl NetContext {
    pub fn new(
        net: NetType,
        thread_index: u8,
        config: Arc<NetConfig>,
        commands: Consumer<Command>,
        notices: Producer<Notice>,
    ) -> io::Result<Self> {
        Ok(Self {
            net,
            thread_index,
            poller: Poller::with_capacity(config.max_events)?,
            outbox: Outbox::new(notices),
            commands,
            nagle: config.nagle,
            config,
        })
    }
}

/// Builds the network serving `net` on worker `thread_index`.
pub fn build(
    net: NetType,
    thread_index: u8,
    config: Arc<NetConfig>,
    commands: Consumer<Command>,
    notices: Producer<Notice>,
) -> io::Result<Box<dyn Network>> {
    let ctx = NetContext::new(net, thread_index, config, commands, notices)?;
    Ok(match net {
        NetType::Tcp => Box::new(TcpNetwork::new(ctx)),
        NetType::Udp => Box::new(UdpNetwork::new(ctx, false)),
        NetType::Kcp => Box::new(UdpNetwork::new(ctx, true)),
    })
}
