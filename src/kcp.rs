//! KCP reliable stream carried over UDP datagrams
//!
//! A [`KcpSession`] wraps one `kcp::Kcp` stream. Outgoing segments are not
//! written to a socket directly: the session's output hook queues them, and
//! the owning UDP network drains the queue with [`KcpSession::pop_output`]
//! and transmits each entry as one datagram.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use ::kcp::Kcp;

use crate::error::{Error, NetError, Result};

/// Size of the KCP segment header.
pub const KCP_OVERHEAD: usize = 24;

/// KCP tuning shared by both ends of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpConfig {
    /// Conversation id; both ends must agree.
    pub conv: u32,
    pub nodelay: bool,
    /// Internal update interval in milliseconds.
    pub interval: i32,
    /// Fast retransmit after this many duplicate ACKs. 0 disables.
    pub resend: i32,
    pub no_congestion: bool,
    pub send_window: u16,
    pub recv_window: u16,
    pub mtu: usize,
    /// Segments allowed to wait for acknowledgement before a send fails with
    /// `SendBuffOverflow`.
    pub max_wait_snd: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            conv: 0x4B43_5031,
            nodelay: false,
            interval: 10,
            resend: 0,
            no_congestion: false,
            send_window: 128,
            recv_window: 128,
            mtu: 1400,
            max_wait_snd: 2048,
        }
    }
}

impl KcpConfig {
    /// The usual "turbo" profile: no delay, fast resend, no congestion window.
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion: true,
            send_window: 256,
            recv_window: 256,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < 50 || self.mtu > 65_507 {
            return Err(Error::InvalidConfig(format!("kcp mtu {} out of range", self.mtu)));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(Error::InvalidConfig("kcp windows must be positive".into()));
        }
        if self.max_wait_snd == 0 {
            return Err(Error::InvalidConfig("kcp max_wait_snd must be positive".into()));
        }
        Ok(())
    }
}

/// Conversation id carried by a KCP segment, if `datagram` is long enough to
/// be one.
pub fn conv_of(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < KCP_OVERHEAD {
        return None;
    }
    Some(u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]))
}

type OutputQueue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Output hook: every `write` is one datagram.
struct QueuedOutput(OutputQueue);

impl Write for QueuedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of feeding one datagram to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Accepted,
    /// The datagram belongs to another conversation and was ignored.
    ConvMismatch(u32),
    /// The datagram could not be parsed as KCP and was ignored.
    Malformed,
}

pub struct KcpSession {
    kcp: Kcp<QueuedOutput>,
    output: OutputQueue,
    max_wait_snd: usize,
}

impl KcpSession {
    pub fn new(cfg: &KcpConfig, now_ms: u32) -> Result<Self> {
        let output = OutputQueue::default();
        let mut kcp = Kcp::new_stream(cfg.conv, QueuedOutput(output.clone()));
        kcp.set_nodelay(cfg.nodelay, cfg.interval, cfg.resend, cfg.no_congestion);
        kcp.set_wndsize(cfg.send_window, cfg.recv_window);
        kcp.set_mtu(cfg.mtu)
            .map_err(|e| Error::InvalidConfig(format!("kcp mtu: {}", e)))?;
        // flush() refuses to run before the first update
        kcp.update(now_ms)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        Ok(Self { kcp, output, max_wait_snd: cfg.max_wait_snd })
    }

    pub fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    /// Queues `data` on the stream.
    pub fn send(&mut self, data: &[u8]) -> std::result::Result<(), NetError> {
        if self.kcp.wait_snd() > self.max_wait_snd {
            return Err(NetError::SendBuffOverflow);
        }
        self.kcp.send(data).map_err(|e| {
            log::debug!("kcp send failed: {}", e);
            NetError::SendFailed
        })?;
        if let Err(e) = self.kcp.flush() {
            log::debug!("kcp flush after send failed: {}", e);
        }
        Ok(())
    }

    /// Feeds one raw datagram.
    pub fn input(&mut self, datagram: &[u8]) -> Input {
        let Some(conv) = conv_of(datagram) else {
            return Input::Malformed;
        };
        if conv != self.kcp.conv() {
            return Input::ConvMismatch(conv);
        }
        match self.kcp.input(datagram) {
            Ok(_) => {
                // push the ACKs out without waiting for the next tick
                if let Err(e) = self.kcp.flush() {
                    log::debug!("kcp flush after input failed: {}", e);
                }
                Input::Accepted
            }
            Err(e) => {
                log::debug!("kcp input rejected: {}", e);
                Input::Malformed
            }
        }
    }

    /// Moves up to `max` in-order bytes out of the stream.
    ///
    /// Returns `Ok(None)` when nothing is deliverable.
    pub fn drain(&mut self, max: usize) -> std::result::Result<Option<Bytes>, NetError> {
        let mut out = BytesMut::new();
        while let Ok(size) = self.kcp.peeksize() {
            if out.len() + size > max {
                if out.is_empty() {
                    return Err(NetError::InvalidPacketSize);
                }
                break;
            }
            let start = out.len();
            out.resize(start + size, 0);
            match self.kcp.recv(&mut out[start..]) {
                Ok(n) => out.truncate(start + n),
                Err(e) => {
                    log::debug!("kcp recv failed: {}", e);
                    out.truncate(start);
                    return Err(NetError::RecvFailed);
                }
            }
        }
        Ok((!out.is_empty()).then(|| out.freeze()))
    }

    /// Drives retransmission and flushes pending segments.
    pub fn update(&mut self, now_ms: u32) -> std::result::Result<(), NetError> {
        self.kcp.update(now_ms).map_err(|e| {
            log::debug!("kcp update failed: {}", e);
            NetError::SendFailed
        })
    }

    /// Next datagram waiting to be transmitted.
    pub fn pop_output(&mut self) -> Option<Vec<u8>> {
        self.output.borrow_mut().pop_front()
    }

    /// Segments sent or queued but not yet acknowledged.
    pub fn wait_snd(&self) -> usize {
        self.kcp.wait_snd()
    }
}
