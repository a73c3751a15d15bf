//! io_uring back-end built on one-shot `POLL_ADD` requests.
//!
//! Every registered descriptor has exactly one poll request in flight. A
//! completion is translated into a [`Readiness`] and the request is armed
//! again with the current interest, which gives level-triggered semantics.
//! `user_data` carries `(token << 32) | seq`; the sequence number changes on
//! every reregistration so completions of cancelled requests are recognised
//! and dropped.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use super::{Multiplexer, PollSource, Readiness, Ready};
use crate::conn_id::ConnectionId;

const TIMEOUT_UD: u64 = u64::MAX;
const CANCEL_UD: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy)]
struct Armed {
    fd: RawFd,
    interest: Ready,
    seq: u32,
}

pub struct UringPoller {
    ring: IoUring,
    armed: HashMap<u32, Armed>,
    next_seq: u32,
    /// Must stay at a stable address while a timeout SQE is in flight.
    timeout: Box<types::Timespec>,
    timeout_pending: bool,
    completions: Vec<(u64, i32)>,
}

fn poll_mask(ready: Ready) -> u32 {
    let mut mask = (libc::POLLIN | libc::POLLRDHUP) as u32;
    if ready.contains(Ready::SEND) {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

fn user_data(token: u32, seq: u32) -> u64 {
    ((token as u64) << 32) | seq as u64
}

impl UringPoller {
    fn push(&mut self, entry: io_uring::squeue::Entry) -> io::Result<()> {
        // SAFETY: poll and cancel entries reference no user memory; timeout
        // entries point at `self.timeout`, which outlives the request.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            self.ring.submit()?;
            unsafe { self.ring.submission().push(&entry) }
                .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "submission queue full"))?;
        }
        Ok(())
    }

    fn arm(&mut self, token: u32, armed: Armed) -> io::Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(armed.fd), poll_mask(armed.interest))
            .build()
            .user_data(user_data(token, armed.seq));
        self.push(entry)
    }

    fn cancel(&mut self, token: u32, seq: u32) -> io::Result<()> {
        let entry = opcode::PollRemove::new(user_data(token, seq)).build().user_data(CANCEL_UD);
        self.push(entry)
    }

    fn seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }
}

impl Multiplexer for UringPoller {
    fn with_capacity(max_events: usize) -> io::Result<Self> {
        let entries = (max_events as u32).clamp(8, 4096).next_power_of_two();
        Ok(Self {
            ring: IoUring::new(entries)?,
            armed: HashMap::new(),
            next_seq: 0,
            timeout: Box::new(types::Timespec::new()),
            timeout_pending: false,
            completions: Vec::with_capacity(entries as usize),
        })
    }

    fn register<S: PollSource + ?Sized>(&mut self, source: &mut S, id: ConnectionId, interest: Ready) -> io::Result<()> {
        let armed = Armed { fd: source.as_raw_fd(), interest, seq: self.seq() };
        if self.armed.insert(id.raw(), armed).is_some() {
            log::warn!("uring: token {} registered twice", id);
        }
        self.arm(id.raw(), armed)
    }

    fn reregister<S: PollSource + ?Sized>(&mut self, source: &mut S, id: ConnectionId, interest: Ready) -> io::Result<()> {
        let seq = self.seq();
        let armed = Armed { fd: source.as_raw_fd(), interest, seq };
        match self.armed.insert(id.raw(), armed) {
            Some(old) => self.cancel(id.raw(), old.seq)?,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "token not registered")),
        }
        self.arm(id.raw(), armed)
    }

    fn deregister<S: PollSource + ?Sized>(&mut self, _source: &mut S, id: ConnectionId) -> io::Result<()> {
        let old = self
            .armed
            .remove(&id.raw())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        self.cancel(id.raw(), old.seq)?;
        // the descriptor is about to be closed; get the cancel to the kernel first
        self.ring.submit()?;
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<usize> {
        let want = match timeout {
            Some(t) if t.is_zero() => 0,
            Some(t) => {
                if !self.timeout_pending {
                    *self.timeout = types::Timespec::new().sec(t.as_secs()).nsec(t.subsec_nanos());
                    let entry = opcode::Timeout::new(&*self.timeout as *const types::Timespec)
                        .build()
                        .user_data(TIMEOUT_UD);
                    self.push(entry)?;
                    self.timeout_pending = true;
                }
                1
            }
            None => 1,
        };

        match self.ring.submit_and_wait(want) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
            Err(e) => return Err(e),
        }

        self.completions.clear();
        self.completions
            .extend(self.ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));

        let before = out.len();
        for i in 0..self.completions.len() {
            let (ud, res) = self.completions[i];
            match ud {
                TIMEOUT_UD => {
                    self.timeout_pending = false;
                    continue;
                }
                CANCEL_UD => continue,
                _ => {}
            }
            let token = (ud >> 32) as u32;
            let seq = ud as u32;
            let Some(armed) = self.armed.get(&token).copied() else {
                continue;
            };
            if armed.seq != seq || res == -libc::ECANCELED {
                continue;
            }

            let mut ready = Ready::EMPTY;
            if res < 0 {
                ready |= Ready::ERR;
            } else {
                let revents = res as i16;
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLRDHUP) != 0 {
                    ready |= Ready::RECV;
                }
                if revents & libc::POLLOUT != 0 {
                    ready |= Ready::SEND;
                }
                if revents & libc::POLLERR != 0 {
                    ready |= Ready::ERR;
                }
            }
            if !ready.is_empty() {
                out.push(Readiness { token: ConnectionId::from_raw(token), ready });
            }
            self.arm(token, armed)?;
        }
        Ok(out.len() - before)
    }
}
