//! `mio` back-end: epoll on Linux, kqueue on macOS/BSD, IOCP on Windows.

use std::io;
use std::time::Duration;

use ::mio::{Events, Interest, Poll, Token};

use super::{Multiplexer, PollSource, Readiness, Ready};
use crate::conn_id::ConnectionId;

#[derive(Debug)]
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

fn interest(ready: Ready) -> Interest {
    if ready.contains(Ready::SEND) {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

#[inline]
fn token(id: ConnectionId) -> Token {
    Token(id.raw() as usize)
}

impl Multiplexer for MioPoller {
    fn with_capacity(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events.max(1)),
        })
    }

    fn register<S: PollSource + ?Sized>(&mut self, source: &mut S, id: ConnectionId, ready: Ready) -> io::Result<()> {
        self.poll.registry().register(source, token(id), interest(ready))
    }

    fn reregister<S: PollSource + ?Sized>(&mut self, source: &mut S, id: ConnectionId, ready: Ready) -> io::Result<()> {
        self.poll.registry().reregister(source, token(id), interest(ready))
    }

    fn deregister<S: PollSource + ?Sized>(&mut self, source: &mut S, _id: ConnectionId) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let before = out.len();
        for ev in self.events.iter() {
            let mut ready = Ready::EMPTY;
            if ev.is_readable() || ev.is_read_closed() {
                ready |= Ready::RECV;
            }
            if ev.is_writable() || ev.is_write_closed() {
                ready |= Ready::SEND;
            }
            if ev.is_error() {
                ready |= Ready::ERR;
            }
            if ready.is_empty() {
                continue;
            }
            out.push(Readiness {
                token: ConnectionId::from_raw(ev.token().0 as u32),
                ready,
            });
        }
        Ok(out.len() - before)
    }
}
