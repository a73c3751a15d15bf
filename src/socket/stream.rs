//! Byte-stream halves of a TCP connection
//!
//! [`Inbound`] turns reads into framed payloads and [`Outbound`] stages
//! writes. Both are generic over `io::Read`/`io::Write` so the framing,
//! overflow and batching rules run the same against a socket or a test double.

use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::error::{Fault, NetError};
use crate::framing::{FrameHeader, HEADER_LEN};
use crate::nagle::{NagleConfig, NagleState};
use crate::ring_buffer::RingBuffer;

/// Initial size of a send buffer; it grows on demand up to the send limit.
const INITIAL_SEND_BUFFER: usize = 16 * 1024;

/// How a read pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The source would block; everything available was consumed.
    Drained,
    /// The peer closed its side.
    Closed,
}

/// Receive half: staging buffer plus the length-prefix parser.
#[derive(Debug, Default)]
pub struct Inbound {
    buf: RingBuffer,
    max_recv: usize,
}

impl Inbound {
    /// Prepares for a new connection accepting payloads up to `max_recv` bytes.
    pub fn reset(&mut self, max_recv: usize) {
        self.max_recv = max_recv;
        self.buf.reset_to(self.limit());
    }

    /// Bytes the buffer may hold: one maximal frame including its header.
    pub fn limit(&self) -> usize {
        self.max_recv + HEADER_LEN
    }

    pub fn pending(&self) -> usize {
        self.buf.readable_size()
    }

    /// Reads from `src` until it would block, passing each complete payload
    /// to `on_frame`.
    pub fn fill<R, F>(&mut self, src: &mut R, mut on_frame: F) -> Result<ReadStatus, Fault>
    where
        R: Read,
        F: FnMut(Bytes),
    {
        loop {
            let room = self.limit().saturating_sub(self.buf.readable_size());
            let span = self.buf.writeable_span();
            let want = span.len().min(room);
            if want == 0 {
                return Err(NetError::RecvBuffOverflow.into());
            }
            match src.read(&mut span[..want]) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.buf.commit(n);
                    if self.buf.readable_size() > self.limit() {
                        return Err(NetError::RecvBuffOverflow.into());
                    }
                    self.parse(&mut on_frame)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(NetError::RecvFailed, &e)),
            }
        }
    }

    fn parse<F: FnMut(Bytes)>(&mut self, on_frame: &mut F) -> Result<(), Fault> {
        while let Some(header) = FrameHeader::peek(&self.buf) {
            let len = header.payload_len();
            if len > self.max_recv {
                return Err(NetError::InvalidPacketSize.into());
            }
            if self.buf.readable_size() < HEADER_LEN + len {
                break;
            }
            self.buf.consume(HEADER_LEN);
            let mut payload = BytesMut::zeroed(len);
            self.buf.read(&mut payload);
            on_frame(payload.freeze());
        }
        Ok(())
    }
}

/// Outcome of a send or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything reached the OS.
    Sent,
    /// Bytes remain buffered; the socket needs SEND interest.
    Queued,
    /// Bytes are held back by batching; no SEND interest needed yet.
    Deferred,
}

/// Send half: bytes the OS has not accepted yet.
#[derive(Debug, Default)]
pub struct Outbound {
    buf: RingBuffer,
    max_send: usize,
}

impl Outbound {
    pub fn reset(&mut self, max_send: usize) {
        self.max_send = max_send;
        self.buf.reset_to(max_send.min(INITIAL_SEND_BUFFER));
    }

    pub fn pending(&self) -> usize {
        self.buf.readable_size()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends without writing. Fails if the buffer would exceed the limit.
    pub fn queue(&mut self, data: &[u8]) -> Result<(), Fault> {
        if self.buf.readable_size() + data.len() > self.max_send {
            return Err(NetError::SendBuffOverflow.into());
        }
        if self.buf.write(data) < data.len() {
            return Err(NetError::SendBuffOverflow.into());
        }
        Ok(())
    }

    /// Writes `data` straight through when nothing is buffered, otherwise
    /// appends it behind the pending bytes.
    pub fn send<W: Write>(&mut self, dst: &mut W, data: &[u8]) -> Result<SendStatus, Fault> {
        if !self.buf.is_empty() {
            self.queue(data)?;
            return Ok(SendStatus::Queued);
        }
        loop {
            match dst.write(data) {
                Ok(n) if n == data.len() => return Ok(SendStatus::Sent),
                Ok(n) => {
                    self.queue(&data[n..])?;
                    return Ok(SendStatus::Queued);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.queue(data)?;
                    return Ok(SendStatus::Queued);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(NetError::SendFailed, &e)),
            }
        }
    }

    /// Like [`send`](Self::send), but holds bytes back while batching is on
    /// until the batch is full.
    pub fn send_batched<W: Write>(
        &mut self,
        dst: &mut W,
        data: &[u8],
        cfg: &NagleConfig,
        state: &mut NagleState,
        now: Instant,
    ) -> Result<SendStatus, Fault> {
        if !cfg.is_enabled() {
            return self.send(dst, data);
        }
        self.queue(data)?;
        if state.on_queued(cfg, now) {
            state.on_flushed();
            return self.flush(dst);
        }
        Ok(SendStatus::Deferred)
    }

    /// Writes buffered bytes until the buffer is empty or `dst` would block.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> Result<SendStatus, Fault> {
        while !self.buf.is_empty() {
            match dst.write(self.buf.readable_span()) {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    return Err(Fault::io(NetError::SendFailed, &err));
                }
                Ok(n) => {
                    self.buf.consume(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendStatus::Queued),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(NetError::SendFailed, &e)),
            }
        }
        Ok(SendStatus::Sent)
    }
}
