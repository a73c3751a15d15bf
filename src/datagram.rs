//! Outbound datagrams waiting for a UDP socket to become writable
//!
//! A datagram is never split, so a would-block send parks the whole packet in
//! its own buffer. Buffers are recycled through a spare list to keep the
//! steady state allocation-free.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

#[derive(Debug)]
struct Pending {
    data: Vec<u8>,
    /// `None` on connected sockets.
    to: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct DatagramQueue {
    pending: VecDeque<Pending>,
    bytes: usize,
    spare: Vec<Vec<u8>>,
    max_spare: usize,
}

impl Default for DatagramQueue {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DatagramQueue {
    /// Creates an empty queue keeping at most `max_spare` recycled buffers.
    pub fn new(max_spare: usize) -> Self {
        Self { pending: VecDeque::new(), bytes: 0, spare: Vec::new(), max_spare }
    }

    /// Copies `data` into a pooled buffer and appends it.
    pub fn push(&mut self, data: &[u8], to: Option<SocketAddr>) {
        let mut buf = self.spare.pop().unwrap_or_default();
        buf.extend_from_slice(data);
        self.bytes += buf.len();
        self.pending.push_back(Pending { data: buf, to });
    }

    /// Sends queued datagrams in order until `send` would block.
    ///
    /// Returns `Ok(true)` once the queue is empty. A datagram is dropped from
    /// the queue only after `send` accepted it.
    pub fn flush<F>(&mut self, mut send: F) -> io::Result<bool>
    where
        F: FnMut(&[u8], Option<SocketAddr>) -> io::Result<usize>,
    {
        while let Some(front) = self.pending.front() {
            match send(&front.data, front.to) {
                Ok(_) => self.pop_front(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drops every queued datagram addressed to `to`.
    pub fn discard_to(&mut self, to: SocketAddr) {
        let mut kept = VecDeque::with_capacity(self.pending.len());
        while let Some(p) = self.pending.pop_front() {
            if p.to == Some(to) {
                self.bytes -= p.data.len();
                self.release(p.data);
            } else {
                kept.push_back(p);
            }
        }
        self.pending = kept;
    }

    /// Queued payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Queued bytes addressed to `to`.
    pub fn bytes_to(&self, to: SocketAddr) -> usize {
        self.pending.iter().filter(|p| p.to == Some(to)).map(|p| p.data.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        while let Some(p) = self.pending.pop_front() {
            self.release(p.data);
        }
        self.bytes = 0;
    }

    fn pop_front(&mut self) {
        if let Some(p) = self.pending.pop_front() {
            self.bytes -= p.data.len();
            self.release(p.data);
        }
    }

    fn release(&mut self, mut buf: Vec<u8>) {
        if self.spare.len() < self.max_spare {
            buf.clear();
            self.spare.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_flush_stops_on_would_block() {
        let mut q = DatagramQueue::new(4);
        q.push(b"one", Some(addr(1)));
        q.push(b"two", Some(addr(2)));
        q.push(b"three", Some(addr(1)));
        assert_eq!(q.bytes(), 11);

        let mut sent = Vec::new();
        let drained = q
            .flush(|data, to| {
                if sent.len() == 2 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                sent.push((data.to_vec(), to));
                Ok(data.len())
            })
            .unwrap();
        assert!(!drained);
        assert_eq!(sent, vec![(b"one".to_vec(), Some(addr(1))), (b"two".to_vec(), Some(addr(2)))]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes(), 5);

        assert!(q.flush(|d, _| Ok(d.len())).unwrap());
        assert!(q.is_empty());
        assert_eq!(q.bytes(), 0);
    }

    #[test]
    fn test_hard_error_keeps_datagram() {
        let mut q = DatagramQueue::default();
        q.push(b"x", None);
        let err = q.flush(|_, _| Err(io::ErrorKind::ConnectionRefused.into())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_discard_by_destination() {
        let mut q = DatagramQueue::default();
        q.push(b"aa", Some(addr(1)));
        q.push(b"bbb", Some(addr(2)));
        q.push(b"cccc", Some(addr(1)));
        assert_eq!(q.bytes_to(addr(1)), 6);
        q.discard_to(addr(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes(), 3);
        assert_eq!(q.bytes_to(addr(1)), 0);
    }

    #[test]
    fn test_buffers_are_recycled() {
        let mut q = DatagramQueue::new(1);
        q.push(&[0u8; 512], None);
        q.clear();
        assert_eq!(q.spare.len(), 1);
        assert!(q.spare[0].capacity() >= 512);
        q.push(b"small", None);
        assert!(q.spare.is_empty());
    }
}
