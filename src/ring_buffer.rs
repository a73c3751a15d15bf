//! Growable circular byte buffer used for all stream staging
//!
//! Every TCP socket owns two of these: one for bytes waiting to be written to
//! the OS and one for bytes read from the OS but not yet framed. The buffer is
//! always a power of two in size so cursor arithmetic reduces to a mask, and
//! one slot is kept free to tell "full" from "empty".
//!
//! The continuous span helpers hand the OS a slice that does not wrap, so
//! `recv`/`send` run straight against the buffer memory without a bounce copy:
//!
//! ```rust
//! use horizon_net::ring_buffer::RingBuffer;
//!
//! let mut rb = RingBuffer::new(64);
//! let span = rb.writeable_span();
//! span[..5].copy_from_slice(b"hello");
//! rb.commit(5);
//! assert_eq!(rb.readable_span(), b"hello");
//! ```

/// Occupancy ratio above which a `write` doubles the buffer first.
pub const DEFAULT_GROW_RATIO: f64 = 0.75;

const MIN_SIZE: usize = 16;

/// Power-of-two circular buffer with independent read and write cursors.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    grow_ratio: f64,
}

impl RingBuffer {
    /// Creates a buffer holding at least `size` bytes, rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; round_size(size)].into_boxed_slice(),
            read: 0,
            write: 0,
            grow_ratio: DEFAULT_GROW_RATIO,
        }
    }

    /// Overrides the growth threshold. Clamped to `0.1..=1.0`.
    pub fn with_grow_ratio(mut self, ratio: f64) -> Self {
        self.grow_ratio = ratio.clamp(0.1, 1.0);
        self
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    /// Total allocated size, including the reserved slot.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable_size(&self) -> usize {
        self.write.wrapping_sub(self.read) & self.mask()
    }

    /// Bytes that can be written without growing.
    #[inline]
    pub fn writeable_size(&self) -> usize {
        self.buf.len() - 1 - self.readable_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.writeable_size() == 0
    }

    /// Longest readable run that does not wrap past the end of the buffer.
    pub fn continuously_readable_size(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.buf.len() - self.read
        }
    }

    /// Longest writable run that does not wrap past the end of the buffer.
    pub fn continuously_writeable_size(&self) -> usize {
        let size = self.buf.len();
        if self.write >= self.read {
            if self.read == 0 {
                size - self.write - 1
            } else {
                size - self.write
            }
        } else {
            self.read - self.write - 1
        }
    }

    /// The continuous readable run, suitable for passing to `send`.
    pub fn readable_span(&self) -> &[u8] {
        let n = self.continuously_readable_size();
        &self.buf[self.read..self.read + n]
    }

    /// The continuous writable run, suitable for passing to `recv`.
    /// Follow with [`commit`](Self::commit) for the bytes actually filled.
    pub fn writeable_span(&mut self) -> &mut [u8] {
        let n = self.continuously_writeable_size();
        let w = self.write;
        &mut self.buf[w..w + n]
    }

    /// Marks `n` bytes of the writable span as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.continuously_writeable_size());
        let n = n.min(self.continuously_writeable_size());
        self.write = (self.write + n) & self.mask();
    }

    /// Drops up to `n` readable bytes, returning how many were dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.readable_size());
        self.read = (self.read + n) & self.mask();
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
        n
    }

    /// Copies `data` in, growing first when the result would cross the
    /// growth ratio. Returns the bytes written; fewer than `data.len()` only
    /// when growing would overflow the size type.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let wanted = self.readable_size().saturating_add(data.len());
        if wanted as f64 > self.buf.len() as f64 * self.grow_ratio || data.len() > self.writeable_size() {
            self.grow_for(wanted);
        }

        let n = data.len().min(self.writeable_size());
        let first = n.min(self.buf.len() - self.write);
        let w = self.write;
        self.buf[w..w + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.write = (self.write + n) & self.mask();
        n
    }

    /// Copies up to `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.readable_size());
        let first = n.min(self.buf.len() - self.read);
        out[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        n
    }

    /// Copies out and consumes up to `out.len()` bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// Grows until `additional` more bytes fit. Returns `false` if that size
    /// is not representable.
    pub fn reserve(&mut self, additional: usize) -> bool {
        if self.writeable_size() >= additional {
            return true;
        }
        match self.readable_size().checked_add(additional) {
            Some(wanted) => self.grow_for(wanted),
            None => false,
        }
    }

    /// Drops all pending bytes without releasing memory.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Clears the buffer and makes sure it is `size` bytes (rounded).
    /// Memory is kept when the size already matches.
    pub fn reset_to(&mut self, size: usize) {
        let size = round_size(size);
        if self.buf.len() != size {
            self.buf = vec![0u8; size].into_boxed_slice();
        }
        self.clear();
    }

    fn grow_for(&mut self, wanted: usize) -> bool {
        let mut size = self.buf.len();
        loop {
            if wanted < size && wanted as f64 <= size as f64 * self.grow_ratio {
                break;
            }
            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }
        if size == self.buf.len() {
            return wanted < size;
        }
        self.resize(size);
        true
    }

    fn resize(&mut self, size: usize) {
        let mut next = vec![0u8; size].into_boxed_slice();
        let len = self.peek(&mut next);
        self.buf = next;
        self.read = 0;
        self.write = len;
        log::trace!("ring buffer grown to {} bytes ({} pending)", size, len);
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(MIN_SIZE)
    }
}

fn round_size(size: usize) -> usize {
    size.saturating_add(1)
        .max(MIN_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_capacity_invariant(rb: &RingBuffer) {
        assert_eq!(rb.readable_size() + rb.writeable_size(), rb.buffer_size() - 1);
    }

    #[test]
    fn test_size_is_power_of_two() {
        assert_eq!(RingBuffer::new(0).buffer_size(), 16);
        assert_eq!(RingBuffer::new(100).buffer_size(), 128);
        // a 128-byte request needs 129 slots because one is reserved
        assert_eq!(RingBuffer::new(128).buffer_size(), 256);
    }

    #[test]
    fn test_round_trip_across_wraps_and_growth() {
        let mut rb = RingBuffer::new(16);
        let mut expected = Vec::new();
        let mut actual = Vec::new();
        let mut seed = 7u8;

        for round in 0..200usize {
            let chunk: Vec<u8> = (0..(round % 23) + 1)
                .map(|_| {
                    seed = seed.wrapping_mul(31).wrapping_add(11);
                    seed
                })
                .collect();
            assert_eq!(rb.write(&chunk), chunk.len());
            expected.extend_from_slice(&chunk);
            assert_capacity_invariant(&rb);

            // drain a little less than we wrote so the cursors keep wrapping
            let mut out = vec![0u8; chunk.len().saturating_sub(round % 3)];
            let n = rb.read(&mut out);
            actual.extend_from_slice(&out[..n]);
            assert_capacity_invariant(&rb);
        }

        let mut rest = vec![0u8; rb.readable_size()];
        let n = rb.read(&mut rest);
        actual.extend_from_slice(&rest[..n]);
        assert_eq!(actual, expected);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_growth_preserves_wrapped_bytes() {
        let mut rb = RingBuffer::new(15).with_grow_ratio(1.0);
        assert_eq!(rb.buffer_size(), 16);
        rb.write(&[0u8; 10]);
        rb.consume(8);
        // write cursor at 10: this write wraps past the end
        rb.write(b"abcdefghij");
        assert_eq!(rb.continuously_readable_size(), 8);
        rb.consume(2);
        assert_eq!(rb.continuously_readable_size(), 6);

        rb.write(b"0123456789");
        assert!(rb.buffer_size() >= 32);
        let mut out = vec![0u8; 20];
        assert_eq!(rb.read(&mut out), 20);
        assert_eq!(&out, b"abcdefghij0123456789");
    }

    #[test]
    fn test_grow_ratio_triggers_early_growth() {
        let mut rb = RingBuffer::new(15);
        assert_eq!(rb.buffer_size(), 16);
        rb.write(&[1u8; 13]);
        // 13 > 16 * 0.75, so the buffer doubled before copying
        assert_eq!(rb.buffer_size(), 32);
        assert_capacity_invariant(&rb);
    }

    #[test]
    fn test_continuous_spans() {
        let mut rb = RingBuffer::new(15).with_grow_ratio(1.0);
        assert_eq!(rb.continuously_writeable_size(), 15);

        let span = rb.writeable_span();
        span[..12].copy_from_slice(b"hello world!");
        rb.commit(12);
        assert_eq!(rb.readable_span(), b"hello world!");

        assert_eq!(rb.consume(6), 6);
        // write cursor at 12, read at 6: 4 bytes to the end, then wrap
        assert_eq!(rb.continuously_writeable_size(), 4);
        assert_eq!(rb.writeable_size(), 9);
        rb.write(b"abcdef");
        assert_eq!(rb.continuously_readable_size(), 10);
        assert_eq!(rb.readable_size(), 12);
        assert_capacity_invariant(&rb);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut rb = RingBuffer::new(32);
        rb.write(b"\x04\x00\x00\x00ping");
        let mut hdr = [0u8; 4];
        assert_eq!(rb.peek(&mut hdr), 4);
        assert_eq!(rb.readable_size(), 8);
        assert_eq!(u32::from_le_bytes(hdr), 4);
    }

    #[test]
    fn test_reserve_and_full() {
        let mut rb = RingBuffer::new(15).with_grow_ratio(1.0);
        rb.write(&[9u8; 15]);
        assert!(rb.is_full());
        assert_eq!(rb.continuously_writeable_size(), 0);
        assert!(rb.reserve(100));
        assert!(rb.writeable_size() >= 100);
        assert_eq!(rb.readable_size(), 15);
    }

    #[test]
    fn test_reset_to_reuses_memory() {
        let mut rb = RingBuffer::new(1000);
        rb.write(b"stale");
        rb.reset_to(1000);
        assert!(rb.is_empty());
        assert_eq!(rb.buffer_size(), 1024);
        rb.reset_to(10);
        assert_eq!(rb.buffer_size(), 16);
    }
}
