//! Connection handle codec
//!
//! A [`ConnectionId`] packs three fields into 32 bits:
//!
//! ```text
//!  31        24 23        16 15                         0
//! +------------+------------+----------------------------+
//! |   cycle    |   worker   |            slot            |
//! +------------+------------+----------------------------+
//! ```
//!
//! The cycle is the generation of the owning pool at the time the slot was
//! handed out, so an ID kept after its connection closed never matches the
//! next occupant of the same slot.

use std::fmt;

/// Opaque handle naming one pooled socket on one worker.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

/// Highest slot index a pool may hand out. Slot `0xFFFF` is never used so that
/// [`ConnectionId::INVALID`] cannot collide with a live handle.
pub const MAX_SLOTS: usize = 0xFFFF;

impl ConnectionId {
    /// The all-ones handle; never issued by a pool.
    pub const INVALID: ConnectionId = ConnectionId(u32::MAX);

    #[inline]
    pub const fn new(cycle: u8, thread_index: u8, slot: u16) -> Self {
        Self(((cycle as u32) << 24) | ((thread_index as u32) << 16) | slot as u32)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn cycle(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub const fn thread_index(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub const fn slot(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("ConnectionId(INVALID)");
        }
        write!(f, "ConnectionId({}:{}@{})", self.thread_index(), self.slot(), self.cycle())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
