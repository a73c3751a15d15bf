//! Generation-checked slot pool for worker-owned sockets
//!
//! Slot indices come from two queues. `active` holds the indices that may be
//! handed out in the current cycle; indices released during the cycle go to
//! `free`. When `active` runs dry the queues are swapped and the cycle counter
//! advances, so a slot released in cycle `c` is reissued no earlier than cycle
//! `c + 1` and its old [`ConnectionId`] can never name the new occupant.
//!
//! Released socket objects are parked on a reuse list instead of being
//! dropped, which keeps their ring buffers allocated across connections.

use std::collections::VecDeque;

use slab::Slab;

use crate::conn_id::{ConnectionId, MAX_SLOTS};

/// Objects stored in a [`SocketPool`].
pub trait Pooled: Default {
    fn conn_id(&self) -> ConnectionId;
    fn set_conn_id(&mut self, id: ConnectionId);
    /// Returns the object to its pristine state before it is parked for reuse.
    fn reset(&mut self);
}

#[derive(Debug)]
struct Entry<T> {
    item: Box<T>,
    /// Key of this slot in the iteration list.
    link: usize,
}

#[derive(Debug)]
pub struct SocketPool<T: Pooled> {
    thread_index: u8,
    max_count: usize,
    cycle: u8,
    slots: Vec<Option<Entry<T>>>,
    active: VecDeque<u16>,
    free: VecDeque<u16>,
    reuse: Vec<Box<T>>,
    allocated: Slab<u16>,
}

impl<T: Pooled> SocketPool<T> {
    /// Creates a pool of `max_count` slots (clamped to 65535) for worker `thread_index`.
    pub fn new(max_count: usize, thread_index: u8) -> Self {
        let max_count = max_count.min(MAX_SLOTS);
        let mut slots = Vec::with_capacity(max_count);
        slots.resize_with(max_count, || None);
        Self {
            thread_index,
            max_count,
            cycle: 0,
            slots,
            active: (0..max_count as u16).collect(),
            free: VecDeque::new(),
            reuse: Vec::new(),
            allocated: Slab::new(),
        }
    }

    /// Takes a slot and stamps a fresh ID on its object.
    ///
    /// Returns `None` when every slot is in use.
    pub fn alloc(&mut self) -> Option<&mut T> {
        if self.active.is_empty() {
            if self.free.is_empty() {
                return None;
            }
            std::mem::swap(&mut self.active, &mut self.free);
            self.cycle = self.cycle.wrapping_add(1);
        }
        let slot = self.active.pop_front()?;

        let mut item = self.reuse.pop().unwrap_or_default();
        item.set_conn_id(ConnectionId::new(self.cycle, self.thread_index, slot));
        let link = self.allocated.insert(slot);

        let entry = &mut self.slots[slot as usize];
        *entry = Some(Entry { item, link });
        entry.as_mut().map(|e| &mut *e.item)
    }

    /// Releases the slot named by `id`. Stale or unknown IDs are ignored and
    /// yield `false`.
    pub fn free(&mut self, id: ConnectionId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        let slot = id.slot();
        let Some(Entry { mut item, link }) = self.slots[slot as usize].take() else {
            return false;
        };
        self.allocated.remove(link);
        self.free.push_back(slot);

        item.reset();
        item.set_conn_id(ConnectionId::INVALID);
        self.reuse.push(item);
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.slots
            .get(id.slot() as usize)?
            .as_ref()
            .filter(|e| e.item.conn_id() == id)
            .map(|e| &*e.item)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.slots
            .get_mut(id.slot() as usize)?
            .as_mut()
            .filter(|e| e.item.conn_id() == id)
            .map(|e| &mut *e.item)
    }

    /// Visits every allocated object until `f` returns `false`.
    pub fn for_each<F: FnMut(&mut T) -> bool>(&mut self, mut f: F) {
        for (_, &slot) in self.allocated.iter() {
            if let Some(entry) = self.slots[slot as usize].as_mut() {
                if !f(&mut entry.item) {
                    break;
                }
            }
        }
    }

    /// IDs of every allocated object, in iteration order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.allocated
            .iter()
            .filter_map(|(_, &slot)| self.slots[slot as usize].as_ref().map(|e| e.item.conn_id()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_count
    }

    pub fn is_full(&self) -> bool {
        self.allocated.len() == self.max_count
    }

    pub fn thread_index(&self) -> u8 {
        self.thread_index
    }
}
