//! Growable circular store of variably-sized sample records.
//!
//! Records are copied into one contiguous backing `Vec<u8>`; each record
//! occupies a contiguous byte range, so a record that does not fit before the
//! end of the store wraps to offset 0 and the unused tail becomes padding.
//! Slots leave strictly oldest-first.
//!
//! `SampleRing` is not synchronised. `TrackPipe` owns it behind its lock.

use std::collections::VecDeque;

use super::sample::SampleInfo;

/// Smallest capacity a growth step produces (covers zero-capacity rings).
pub const MIN_GROWTH_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    info: SampleInfo,
}

pub struct SampleRing {
    store: Vec<u8>,
    slots: VecDeque<Slot>,
    /// End of the newest record that occupies bytes.
    head: usize,
    /// Bytes held by live records (padding excluded).
    used: usize,
    ceiling: usize,
}

impl SampleRing {
    /// Create a ring with `capacity` bytes that may grow up to `ceiling`.
    pub fn new(capacity: usize, ceiling: usize) -> Self {
        Self {
            store: vec![0; capacity],
            slots: VecDeque::new(),
            head: 0,
            used: 0,
            ceiling: ceiling.max(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Number of unread records.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Copy `payload` in as the newest record.
    ///
    /// Returns `false` without touching the ring when there is no contiguous
    /// free range large enough. `info.size` is normalised to the payload length.
    pub fn add(&mut self, payload: &[u8], info: SampleInfo) -> bool {
        let size = payload.len();
        let Some(offset) = self.reserve(size) else {
            return false;
        };

        self.store[offset..offset + size].copy_from_slice(payload);
        if size > 0 {
            self.head = offset + size;
        }
        self.used += size;
        self.slots.push_back(Slot {
            offset,
            info: SampleInfo { size, ..info },
        });
        true
    }

    /// Oldest unread record, without removing it.
    pub fn peek_oldest(&self) -> Option<(&[u8], SampleInfo)> {
        self.slots.front().map(|slot| {
            let end = slot.offset + slot.info.size;
            (&self.store[slot.offset..end], slot.info)
        })
    }

    /// Free the oldest record. Returns its metadata, or `None` when empty.
    pub fn remove_oldest(&mut self) -> Option<SampleInfo> {
        let slot = self.slots.pop_front()?;
        self.used -= slot.info.size;
        if self.used == 0 {
            self.head = 0;
        }
        Some(slot.info)
    }

    /// Double the backing store, bounded by the ceiling.
    ///
    /// Live records are compacted to the front of the new store in FIFO
    /// order. Returns `false` when the ceiling is reached or the allocation
    /// fails; the ring is unchanged in that case.
    pub fn grow(&mut self) -> bool {
        let current = self.capacity();
        let doubled = if current == 0 {
            MIN_GROWTH_BYTES
        } else {
            current.saturating_mul(2)
        };
        let target = doubled.min(self.ceiling);
        if target <= current {
            return false;
        }

        let mut store = Vec::new();
        if store.try_reserve_exact(target).is_err() {
            return false;
        }
        store.resize(target, 0);

        let mut offset = 0;
        for slot in self.slots.iter_mut() {
            let size = slot.info.size;
            store[offset..offset + size]
                .copy_from_slice(&self.store[slot.offset..slot.offset + size]);
            slot.offset = offset;
            offset += size;
        }

        self.store = store;
        self.head = offset;
        true
    }

    /// Find a contiguous free range of `size` bytes.
    fn reserve(&self, size: usize) -> Option<usize> {
        let cap = self.capacity();
        if self.used == 0 {
            return (size <= cap).then_some(0);
        }
        if size == 0 {
            return Some(self.head);
        }

        // Oldest record that actually occupies bytes; zero-sized ones float.
        let tail = self
            .slots
            .iter()
            .find(|slot| slot.info.size > 0)
            .map(|slot| slot.offset)?;

        if self.head > tail {
            // Live bytes are [tail, head): free space after head, then before tail.
            if cap - self.head >= size {
                Some(self.head)
            } else if tail >= size {
                Some(0)
            } else {
                None
            }
        } else if tail - self.head >= size {
            // Wrapped: live bytes are [tail, end) and [0, head).
            Some(self.head)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity())
            .field("ceiling", &self.ceiling)
            .field("len", &self.len())
            .field("used", &self.used)
            .finish()
    }
}
