// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Elastic Paged Queue.
//!
//! A FIFO built from fixed-capacity ring segments. It grows by chaining a new
//! ring when the last one is full and shrinks by dropping rings that the
//! front has drained, keeping one spare for reuse.
//!
//! Elements are addressed by a monotonically increasing absolute index:
//! popping the front never renumbers the survivors, so an index held by a
//! reader either still names the same element or is below
//! [`ElasticQueue::first_index`] and is known to be stale.

use std::collections::VecDeque;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, head: 0, len: 0 }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.capacity()
    }

    fn push(&mut self, value: T) {
        let at = self.slot(self.len);
        self.slots[at] = Some(value);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        value
    }

    fn get(&self, i: usize) -> Option<&T> {
        if i >= self.len {
            return None;
        }
        self.slots[self.slot(i)].as_ref()
    }

    fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        if i >= self.len {
            return None;
        }
        let at = self.slot(i);
        self.slots[at].as_mut()
    }
}

pub struct ElasticQueue<T> {
    rings: VecDeque<Ring<T>>,
    spare: Option<Ring<T>>,
    ring_capacity: usize,
    len: usize,
    first_index: u64,
}

impl<T> ElasticQueue<T> {
    pub fn new(ring_capacity: usize) -> Self {
        Self::starting_at(ring_capacity, 0)
    }

    /// Queue whose first element will get absolute index `first_index`.
    pub fn starting_at(ring_capacity: usize, first_index: u64) -> Self {
        Self {
            rings: VecDeque::new(),
            spare: None,
            ring_capacity: ring_capacity.max(1),
            len: 0,
            first_index,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute index of the front element (or of the next push when empty).
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Absolute index the next push will receive.
    pub fn end_index(&self) -> u64 {
        self.first_index + self.len as u64
    }

    /// Number of ring segments currently chained.
    pub fn segments(&self) -> usize {
        self.rings.len()
    }

    pub fn push_back(&mut self, value: T) -> u64 {
        let needs_ring = self.rings.back().map_or(true, Ring::is_full);
        if needs_ring {
            let ring = self
                .spare
                .take()
                .unwrap_or_else(|| Ring::with_capacity(self.ring_capacity));
            self.rings.push_back(ring);
        }
        if let Some(ring) = self.rings.back_mut() {
            ring.push(value);
        }
        self.len += 1;
        self.end_index() - 1
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let ring = self.rings.front_mut()?;
        let value = ring.pop()?;
        self.len -= 1;
        self.first_index += 1;
        if ring.len == 0 {
            if let Some(mut drained) = self.rings.pop_front() {
                drained.head = 0;
                if self.spare.is_none() {
                    self.spare = Some(drained);
                }
            }
        }
        Some(value)
    }

    fn locate(&self, index: u64) -> Option<(usize, usize)> {
        if index < self.first_index || index >= self.end_index() {
            return None;
        }
        let mut offset = (index - self.first_index) as usize;
        for (r, ring) in self.rings.iter().enumerate() {
            if offset < ring.len {
                return Some((r, offset));
            }
            offset -= ring.len;
        }
        None
    }

    pub fn get(&self, index: u64) -> Option<&T> {
        let (r, i) = self.locate(index)?;
        self.rings[r].get(i)
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut T> {
        let (r, i) = self.locate(index)?;
        self.rings[r].get_mut(i)
    }

    pub fn front(&self) -> Option<&T> {
        self.get(self.first_index)
    }

    pub fn back(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|last| self.get(self.first_index + last as u64))
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        let last = self.len.checked_sub(1)?;
        self.get_mut(self.first_index + last as u64)
    }

    /// Elements front to back, paired with their absolute index.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        let first = self.first_index;
        self.rings
            .iter()
            .flat_map(|ring| (0..ring.len).filter_map(move |i| ring.get(i)))
            .enumerate()
            .map(move |(i, v)| (first + i as u64, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.rings.iter_mut().flat_map(|ring| {
            let (cap, head, len) = (ring.capacity(), ring.head, ring.len);
            let (wrapped, straight) = ring.slots.split_at_mut(head);
            let straight_len = len.min(cap - head);
            straight[..straight_len]
                .iter_mut()
                .chain(wrapped[..len - straight_len].iter_mut())
                .filter_map(Option::as_mut)
        })
    }

    /// Pop front elements while `pred` holds.
    pub fn drain_front_while<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        while self.front().map_or(false, &mut pred) {
            if let Some(v) = self.pop_front() {
                out.push(v);
            }
        }
        out
    }
}
