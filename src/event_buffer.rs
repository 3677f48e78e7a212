// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-destination output buffer.
//!
//! Outgoing calls for one destination are appended to pages held in an
//! [`ElasticQueue`]. Every page knows the sequence range it holds, so a
//! receiver's acknowledgement trims whole pages and a reconnect can resume
//! sending from any sequence number still buffered.
//!
//! # Page lifecycle
//! ```text
//! writable tail -> sendable -> trimmed (back to the PagePool)
//! ```
//!
//! # Invariants
//! - On every page, `highest_seq - lowest_seq + 1` equals its message count.
//! - Sequence numbers increase by one from page to page, except where a
//!   discontinuity forced a new page.
//! - Page numbers are never reused; a cursor naming a page below
//!   `first_page_no` is stale.
//!
//! Locking: the pages sit behind the append lock. Callers that also hold
//! the owning record's trim lock take it first.

use crate::elastic::ElasticQueue;
use crate::spin::{LockRole, SpinGuard, SpinLock, SpinPolicy, Spinner};
use crate::wire;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Pages chained per ring segment of the queue.
const PAGES_PER_SEGMENT: usize = 16;

/// Shared free list of output pages.
///
/// At most `bound` standard pages exist at once, except while a
/// [`GrowthWindow`] is open (recovery and reconnects), when the pool
/// allocates past the bound rather than make the caller wait.
pub struct PagePool {
    free: Mutex<Vec<Vec<u8>>>,
    page_size: usize,
    bound: usize,
    allocated: AtomicUsize,
    growth: AtomicUsize,
}

pub struct GrowthWindow {
    pool: Arc<PagePool>,
}

impl Drop for GrowthWindow {
    fn drop(&mut self) {
        self.pool.growth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PagePool {
    pub fn new(page_size: usize, bound: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            page_size,
            bound,
            allocated: AtomicUsize::new(0),
            growth: AtomicUsize::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn free_pages(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn open_growth_window(self: &Arc<Self>) -> GrowthWindow {
        self.growth.fetch_add(1, Ordering::AcqRel);
        GrowthWindow { pool: self.clone() }
    }

    pub fn growing(&self) -> bool {
        self.growth.load(Ordering::Acquire) > 0
    }

    /// A cleared standard page, or `None` when the pool is exhausted.
    pub fn take(&self) -> Option<Vec<u8>> {
        if let Some(page) = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop() {
            return Some(page);
        }
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            if current >= self.bound && !self.growing() {
                return None;
            }
            match self
                .allocated
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(Vec::with_capacity(self.page_size)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Standard page regardless of the bound.
    fn take_or_grow(&self) -> Vec<u8> {
        if let Some(page) = self.take() {
            return page;
        }
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Vec::with_capacity(self.page_size)
    }

    pub fn give(&self, mut page: Vec<u8>) {
        page.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.bound && self.allocated() <= self.bound {
            free.push(page);
        } else {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct MessageSlot {
    offset: u32,
    len: u32,
    replayable: bool,
}

pub struct BufferPage {
    bytes: Vec<u8>,
    /// Dedicated page for a message larger than the page size.
    oversized: bool,
    pub lowest_seq: i64,
    pub highest_seq: i64,
    pub unsent_replayable: usize,
    pub total_replayable: usize,
    slots: Vec<MessageSlot>,
}

impl BufferPage {
    fn new(bytes: Vec<u8>, oversized: bool, first_seq: i64) -> Self {
        Self {
            bytes,
            oversized,
            lowest_seq: first_seq,
            highest_seq: first_seq - 1,
            unsent_replayable: 0,
            total_replayable: 0,
            slots: Vec::new(),
        }
    }

    pub fn cur_length(&self) -> usize {
        self.bytes.len()
    }

    pub fn message_count(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn room(&self, page_size: usize) -> usize {
        let limit = if self.oversized { self.bytes.capacity() } else { page_size };
        limit.saturating_sub(self.bytes.len())
    }

    fn push(&mut self, frame: &[u8], replayable: bool) {
        self.slots.push(MessageSlot {
            offset: self.bytes.len() as u32,
            len: frame.len() as u32,
            replayable,
        });
        self.bytes.extend_from_slice(frame);
        self.highest_seq += 1;
        if replayable {
            self.total_replayable += 1;
            self.unsent_replayable += 1;
        }
    }

    fn message(&self, i: usize) -> &[u8] {
        let slot = self.slots[i];
        &self.bytes[slot.offset as usize..(slot.offset + slot.len) as usize]
    }

    fn shift(&mut self, delta: i64) {
        self.lowest_seq += delta;
        self.highest_seq += delta;
    }

    /// Index of the first message starting at or after `offset`.
    fn slot_at(&self, offset: usize) -> usize {
        self.slots.partition_point(|s| (s.offset as usize) < offset)
    }

    fn end_offset(&self, i: usize) -> usize {
        let slot = self.slots[i];
        (slot.offset + slot.len) as usize
    }
}

/// Position of the next message to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputCursor {
    pub page_no: u64,
    /// Byte offset inside the page, always on a message boundary.
    pub offset: usize,
    /// Sequence number of the next message to send.
    pub seq: i64,
}

/// Bytes ready for the wire plus where the cursor goes once they are out.
#[derive(Debug)]
pub struct SendChunk {
    pub bytes: Bytes,
    pub messages: usize,
    pub next: OutputCursor,
    pub sent_replayable: Vec<(u64, usize)>,
}

pub struct Pages {
    queue: ElasticQueue<BufferPage>,
    /// `LastSeqNoFromLocalService`.
    last_seq: i64,
}

impl Pages {
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    pub fn first_page_no(&self) -> u64 {
        self.queue.first_index()
    }

    pub fn page(&self, page_no: u64) -> Option<&BufferPage> {
        self.queue.get(page_no)
    }

    pub fn image(&self) -> BufferImage {
        BufferImage {
            last_seq: self.last_seq,
            pages: self
                .queue
                .iter()
                .filter(|(_, p)| p.message_count() > 0)
                .map(|(_, p)| PageImage {
                    lowest_seq: p.lowest_seq,
                    bytes: p.bytes.clone(),
                    slots: p.slots.clone(),
                })
                .collect(),
        }
    }

    fn shift(&mut self, delta: i64) {
        for page in self.queue.iter_mut() {
            page.shift(delta);
        }
        self.last_seq += delta;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    lowest_seq: i64,
    bytes: Vec<u8>,
    slots: Vec<MessageSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferImage {
    pub last_seq: i64,
    pub pages: Vec<PageImage>,
}

pub struct EventBuffer {
    pages: SpinLock<Pages>,
    pool: Arc<PagePool>,
    spin: SpinPolicy,
}

impl EventBuffer {
    pub fn new(pool: Arc<PagePool>, spin: SpinPolicy) -> Self {
        Self {
            pages: SpinLock::new(Pages {
                queue: ElasticQueue::new(PAGES_PER_SEGMENT),
                last_seq: 0,
            }),
            pool,
            spin,
        }
    }

    pub fn lock(&self, role: LockRole) -> SpinGuard<'_, Pages> {
        self.pages.lock(role)
    }

    pub fn last_seq(&self) -> i64 {
        self.lock(LockRole::Send).last_seq
    }

    pub fn first_page_no(&self) -> u64 {
        self.lock(LockRole::Send).queue.first_index()
    }

    pub fn page_count(&self) -> usize {
        self.lock(LockRole::Send).queue.len()
    }

    /// `(page_no, lowest, highest)` for every page, front to back.
    pub fn page_ranges(&self) -> Vec<(u64, i64, i64)> {
        self.lock(LockRole::Send)
            .queue
            .iter()
            .map(|(n, p)| (n, p.lowest_seq, p.highest_seq))
            .collect()
    }

    /// Every buffered message as `(seq, frame, replayable)`.
    pub fn messages(&self) -> Vec<(i64, Bytes, bool)> {
        let pages = self.lock(LockRole::Send);
        let mut out = Vec::new();
        for (_, page) in pages.queue.iter() {
            for (i, slot) in page.slots.iter().enumerate() {
                out.push((
                    page.lowest_seq + i as i64,
                    Bytes::copy_from_slice(page.message(i)),
                    slot.replayable,
                ));
            }
        }
        out
    }

    /// The tail page when it can take `n` more bytes continuing at
    /// `next_seq`; otherwise a fresh page from the pool starting a new run.
    /// `None` when the pool is exhausted.
    pub fn get_writable_page<'a>(&self, pages: &'a mut Pages, n: usize, next_seq: i64) -> Option<&'a mut BufferPage> {
        let page_size = self.pool.page_size();
        let fits = pages
            .queue
            .back()
            .map_or(false, |p| p.highest_seq + 1 == next_seq && p.room(page_size) >= n);
        if !fits {
            let page = if n > page_size {
                BufferPage::new(Vec::with_capacity(n), true, next_seq)
            } else {
                BufferPage::new(self.pool.take()?, false, next_seq)
            };
            pages.queue.push_back(page);
        }
        pages.queue.back_mut()
    }

    /// Append without waiting. Returns the assigned sequence number, or
    /// `None` when no page could be had.
    pub fn try_append(&self, frame: &[u8], replayable: bool) -> Option<i64> {
        let mut pages = self.lock(LockRole::Append);
        let next = pages.last_seq + 1;
        let page = self.get_writable_page(&mut pages, frame.len(), next)?;
        page.push(frame, replayable);
        pages.last_seq = next;
        Some(next)
    }

    /// Append `frame`, waiting for a trim to free a page if the pool is
    /// exhausted.
    pub async fn append(&self, frame: &[u8], replayable: bool) -> i64 {
        let mut spinner = Spinner::new(self.spin);
        loop {
            if let Some(seq) = self.try_append(frame, replayable) {
                return seq;
            }
            spinner.spin().await;
        }
    }

    /// Release every page whose `highest_seq <= commit_seq` and move a cursor
    /// that pointed into a released page to the new front.
    pub fn trim(&self, commit_seq: i64, cursor: &mut OutputCursor) -> usize {
        let released = {
            let mut pages = self.lock(LockRole::Trim);
            let released = pages.queue.drain_front_while(|p| p.highest_seq <= commit_seq);
            let first = pages.queue.first_index();
            if cursor.page_no < first {
                cursor.page_no = first;
                cursor.offset = 0;
            }
            released
        };
        if cursor.seq <= commit_seq {
            cursor.seq = commit_seq + 1;
        }
        let count = released.len();
        for page in released {
            if !page.oversized {
                self.pool.give(page.bytes);
            }
        }
        count
    }

    /// Cursor for the message numbered `seq`, or the end of the buffer.
    pub fn locate(&self, seq: i64) -> OutputCursor {
        let pages = self.lock(LockRole::Send);
        for (page_no, page) in pages.queue.iter() {
            if seq < page.lowest_seq {
                return OutputCursor { page_no, offset: 0, seq };
            }
            if seq <= page.highest_seq {
                let i = (seq - page.lowest_seq) as usize;
                return OutputCursor {
                    page_no,
                    offset: page.slots[i].offset as usize,
                    seq,
                };
            }
        }
        match pages.queue.back() {
            Some(back) => OutputCursor {
                page_no: pages.queue.end_index() - 1,
                offset: back.cur_length(),
                seq,
            },
            None => OutputCursor {
                page_no: pages.queue.end_index(),
                offset: 0,
                seq,
            },
        }
    }

    /// Gather up to `max_bytes` of messages from `cursor` on. Runs of two or
    /// more become one batch frame (the counted form when some member is
    /// not replayable); a lone message goes out as is.
    pub fn collect_sendable(&self, cursor: OutputCursor, max_bytes: usize) -> Option<SendChunk> {
        let pages = self.lock(LockRole::Send);
        let first = pages.queue.first_index();
        let mut page_no = cursor.page_no.max(first);
        let mut offset = if page_no == cursor.page_no { cursor.offset } else { 0 };

        let mut picked: Vec<(u64, usize)> = Vec::new();
        let mut total = 0usize;
        let mut replayable = 0usize;
        'pages: while let Some(page) = pages.queue.get(page_no) {
            for i in page.slot_at(offset)..page.message_count() {
                let seq = page.lowest_seq + i as i64;
                if seq < cursor.seq {
                    continue;
                }
                let len = page.slots[i].len as usize;
                if !picked.is_empty() && total + len > max_bytes {
                    break 'pages;
                }
                picked.push((page_no, i));
                total += len;
                if page.slots[i].replayable {
                    replayable += 1;
                }
            }
            page_no += 1;
            offset = 0;
        }

        let &(last_page, last_slot) = picked.last()?;
        let mut bytes = BytesMut::with_capacity(total + 16);
        if picked.len() >= 2 {
            let counted = (replayable != picked.len()).then_some(replayable);
            wire::put_batch_head(&mut bytes, picked.len(), counted, total);
        }
        let mut sent_replayable: Vec<(u64, usize)> = Vec::new();
        for &(p, i) in &picked {
            let Some(page) = pages.queue.get(p) else { continue };
            bytes.put_slice(page.message(i));
            if page.slots[i].replayable {
                match sent_replayable.last_mut() {
                    Some((n, c)) if *n == p => *c += 1,
                    _ => sent_replayable.push((p, 1)),
                }
            }
        }
        let last = pages.queue.get(last_page)?;
        let next = OutputCursor {
            page_no: last_page,
            offset: last.end_offset(last_slot),
            seq: last.lowest_seq + last_slot as i64 + 1,
        };
        Some(SendChunk {
            bytes: bytes.freeze(),
            messages: picked.len(),
            next,
            sent_replayable,
        })
    }

    pub fn mark_sent(&self, sent: &[(u64, usize)]) {
        let mut pages = self.lock(LockRole::Send);
        for &(page_no, count) in sent {
            if let Some(page) = pages.queue.get_mut(page_no) {
                page.unsent_replayable = page.unsent_replayable.saturating_sub(count);
            }
        }
    }

    /// Recount unsent replayable messages for a send restarting at `from_seq`.
    pub fn reset_unsent(&self, from_seq: i64) {
        let mut pages = self.lock(LockRole::Send);
        for page in pages.queue.iter_mut() {
            page.unsent_replayable = page
                .slots
                .iter()
                .enumerate()
                .filter(|(i, s)| s.replayable && page.lowest_seq + *i as i64 >= from_seq)
                .count();
        }
    }

    /// Recovery only. Drop everything at or below `trim_seq` and every
    /// non-replayable message, then number the survivors densely from
    /// `matching_replayable_seq + 1`. Returns the new last sequence number.
    pub fn trim_and_unbuffer_nonreplayable_calls(&self, trim_seq: i64, matching_replayable_seq: i64) -> i64 {
        let mut pages = self.lock(LockRole::Trim);
        let start = pages.queue.end_index();
        let mut old = std::mem::replace(&mut pages.queue, ElasticQueue::starting_at(PAGES_PER_SEGMENT, start));
        let page_size = self.pool.page_size();

        let mut next = matching_replayable_seq + 1;
        while let Some(page) = old.pop_front() {
            for i in 0..page.message_count() {
                let seq = page.lowest_seq + i as i64;
                if seq <= trim_seq || !page.slots[i].replayable {
                    continue;
                }
                let frame = page.message(i);
                let fits = pages
                    .queue
                    .back()
                    .map_or(false, |p| p.room(page_size) >= frame.len());
                if !fits {
                    let fresh = if frame.len() > page_size {
                        BufferPage::new(Vec::with_capacity(frame.len()), true, next)
                    } else {
                        BufferPage::new(self.pool.take_or_grow(), false, next)
                    };
                    pages.queue.push_back(fresh);
                }
                if let Some(tail) = pages.queue.back_mut() {
                    tail.push(frame, true);
                }
                next += 1;
            }
            if !page.oversized {
                self.pool.give(page.bytes);
            }
        }
        pages.last_seq = next - 1;
        pages.last_seq
    }

    /// Renumber so the first buffered message carries `seq`.
    pub fn adjust_first_seq_no_to(&self, seq: i64) {
        let mut pages = self.lock(LockRole::Trim);
        let first = pages.queue.front().map(|p| p.lowest_seq);
        match first {
            Some(lowest) => pages.shift(seq - lowest),
            None => pages.last_seq = seq - 1,
        }
    }

    /// Shift every buffered sequence number by `commit - commit_replayable`,
    /// moving a buffer numbered in replayable space into the receiver's space.
    pub fn rebase_seq_nos_in_buffer(&self, commit: i64, commit_replayable: i64) {
        let mut pages = self.lock(LockRole::Trim);
        pages.shift(commit - commit_replayable);
    }

    /// Replace the contents with a checkpointed image.
    pub fn restore(&self, image: &BufferImage) {
        let mut pages = self.lock(LockRole::Append);
        let page_size = self.pool.page_size();
        while let Some(page) = pages.queue.pop_front() {
            if !page.oversized {
                self.pool.give(page.bytes);
            }
        }
        for img in &image.pages {
            let (mut bytes, oversized) = if img.bytes.len() > page_size {
                (Vec::with_capacity(img.bytes.len()), true)
            } else {
                (self.pool.take_or_grow(), false)
            };
            bytes.extend_from_slice(&img.bytes);
            let replayable = img.slots.iter().filter(|s| s.replayable).count();
            pages.queue.push_back(BufferPage {
                bytes,
                oversized,
                lowest_seq: img.lowest_seq,
                highest_seq: img.lowest_seq + img.slots.len() as i64 - 1,
                unsent_replayable: replayable,
                total_replayable: replayable,
                slots: img.slots.clone(),
            });
        }
        pages.last_seq = image.last_seq;
    }
}
