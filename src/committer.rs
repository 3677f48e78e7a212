// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Committer - the write path.
//!
//! Every input call is copied into a shared commit buffer and becomes
//! durable as part of one log record together with every other call that
//! landed in the same buffer. Many writers copy concurrently; only the
//! transition to "sealed" is serialised.
//!
//! # Status Word
//! ```text
//! bit  0      sealed
//! bits 1-32   bytes occupied in the active buffer
//! bits 33-63  writers still copying into the active buffer
//! ```
//!
//! # Protocol
//! ```text
//! add_row
//! ↓
//! 1. sealed? spin until not
//! ↓
//! 2. would overflow? CAS to sealed, else CAS (writers+1, len+n)
//! ↓
//! 3. copy, record input watermark, writers-1
//!    last writer out with the backup free schedules a commit
//! ↓
//! 4. sealer: take the backup, drain writers, swap buffers, unseal
//! ↓
//! 5. commit: header + payload + watermark tables, flush,
//!    propagate watermarks, forward payload to the service,
//!    free the backup
//! ```
//!
//! # Invariants
//! - Buffers swap only while sealed with zero writers.
//! - At most one commit is in flight; `backup_free` is its token.
//! - Write sequence ids increase by exactly one per record.
//! - A failed commit is fatal. Nothing is retried in-process.

use crate::connections::Connections;
use crate::error::{AmbrosiaError, FaultReporter, Result};
use crate::service::ServiceHandle;
use crate::spin::{SpinPolicy, Spinner};
use ambrosia_persistence::{LogWriter, Watermark, WatermarkTables};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const SEALED: u64 = 1;
const LEN_SHIFT: u32 = 1;
const LEN_MASK: u64 = 0xFFFF_FFFF << LEN_SHIFT;
const WRITER_SHIFT: u32 = 33;
const WRITER_ONE: u64 = 1 << WRITER_SHIFT;

const fn is_sealed(status: u64) -> bool {
    status & SEALED != 0
}

const fn occupied(status: u64) -> usize {
    ((status & LEN_MASK) >> LEN_SHIFT) as usize
}

const fn writers(status: u64) -> u64 {
    status >> WRITER_SHIFT
}

/// Where a row landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPosition {
    /// Write sequence id of the record that will carry the row.
    pub write_seq_id: u64,
    pub offset: usize,
}

/// The part of the committer that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitterState {
    pub committer_id: u32,
    pub next_write_seq: u64,
}

impl CommitterState {
    pub fn fresh(committer_id: u32) -> Self {
        Self {
            committer_id,
            next_write_seq: 1,
        }
    }
}

struct CommitBuffer {
    bytes: Box<[UnsafeCell<u8>]>,
    marks: Mutex<WatermarkTables>,
}

// SAFETY: writers only touch the disjoint ranges the status word reserved
// for them, and the committed buffer is read only after every writer left.
unsafe impl Sync for CommitBuffer {}

impl CommitBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            marks: Mutex::new(WatermarkTables::default()),
        }
    }

    /// # Safety
    /// `offset..offset + src.len()` must be reserved for the caller.
    unsafe fn write_at(&self, offset: usize, src: &[u8]) {
        let dst = UnsafeCell::raw_get(self.bytes.as_ptr().add(offset));
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    }

    /// # Safety
    /// No writer may be active on this buffer.
    unsafe fn read(&self, len: usize) -> &[u8] {
        std::slice::from_raw_parts(UnsafeCell::raw_get(self.bytes.as_ptr()) as *const u8, len)
    }

    fn take_marks(&self) -> WatermarkTables {
        std::mem::take(&mut *self.marks.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

pub struct Committer {
    committer_id: u32,
    capacity: usize,
    status: AtomicU64,
    buffers: [CommitBuffer; 2],
    active: AtomicUsize,
    backup_free: AtomicBool,
    /// Write sequence id the active buffer will be committed under.
    active_write_seq: AtomicU64,
    trims: Mutex<BTreeMap<String, Watermark>>,
    sink: tokio::sync::Mutex<Option<LogWriter>>,
    durable: watch::Sender<u64>,
    connections: Arc<Connections>,
    service: ServiceHandle,
    faults: FaultReporter,
    spin: SpinPolicy,
}

impl Committer {
    pub fn new(
        state: CommitterState,
        sink: Option<LogWriter>,
        max_commit_buffer: usize,
        spin: SpinPolicy,
        connections: Arc<Connections>,
        service: ServiceHandle,
        faults: FaultReporter,
    ) -> Arc<Self> {
        let (durable, _) = watch::channel(state.next_write_seq.saturating_sub(1));
        Arc::new(Self {
            committer_id: state.committer_id,
            capacity: max_commit_buffer,
            status: AtomicU64::new(0),
            buffers: [CommitBuffer::new(max_commit_buffer), CommitBuffer::new(max_commit_buffer)],
            active: AtomicUsize::new(0),
            backup_free: AtomicBool::new(true),
            active_write_seq: AtomicU64::new(state.next_write_seq),
            trims: Mutex::new(BTreeMap::new()),
            sink: tokio::sync::Mutex::new(sink),
            durable,
            connections,
            service,
            faults,
            spin,
        })
    }

    pub fn committer_id(&self) -> u32 {
        self.committer_id
    }

    /// Meaningful while asleep.
    pub fn state(&self) -> CommitterState {
        CommitterState {
            committer_id: self.committer_id,
            next_write_seq: self.active_write_seq.load(Ordering::SeqCst),
        }
    }

    /// Highest write sequence id known durable.
    pub fn durable_write_seq(&self) -> u64 {
        *self.durable.borrow()
    }

    pub async fn log_position(&self) -> Option<u64> {
        self.sink.lock().await.as_ref().map(LogWriter::position)
    }

    fn trims_pending(&self) -> bool {
        !self.trims.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Copy one serialized input call from `source` into the commit buffer.
    /// `seq`/`replayable_seq` become the source's input watermark once the
    /// record is durable.
    pub async fn add_row(
        self: &Arc<Self>,
        frame: &[u8],
        source: &str,
        seq: i64,
        replayable_seq: i64,
    ) -> Result<RowPosition> {
        let n = frame.len();
        let mark = Watermark::new(seq, replayable_seq);
        if n > self.capacity {
            return self.add_oversized(frame, source, mark).await;
        }

        let mut spinner = Spinner::new(self.spin);
        loop {
            let status = self.status.load(Ordering::SeqCst);
            if is_sealed(status) {
                spinner.spin().await;
                continue;
            }
            let len = occupied(status);
            if len + n > self.capacity {
                if self
                    .status
                    .compare_exchange(status, status | SEALED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.seal_and_commit().await?;
                    spinner.reset();
                }
                continue;
            }

            let reserved = status + WRITER_ONE + ((n as u64) << LEN_SHIFT);
            if self
                .status
                .compare_exchange(status, reserved, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let idx = self.active.load(Ordering::SeqCst);
            let write_seq_id = self.active_write_seq.load(Ordering::SeqCst);
            let buffer = &self.buffers[idx];
            // SAFETY: [len, len + n) was reserved by the CAS above and the
            // buffer cannot swap while this writer is counted.
            unsafe { buffer.write_at(len, frame) };
            {
                let mut marks = buffer.marks.lock().unwrap_or_else(|e| e.into_inner());
                let entry = marks.inputs.entry(source.to_string()).or_default();
                *entry = entry.merge(mark);
            }

            let before = self.status.fetch_sub(WRITER_ONE, Ordering::SeqCst);
            if writers(before) == 1 && !is_sealed(before) {
                self.schedule_commit();
            }
            return Ok(RowPosition {
                write_seq_id,
                offset: len,
            });
        }
    }

    /// Record that `dest` acknowledged our calls up to `wm`. The output
    /// buffer is trimmed once the watermark itself is durable.
    pub fn add_trim(self: &Arc<Self>, dest: &str, wm: Watermark) {
        {
            let mut trims = self.trims.lock().unwrap_or_else(|e| e.into_inner());
            let entry = trims.entry(dest.to_string()).or_default();
            *entry = entry.merge(wm);
        }
        self.schedule_commit();
    }

    /// Resolve once every row added before the call is durable.
    pub async fn flush_pending(self: &Arc<Self>) -> Result<()> {
        let status = self.status.load(Ordering::SeqCst);
        let active = self.active_write_seq.load(Ordering::SeqCst);
        let target = if occupied(status) == 0 && writers(status) == 0 && !self.trims_pending() {
            active - 1
        } else {
            active
        };
        self.schedule_commit();
        self.wait_durable(target).await
    }

    pub async fn wait_durable(&self, write_seq_id: u64) -> Result<()> {
        let mut rx = self.durable.subscribe();
        rx.wait_for(|durable| *durable >= write_seq_id)
            .await
            .map(|_| ())
            .map_err(|_| AmbrosiaError::LogWrite("committer dropped".to_string()))
    }

    /// Start a commit in the background if one is due and none is running.
    fn schedule_commit(self: &Arc<Self>) {
        let status = self.status.load(Ordering::SeqCst);
        if is_sealed(status) || writers(status) != 0 {
            return;
        }
        if occupied(status) == 0 && !self.trims_pending() {
            return;
        }
        if self
            .backup_free
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_scheduled_commit().await {
                this.faults.report(e);
            }
        });
    }

    /// Body of a scheduled commit. Holds the backup token on entry.
    async fn run_scheduled_commit(self: &Arc<Self>) -> Result<()> {
        loop {
            let status = self.status.load(Ordering::SeqCst);
            if is_sealed(status) {
                // A sealer or sleeper is waiting for the token.
                self.backup_free.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if self
                .status
                .compare_exchange(status, status | SEALED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        self.drain_writers().await;
        let len = occupied(self.status.load(Ordering::SeqCst));
        self.swap_and_commit(len, true).await?;
        self.schedule_commit();
        Ok(())
    }

    async fn take_backup(&self) {
        let mut spinner = Spinner::new(self.spin);
        while self
            .backup_free
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            spinner.spin().await;
        }
    }

    async fn drain_writers(&self) {
        let mut spinner = Spinner::new(self.spin);
        while writers(self.status.load(Ordering::SeqCst)) != 0 {
            spinner.spin().await;
        }
    }

    /// Called by the writer whose CAS sealed the buffer.
    async fn seal_and_commit(self: &Arc<Self>) -> Result<()> {
        self.take_backup().await;
        self.drain_writers().await;
        let len = occupied(self.status.load(Ordering::SeqCst));
        self.swap_and_commit(len, true).await?;
        self.schedule_commit();
        Ok(())
    }

    async fn seal(&self) {
        let mut spinner = Spinner::new(self.spin);
        loop {
            let status = self.status.load(Ordering::SeqCst);
            if !is_sealed(status)
                && self
                    .status
                    .compare_exchange(status, status | SEALED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return;
            }
            spinner.spin().await;
        }
    }

    /// A row that can never fit a commit buffer is committed as a record of
    /// its own while the committer stays sealed.
    async fn add_oversized(self: &Arc<Self>, frame: &[u8], source: &str, mark: Watermark) -> Result<RowPosition> {
        tracing::debug!("oversized row of {} bytes from {}", frame.len(), source);
        self.seal().await;
        self.take_backup().await;
        self.drain_writers().await;
        let len = occupied(self.status.load(Ordering::SeqCst));
        self.swap_and_commit(len, false).await?;

        let write_seq_id = self.active_write_seq.fetch_add(1, Ordering::SeqCst);
        let mut marks = WatermarkTables::default();
        marks.inputs.insert(source.to_string(), mark);
        let result = self.commit(frame, marks, write_seq_id).await;
        self.status.store(0, Ordering::SeqCst);
        self.backup_free.store(true, Ordering::SeqCst);
        result?;
        self.schedule_commit();
        Ok(RowPosition {
            write_seq_id,
            offset: 0,
        })
    }

    /// Swap the drained active buffer out and commit it. With `reopen` the
    /// status is cleared before the commit and the token released after;
    /// without it the caller keeps both.
    async fn swap_and_commit(&self, len: usize, reopen: bool) -> Result<()> {
        let old = self.active.load(Ordering::SeqCst);
        let mut marks = self.buffers[old].take_marks();
        {
            let mut trims = self.trims.lock().unwrap_or_else(|e| e.into_inner());
            for (dest, wm) in std::mem::take(&mut *trims) {
                let entry = marks.trims.entry(dest).or_default();
                *entry = entry.merge(wm);
            }
        }

        if len == 0 && marks.is_empty() {
            if reopen {
                self.status.store(0, Ordering::SeqCst);
                self.backup_free.store(true, Ordering::SeqCst);
            } else {
                self.status.store(SEALED, Ordering::SeqCst);
            }
            return Ok(());
        }

        let write_seq_id = self.active_write_seq.fetch_add(1, Ordering::SeqCst);
        self.active.store(1 - old, Ordering::SeqCst);
        self.status
            .store(if reopen { 0 } else { SEALED }, Ordering::SeqCst);

        // SAFETY: every writer of `old` has left and new writers go to the
        // other buffer; `old` is reused only after the token is released.
        let payload = unsafe { self.buffers[old].read(len) };
        let result = self.commit(payload, marks, write_seq_id).await;
        if reopen {
            self.backup_free.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn commit(&self, payload: &[u8], marks: WatermarkTables, write_seq_id: u64) -> Result<()> {
        let start = std::time::Instant::now();
        {
            let mut sink = self.sink.lock().await;
            let writer = sink
                .as_mut()
                .ok_or_else(|| AmbrosiaError::LogWrite("no log stream attached".to_string()))?;
            writer.append_record(self.committer_id, write_seq_id, payload, &marks)?;
            writer.flush()?;
        }

        for (source, wm) in &marks.inputs {
            self.connections.record_input(source, *wm);
        }
        for (dest, wm) in &marks.trims {
            self.connections.output(dest).apply_trim(*wm);
        }
        if !payload.is_empty() {
            self.service.deliver(Bytes::copy_from_slice(payload))?;
        }
        self.durable.send_replace(write_seq_id);

        metrics::counter!("ambrosia_commits_total", 1);
        metrics::histogram!("ambrosia_commit_bytes", payload.len() as f64);
        metrics::histogram!("ambrosia_commit_duration_seconds", start.elapsed().as_secs_f64());
        tracing::debug!(
            "committed record {} ({} bytes, {} inputs, {} trims)",
            write_seq_id,
            payload.len(),
            marks.inputs.len(),
            marks.trims.len()
        );
        Ok(())
    }

    /// Commit whatever is pending and stay sealed. Writers wait until
    /// [`Committer::wakeup`].
    pub async fn sleep(&self) -> Result<()> {
        self.seal().await;
        self.take_backup().await;
        self.drain_writers().await;
        let len = occupied(self.status.load(Ordering::SeqCst));
        self.swap_and_commit(len, false).await?;
        tracing::debug!("committer asleep at write seq {}", self.state().next_write_seq);
        Ok(())
    }

    pub fn wakeup(self: &Arc<Self>) {
        self.status.store(0, Ordering::SeqCst);
        self.backup_free.store(true, Ordering::SeqCst);
        self.schedule_commit();
    }

    /// Replace the durable sink. Only while asleep.
    pub async fn switch_log_stream(&self, writer: LogWriter) -> Option<LogWriter> {
        let mut sink = self.sink.lock().await;
        tracing::info!("switching log stream to {:?}", writer.path());
        sink.replace(writer)
    }

    /// Give up the durable sink, and with it the log lock. Only while asleep.
    pub async fn detach_log_stream(&self) -> Option<LogWriter> {
        self.sink.lock().await.take()
    }
}
