// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Connection registry.
//!
//! One [`OutputConnectionRecord`] per peer holds everything the runtime
//! knows about that peer: the buffer of calls going to it, how far the
//! receiver has acknowledged them, and the input watermark this runtime
//! acknowledges back to the peer.
//!
//! # Invariants
//! - `last_seq_sent >= trim_to` at all times.
//! - While `replayable_space` is set, every buffered message is replayable
//!   and numbered in replayable sequence space. It clears on the first
//!   `ReplayFrom` from the receiver.
//! - Lock order: the record's trim lock, then its buffer's append lock.

use crate::error::Result;
use crate::event_buffer::{BufferImage, EventBuffer, OutputCursor, PagePool};
use crate::spin::{LockRole, SpinGuard, SpinLock, SpinPolicy};
use crate::wire::{RpcHeader, RpcKind};
use ambrosia_persistence::Watermark;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};

/// Upper bound on bytes handed to one socket write.
pub const MAX_SEND_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputState {
    pub cursor: OutputCursor,
    /// Bumped whenever someone other than the sender moves the cursor.
    pub generation: u64,
    /// Bumped on every `ReplayFrom`; a sender holding an older value stops.
    pub session: u64,
    pub last_seq_sent: i64,
    pub trim_to: i64,
    pub replayable_trim_to: i64,
    pub replay_from: i64,
}

/// Checkpointed form of one output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub name: String,
    pub last_seq_sent: i64,
    pub trim_to: i64,
    pub replayable_trim_to: i64,
    pub remote_trim: (i64, i64),
    pub replay_from: i64,
    pub replayable_space: bool,
    pub buffer: BufferImage,
}

pub struct OutputConnectionRecord {
    name: String,
    buffer: EventBuffer,
    state: SpinLock<OutputState>,
    replayable_space: AtomicBool,
    wake: Notify,
    remote_trim: watch::Sender<Watermark>,
}

/// Trim and append locks of one record, held together for a checkpoint.
pub struct CheckpointGuard<'a> {
    record: &'a OutputConnectionRecord,
    state: SpinGuard<'a, OutputState>,
    pages: SpinGuard<'a, crate::event_buffer::Pages>,
}

impl CheckpointGuard<'_> {
    pub fn image(&self) -> OutputImage {
        let remote = *self.record.remote_trim.borrow();
        OutputImage {
            name: self.record.name.clone(),
            last_seq_sent: self.state.last_seq_sent,
            trim_to: self.state.trim_to,
            replayable_trim_to: self.state.replayable_trim_to,
            remote_trim: (remote.seq, remote.replayable_seq),
            replay_from: self.state.replay_from,
            replayable_space: self.record.in_replayable_space(),
            buffer: self.pages.image(),
        }
    }
}

impl OutputConnectionRecord {
    fn new(name: String, pool: Arc<PagePool>, spin: SpinPolicy, replayable_space: bool) -> Self {
        let (remote_trim, _) = watch::channel(Watermark::default());
        Self {
            name,
            buffer: EventBuffer::new(pool, spin),
            state: SpinLock::new(OutputState {
                cursor: OutputCursor { page_no: 0, offset: 0, seq: 1 },
                ..OutputState::default()
            }),
            replayable_space: AtomicBool::new(replayable_space),
            wake: Notify::new(),
            remote_trim,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn state(&self) -> OutputState {
        *self.state.lock(LockRole::Send)
    }

    pub fn in_replayable_space(&self) -> bool {
        self.replayable_space.load(Ordering::Acquire)
    }

    /// Buffer a call for this destination and wake the sender.
    pub async fn append(&self, frame: &[u8], replayable: bool) -> i64 {
        let seq = self.buffer.append(frame, replayable).await;
        self.wake.notify_one();
        seq
    }

    /// The receiver has durably logged everything up to `wm`.
    pub fn apply_trim(&self, wm: Watermark) -> usize {
        let mut st = self.state.lock(LockRole::Trim);
        st.trim_to = st.trim_to.max(wm.seq);
        st.replayable_trim_to = st.replayable_trim_to.max(wm.replayable_seq);
        let effective = if self.in_replayable_space() {
            st.replayable_trim_to
        } else {
            st.trim_to
        };
        let mut cursor = st.cursor;
        let released = self.buffer.trim(effective, &mut cursor);
        if cursor != st.cursor {
            st.cursor = cursor;
            st.generation += 1;
        }
        st.last_seq_sent = st.last_seq_sent.max(effective);
        released
    }

    /// Restart sending at `wm` for a receiver that just (re)attached.
    /// Returns the session the new sender must carry.
    pub fn replay_from(&self, wm: Watermark) -> u64 {
        let mut st = self.state.lock(LockRole::Trim);
        let from = wm.seq.saturating_sub(1);
        let from_replayable = wm.replayable_seq.saturating_sub(1);
        if self.replayable_space.swap(false, Ordering::AcqRel) {
            self.buffer.rebase_seq_nos_in_buffer(from, from_replayable);
            tracing::info!(
                "{}: left replayable space, rebased by {}",
                self.name,
                from.saturating_sub(from_replayable)
            );
        }
        let mut cursor = st.cursor;
        self.buffer.trim(from, &mut cursor);
        st.trim_to = st.trim_to.max(from);
        st.replayable_trim_to = st.replayable_trim_to.max(from_replayable);
        st.cursor = self.buffer.locate(wm.seq);
        st.last_seq_sent = st.trim_to;
        st.replay_from = wm.seq;
        st.session += 1;
        st.generation += 1;
        self.buffer.reset_unsent(wm.seq);
        self.wake.notify_one();
        st.session
    }

    /// Write buffered calls to `out` until the session is superseded or the
    /// write fails.
    pub async fn send_async<W>(&self, out: &mut W, session: u64) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let (generation, chunk) = {
                let st = self.state.lock(LockRole::Send);
                if st.session != session {
                    return Ok(());
                }
                (st.generation, self.buffer.collect_sendable(st.cursor, MAX_SEND_CHUNK))
            };
            let Some(chunk) = chunk else {
                self.wake.notified().await;
                continue;
            };

            out.write_all(&chunk.bytes).await?;
            out.flush().await?;

            let mut st = self.state.lock(LockRole::Send);
            if st.session != session {
                return Ok(());
            }
            if st.generation == generation {
                st.cursor = chunk.next;
            } else {
                let seq = st.cursor.seq.max(chunk.next.seq);
                st.cursor = self.buffer.locate(seq);
            }
            st.last_seq_sent = st.last_seq_sent.max(chunk.next.seq - 1);
            drop(st);
            self.buffer.mark_sent(&chunk.sent_replayable);
            metrics::counter!("ambrosia_messages_sent_total", chunk.messages as u64);
            metrics::counter!("ambrosia_bytes_sent_total", chunk.bytes.len() as u64);
        }
    }

    /// Stop any sender waiting on this record.
    pub fn kick(&self) {
        let mut st = self.state.lock(LockRole::Trim);
        st.session += 1;
        drop(st);
        self.wake.notify_one();
    }

    pub fn remote_trim(&self) -> Watermark {
        *self.remote_trim.borrow()
    }

    pub fn set_remote_trim(&self, wm: Watermark) {
        self.remote_trim.send_if_modified(|cur| {
            let next = cur.merge(wm);
            let changed = next != *cur;
            *cur = next;
            changed
        });
    }

    pub fn watch_remote_trim(&self) -> watch::Receiver<Watermark> {
        self.remote_trim.subscribe()
    }

    pub fn lock_for_checkpoint(&self) -> CheckpointGuard<'_> {
        let state = self.state.lock(LockRole::Checkpoint);
        let pages = self.buffer.lock(LockRole::Checkpoint);
        CheckpointGuard { record: self, state, pages }
    }

    /// Load a checkpointed image and move the buffer into replayable space,
    /// dropping every non-replayable call.
    fn restore(&self, image: &OutputImage) {
        let mut st = self.state.lock(LockRole::Trim);
        self.buffer.restore(&image.buffer);
        let last = if image.replayable_space {
            self.buffer
                .trim_and_unbuffer_nonreplayable_calls(image.replayable_trim_to, image.replayable_trim_to)
        } else {
            self.buffer
                .trim_and_unbuffer_nonreplayable_calls(image.trim_to, image.replayable_trim_to)
        };
        self.replayable_space.store(true, Ordering::Release);
        st.trim_to = image.trim_to;
        st.replayable_trim_to = image.replayable_trim_to;
        st.replay_from = image.replay_from;
        st.last_seq_sent = image.trim_to.max(image.replayable_trim_to);
        st.cursor = self.buffer.locate(image.replayable_trim_to + 1);
        st.generation += 1;
        drop(st);
        self.set_remote_trim(Watermark::new(image.remote_trim.0, image.remote_trim.1));
        tracing::debug!("{}: restored output buffer, last replayable seq {}", self.name, last);
    }
}

/// All peers known to this runtime, keyed by service name.
pub struct Connections {
    own_name: String,
    pool: Arc<PagePool>,
    spin: SpinPolicy,
    outputs: RwLock<HashMap<String, Arc<OutputConnectionRecord>>>,
    inputs: RwLock<HashMap<String, Watermark>>,
    recovering: AtomicBool,
    new_outputs: mpsc::UnboundedSender<String>,
    new_outputs_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Connections {
    pub fn new(own_name: impl Into<String>, pool: Arc<PagePool>, spin: SpinPolicy) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            own_name: own_name.into(),
            pool,
            spin,
            outputs: RwLock::new(HashMap::new()),
            inputs: RwLock::new(HashMap::new()),
            recovering: AtomicBool::new(false),
            new_outputs: tx,
            new_outputs_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn own_name(&self) -> &str {
        &self.own_name
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    /// Names of outputs created from now on. Only the first caller gets it.
    pub fn take_new_outputs(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.new_outputs_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn get_output(&self, name: &str) -> Option<Arc<OutputConnectionRecord>> {
        self.outputs.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Record for `name`, created on first use.
    pub fn output(&self, name: &str) -> Arc<OutputConnectionRecord> {
        if let Some(record) = self.get_output(name) {
            return record;
        }
        let mut outputs = self.outputs.write().unwrap_or_else(|e| e.into_inner());
        outputs
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("new output connection record for {}", name);
                let _ = self.new_outputs.send(name.to_string());
                Arc::new(OutputConnectionRecord::new(
                    name.to_string(),
                    self.pool.clone(),
                    self.spin,
                    self.is_recovering(),
                ))
            })
            .clone()
    }

    /// Every record, ordered by name.
    pub fn outputs(&self) -> Vec<Arc<OutputConnectionRecord>> {
        let outputs = self.outputs.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = outputs.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn input(&self, source: &str) -> Watermark {
        self.inputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .copied()
            .unwrap_or_default()
    }

    pub fn inputs(&self) -> BTreeMap<String, Watermark> {
        self.inputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Calls from `source` up to `wm` are durable; acknowledge them back.
    pub fn record_input(&self, source: &str, wm: Watermark) {
        {
            let mut inputs = self.inputs.write().unwrap_or_else(|e| e.into_inner());
            let entry = inputs.entry(source.to_string()).or_default();
            *entry = entry.merge(wm);
        }
        self.output(source).set_remote_trim(wm);
    }

    /// Route one call emitted by the local service. Impulses emitted while
    /// replaying are dropped. Returns the sequence number assigned.
    pub async fn process_rpc(&self, frame: Bytes) -> Result<Option<i64>> {
        let header = RpcHeader::from_frame(&frame)?;
        let replayable = header.kind.is_replayable();
        if header.kind == RpcKind::Impulse && self.is_recovering() {
            metrics::counter!("ambrosia_impulses_dropped_total", 1);
            return Ok(None);
        }
        let record = self.output(&header.dest);
        let seq = record.append(&frame, replayable).await;
        metrics::counter!("ambrosia_messages_buffered_total", 1);
        Ok(Some(seq))
    }

    /// Restore inputs and outputs from a checkpoint image.
    pub fn restore(&self, inputs: &BTreeMap<String, Watermark>, outputs: &[OutputImage]) {
        {
            let mut table = self.inputs.write().unwrap_or_else(|e| e.into_inner());
            table.clear();
            table.extend(inputs.iter().map(|(k, v)| (k.clone(), *v)));
        }
        for image in outputs {
            self.output(&image.name).restore(image);
        }
        for (source, wm) in inputs {
            self.output(source).set_remote_trim(*wm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_rpc, rpc_frames};

    fn connections() -> Arc<Connections> {
        Connections::new("self", PagePool::new(4096, 16), SpinPolicy::default())
    }

    fn call(dest: &str, kind: RpcKind, n: u8) -> Bytes {
        encode_rpc(dest, 1, kind, Some(("self", n as i64)), &[n])
    }

    #[tokio::test]
    async fn test_process_rpc_routes_by_destination() {
        let conns = connections();
        let mut created = conns.take_new_outputs().unwrap();
        assert_eq!(conns.process_rpc(call("a", RpcKind::ReturnValue, 1)).await.unwrap(), Some(1));
        assert_eq!(conns.process_rpc(call("b", RpcKind::ReturnValue, 2)).await.unwrap(), Some(1));
        assert_eq!(conns.process_rpc(call("a", RpcKind::Impulse, 3)).await.unwrap(), Some(2));
        assert_eq!(created.recv().await.unwrap(), "a");
        assert_eq!(created.recv().await.unwrap(), "b");
        assert_eq!(conns.outputs().len(), 2);
    }

    #[tokio::test]
    async fn test_impulses_dropped_while_recovering() {
        let conns = connections();
        conns.set_recovering(true);
        assert_eq!(conns.process_rpc(call("a", RpcKind::Impulse, 1)).await.unwrap(), None);
        assert_eq!(conns.process_rpc(call("a", RpcKind::ReturnValue, 2)).await.unwrap(), Some(1));
        assert!(conns.output("a").in_replayable_space());
    }

    #[tokio::test]
    async fn test_trim_keeps_last_sent_ahead() {
        let conns = connections();
        let out = conns.output("a");
        for n in 1..=3 {
            out.append(&call("a", RpcKind::ReturnValue, n), true).await;
        }
        out.apply_trim(Watermark::new(2, 2));
        let st = out.state();
        assert_eq!(st.trim_to, 2);
        assert!(st.last_seq_sent >= st.trim_to);
        assert_eq!(st.cursor.seq, 3);
    }

    #[tokio::test]
    async fn test_replay_from_rebases_recovered_buffer() {
        let conns = connections();
        let out = conns.output("a");
        for n in 1..=5u8 {
            let kind = if n % 2 == 0 { RpcKind::Impulse } else { RpcKind::ReturnValue };
            out.append(&call("a", kind, n), kind.is_replayable()).await;
        }
        // Receiver logged seq 2, one of them replayable.
        out.apply_trim(Watermark::new(2, 1));
        let image = out.lock_for_checkpoint().image();

        let recovered = connections();
        recovered.restore(&BTreeMap::new(), &[image]);
        let out = recovered.output("a");
        assert!(out.in_replayable_space());
        let seqs: Vec<i64> = out.buffer().messages().iter().map(|m| m.0).collect();
        assert_eq!(seqs, vec![2, 3]);

        let session = out.replay_from(Watermark::new(3, 2));
        assert!(!out.in_replayable_space());
        let msgs = out.buffer().messages();
        assert_eq!(msgs.iter().map(|m| m.0).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(msgs[1].1, call("a", RpcKind::ReturnValue, 5));
        let st = out.state();
        assert_eq!(st.session, session);
        assert_eq!(st.cursor.seq, 3);
        assert_eq!(st.last_seq_sent, 2);
    }

    #[tokio::test]
    async fn test_restored_record_keeps_sent_ahead_of_trim() {
        let conns = connections();
        let out = conns.output("a");
        for n in 1..=6u8 {
            let kind = if n <= 3 { RpcKind::Impulse } else { RpcKind::ReturnValue };
            out.append(&call("a", kind, n), kind.is_replayable()).await;
        }
        // Three impulses went out before any replayable call.
        out.apply_trim(Watermark::new(4, 1));
        let image = out.lock_for_checkpoint().image();
        assert!(image.replayable_trim_to < image.trim_to);

        let recovered = connections();
        recovered.restore(&BTreeMap::new(), &[image]);
        let st = recovered.output("a").state();
        assert_eq!(st.trim_to, 4);
        assert!(st.last_seq_sent >= st.trim_to);
        assert!(st.last_seq_sent >= st.replayable_trim_to);
    }

    #[tokio::test]
    async fn test_replay_from_extreme_seq_does_not_overflow() {
        let conns = connections();
        let out = conns.output("a");
        out.replay_from(Watermark::new(i64::MIN, i64::MIN));
        let st = out.state();
        assert!(st.last_seq_sent >= st.trim_to);
    }

    #[tokio::test]
    async fn test_send_async_writes_and_stops_on_new_session() {
        let conns = connections();
        let out = conns.output("a");
        let session = out.replay_from(Watermark::new(1, 1));
        out.append(&call("a", RpcKind::ReturnValue, 1), true).await;
        out.append(&call("a", RpcKind::ReturnValue, 2), true).await;

        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let sender = {
            let out = out.clone();
            tokio::spawn(async move { out.send_async(&mut tx, session).await })
        };
        let mut frames = Vec::new();
        let mut codec = crate::wire::FrameCodec::new();
        let mut buf = bytes::BytesMut::new();
        while frames.len() < 2 {
            use tokio::io::AsyncReadExt;
            use tokio_util::codec::Decoder;
            rx.read_buf(&mut buf).await.unwrap();
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                let raw = match frame {
                    crate::wire::Frame::Rpc(raw) | crate::wire::Frame::Batch(raw) => raw,
                    other => panic!("unexpected {:?}", other),
                };
                frames.extend(rpc_frames(&raw).unwrap());
            }
        }
        assert_eq!(frames.len(), 2);
        out.kick();
        sender.await.unwrap().unwrap();
    }

    #[test]
    fn test_record_input_publishes_ack() {
        let conns = connections();
        let rx = conns.output("peer").watch_remote_trim();
        conns.record_input("peer", Watermark::new(5, 4));
        conns.record_input("peer", Watermark::new(3, 3));
        assert_eq!(conns.input("peer"), Watermark::new(5, 4));
        assert_eq!(*rx.borrow(), Watermark::new(5, 4));
    }
}
