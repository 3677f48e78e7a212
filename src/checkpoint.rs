// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Checkpoints.
//!
//! Checkpoint `N` is the machine state at the first record of log `N`:
//! committer, input watermarks, output records with their buffers, and the
//! service's own bytes. Recovery loads checkpoint `N` and replays log `N`
//! onwards.
//!
//! # File Format
//! ```text
//! [image_len: u64 LE][CheckpointImage, bincode]
//! [service_len: u64 LE][service state, raw]
//! ```
//!
//! # Protocol
//! ```text
//! hold exclusive lock on chkpt N (taken by the caller)
//! ↓
//! service serializes (every earlier output already buffered)
//! ↓
//! lock every output record, capture images, unlock
//! ↓
//! write + fsync
//! ↓
//! LAST_COMMITTED_CHECKPOINT = N
//! ↓
//! input watermarks become remote trims
//! ↓
//! caller releases the lock on chkpt N-1
//! ```

use crate::committer::CommitterState;
use crate::connections::{Connections, OutputImage};
use crate::error::{AmbrosiaError, Result};
use crate::service::ServiceHandle;
use ambrosia_persistence::metadata::keys;
use ambrosia_persistence::{lock, LogLayout, LogWriter, MetadataStore, Watermark};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub committer: CommitterState,
    /// `(source, last id, last replayable id)`.
    pub inputs: Vec<(String, i64, i64)>,
    pub outputs: Vec<OutputImage>,
}

impl CheckpointImage {
    pub fn input_table(&self) -> BTreeMap<String, Watermark> {
        self.inputs
            .iter()
            .map(|(name, seq, repl)| (name.clone(), Watermark::new(*seq, *repl)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub image: CheckpointImage,
    pub service_state: Bytes,
}

/// Snapshot committer and connection state. Every output record is locked
/// for the duration so no append lands half-way through the capture.
pub fn capture_image(committer: CommitterState, connections: &Connections) -> CheckpointImage {
    let records = connections.outputs();
    let guards: Vec<_> = records.iter().map(|r| r.lock_for_checkpoint()).collect();
    let outputs = guards.iter().map(|g| g.image()).collect();
    drop(guards);
    CheckpointImage {
        committer,
        inputs: connections
            .inputs()
            .into_iter()
            .map(|(name, wm)| (name, wm.seq, wm.replayable_seq))
            .collect(),
        outputs,
    }
}

/// Write a checkpoint into `file`, which the caller opened and locked.
pub fn write_checkpoint(path: &Path, file: File, image: &CheckpointImage, service_state: &[u8]) -> Result<File> {
    let encoded = bincode::serde::encode_to_vec(image, bincode::config::standard())?;
    let mut writer = LogWriter::from_file(path, file)?;
    if writer.position() != 0 {
        tracing::warn!("discarding stale contents of {:?}", path);
        writer.truncate_to(0)?;
    }
    writer.append(&(encoded.len() as u64).to_le_bytes())?;
    writer.append(&encoded)?;
    writer.append(&(service_state.len() as u64).to_le_bytes())?;
    writer.append_stream(service_state)?;
    writer.flush()?;
    Ok(writer.into_file()?)
}

fn read_u64(reader: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(|e| AmbrosiaError::IntegrityCheckFailure {
        offset: 0,
        reason: format!("{:?}: {}", path, e),
    })?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length prefix and check that many bytes are still in the file.
fn read_len(reader: &mut impl Read, path: &Path, offset: u64, file_len: u64) -> Result<usize> {
    let len = read_u64(reader, path)?;
    let left = file_len.saturating_sub(offset + 8);
    if len > left {
        return Err(AmbrosiaError::IntegrityCheckFailure {
            offset,
            reason: format!("{:?}: section of {} bytes but only {} left", path, len, left),
        });
    }
    Ok(len as usize)
}

pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    if !path.exists() {
        return Err(AmbrosiaError::MissingCheckpoint(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = std::io::BufReader::new(file);
    let image_len = read_len(&mut reader, path, 0, file_len)?;
    let mut encoded = vec![0u8; image_len];
    reader.read_exact(&mut encoded)?;
    let (image, _): (CheckpointImage, usize) =
        bincode::serde::decode_from_slice(&encoded, bincode::config::standard())?;
    let service_len = read_len(&mut reader, path, 8 + image_len as u64, file_len)?;
    let mut service_state = vec![0u8; service_len];
    reader.read_exact(&mut service_state)?;
    Ok(Checkpoint {
        image,
        service_state: Bytes::from(service_state),
    })
}

/// Exclusive handle on checkpoint file `n`, or `None` if someone holds it.
pub fn lock_checkpoint(layout: &LogLayout, n: u64) -> Result<Option<File>> {
    Ok(lock::try_open_exclusive(layout.checkpoint(n), true)?)
}

/// Everything a checkpoint needs besides the state itself.
pub struct CheckpointContext<'a> {
    pub layout: &'a LogLayout,
    pub metadata: &'a dyn MetadataStore,
    pub service_name: &'a str,
    pub connections: &'a Connections,
    pub service: &'a ServiceHandle,
}

/// Take checkpoint `n` into the locked `file` and publish it. Returns the
/// file so the caller keeps the lock until the next checkpoint.
pub async fn checkpoint_async(
    ctx: &CheckpointContext<'_>,
    n: u64,
    file: File,
    committer: CommitterState,
) -> Result<File> {
    let start = std::time::Instant::now();
    let service_state = ctx.service.take_checkpoint().await?;
    let image = capture_image(committer, ctx.connections);
    let path = ctx.layout.checkpoint(n);
    let file = write_checkpoint(&path, file, &image, &service_state)?;

    ctx.metadata
        .set_i64(ctx.service_name, keys::LAST_COMMITTED_CHECKPOINT, n as i64)
        .map_err(|e| AmbrosiaError::ExternalMetadata(e.to_string()))?;

    for (source, wm) in image.input_table() {
        ctx.connections.output(&source).set_remote_trim(wm);
    }

    metrics::counter!("ambrosia_checkpoints_total", 1);
    metrics::histogram!("ambrosia_checkpoint_duration_seconds", start.elapsed().as_secs_f64());
    tracing::info!(
        "checkpoint {} written ({} outputs, {} service bytes)",
        n,
        image.outputs.len(),
        service_state.len()
    );
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::PagePool;
    use crate::service::{service_channel, ServiceRequest};
    use crate::spin::SpinPolicy;
    use crate::wire::{encode_rpc, RpcKind};
    use ambrosia_persistence::MemoryMetadataStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_checkpoint_publishes_pointer_and_trims() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "svc", 0);
        layout.ensure_dir().unwrap();
        let metadata = MemoryMetadataStore::new();

        let conns = Connections::new("svc", PagePool::new(4096, 8), SpinPolicy::default());
        let (service, mut endpoint) = service_channel(conns.clone());
        tokio::spawn(async move {
            while let Some(req) = endpoint.requests.recv().await {
                if let ServiceRequest::TakeCheckpoint(reply) = req {
                    let _ = reply.send(Bytes::from_static(b"service-bytes"));
                }
            }
        });

        let out = conns.output("peer");
        out.append(&encode_rpc("peer", 1, RpcKind::FireAndForget, None, b"x"), true)
            .await;
        conns.record_input("client", Watermark::new(9, 7));

        let ctx = CheckpointContext {
            layout: &layout,
            metadata: &metadata,
            service_name: "svc",
            connections: &conns,
            service: &service,
        };
        let file = lock_checkpoint(&layout, 2).unwrap().unwrap();
        assert!(lock_checkpoint(&layout, 2).unwrap().is_none());
        let _held = checkpoint_async(&ctx, 2, file, CommitterState::fresh(5)).await.unwrap();

        assert_eq!(
            metadata.get_i64("svc", keys::LAST_COMMITTED_CHECKPOINT).unwrap(),
            Some(2)
        );
        assert_eq!(conns.output("client").remote_trim(), Watermark::new(9, 7));

        let loaded = read_checkpoint(&layout.checkpoint(2)).unwrap();
        assert_eq!(&loaded.service_state[..], b"service-bytes");
        assert_eq!(loaded.image.committer, CommitterState::fresh(5));
        assert_eq!(loaded.image.input_table()["client"], Watermark::new(9, 7));
        let peer = loaded.image.outputs.iter().find(|o| o.name == "peer").unwrap();
        assert_eq!(peer.buffer.last_seq, 1);
    }

    #[test]
    fn test_missing_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope");
        assert!(matches!(read_checkpoint(&path), Err(AmbrosiaError::MissingCheckpoint(_))));
    }

    #[test]
    fn test_stale_contents_are_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chkpt");
        std::fs::write(&path, b"half a checkpoint from a crash").unwrap();
        let file = lock::try_open_exclusive(&path, true).unwrap().unwrap();
        let image = CheckpointImage {
            committer: CommitterState::fresh(1),
            inputs: vec![],
            outputs: vec![],
        };
        write_checkpoint(&path, file, &image, b"s").unwrap();
        let loaded = read_checkpoint(&path).unwrap();
        assert_eq!(loaded.image, image);
        assert_eq!(&loaded.service_state[..], b"s");
    }

    #[test]
    fn test_corrupt_lengths_are_integrity_failures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chkpt");
        let file = lock::try_open_exclusive(&path, true).unwrap().unwrap();
        let image = CheckpointImage {
            committer: CommitterState::fresh(1),
            inputs: vec![],
            outputs: vec![],
        };
        drop(write_checkpoint(&path, file, &image, b"state").unwrap());
        let good = std::fs::read(&path).unwrap();

        let mut bad = good.clone();
        bad[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &bad).unwrap();
        assert!(matches!(read_checkpoint(&path), Err(AmbrosiaError::IntegrityCheckFailure { offset: 0, .. })));

        let mut bad = good;
        let at = bad.len() - 5 - 8;
        bad[at..at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
        std::fs::write(&path, &bad).unwrap();
        assert!(matches!(read_checkpoint(&path), Err(AmbrosiaError::IntegrityCheckFailure { .. })));
    }
}
