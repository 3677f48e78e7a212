// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Recovery and replay.
//!
//! Rebuilds the machine state from the last committed checkpoint plus the
//! log that follows it, then hands the caller a locked log stream to serve
//! from as primary.
//!
//! # Protocol
//! ```text
//! CURRENT_VERSION unset ── create: checkpoint 1, log 1, pointers
//! ↓
//! load checkpoint LAST_COMMITTED_CHECKPOINT
//! ↓
//! restore connections (impulses unbuffered), restore service
//! ↓
//! replay: inputs -> payload -> trims, record by record
//! ↓
//! end of log / torn record
//!   not active-active   -> stop, the tail was never durable
//!   newer log exists    -> checkpoint (checkpointer only), advance
//!   promoted            -> one last pass, stop
//!   otherwise           -> back off, read again
//! ↓
//! truncate torn tail, upgrade if asked, primary
//! ```
//!
//! # Invariants
//! - Records are applied in write sequence order, each exactly once.
//! - Replay never sends: outputs are buffered and impulses dropped.
//! - Only a log whose lock this process holds is ever truncated.

use crate::checkpoint::{checkpoint_async, lock_checkpoint, read_checkpoint, CheckpointContext};
use crate::committer::CommitterState;
use crate::config::RuntimeConfig;
use crate::connections::Connections;
use crate::error::{AmbrosiaError, Result};
use crate::roles::{
    self, detect_becoming_primary, determine_role, metadata_err, publish_role, read_pointer, CheckpointLease,
    PromotionTicket, PromotionWatch, Role,
};
use crate::service::ServiceHandle;
use ambrosia_persistence::metadata::keys;
use ambrosia_persistence::{lock, LogLayout, LogReader, LogRecord, LogWriter, MetadataStore, ReadOutcome};
use bytes::Bytes;
use std::fs::File;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Everything recovery reads from or feeds.
#[derive(Clone)]
pub struct RecoveryContext {
    pub config: RuntimeConfig,
    pub metadata: Arc<dyn MetadataStore>,
    pub connections: Arc<Connections>,
    pub service: ServiceHandle,
}

impl RecoveryContext {
    fn checkpoint_ctx<'a>(&'a self, layout: &'a LogLayout) -> CheckpointContext<'a> {
        CheckpointContext {
            layout,
            metadata: self.metadata.as_ref(),
            service_name: &self.config.service_name,
            connections: &self.connections,
            service: &self.service,
        }
    }

    fn set_pointer(&self, key: &str, value: i64) -> Result<()> {
        self.metadata
            .set_i64(&self.config.service_name, key, value)
            .map_err(metadata_err)
    }
}

/// State handed to the live runtime.
#[derive(Debug)]
pub struct Recovered {
    pub layout: LogLayout,
    pub version: i64,
    pub state: CommitterState,
    pub log_no: u64,
    /// Locked stream of log `log_no`, positioned after the last good record.
    pub writer: LogWriter,
    /// Last checkpoint this process wrote, still locked.
    pub checkpoint: Option<(u64, File)>,
    pub kill_lock: Option<File>,
    /// Take a checkpoint and start a new log before serving.
    pub rotate_on_start: bool,
    pub records_replayed: u64,
}

/// Committer ids only have to differ between incarnations of a service.
pub fn generate_committer_id() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mixed = nanos ^ ((std::process::id() as u64) << 17) ^ (nanos >> 29);
    let id = (mixed as u32) ^ ((mixed >> 32) as u32);
    id.max(1)
}

/// Run the startup state machine until this process is primary.
///
/// A checkpointer never becomes primary, so for one this only returns on
/// error.
pub async fn recover_or_create(ctx: &RecoveryContext) -> Result<Recovered> {
    let config = &ctx.config;
    loop {
        let stored = ctx
            .metadata
            .get_i64(&config.service_name, keys::CURRENT_VERSION)
            .map_err(metadata_err)?;
        let (version, upgrading) = match stored {
            None => {
                let layout = config.upgrade_layout();
                match create_fresh(ctx, layout, config.upgrade_version).await? {
                    Some(created) => return Ok(created),
                    None => {
                        tracing::info!("another instance is creating {}, waiting", config.service_name);
                        tokio::time::sleep(config.tail_poll()).await;
                        continue;
                    }
                }
            }
            Some(v) if v == config.current_version => (v, config.is_upgrading()),
            Some(v) if config.is_upgrading() && v == config.upgrade_version => {
                tracing::info!("already upgraded to version {}", v);
                (v, false)
            }
            Some(v) => {
                return Err(AmbrosiaError::VersionMismatch {
                    running: config.current_version,
                    stored: v,
                })
            }
        };
        return recover(ctx, version, upgrading).await;
    }
}

/// First start of a service. `None` if another instance won the race.
async fn create_fresh(ctx: &RecoveryContext, layout: LogLayout, version: i64) -> Result<Option<Recovered>> {
    layout.ensure_dir()?;
    let Some(checkpoint_file) = lock_checkpoint(&layout, 1)? else {
        return Ok(None);
    };
    let Some(log_file) = lock::try_open_exclusive(layout.log(1), true)? else {
        return Ok(None);
    };
    let mut writer = LogWriter::from_file(layout.log(1), log_file)?;
    if writer.position() != 0 {
        tracing::warn!("discarding log 1 left by an interrupted create");
        writer.truncate_to(0)?;
    }

    ctx.connections.set_recovering(false);
    let state = CommitterState::fresh(generate_committer_id());
    let held = checkpoint_async(&ctx.checkpoint_ctx(&layout), 1, checkpoint_file, state).await?;
    ctx.set_pointer(keys::LAST_LOG_FILE, 1)?;
    ctx.set_pointer(keys::CURRENT_VERSION, version)?;

    ctx.service.becoming_primary()?;
    publish_role(Role::Primary);
    tracing::info!(
        "created {} version {} with committer {:#010x}",
        ctx.config.service_name,
        version,
        state.committer_id
    );
    Ok(Some(Recovered {
        layout,
        version,
        state,
        log_no: 1,
        writer,
        checkpoint: Some((1, held)),
        kill_lock: None,
        rotate_on_start: false,
        records_replayed: 0,
    }))
}

fn open_log(layout: &LogLayout, log_no: u64, state: &CommitterState) -> Result<LogReader> {
    let path = layout.log(log_no);
    if !path.exists() {
        return Err(AmbrosiaError::MissingLog(path));
    }
    Ok(LogReader::open(&path)?
        .expect_committer(state.committer_id)
        .expect_write_seq(state.next_write_seq))
}

/// Where a read pass stopped.
#[derive(Debug)]
enum Stop {
    End,
    Torn { offset: u64, reason: String },
}

/// Cursor over the log series being replayed.
pub struct Replay<'a> {
    ctx: &'a RecoveryContext,
    layout: LogLayout,
    version: i64,
    log_no: u64,
    reader: LogReader,
    state: CommitterState,
    records: u64,
}

impl<'a> Replay<'a> {
    pub fn new(
        ctx: &'a RecoveryContext,
        layout: LogLayout,
        version: i64,
        log_no: u64,
        state: CommitterState,
    ) -> Result<Self> {
        let reader = open_log(&layout, log_no, &state)?;
        Ok(Self {
            ctx,
            layout,
            version,
            log_no,
            reader,
            state,
            records: 0,
        })
    }

    pub fn state(&self) -> CommitterState {
        self.state
    }

    pub fn log_no(&self) -> u64 {
        self.log_no
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Offset just past the last applied record of the current log.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// Apply records until the end of what is readable right now.
    async fn drain(&mut self) -> Result<Stop> {
        loop {
            match self.reader.next_record()? {
                ReadOutcome::Record(record) => self.apply(record).await?,
                ReadOutcome::EndOfLog => return Ok(Stop::End),
                ReadOutcome::Torn { offset, reason } => return Ok(Stop::Torn { offset, reason }),
            }
        }
    }

    async fn apply(&mut self, record: LogRecord) -> Result<()> {
        let conns = &self.ctx.connections;
        for (source, wm) in &record.tables.inputs {
            conns.record_input(source, *wm);
        }
        if !record.payload.is_empty() {
            self.ctx.service.deliver(Bytes::from(record.payload))?;
        }
        if !record.tables.trims.is_empty() {
            // Trims cover outputs of earlier records; let the service emit them first.
            self.ctx.service.barrier().await?;
            for (dest, wm) in &record.tables.trims {
                conns.output(dest).apply_trim(*wm);
            }
        }
        self.state.next_write_seq = record.header.write_seq_id + 1;
        self.records += 1;
        metrics::counter!("ambrosia_replay_records_total", 1);
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.log_no += 1;
        self.reader = open_log(&self.layout, self.log_no, &self.state)?;
        tracing::info!("replay advanced to log {}", self.log_no);
        Ok(())
    }

    fn newer_log(&self) -> Result<bool> {
        let last = read_pointer(self.ctx.metadata.as_ref(), &self.ctx.config.service_name, keys::LAST_LOG_FILE)?;
        Ok(last > self.log_no && self.layout.log_exists(self.log_no + 1))
    }

    /// Replay to the end of the last log. A torn record anywhere but the
    /// tail of the last log is corruption.
    pub async fn run_to_end(&mut self) -> Result<()> {
        loop {
            let stop = self.drain().await?;
            if self.newer_log()? {
                if let Stop::Torn { offset, reason } = stop {
                    return Err(AmbrosiaError::IntegrityCheckFailure { offset, reason });
                }
                self.advance()?;
                continue;
            }
            if let Stop::Torn { offset, reason } = stop {
                tracing::warn!(
                    "log {} torn at offset {} ({}), replay stops at the last good record",
                    self.log_no,
                    offset,
                    reason
                );
                metrics::counter!("ambrosia_torn_records_total", 1);
            }
            return Ok(());
        }
    }

    /// Tail the live log as a secondary or checkpointer until promoted.
    async fn tail(&mut self, mut role: Role, mut lease: Option<CheckpointLease>, upgrading: bool) -> Result<Tailed> {
        let mut watcher = (role == Role::Secondary).then(|| self.spawn_watcher(upgrading));
        let mut ticket: Option<PromotionTicket> = None;
        let mut kill_lock: Option<File> = None;

        loop {
            let stop = self.drain().await?;

            if self.newer_log()? {
                if let Stop::Torn { .. } = stop {
                    // The writer may still have been flushing when we read.
                    self.reader.rewind()?;
                    if let Stop::Torn { offset, reason } = self.drain().await? {
                        return Err(AmbrosiaError::IntegrityCheckFailure { offset, reason });
                    }
                }
                if role == Role::Checkpointer {
                    lease = self.checkpoint_at_boundary(lease).await?;
                    if lease.is_none() {
                        role = Role::Secondary;
                        publish_role(role);
                        watcher = Some(self.spawn_watcher(upgrading));
                    }
                }
                self.advance()?;
                continue;
            }

            if ticket.is_none() && watcher.as_ref().is_some_and(JoinHandle::is_finished) {
                if let Some(handle) = watcher.take() {
                    let won = handle
                        .await
                        .map_err(|e| AmbrosiaError::LogWrite(format!("promotion watcher: {}", e)))??;
                    ticket = Some(won);
                }
            }
            if let Some(won) = ticket.take() {
                if won.log_no == self.log_no {
                    // The primary is gone; whatever is readable now is the whole log.
                    self.reader.rewind()?;
                    let stop = self.drain().await?;
                    return Ok(Tailed {
                        ticket: won,
                        stop,
                        kill_lock,
                    });
                }
                ticket = Some(won);
            }

            if upgrading && kill_lock.is_none() {
                kill_lock = roles::take_kill_lock(&self.layout)?;
                if kill_lock.is_some() {
                    tracing::info!("holding the kill lock, waiting for the old primary to stop");
                }
            }

            tokio::time::sleep(self.ctx.config.tail_poll()).await;
            self.reader.rewind()?;
        }
    }

    fn spawn_watcher(&self, upgrading: bool) -> JoinHandle<Result<PromotionTicket>> {
        let watch = PromotionWatch {
            layout: self.layout.clone(),
            service: self.ctx.config.service_name.clone(),
            version: self.version,
            active_active: self.ctx.config.active_active,
            upgrading,
            poll: self.ctx.config.tail_poll(),
            spin: self.ctx.config.spin,
        };
        let metadata = self.ctx.metadata.clone();
        tokio::spawn(async move { detect_becoming_primary(&watch, metadata.as_ref()).await })
    }

    /// The checkpointer reached the end of log `k` and log `k + 1` exists:
    /// write checkpoint `k + 1` and move the lease on to `k + 2`.
    async fn checkpoint_at_boundary(&self, lease: Option<CheckpointLease>) -> Result<Option<CheckpointLease>> {
        let Some(current) = lease else {
            return Ok(None);
        };
        let n = self.log_no + 1;
        if current.checkpoint_no != n {
            tracing::warn!(
                "holding checkpoint {} at the end of log {}, skipping",
                current.checkpoint_no,
                self.log_no
            );
            return Ok(Some(current));
        }
        let next = lock_checkpoint(&self.layout, n + 1)?;
        let written = checkpoint_async(&self.ctx.checkpoint_ctx(&self.layout), n, current.file, self.state).await?;
        drop(written);
        Ok(next.map(|file| CheckpointLease {
            checkpoint_no: n + 1,
            file,
        }))
    }
}

struct Tailed {
    ticket: PromotionTicket,
    stop: Stop,
    kill_lock: Option<File>,
}

async fn recover(ctx: &RecoveryContext, version: i64, upgrading: bool) -> Result<Recovered> {
    let config = &ctx.config;
    let layout = LogLayout::new(&config.log_dir, &config.service_name, version);
    let last = read_pointer(ctx.metadata.as_ref(), &config.service_name, keys::LAST_COMMITTED_CHECKPOINT)?;

    let (role, lease) = if config.active_active {
        determine_role(&layout, ctx.metadata.as_ref(), &config.service_name)?
    } else {
        (Role::Primary, None)
    };
    if role != Role::Primary {
        publish_role(role);
    }

    let checkpoint = read_checkpoint(&layout.checkpoint(last))?;
    tracing::info!("recovering {} from checkpoint {}", config.service_name, last);

    let growth = ctx.connections.pool().open_growth_window();
    ctx.connections.set_recovering(true);
    ctx.connections
        .restore(&checkpoint.image.input_table(), &checkpoint.image.outputs);
    ctx.service.restore(checkpoint.service_state)?;

    let mut replay = Replay::new(ctx, layout.clone(), version, last, checkpoint.image.committer)?;
    let (log_file, kill_lock) = if config.active_active {
        let tailed = replay.tail(role, lease, upgrading).await?;
        if let Stop::Torn { offset, reason } = &tailed.stop {
            tracing::warn!("log {} ends in a torn record at {} ({})", replay.log_no(), offset, reason);
        }
        (tailed.ticket.file, tailed.kill_lock)
    } else {
        replay.run_to_end().await?;
        let file = lock::try_open_exclusive(layout.log(replay.log_no()), false)?.ok_or_else(|| {
            AmbrosiaError::Superseded(format!("log {} is held by another primary", replay.log_no()))
        })?;
        (file, None)
    };

    let log_no = replay.log_no();
    let records_replayed = replay.records();
    let mut writer = LogWriter::from_file(layout.log(log_no), log_file)?;
    if writer.position() > replay.position() {
        tracing::warn!(
            "truncating log {} from {} to {} bytes",
            log_no,
            writer.position(),
            replay.position()
        );
        writer.truncate_to(replay.position())?;
    }
    let state = replay.state();
    drop(replay);

    ctx.connections.set_recovering(false);
    drop(growth);
    tracing::info!(
        "replayed {} records, next write seq {}",
        records_replayed,
        state.next_write_seq
    );

    let mut recovered = Recovered {
        layout,
        version,
        state,
        log_no,
        writer,
        checkpoint: None,
        kill_lock,
        rotate_on_start: !config.active_active,
        records_replayed,
    };
    if upgrading {
        upgrade(ctx, &mut recovered).await?;
    }
    ctx.service.becoming_primary()?;
    publish_role(Role::Primary);
    Ok(recovered)
}

/// Move a recovered primary onto the new version's files.
async fn upgrade(ctx: &RecoveryContext, recovered: &mut Recovered) -> Result<()> {
    let config = &ctx.config;
    ctx.service.upgrade()?;

    let layout = config.upgrade_layout();
    layout.ensure_dir()?;
    let superseded = |what: &str| AmbrosiaError::Superseded(format!("{} of version {} is held", what, config.upgrade_version));
    let checkpoint_file = lock_checkpoint(&layout, 1)?.ok_or_else(|| superseded("checkpoint 1"))?;
    let log_file = lock::try_open_exclusive(layout.log(1), true)?.ok_or_else(|| superseded("log 1"))?;
    let mut writer = LogWriter::from_file(layout.log(1), log_file)?;
    if writer.position() != 0 {
        writer.truncate_to(0)?;
    }

    let held = checkpoint_async(&ctx.checkpoint_ctx(&layout), 1, checkpoint_file, recovered.state).await?;
    ctx.set_pointer(keys::LAST_LOG_FILE, 1)?;
    ctx.set_pointer(keys::CURRENT_VERSION, config.upgrade_version)?;
    tracing::info!(
        "upgraded {} from version {} to {}",
        config.service_name,
        recovered.version,
        config.upgrade_version
    );

    recovered.layout = layout;
    recovered.version = config.upgrade_version;
    recovered.log_no = 1;
    recovered.writer = writer;
    recovered.checkpoint = Some((1, held));
    recovered.rotate_on_start = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::PagePool;
    use crate::service::{service_channel, spawn_immortal, Immortal, Outbox};
    use crate::spin::SpinPolicy;
    use crate::wire::{encode_rpc, RpcHeader, RpcKind};
    use ambrosia_persistence::{MemoryMetadataStore, Watermark, WatermarkTables};
    use std::path::Path;
    use tempfile::tempdir;

    /// Appends every argument byte it sees and forwards a running count.
    #[derive(Default)]
    struct Journal {
        seen: Vec<u8>,
    }

    impl Immortal for Journal {
        fn dispatch(&mut self, call: &RpcHeader, outbox: &mut Outbox) -> Result<()> {
            self.seen.extend_from_slice(&call.args);
            outbox.fork("audit", 1, &(self.seen.len() as u64).to_le_bytes());
            Ok(())
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(self.seen.clone())
        }

        fn deserialize(&mut self, state: &[u8]) -> Result<()> {
            self.seen = state.to_vec();
            Ok(())
        }
    }

    fn context(dir: &Path, metadata: Arc<MemoryMetadataStore>) -> RecoveryContext {
        let mut config = RuntimeConfig::new("journal", dir);
        config.tail_poll_ms = 5;
        let connections = Connections::new("journal", PagePool::new(4096, 8), SpinPolicy::default());
        let (service, endpoint) = service_channel(connections.clone());
        spawn_immortal(Journal::default(), endpoint);
        RecoveryContext {
            config,
            metadata,
            connections,
            service,
        }
    }

    fn call(arg: u8) -> Vec<u8> {
        encode_rpc("journal", 1, RpcKind::FireAndForget, None, &[arg]).to_vec()
    }

    fn append(writer: &mut LogWriter, id: u32, seq: u64, payload: &[u8], input: i64) {
        let mut tables = WatermarkTables::default();
        tables
            .inputs
            .insert("client".to_string(), Watermark::new(input, input));
        writer.append_record(id, seq, payload, &tables).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_start_then_recover() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());

        let ctx = context(dir.path(), metadata.clone());
        let created = recover_or_create(&ctx).await.unwrap();
        assert_eq!(created.log_no, 1);
        assert_eq!(created.state.next_write_seq, 1);
        assert_eq!(metadata.get_i64("journal", keys::CURRENT_VERSION).unwrap(), Some(0));
        assert_eq!(metadata.get_i64("journal", keys::LAST_LOG_FILE).unwrap(), Some(1));

        let id = created.state.committer_id;
        let mut writer = created.writer;
        append(&mut writer, id, 1, &call(4), 1);
        let mut both = call(5);
        both.extend_from_slice(&call(6));
        append(&mut writer, id, 2, &both, 3);
        writer.flush().unwrap();
        drop(writer);
        drop(created.checkpoint);

        let ctx = context(dir.path(), metadata.clone());
        let recovered = recover_or_create(&ctx).await.unwrap();
        assert_eq!(recovered.records_replayed, 2);
        assert_eq!(recovered.state.next_write_seq, 3);
        assert!(recovered.rotate_on_start);
        assert_eq!(ctx.connections.input("client"), Watermark::new(3, 3));
        assert_eq!(&ctx.service.take_checkpoint().await.unwrap()[..], &[4, 5, 6]);
        assert_eq!(ctx.connections.output("audit").buffer().last_seq(), 3);
        assert!(!ctx.connections.is_recovering());
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let ctx = context(dir.path(), metadata.clone());
        let created = recover_or_create(&ctx).await.unwrap();
        let id = created.state.committer_id;
        let log = created.layout.log(1);

        let mut writer = created.writer;
        for seq in 1..=5u64 {
            append(&mut writer, id, seq, &call(seq as u8), seq as i64);
        }
        writer.flush().unwrap();
        let good_end = std::fs::metadata(&log).unwrap().len();
        append(&mut writer, id, 6, &call(6), 6);
        writer.flush().unwrap();
        drop(writer);
        drop(created.checkpoint);
        let full = std::fs::metadata(&log).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&log).unwrap();
        file.set_len(good_end + (full - good_end) / 2).unwrap();
        drop(file);

        let ctx = context(dir.path(), metadata.clone());
        let recovered = recover_or_create(&ctx).await.unwrap();
        assert_eq!(recovered.records_replayed, 5);
        assert_eq!(recovered.writer.position(), good_end);
        assert_eq!(std::fs::metadata(&log).unwrap().len(), good_end);
        assert_eq!(ctx.connections.input("client"), Watermark::new(5, 5));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.set_i64("journal", keys::CURRENT_VERSION, 3).unwrap();
        let ctx = context(dir.path(), metadata);
        assert!(matches!(
            recover_or_create(&ctx).await,
            Err(AmbrosiaError::VersionMismatch { running: 0, stored: 3 })
        ));
    }

    #[tokio::test]
    async fn test_missing_log_is_reported() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let ctx = context(dir.path(), metadata.clone());
        let created = recover_or_create(&ctx).await.unwrap();
        let log = created.layout.log(1);
        drop(created);
        std::fs::remove_file(&log).unwrap();

        let ctx = context(dir.path(), metadata);
        assert!(matches!(recover_or_create(&ctx).await, Err(AmbrosiaError::MissingLog(_))));
    }

    #[tokio::test]
    async fn test_upgrade_moves_to_new_version() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let ctx = context(dir.path(), metadata.clone());
        let created = recover_or_create(&ctx).await.unwrap();
        let id = created.state.committer_id;
        let mut writer = created.writer;
        append(&mut writer, id, 1, &call(9), 1);
        writer.flush().unwrap();
        drop(writer);
        drop(created.checkpoint);

        let mut ctx = context(dir.path(), metadata.clone());
        ctx.config.upgrade_version = 1;
        let upgraded = recover_or_create(&ctx).await.unwrap();
        assert_eq!(upgraded.version, 1);
        assert_eq!(upgraded.log_no, 1);
        assert_eq!(upgraded.state.next_write_seq, 2);
        assert_eq!(metadata.get_i64("journal", keys::CURRENT_VERSION).unwrap(), Some(1));
        assert!(upgraded.layout.checkpoint_exists(1));
        assert!(upgraded.layout.dir().ends_with("journal_1"));
    }

    #[test]
    fn test_committer_ids_are_nonzero() {
        assert!((0..100).map(|_| generate_committer_id()).all(|id| id != 0));
    }
}
