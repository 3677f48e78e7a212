// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The live runtime.
//!
//! Startup is two steps so the service can be attached before recovery
//! feeds it:
//!
//! ```text
//! Runtime::prepare(config, metadata, broker) -> (Prepared, ServiceEndpoint)
//! spawn_immortal(service, endpoint)      (or serve it over the local link)
//! Prepared::start().await                -> Arc<Runtime>, primary
//! ```
//!
//! Once started, the runtime owns one sending task per destination, one
//! task per inbound stream, and a housekeeping task that rotates logs,
//! takes periodic checkpoints and watches the kill lock. Any fault a task
//! cannot handle arrives on [`Runtime::wait_fatal`].

use crate::checkpoint::{checkpoint_async, lock_checkpoint, CheckpointContext};
use crate::committer::Committer;
use crate::config::RuntimeConfig;
use crate::connections::Connections;
use crate::error::{fault_channel, AmbrosiaError, FaultReporter, Result};
use crate::event_buffer::PagePool;
use crate::peer::{run_input, run_output, ConnectionBroker, PeerContext, PeerStream};
use crate::recovery::{recover_or_create, Recovered, RecoveryContext};
use crate::roles::{self, metadata_err};
use crate::service::{service_channel, ServiceEndpoint, ServiceHandle};
use ambrosia_persistence::metadata::keys;
use ambrosia_persistence::{lock, LogLayout, LogWriter, MetadataStore};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A runtime that has not recovered yet.
pub struct Prepared {
    config: RuntimeConfig,
    metadata: Arc<dyn MetadataStore>,
    broker: Arc<dyn ConnectionBroker>,
    connections: Arc<Connections>,
    service: ServiceHandle,
    faults: FaultReporter,
    fault_rx: mpsc::UnboundedReceiver<AmbrosiaError>,
}

pub struct Runtime {
    config: RuntimeConfig,
    metadata: Arc<dyn MetadataStore>,
    connections: Arc<Connections>,
    service: ServiceHandle,
    committer: Arc<Committer>,
    peers: Arc<PeerContext>,
    layout: LogLayout,
    version: i64,
    log_no: AtomicU64,
    /// Last checkpoint written by this process, kept locked. Also
    /// serialises rotations.
    checkpoint: tokio::sync::Mutex<Option<(u64, File)>>,
    kill_lock: Mutex<Option<File>>,
    faults: FaultReporter,
    fault_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AmbrosiaError>>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn prepare(
        config: RuntimeConfig,
        metadata: Arc<dyn MetadataStore>,
        broker: Arc<dyn ConnectionBroker>,
    ) -> Result<(Prepared, ServiceEndpoint)> {
        config.validate()?;
        let pool = PagePool::new(config.page_size, config.page_pool_size);
        let connections = Connections::new(config.service_name.clone(), pool, config.spin);
        let (service, endpoint) = service_channel(connections.clone());
        let (faults, fault_rx) = fault_channel();
        Ok((
            Prepared {
                config,
                metadata,
                broker,
                connections,
                service,
                faults,
                fault_rx,
            },
            endpoint,
        ))
    }
}

impl Prepared {
    /// Recover (or create) the service and start serving as primary. In an
    /// active-active deployment this waits as long as another replica is
    /// primary; a checkpointer never returns from here except on error.
    pub async fn start(self) -> Result<Arc<Runtime>> {
        let ctx = RecoveryContext {
            config: self.config.clone(),
            metadata: self.metadata.clone(),
            connections: self.connections.clone(),
            service: self.service.clone(),
        };
        let Recovered {
            layout,
            version,
            state,
            log_no,
            writer,
            checkpoint,
            kill_lock,
            rotate_on_start,
            records_replayed,
        } = recover_or_create(&ctx).await?;

        let committer = Committer::new(
            state,
            Some(writer),
            self.config.max_commit_buffer,
            self.config.spin,
            self.connections.clone(),
            self.service.clone(),
            self.faults.clone(),
        );
        let shutdown = CancellationToken::new();
        let peers = Arc::new(PeerContext {
            connections: self.connections.clone(),
            committer: committer.clone(),
            broker: self.broker,
            faults: self.faults.clone(),
            shutdown: shutdown.clone(),
        });
        let runtime = Arc::new(Runtime {
            config: self.config,
            metadata: self.metadata,
            connections: self.connections,
            service: self.service,
            committer,
            peers,
            layout,
            version,
            log_no: AtomicU64::new(log_no),
            checkpoint: tokio::sync::Mutex::new(checkpoint),
            kill_lock: Mutex::new(kill_lock),
            faults: self.faults,
            fault_rx: tokio::sync::Mutex::new(self.fault_rx),
            shutdown,
        });

        if rotate_on_start {
            runtime.checkpoint_and_rotate().await?;
        }
        runtime.spawn_senders();
        runtime.spawn_housekeeping();
        tracing::info!(
            "{} v{} serving as primary on log {} ({} records replayed)",
            runtime.config.service_name,
            runtime.version,
            runtime.log_no(),
            records_replayed
        );
        Ok(runtime)
    }
}

impl Runtime {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    pub fn committer(&self) -> &Arc<Committer> {
        &self.committer
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn log_no(&self) -> u64 {
        self.log_no.load(Ordering::SeqCst)
    }

    /// Serve an inbound stream from a peer.
    pub fn accept(&self, stream: PeerStream) {
        tokio::spawn(run_input(self.peers.clone(), stream));
    }

    /// Accept every stream arriving on `incoming` until shutdown.
    pub fn serve(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<PeerStream>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    stream = incoming.recv() => match stream {
                        Some(stream) => this.accept(stream),
                        None => return,
                    },
                }
            }
        });
    }

    /// One sending task per destination, existing or future.
    fn spawn_senders(&self) {
        let Some(mut names) = self.connections.take_new_outputs() else {
            return;
        };
        let peers = self.peers.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = peers.shutdown.cancelled() => return,
                    name = names.recv() => match name {
                        Some(name) => name,
                        None => return,
                    },
                };
                if let Some(record) = connections.get_output(&name) {
                    tracing::debug!("starting sender for {}", name);
                    tokio::spawn(run_output(peers.clone(), record));
                }
            }
        });
    }

    fn spawn_housekeeping(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.housekeeping_interval());
            let mut last_checkpoint = Instant::now();
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(e) = this.housekeeping_pass(&mut last_checkpoint).await {
                    this.faults.report(e);
                    return;
                }
            }
        });
    }

    async fn housekeeping_pass(&self, last_checkpoint: &mut Instant) -> Result<()> {
        let upgrading_here = self.kill_lock.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if self.config.active_active && !upgrading_here && roles::kill_lock_held(&self.layout)? {
            return Err(AmbrosiaError::Superseded(
                "an upgrading replica holds the kill lock".to_string(),
            ));
        }

        let size = self.committer.log_position().await.unwrap_or(0);
        let by_size = size >= self.config.log_trigger_size;
        let by_time = self
            .config
            .checkpoint_interval()
            .is_some_and(|every| last_checkpoint.elapsed() >= every);
        if !by_size && !by_time {
            return Ok(());
        }
        tracing::debug!("rotating log {} ({} bytes, timer {})", self.log_no(), size, by_time);
        if self.config.active_active {
            self.rotate_log().await?;
        } else {
            self.checkpoint_and_rotate().await?;
        }
        *last_checkpoint = Instant::now();
        Ok(())
    }

    /// Open log `n` for writing, discarding anything a crashed rotation
    /// left in it.
    fn open_log(&self, n: u64) -> Result<LogWriter> {
        let path = self.layout.log(n);
        let file = lock::try_open_exclusive(&path, true)?
            .ok_or_else(|| AmbrosiaError::Superseded(format!("log {} is held by another process", n)))?;
        let mut writer = LogWriter::from_file(&path, file)?;
        if writer.position() != 0 {
            tracing::warn!("discarding stale contents of log {}", n);
            writer.truncate_to(0)?;
        }
        Ok(writer)
    }

    /// Swap the committer onto `writer` as log `n`. Committer must be asleep.
    async fn switch_to(&self, n: u64, writer: LogWriter) -> Result<()> {
        let old = self.committer.switch_log_stream(writer).await;
        self.metadata
            .set_i64(&self.config.service_name, keys::LAST_LOG_FILE, n as i64)
            .map_err(metadata_err)?;
        self.log_no.store(n, Ordering::SeqCst);
        // The old log stays locked until the pointer has moved on.
        drop(old);
        metrics::counter!("ambrosia_log_rotations_total", 1);
        tracing::info!("now writing log {}", n);
        Ok(())
    }

    /// Checkpoint `N + 1` and move to log `N + 1`.
    pub async fn checkpoint_and_rotate(&self) -> Result<u64> {
        let mut held = self.checkpoint.lock().await;
        self.committer.sleep().await?;
        let result: Result<u64> = async {
            let n = self.log_no() + 1;
            let file = lock_checkpoint(&self.layout, n)?
                .ok_or_else(|| AmbrosiaError::Superseded(format!("checkpoint {} is held by another process", n)))?;
            // The log must exist before the checkpoint naming it is published.
            let writer = self.open_log(n)?;
            let ctx = CheckpointContext {
                layout: &self.layout,
                metadata: self.metadata.as_ref(),
                service_name: &self.config.service_name,
                connections: &self.connections,
                service: &self.service,
            };
            let file = checkpoint_async(&ctx, n, file, self.committer.state()).await?;
            self.switch_to(n, writer).await?;
            *held = Some((n, file));
            Ok(n)
        }
        .await;
        self.committer.wakeup();
        result
    }

    /// Move to a new log without checkpointing. The active-active
    /// checkpointer picks the boundary up on its own.
    pub async fn rotate_log(&self) -> Result<u64> {
        let _held = self.checkpoint.lock().await;
        self.committer.sleep().await?;
        let result: Result<u64> = async {
            let n = self.log_no() + 1;
            let writer = self.open_log(n)?;
            self.switch_to(n, writer).await?;
            Ok(n)
        }
        .await;
        self.committer.wakeup();
        result
    }

    /// Next fault reported by a background task. The caller is expected to
    /// end the process with [`crate::error::terminate`].
    pub async fn wait_fatal(&self) -> AmbrosiaError {
        let mut rx = self.fault_rx.lock().await;
        match rx.recv().await {
            Some(err) => err,
            None => AmbrosiaError::ServiceGone("fault channel closed".to_string()),
        }
    }

    /// Stop every task, commit what is pending and let go of all locks.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.committer.sleep().await?;
        drop(self.committer.detach_log_stream().await);
        drop(self.checkpoint.lock().await.take());
        drop(self.kill_lock.lock().unwrap_or_else(|e| e.into_inner()).take());
        tracing::info!("{} stopped at log {}", self.config.service_name, self.log_no());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::MemoryBroker;
    use crate::service::{spawn_immortal, Immortal, Outbox};
    use crate::wire::RpcHeader;
    use ambrosia_persistence::MemoryMetadataStore;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Counter {
        calls: u64,
    }

    impl Immortal for Counter {
        fn dispatch(&mut self, _call: &RpcHeader, _outbox: &mut Outbox) -> Result<()> {
            self.calls += 1;
            Ok(())
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(self.calls.to_le_bytes().to_vec())
        }

        fn deserialize(&mut self, state: &[u8]) -> Result<()> {
            let bytes: [u8; 8] = state
                .try_into()
                .map_err(|_| AmbrosiaError::Codec("counter state is 8 bytes".into()))?;
            self.calls = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    async fn start(dir: &std::path::Path, metadata: Arc<MemoryMetadataStore>) -> Arc<Runtime> {
        let mut config = RuntimeConfig::new("counter", dir);
        config.housekeeping_interval_ms = 10;
        let (prepared, endpoint) = Runtime::prepare(config, metadata, Arc::new(MemoryBroker::new())).unwrap();
        spawn_immortal(Counter::default(), endpoint);
        prepared.start().await.unwrap()
    }

    #[tokio::test]
    async fn test_restart_rotates_to_next_log() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());

        let first = start(dir.path(), metadata.clone()).await;
        assert_eq!(first.log_no(), 1);
        first.shutdown().await.unwrap();

        let second = start(dir.path(), metadata.clone()).await;
        assert_eq!(second.log_no(), 2);
        assert_eq!(
            metadata.get_i64("counter", keys::LAST_COMMITTED_CHECKPOINT).unwrap(),
            Some(2)
        );
        assert_eq!(metadata.get_i64("counter", keys::LAST_LOG_FILE).unwrap(), Some(2));
        assert!(second.layout().checkpoint_exists(2));
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_size_trigger_rotates() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let mut config = RuntimeConfig::new("counter", dir.path());
        config.housekeeping_interval_ms = 5;
        config.log_trigger_size = 64;
        let (prepared, endpoint) = Runtime::prepare(config, metadata, Arc::new(MemoryBroker::new())).unwrap();
        spawn_immortal(Counter::default(), endpoint);
        let rt = prepared.start().await.unwrap();

        let frame = crate::wire::encode_rpc("counter", 1, crate::wire::RpcKind::FireAndForget, None, &[0u8; 100]);
        rt.committer().add_row(&frame, "client", 1, 1).await.unwrap();
        rt.committer().flush_pending().await.unwrap();

        for _ in 0..200 {
            if rt.log_no() > 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(rt.log_no() > 1);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_config_is_rejected_before_recovery() {
        let mut config = RuntimeConfig::new("counter", "/nonexistent");
        config.page_size = 0;
        let result = Runtime::prepare(
            config,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryBroker::new()),
        );
        assert!(matches!(result, Err(AmbrosiaError::Config(_))));
    }
}
