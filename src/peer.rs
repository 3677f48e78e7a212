// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Peer links.
//!
//! Every peer pair talks over two streams, one per direction. The sending
//! side dials, the receiving side tells it where to resume.
//!
//! # Protocol
//! ```text
//! sender                         receiver
//!   AttachTo(sender)      ->
//!                                flush pending commits
//!                         <-     ReplayFrom(last id + 1, last replayable + 1)
//!   Rpc / Batch ...       ->     add_row, one per frame
//!                         <-     Commit(watermark), whenever it advances
//!   add_trim(watermark)
//! ```
//!
//! Network failures end the session and the sender dials again. A receiver
//! that sees an illegal type byte reports a fault: the peer is corrupt.

use crate::committer::Committer;
use crate::connections::{Connections, OutputConnectionRecord};
use crate::error::{AmbrosiaError, FaultReporter, Result};
use crate::wire::{self, Frame, FrameCodec};
use ambrosia_persistence::Watermark;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Buffer size of in-memory duplex links.
const DUPLEX_CAPACITY: usize = 64 * 1024;

const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerIo for T {}

/// A bidirectional byte stream to or from a peer.
pub type PeerStream = Box<dyn PeerIo>;

/// Finds peers by service name.
#[async_trait]
pub trait ConnectionBroker: Send + Sync + 'static {
    async fn connect(&self, from: &str, to: &str) -> Result<PeerStream>;
}

/// In-process broker: every listening service gets a channel of inbound
/// streams.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PeerStream>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, name: &str) -> mpsc::UnboundedReceiver<PeerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), tx);
        rx
    }

    pub fn unlisten(&self, name: &str) {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
    }
}

fn not_connected(to: &str) -> AmbrosiaError {
    AmbrosiaError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("{} is not listening", to),
    ))
}

#[async_trait]
impl ConnectionBroker for MemoryBroker {
    async fn connect(&self, _from: &str, to: &str) -> Result<PeerStream> {
        let tx = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(to)
            .cloned()
            .ok_or_else(|| not_connected(to))?;
        let (near, far) = tokio::io::duplex(DUPLEX_CAPACITY);
        tx.send(Box::new(far)).map_err(|_| not_connected(to))?;
        Ok(Box::new(near))
    }
}

/// Errors that end one session but not the process.
fn is_link_error(err: &AmbrosiaError) -> bool {
    matches!(err, AmbrosiaError::Io(_) | AmbrosiaError::MalformedFrame(_))
}

/// Shared by every link task of one runtime.
pub struct PeerContext {
    pub connections: Arc<Connections>,
    pub committer: Arc<Committer>,
    pub broker: Arc<dyn ConnectionBroker>,
    pub faults: FaultReporter,
    pub shutdown: CancellationToken,
}

impl PeerContext {
    fn own_name(&self) -> &str {
        self.connections.own_name()
    }

    /// Self calls go through an in-memory pipe into our own input path so
    /// they are logged like any other input.
    async fn dial(self: &Arc<Self>, dest: &str) -> Result<PeerStream> {
        if dest == self.own_name() {
            let (near, far) = tokio::io::duplex(DUPLEX_CAPACITY);
            tokio::spawn(run_input(self.clone(), Box::new(far)));
            return Ok(Box::new(near));
        }
        self.broker.connect(self.own_name(), dest).await
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(out: &mut W, frame: Frame) -> Result<()> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    out.write_all(&buf).await?;
    out.flush().await?;
    Ok(())
}

async fn expect_frame<R: AsyncRead + Unpin>(frames: &mut FramedRead<R, FrameCodec>, what: &str) -> Result<Frame> {
    match frames.next().await {
        Some(frame) => frame,
        None => Err(AmbrosiaError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("stream closed while waiting for {}", what),
        ))),
    }
}

/// Keep a sending link to `record`'s destination up until shutdown.
pub async fn run_output(ctx: Arc<PeerContext>, record: Arc<OutputConnectionRecord>) {
    let mut backoff = MIN_BACKOFF;
    loop {
        let result = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            r = output_session(&ctx, &record, &mut backoff) => r,
        };
        record.kick();
        match result {
            Ok(()) => tracing::debug!("link to {} closed", record.name()),
            Err(e) if is_link_error(&e) => tracing::debug!("link to {} failed: {}", record.name(), e),
            Err(e) => {
                ctx.faults.report(e);
                return;
            }
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn output_session(ctx: &Arc<PeerContext>, record: &OutputConnectionRecord, backoff: &mut Duration) -> Result<()> {
    let dest = record.name();
    let stream = ctx.dial(dest).await?;
    let (rd, mut wr) = tokio::io::split(stream);
    write_frame(&mut wr, Frame::AttachTo(ctx.own_name().to_string())).await?;

    let mut frames = FramedRead::new(rd, FrameCodec::new());
    let wm = match expect_frame(&mut frames, "ReplayFrom").await? {
        Frame::ReplayFrom(wm) => wm,
        other => {
            return Err(AmbrosiaError::MalformedFrame(format!(
                "expected ReplayFrom from {}, got {:?}",
                dest, other
            )))
        }
    };
    let session = record.replay_from(wm);
    *backoff = MIN_BACKOFF;
    tracing::info!("sending to {} from seq {}", dest, wm.seq);

    let acks = async {
        while let Some(frame) = frames.next().await {
            match frame? {
                Frame::Commit(wm) | Frame::TrimTo(wm) => ctx.committer.add_trim(dest, wm),
                other => tracing::debug!("ignoring {:?} from {}", other, dest),
            }
        }
        Ok::<(), AmbrosiaError>(())
    };
    tokio::select! {
        r = record.send_async(&mut wr, session) => r,
        r = acks => r,
    }
}

/// Serve one inbound stream until it closes.
pub async fn run_input(ctx: Arc<PeerContext>, stream: PeerStream) {
    let result = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        r = input_session(&ctx, stream) => r,
    };
    match result {
        Ok(()) => {}
        Err(e) if is_link_error(&e) => tracing::debug!("inbound link failed: {}", e),
        Err(e) => ctx.faults.report(e),
    }
}

async fn input_session(ctx: &Arc<PeerContext>, stream: PeerStream) -> Result<()> {
    let (rd, wr) = tokio::io::split(stream);
    let mut frames = FramedRead::new(rd, FrameCodec::new());
    let source = match expect_frame(&mut frames, "AttachTo").await? {
        Frame::AttachTo(name) => name,
        other => return Err(AmbrosiaError::MalformedFrame(format!("expected AttachTo, got {:?}", other))),
    };

    // Resume exactly after what is already durable.
    ctx.committer.flush_pending().await?;
    let start = ctx.connections.input(&source);
    let mut out = FramedWrite::new(wr, FrameCodec::new());
    out.send(Frame::ReplayFrom(Watermark::new(start.seq + 1, start.replayable_seq + 1)))
        .await?;
    tracing::info!("{} attached, resuming after {}", source, start.seq);

    let mut acks = ctx.connections.output(&source).watch_remote_trim();
    let ack_writer = async move {
        loop {
            let wm = *acks.borrow_and_update();
            if wm.seq > 0 {
                out.send(Frame::Commit(wm)).await?;
            }
            if acks.changed().await.is_err() {
                return Ok::<(), AmbrosiaError>(());
            }
        }
    };

    let reader = async {
        let (mut seq, mut replayable) = (start.seq, start.replayable_seq);
        while let Some(frame) = frames.next().await {
            match frame? {
                Frame::Rpc(raw) | Frame::Batch(raw) => {
                    let (total, repl) = wire::count_calls(&raw)?;
                    seq += total;
                    replayable += repl;
                    ctx.committer.add_row(&raw, &source, seq, replayable).await?;
                    metrics::counter!("ambrosia_calls_received_total", total as u64);
                }
                Frame::Ping(_) | Frame::PingReturn(_) => {}
                other => tracing::debug!("ignoring {:?} from {}", other, source),
            }
        }
        tracing::debug!("{} detached", source);
        Ok::<(), AmbrosiaError>(())
    };

    tokio::select! {
        r = reader => r,
        r = ack_writer => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_memory_broker_pairs_streams() {
        let broker = MemoryBroker::new();
        let mut inbound = broker.listen("bank");
        let mut near = broker.connect("teller", "bank").await.unwrap();
        let mut far = inbound.recv().await.unwrap();

        near.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        broker.unlisten("bank");
        let err = broker.connect("teller", "bank").await.err().unwrap();
        assert!(is_link_error(&err));
    }

    #[tokio::test]
    async fn test_write_frame_round_trips_through_codec() {
        let (near, far) = tokio::io::duplex(1024);
        let (_, mut wr) = tokio::io::split(near);
        write_frame(&mut wr, Frame::Commit(Watermark::new(4, 3))).await.unwrap();
        let mut frames = FramedRead::new(far, FrameCodec::new());
        let got = expect_frame(&mut frames, "Commit").await.unwrap();
        assert_eq!(got, Frame::Commit(Watermark::new(4, 3)));
    }

    #[test]
    fn test_protocol_errors_are_not_link_errors() {
        assert!(!is_link_error(&AmbrosiaError::IllegalProtocolByte(99)));
        assert!(is_link_error(&AmbrosiaError::MalformedFrame("short".into())));
    }
}
