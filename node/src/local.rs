// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Local service listener.
//!
//! An out-of-process service connects once and speaks the peer wire
//! protocol. Requests from the runtime become frames, and frames from the
//! service become routed calls or replies.
//!
//! # Protocol
//! ```text
//! runtime                           service
//!   Deliver(payload)      -> Rpc / Batch frames, verbatim
//!   Restore(state)        -> Checkpoint(state)
//!   TakeCheckpoint        -> TakeCheckpoint
//!                         <- Checkpoint(state)
//!   BecomingPrimary       -> BecomingPrimary
//!   Upgrade               -> UpgradeService
//!   Barrier               -> Ping(n)
//!                         <- PingReturn(n)
//!                         <- Rpc / Batch       (calls the service makes)
//! ```
//!
//! # Invariants
//! - The service answers in request order, so replies are matched FIFO.
//! - Calls are routed in the order they arrive, so a checkpoint reply
//!   covers every call the service sent before it.

use ambrosia::connections::Connections;
use ambrosia::wire::{self, Frame, FrameCodec};
use ambrosia::{AmbrosiaError, Result, ServiceEndpoint, ServiceRequest};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};

enum Pending {
    Checkpoint(oneshot::Sender<Bytes>),
    Barrier(u64, oneshot::Sender<()>),
}

/// Wait for the service to connect, then bridge until either side goes away.
pub async fn serve_local(listener: TcpListener, endpoint: ServiceEndpoint) -> Result<()> {
    let (stream, from) = listener.accept().await?;
    stream.set_nodelay(true)?;
    tracing::info!("local service connected from {}", from);
    bridge(stream, endpoint).await
}

/// Returns `Ok` once the runtime drops its last handle.
pub async fn bridge<S>(stream: S, endpoint: ServiceEndpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let ServiceEndpoint {
        mut requests,
        connections,
    } = endpoint;
    let (rd, wr) = tokio::io::split(stream);
    let mut from_service = FramedRead::new(rd, FrameCodec::new());
    let mut to_service = FramedWrite::new(wr, FrameCodec::new());
    let mut pending: VecDeque<Pending> = VecDeque::new();
    let mut pings = 0u64;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    return Ok(());
                };
                match request {
                    ServiceRequest::Deliver(payload) => {
                        for frame in wire::split_frames(&payload)? {
                            to_service.feed(Frame::Rpc(frame)).await?;
                        }
                    }
                    ServiceRequest::Restore(state) => to_service.feed(Frame::Checkpoint(state)).await?,
                    ServiceRequest::TakeCheckpoint(reply) => {
                        pending.push_back(Pending::Checkpoint(reply));
                        to_service.feed(Frame::TakeCheckpoint).await?;
                    }
                    ServiceRequest::BecomingPrimary => to_service.feed(Frame::BecomingPrimary).await?,
                    ServiceRequest::Upgrade => to_service.feed(Frame::UpgradeService).await?,
                    ServiceRequest::Barrier(reply) => {
                        pings += 1;
                        pending.push_back(Pending::Barrier(pings, reply));
                        to_service.feed(Frame::Ping(Bytes::copy_from_slice(&pings.to_le_bytes()))).await?;
                    }
                }
                to_service.flush().await?;
            }
            frame = from_service.next() => {
                let Some(frame) = frame else {
                    return Err(AmbrosiaError::ServiceGone("local service disconnected".to_string()));
                };
                on_service_frame(frame?, &connections, &mut pending).await?;
            }
        }
    }
}

async fn on_service_frame(frame: Frame, connections: &Connections, pending: &mut VecDeque<Pending>) -> Result<()> {
    match frame {
        Frame::Rpc(raw) | Frame::Batch(raw) => {
            for rpc in wire::rpc_frames(&raw)? {
                connections.process_rpc(rpc).await?;
            }
        }
        Frame::Checkpoint(state) => match pending.pop_front() {
            Some(Pending::Checkpoint(reply)) => {
                let _ = reply.send(state);
            }
            _ => return Err(unexpected("checkpoint")),
        },
        Frame::PingReturn(body) => match pending.pop_front() {
            Some(Pending::Barrier(n, reply)) if body[..] == n.to_le_bytes() => {
                let _ = reply.send(());
            }
            _ => return Err(unexpected("ping return")),
        },
        other => return Err(unexpected(&format!("{:?}", other))),
    }
    Ok(())
}

fn unexpected(what: &str) -> AmbrosiaError {
    AmbrosiaError::MalformedFrame(format!("unexpected {} from local service", what))
}
