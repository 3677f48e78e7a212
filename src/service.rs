// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Local service boundary.
//!
//! The runtime never looks inside service state. It hands the service
//! committed calls, asks for opaque checkpoint bytes, and routes whatever
//! calls the service emits. An in-process service implements [`Immortal`]
//! and runs as an actor on [`spawn_immortal`]; an out-of-process one is
//! served by the node's local listener over the same request channel.
//!
//! # Protocol
//! ```text
//! Deliver(payload)   -> dispatch each call, route its outputs
//! TakeCheckpoint     -> serialize, reply with the bytes
//! Restore(bytes)     -> deserialize
//! BecomingPrimary    -> notify the service it now serves live traffic
//! Upgrade            -> migrate state to the new version
//! Barrier            -> reply once everything before it is handled
//! ```
//! Requests are handled strictly in order, and every output of one request
//! is buffered before the next request starts. A checkpoint reply therefore
//! covers exactly the outputs buffered before it.

use crate::connections::Connections;
use crate::error::{AmbrosiaError, Result};
use crate::wire::{self, encode_rpc, RpcHeader, RpcKind};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum ServiceRequest {
    /// Committed calls, byte for byte as logged.
    Deliver(Bytes),
    TakeCheckpoint(oneshot::Sender<Bytes>),
    Restore(Bytes),
    BecomingPrimary,
    Upgrade,
    /// Answered once every earlier request has been handled.
    Barrier(oneshot::Sender<()>),
}

/// Sending half held by the committer, recovery and checkpointing.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceRequest>,
}

fn gone(what: &str) -> AmbrosiaError {
    AmbrosiaError::ServiceGone(what.to_string())
}

impl ServiceHandle {
    pub fn deliver(&self, payload: Bytes) -> Result<()> {
        self.tx
            .send(ServiceRequest::Deliver(payload))
            .map_err(|_| gone("deliver"))
    }

    pub async fn take_checkpoint(&self) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ServiceRequest::TakeCheckpoint(tx))
            .map_err(|_| gone("take checkpoint"))?;
        rx.await.map_err(|_| gone("checkpoint reply"))
    }

    pub fn restore(&self, state: Bytes) -> Result<()> {
        self.tx
            .send(ServiceRequest::Restore(state))
            .map_err(|_| gone("restore"))
    }

    pub fn becoming_primary(&self) -> Result<()> {
        self.tx
            .send(ServiceRequest::BecomingPrimary)
            .map_err(|_| gone("becoming primary"))
    }

    pub fn upgrade(&self) -> Result<()> {
        self.tx.send(ServiceRequest::Upgrade).map_err(|_| gone("upgrade"))
    }

    /// Wait until the service has caught up with every request sent so far.
    pub async fn barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ServiceRequest::Barrier(tx))
            .map_err(|_| gone("barrier"))?;
        rx.await.map_err(|_| gone("barrier reply"))
    }
}

/// Receiving half, consumed by whatever runs the service.
pub struct ServiceEndpoint {
    pub requests: mpsc::UnboundedReceiver<ServiceRequest>,
    pub connections: Arc<Connections>,
}

pub fn service_channel(connections: Arc<Connections>) -> (ServiceHandle, ServiceEndpoint) {
    let (tx, requests) = mpsc::unbounded_channel();
    (ServiceHandle { tx }, ServiceEndpoint { requests, connections })
}

/// Calls emitted while handling one request.
#[derive(Debug)]
pub struct Outbox {
    own_name: String,
    frames: Vec<Bytes>,
}

impl Outbox {
    pub fn new(own_name: impl Into<String>) -> Self {
        Self {
            own_name: own_name.into(),
            frames: Vec::new(),
        }
    }

    pub fn own_name(&self) -> &str {
        &self.own_name
    }

    /// Replayable call carrying this service's name and `seq` for the reply.
    pub fn call(&mut self, dest: &str, method_id: i32, seq: i64, args: &[u8]) {
        let frame = encode_rpc(dest, method_id, RpcKind::ReturnValue, Some((self.own_name.as_str(), seq)), args);
        self.frames.push(frame);
    }

    pub fn fork(&mut self, dest: &str, method_id: i32, args: &[u8]) {
        self.frames
            .push(encode_rpc(dest, method_id, RpcKind::FireAndForget, None, args));
    }

    /// Not replayable: dropped if emitted while replaying.
    pub fn impulse(&mut self, dest: &str, method_id: i32, args: &[u8]) {
        let frame = encode_rpc(dest, method_id, RpcKind::Impulse, Some((self.own_name.as_str(), 0)), args);
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Bytes> {
        self.frames.drain(..)
    }
}

/// An in-process stateful service.
pub trait Immortal: Send + 'static {
    fn dispatch(&mut self, call: &RpcHeader, outbox: &mut Outbox) -> Result<()>;

    fn serialize(&self) -> Result<Vec<u8>>;

    fn deserialize(&mut self, state: &[u8]) -> Result<()>;

    fn becoming_primary(&mut self, _outbox: &mut Outbox) -> Result<()> {
        Ok(())
    }

    fn upgrade(&mut self) -> Result<()> {
        Ok(())
    }
}

async fn flush_outbox(connections: &Connections, outbox: &mut Outbox) -> Result<()> {
    for frame in outbox.drain() {
        connections.process_rpc(frame).await?;
    }
    Ok(())
}

/// Run `immortal` until every [`ServiceHandle`] is dropped.
pub fn spawn_immortal<I: Immortal>(mut immortal: I, endpoint: ServiceEndpoint) -> JoinHandle<Result<()>> {
    let ServiceEndpoint {
        mut requests,
        connections,
    } = endpoint;
    tokio::spawn(async move {
        let mut outbox = Outbox::new(connections.own_name());
        while let Some(request) = requests.recv().await {
            match request {
                ServiceRequest::Deliver(payload) => {
                    for frame in wire::split_frames(&payload)? {
                        for rpc in wire::rpc_frames(&frame)? {
                            let call = RpcHeader::from_frame(&rpc)?;
                            immortal.dispatch(&call, &mut outbox)?;
                            flush_outbox(&connections, &mut outbox).await?;
                        }
                    }
                }
                ServiceRequest::TakeCheckpoint(reply) => {
                    let state = immortal.serialize()?;
                    metrics::histogram!("ambrosia_service_checkpoint_bytes", state.len() as f64);
                    let _ = reply.send(Bytes::from(state));
                }
                ServiceRequest::Restore(state) => {
                    immortal.deserialize(&state)?;
                    tracing::info!("service state restored ({} bytes)", state.len());
                }
                ServiceRequest::BecomingPrimary => {
                    immortal.becoming_primary(&mut outbox)?;
                    flush_outbox(&connections, &mut outbox).await?;
                }
                ServiceRequest::Upgrade => {
                    immortal.upgrade()?;
                    tracing::info!("service upgraded");
                }
                ServiceRequest::Barrier(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::debug!("service request channel closed");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::PagePool;
    use crate::spin::SpinPolicy;

    /// Sums its inputs and echoes each one to `sink`.
    #[derive(Default)]
    struct Adder {
        total: u64,
    }

    impl Immortal for Adder {
        fn dispatch(&mut self, call: &RpcHeader, outbox: &mut Outbox) -> Result<()> {
            self.total += call.args.iter().map(|b| *b as u64).sum::<u64>();
            outbox.fork("sink", 1, &self.total.to_le_bytes());
            if call.method_id == 2 {
                outbox.impulse("sink", 2, b"tick");
            }
            Ok(())
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(self.total.to_le_bytes().to_vec())
        }

        fn deserialize(&mut self, state: &[u8]) -> Result<()> {
            let bytes: [u8; 8] = state
                .try_into()
                .map_err(|_| AmbrosiaError::Codec("adder state is 8 bytes".into()))?;
            self.total = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_outputs_buffered_before_checkpoint_reply() {
        let conns = Connections::new("adder", PagePool::new(4096, 8), SpinPolicy::default());
        let (handle, endpoint) = service_channel(conns.clone());
        let task = spawn_immortal(Adder::default(), endpoint);

        let a = encode_rpc("adder", 1, RpcKind::FireAndForget, None, &[1, 2]);
        let b = encode_rpc("adder", 2, RpcKind::FireAndForget, None, &[3]);
        let mut payload = a.to_vec();
        payload.extend_from_slice(&b);
        handle.deliver(Bytes::from(payload)).unwrap();

        let state = handle.take_checkpoint().await.unwrap();
        assert_eq!(state.as_ref(), &6u64.to_le_bytes());
        // Two forks and one impulse reached the sink buffer first.
        assert_eq!(conns.output("sink").buffer().last_seq(), 3);

        handle.restore(Bytes::from(10u64.to_le_bytes().to_vec())).unwrap();
        assert_eq!(handle.take_checkpoint().await.unwrap().as_ref(), &10u64.to_le_bytes());

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_actor_reports_service_gone() {
        let conns = Connections::new("adder", PagePool::new(4096, 8), SpinPolicy::default());
        let (handle, endpoint) = service_channel(conns);
        drop(endpoint);
        assert!(matches!(
            handle.deliver(Bytes::new()),
            Err(AmbrosiaError::ServiceGone(_))
        ));
    }
}
