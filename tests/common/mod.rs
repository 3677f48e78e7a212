// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![allow(dead_code)]

use ambrosia::peer::{ConnectionBroker, MemoryBroker, PeerStream};
use ambrosia::wire::{encode_rpc, Frame, FrameCodec, RpcHeader, RpcKind};
use ambrosia::{spawn_immortal, AmbrosiaError, Immortal, Outbox, Prepared, Result, Runtime, RuntimeConfig};
use ambrosia_persistence::{MemoryMetadataStore, Watermark};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Sums the argument bytes of every call. Optionally forwards each call.
pub struct Summer {
    pub total: u64,
    pub forward_to: Option<String>,
}

impl Summer {
    pub fn new() -> Self {
        Self {
            total: 0,
            forward_to: None,
        }
    }

    pub fn forwarding(dest: &str) -> Self {
        Self {
            total: 0,
            forward_to: Some(dest.to_string()),
        }
    }
}

impl Immortal for Summer {
    fn dispatch(&mut self, call: &RpcHeader, outbox: &mut Outbox) -> Result<()> {
        self.total += call.args.iter().map(|b| *b as u64).sum::<u64>();
        if let Some(dest) = &self.forward_to {
            outbox.fork(dest, call.method_id, &call.args);
        }
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.total.to_le_bytes().to_vec())
    }

    fn deserialize(&mut self, state: &[u8]) -> Result<()> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| AmbrosiaError::Codec("summer state is 8 bytes".into()))?;
        self.total = u64::from_le_bytes(bytes);
        Ok(())
    }
}

pub fn config(name: &str, dir: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(name, dir);
    config.housekeeping_interval_ms = 10;
    config.tail_poll_ms = 5;
    config
}

pub fn prepare(
    config: RuntimeConfig,
    metadata: &Arc<MemoryMetadataStore>,
    broker: &MemoryBroker,
    service: Summer,
) -> Prepared {
    let (prepared, endpoint) = Runtime::prepare(config, metadata.clone(), Arc::new(broker.clone())).unwrap();
    spawn_immortal(service, endpoint);
    prepared
}

/// Start a runtime and accept its inbound links.
pub async fn start(
    config: RuntimeConfig,
    metadata: &Arc<MemoryMetadataStore>,
    broker: &MemoryBroker,
    service: Summer,
) -> Arc<Runtime> {
    let inbound = broker.listen(&config.service_name);
    let rt = prepare(config, metadata, broker, service).start().await.unwrap();
    rt.serve(inbound);
    rt
}

pub async fn total(rt: &Runtime) -> u64 {
    let state = rt.service().take_checkpoint().await.unwrap();
    u64::from_le_bytes(state[..8].try_into().unwrap())
}

pub async fn wait_for_total(rt: &Runtime, expected: u64) {
    for _ in 0..1000 {
        if total(rt).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("total never reached {}, stuck at {}", expected, total(rt).await);
}

pub async fn wait_until(mut f: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A hand-driven peer speaking the wire protocol.
pub struct Client {
    pub rx: FramedRead<ReadHalf<PeerStream>, FrameCodec>,
    pub tx: FramedWrite<WriteHalf<PeerStream>, FrameCodec>,
    pub dest: String,
}

impl Client {
    pub async fn attach(broker: &MemoryBroker, name: &str, dest: &str) -> (Self, Watermark) {
        let stream = broker.connect(name, dest).await.unwrap();
        let (rd, wr) = tokio::io::split(stream);
        let mut client = Self {
            rx: FramedRead::new(rd, FrameCodec::new()),
            tx: FramedWrite::new(wr, FrameCodec::new()),
            dest: dest.to_string(),
        };
        client.tx.send(Frame::AttachTo(name.to_string())).await.unwrap();
        match client.rx.next().await.unwrap().unwrap() {
            Frame::ReplayFrom(wm) => (client, wm),
            other => panic!("expected ReplayFrom, got {:?}", other),
        }
    }

    pub async fn call(&mut self, arg: u8) {
        let frame = encode_rpc(&self.dest, 1, RpcKind::FireAndForget, None, &[arg]);
        self.tx.send(Frame::Rpc(frame)).await.unwrap();
    }

    /// Wait for the receiver to acknowledge calls up to `seq`.
    pub async fn wait_commit(&mut self, seq: i64) -> Watermark {
        loop {
            match self.rx.next().await.unwrap().unwrap() {
                Frame::Commit(wm) if wm.seq >= seq => return wm,
                Frame::Commit(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
