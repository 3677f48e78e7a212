// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use ambrosia::peer::MemoryBroker;
use ambrosia::wire::{encode_rpc, RpcHeader, RpcKind};
use ambrosia::{spawn_immortal, Immortal, Outbox, Result, Runtime};
use ambrosia_persistence::{LogReader, MemoryMetadataStore, ReadOutcome, Watermark};
use common::{config, start, total, wait_for_total, wait_until, Client, Summer};
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_flow_through_two_runtimes() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(MemoryMetadataStore::new());
    let broker = MemoryBroker::new();

    let alice = start(config("alice", dir.path()), &metadata, &broker, Summer::forwarding("bob")).await;
    let bob = start(config("bob", dir.path()), &metadata, &broker, Summer::new()).await;

    let (mut client, from) = Client::attach(&broker, "client", "alice").await;
    assert_eq!(from, Watermark::new(1, 1));
    for n in 1..=10u8 {
        client.call(n).await;
    }
    assert_eq!(client.wait_commit(10).await, Watermark::new(10, 10));

    wait_for_total(&bob, 55).await;
    assert_eq!(total(&alice).await, 55);

    // Bob's acknowledgement comes back as a trim record on alice's side.
    let to_bob = alice.connections().output("bob");
    wait_until(|| to_bob.state().trim_to == 10, "alice to trim bob's buffer").await;
    assert_eq!(to_bob.buffer().page_count(), 0);
    assert_eq!(bob.connections().input("alice"), Watermark::new(10, 10));

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reattaching_client_resumes_after_durable_calls() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(MemoryMetadataStore::new());
    let broker = MemoryBroker::new();
    let rt = start(config("svc", dir.path()), &metadata, &broker, Summer::new()).await;

    let (mut client, _) = Client::attach(&broker, "client", "svc").await;
    for n in 1..=3u8 {
        client.call(n).await;
    }
    client.wait_commit(3).await;
    drop(client);

    let (_client, from) = Client::attach(&broker, "client", "svc").await;
    assert_eq!(from, Watermark::new(4, 4));
    rt.shutdown().await.unwrap();
}

/// Calls itself once for every outside call.
struct Echo {
    outside: u64,
    inside: u64,
}

impl Immortal for Echo {
    fn dispatch(&mut self, call: &RpcHeader, outbox: &mut Outbox) -> Result<()> {
        if call.method_id == 1 {
            self.outside += 1;
            let own = outbox.own_name().to_string();
            outbox.fork(&own, 2, &call.args);
        } else {
            self.inside += 1;
        }
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = self.outside.to_le_bytes().to_vec();
        out.extend_from_slice(&self.inside.to_le_bytes());
        Ok(out)
    }

    fn deserialize(&mut self, state: &[u8]) -> Result<()> {
        self.outside = u64::from_le_bytes(state[..8].try_into().unwrap_or_default());
        self.inside = u64::from_le_bytes(state[8..16].try_into().unwrap_or_default());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_calls_are_logged_as_inputs() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(MemoryMetadataStore::new());
    let broker = MemoryBroker::new();

    let inbound = broker.listen("echo");
    let (prepared, endpoint) = Runtime::prepare(config("echo", dir.path()), metadata.clone(), Arc::new(broker.clone())).unwrap();
    spawn_immortal(Echo { outside: 0, inside: 0 }, endpoint);
    let rt = prepared.start().await.unwrap();
    rt.serve(inbound);

    let (mut client, _) = Client::attach(&broker, "client", "echo").await;
    for n in 1..=4u8 {
        client.call(n).await;
    }
    client.wait_commit(4).await;

    let mut both = (0, 0);
    for _ in 0..1000 {
        let state = rt.service().take_checkpoint().await.unwrap();
        both = (
            u64::from_le_bytes(state[..8].try_into().unwrap()),
            u64::from_le_bytes(state[8..16].try_into().unwrap()),
        );
        if both == (4, 4) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(both, (4, 4));
    assert_eq!(rt.connections().input("echo"), Watermark::new(4, 4));

    let log = rt.layout().log(rt.log_no());
    rt.shutdown().await.unwrap();
    let mut reader = LogReader::open(&log).unwrap();
    let mut logged_self_calls = false;
    while let ReadOutcome::Record(record) = reader.next_record().unwrap() {
        logged_self_calls |= record.tables.inputs.contains_key("echo");
    }
    assert!(logged_self_calls);

    // The self call frames are ordinary RPCs addressed to ourselves.
    let frame = encode_rpc("echo", 2, RpcKind::FireAndForget, None, &[1]);
    assert_eq!(RpcHeader::from_frame(&frame).unwrap().dest, "echo");
}
