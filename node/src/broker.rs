// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! TCP connection broker.
//!
//! Peers are found through a static name to address table. Inbound
//! connections from any peer arrive on one listener and are handed to the
//! runtime as they come.

use ambrosia::{AmbrosiaError, ConnectionBroker, PeerStream};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct TcpBroker {
    peers: RwLock<BTreeMap<String, SocketAddr>>,
}

impl TcpBroker {
    pub fn new(peers: BTreeMap<String, SocketAddr>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn add_peer(&self, name: &str, addr: SocketAddr) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), addr);
    }

    pub fn address_of(&self, name: &str) -> Option<SocketAddr> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }
}

#[async_trait]
impl ConnectionBroker for TcpBroker {
    async fn connect(&self, from: &str, to: &str) -> ambrosia::Result<PeerStream> {
        let addr = self.address_of(to).ok_or_else(|| {
            AmbrosiaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address known for peer {}", to),
            ))
        })?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("{} connected to {} at {}", from, to, addr);
        Ok(Box::new(stream))
    }
}

/// Bind `addr` and forward every accepted connection. Returns the bound
/// address, which differs from `addr` when it asked for port 0.
pub async fn listen(addr: SocketAddr) -> std::io::Result<(SocketAddr, mpsc::UnboundedReceiver<PeerStream>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!("set_nodelay for {}: {}", from, e);
                    }
                    tracing::debug!("accepted peer link from {}", from);
                    if tx.send(Box::new(stream) as PeerStream).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("accept on {} failed: {}", local, e);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    });
    tracing::info!("listening for peers on {}", local);
    Ok((local, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let (addr, mut inbound) = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let broker = TcpBroker::default();
        broker.add_peer("bob", addr);

        let mut out = broker.connect("alice", "bob").await.unwrap();
        out.write_all(b"hi").await.unwrap();
        let mut accepted = inbound.recv().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_a_link_error() {
        let broker = TcpBroker::default();
        assert!(matches!(
            broker.connect("alice", "nobody").await,
            Err(AmbrosiaError::Io(_))
        ));
    }
}
