// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Wire plumbing for the controller: outbound fire-and-forget sends through a
//! capped connection cache, a one-shot request helper, and the inbound
//! listener tasks that feed the controller loop's channels.
//!
//! All endpoints speak length-delimited frames. `tcp://ip:port` endpoints are
//! remote tiers; `ipc://path` endpoints are Unix sockets of co-located
//! workers.

pub mod address;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, UnixStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("malformed endpoint address: {0}")]
    MalformedAddress(String),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a reply arrived")]
    ClosedEarly,
}

enum Outbound {
    Tcp(FramedWrite<TcpStream, LengthDelimitedCodec>),
    Ipc(FramedWrite<UnixStream, LengthDelimitedCodec>),
}

impl Outbound {
    async fn connect(address: &str) -> Result<Self, NetworkError> {
        if let Some(host) = address.strip_prefix("tcp://") {
            let stream = TcpStream::connect(host).await?;
            Ok(Outbound::Tcp(FramedWrite::new(stream, LengthDelimitedCodec::new())))
        } else if let Some(path) = address.strip_prefix("ipc://") {
            let stream = UnixStream::connect(path).await?;
            Ok(Outbound::Ipc(FramedWrite::new(stream, LengthDelimitedCodec::new())))
        } else {
            Err(NetworkError::MalformedAddress(address.to_string()))
        }
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), NetworkError> {
        match self {
            Outbound::Tcp(framed) => framed.send(payload).await?,
            Outbound::Ipc(framed) => framed.send(payload).await?,
        }
        Ok(())
    }
}

/// Cache of outbound connections keyed by endpoint string. Capped: least
/// recently used endpoints are closed as new ones are opened, so the cache
/// stays bounded under membership churn.
pub struct SocketCache {
    connections: LruCache<String, Outbound>,
}

impl SocketCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: LruCache::new(capacity),
        }
    }

    /// Fire-and-forget send of one frame. Delivery is not guaranteed: any
    /// connect or write failure is logged and the cached connection dropped,
    /// and the caller proceeds either way.
    pub async fn send(&mut self, address: &str, payload: Bytes) {
        if let Err(err) = self.try_send(address, payload).await {
            warn!(address, "dropping outbound message: {err}");
            self.connections.pop(&address.to_string());
        }
    }

    async fn try_send(&mut self, address: &str, payload: Bytes) -> Result<(), NetworkError> {
        if !self.connections.contains(&address.to_string()) {
            let connection = Outbound::connect(address).await?;
            self.connections.put(address.to_string(), connection);
        }
        if let Some(connection) = self.connections.get_mut(&address.to_string()) {
            connection.send(payload).await?;
        }
        Ok(())
    }
}

/// Synchronous request/reply over a fresh connection: send one frame, wait
/// for one frame back. Used only for the routing tier's seed endpoint.
pub async fn request(address: &str, payload: Bytes) -> Result<Bytes, NetworkError> {
    let host = address
        .strip_prefix("tcp://")
        .ok_or_else(|| NetworkError::MalformedAddress(address.to_string()))?;
    let stream = TcpStream::connect(host).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(payload).await?;
    match framed.next().await {
        Some(frame) => Ok(frame?.freeze()),
        None => Err(NetworkError::ClosedEarly),
    }
}

/// Accept loop for a push-style channel: every decoded inbound frame is
/// forwarded into `tx`. Frames that fail to decode are skipped without
/// tearing down the connection's remaining traffic.
pub fn spawn_pull_listener<T: Send + 'static>(
    name: &'static str,
    listener: TcpListener,
    tx: mpsc::Sender<T>,
    decode: fn(BytesMut) -> Option<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(listener = name, "accept failed: {err}");
                    continue;
                },
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(bytes) => match decode(bytes) {
                            Some(message) => {
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            },
                            None => debug!(listener = name, peer = %peer, "skipping undecodable frame"),
                        },
                        Err(err) => {
                            debug!(listener = name, peer = %peer, "stream error: {err}");
                            return;
                        },
                    }
                }
            });
        }
    })
}

/// Accept loop for a request/reply channel. Each inbound frame is turned into
/// an event carrying a reply sender; the connection waits for the handler's
/// reply before reading the next request.
pub fn spawn_reply_listener<T: Send + 'static>(
    name: &'static str,
    listener: TcpListener,
    tx: mpsc::Sender<T>,
    decode: fn(BytesMut, oneshot::Sender<Bytes>) -> Option<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(listener = name, "accept failed: {err}");
                    continue;
                },
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(frame) = framed.next().await {
                    let bytes = match frame {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            debug!(listener = name, peer = %peer, "stream error: {err}");
                            return;
                        },
                    };
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let request = match decode(bytes, reply_tx) {
                        Some(request) => request,
                        None => {
                            debug!(listener = name, peer = %peer, "skipping undecodable request");
                            continue;
                        },
                    };
                    if tx.send(request).await.is_err() {
                        return;
                    }
                    match reply_rx.await {
                        Ok(reply) => {
                            if framed.send(reply).await.is_err() {
                                return;
                            }
                        },
                        // Handler dropped the reply; the requester will see
                        // the connection close.
                        Err(_) => return,
                    }
                }
            });
        }
    })
}
