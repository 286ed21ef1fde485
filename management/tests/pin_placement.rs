// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pin placement against a fake executor: the scaler sends a pin
//! request over TCP, the executor acknowledges to the pin-accept listener,
//! and the location table records the outcome.

use bytes::{Bytes, BytesMut};
use cascade_config::NetworkConfig;
use cascade_management::{
    network::{address::AddressMap, spawn_pull_listener, SocketCache},
    scaler::{DefaultScaler, ExecutorPool, Scaler},
};
use cascade_types::{ExecutorKey, GenericResponse, PinFunction};
use futures::{SinkExt, StreamExt};
use prost::Message;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

fn decode_ack(bytes: BytesMut) -> Option<GenericResponse> {
    GenericResponse::decode(bytes).ok()
}

struct PinHarness {
    scaler: DefaultScaler,
    executor_listener: TcpListener,
    ack_port: u16,
    key: ExecutorKey,
    pool: ExecutorPool,
}

/// Binds a fake executor pin endpoint and a real pin-accept listener, and
/// wires a scaler to both.
async fn harness(ack_timeout: Duration) -> PinHarness {
    let executor_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pin_port = executor_listener.local_addr().unwrap().port();

    let ack_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ack_port = ack_listener.local_addr().unwrap().port();
    let (ack_tx, ack_rx) = mpsc::channel(8);
    spawn_pull_listener("pin-accept", ack_listener, ack_tx, decode_ack);

    let network = NetworkConfig {
        executor_pin_base: pin_port,
        ..NetworkConfig::default()
    };
    let scaler = DefaultScaler::new(
        "127.0.0.1".to_string(),
        AddressMap::new(&network),
        SocketCache::new(8),
        ack_rx,
        ack_timeout,
    );

    let key = ExecutorKey::new("127.0.0.1", 0);
    let pool = ExecutorPool::Unified([key.clone()].into_iter().collect());
    PinHarness {
        scaler,
        executor_listener,
        ack_port,
        key,
        pool,
    }
}

/// Fake executor: receive one pin request, then acknowledge it with the given
/// verdict.
fn spawn_executor(listener: TcpListener, ack_port: u16, verdict: Option<bool>) {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        let frame = frames.next().await.unwrap().unwrap();
        let pin = PinFunction::decode(frame).unwrap();
        assert_eq!(pin.name, "f");
        assert_eq!(pin.response_address, "127.0.0.1");

        if let Some(success) = verdict {
            let stream = TcpStream::connect(("127.0.0.1", ack_port)).await.unwrap();
            let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
            sink.send(Bytes::from(GenericResponse { success }.encode_to_vec()))
                .await
                .unwrap();
        }
    });
}

#[tokio::test]
async fn acknowledged_pin_is_recorded() {
    let h = harness(Duration::from_secs(5)).await;
    spawn_executor(h.executor_listener, h.ack_port, Some(true));
    let mut scaler = h.scaler;

    let mut locations: HashMap<String, HashSet<ExecutorKey>> = HashMap::new();
    scaler.replicate_function("f", 1, &mut locations, &h.pool).await;

    assert!(locations["f"].contains(&h.key));
}

#[tokio::test]
async fn refused_pin_leaves_no_replica() {
    let h = harness(Duration::from_secs(5)).await;
    spawn_executor(h.executor_listener, h.ack_port, Some(false));
    let mut scaler = h.scaler;

    let mut locations: HashMap<String, HashSet<ExecutorKey>> = HashMap::new();
    scaler.replicate_function("f", 1, &mut locations, &h.pool).await;

    assert!(locations.get("f").map_or(true, HashSet::is_empty));
}

#[tokio::test]
async fn silent_executor_times_out_and_is_dropped() {
    let h = harness(Duration::from_millis(200)).await;
    // The executor reads the pin request but never acknowledges it.
    spawn_executor(h.executor_listener, h.ack_port, None);
    let mut scaler = h.scaler;

    let mut locations: HashMap<String, HashSet<ExecutorKey>> = HashMap::new();
    scaler.replicate_function("f", 1, &mut locations, &h.pool).await;

    assert!(locations.get("f").map_or(true, HashSet::is_empty));
}

#[tokio::test]
async fn unreachable_executor_counts_as_a_dropped_candidate() {
    let h = harness(Duration::from_millis(200)).await;
    // Close the pin endpoint entirely; the send fails and no ack ever comes.
    drop(h.executor_listener);
    let mut scaler = h.scaler;

    let mut locations: HashMap<String, HashSet<ExecutorKey>> = HashMap::new();
    scaler.replicate_function("f", 1, &mut locations, &h.pool).await;

    assert!(locations.get("f").map_or(true, HashSet::is_empty));
}
