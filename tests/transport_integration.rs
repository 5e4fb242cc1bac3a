//! Integration tests for QUIC Transport
//!
//! Tests real QUIC links between transport services using ephemeral ports.

use knowledge_sync::infrastructure::ShutdownController;
use knowledge_sync::replication::{TransportError, TransportEvent, TransportService};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn started(queue: usize) -> (TransportService, mpsc::Receiver<TransportEvent>, ShutdownController) {
    let shutdown = ShutdownController::new();
    let mut service = TransportService::new("127.0.0.1:0".parse().unwrap(), queue, shutdown.clone());
    let events = service.take_event_rx().unwrap();
    service.start().await.unwrap();
    (service, events, shutdown)
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
}

/// Test TransportService binding to an ephemeral port
#[tokio::test]
async fn test_transport_service_lifecycle() {
    let (service, _events, shutdown) = started(16).await;
    let addr = service.local_addr().unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(service.connection_count(), 0);

    shutdown.shutdown();
    service.close();
    assert!(shutdown.wait_for_drain(Duration::from_secs(1)).await);
}

/// Test frames flow both ways over one link
#[tokio::test]
async fn test_frames_round_trip() {
    let (a, mut a_events, _a_stop) = started(16).await;
    let (b, mut b_events, _b_stop) = started(16).await;

    let conn = a.connect(b.local_addr().unwrap()).await.unwrap();
    match next_event(&mut a_events).await {
        TransportEvent::Connected {
            connection,
            outbound,
            ..
        } => {
            assert_eq!(connection, conn);
            assert!(outbound);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The acceptor only sees the stream once the dialer writes to it.
    a.send(conn, b"hello").unwrap();

    let inbound = match next_event(&mut b_events).await {
        TransportEvent::Connected {
            connection,
            outbound,
            addr,
        } => {
            assert!(!outbound);
            assert!(addr.ip().is_loopback());
            connection
        }
        other => panic!("unexpected event: {:?}", other),
    };
    match next_event(&mut b_events).await {
        TransportEvent::Frame {
            connection,
            payload,
        } => {
            assert_eq!(connection, inbound);
            assert_eq!(&payload[..], b"hello");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    b.send(inbound, b"world").unwrap();
    match next_event(&mut a_events).await {
        TransportEvent::Frame { payload, .. } => assert_eq!(&payload[..], b"world"),
        other => panic!("unexpected event: {:?}", other),
    }

    a.close();
    b.close();
}

/// Test several frames keep their order
#[tokio::test]
async fn test_frames_arrive_in_order() {
    let (a, _a_events, _a_stop) = started(64).await;
    let (b, mut b_events, _b_stop) = started(64).await;

    let conn = a.connect(b.local_addr().unwrap()).await.unwrap();
    for i in 0..20u32 {
        a.send(conn, format!("frame-{}", i).as_bytes()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 20 {
        if let TransportEvent::Frame { payload, .. } = next_event(&mut b_events).await {
            received.push(String::from_utf8(payload.to_vec()).unwrap());
        }
    }
    let expected: Vec<String> = (0..20).map(|i| format!("frame-{}", i)).collect();
    assert_eq!(received, expected);

    a.close();
    b.close();
}

/// Test closing one side reports a disconnect on the other
#[tokio::test]
async fn test_disconnect_is_reported() {
    let (a, _a_events, _a_stop) = started(16).await;
    let (b, mut b_events, _b_stop) = started(16).await;

    let conn = a.connect(b.local_addr().unwrap()).await.unwrap();
    a.send(conn, b"hi").unwrap();

    let inbound = match next_event(&mut b_events).await {
        TransportEvent::Connected { connection, .. } => connection,
        other => panic!("unexpected event: {:?}", other),
    };
    assert!(matches!(next_event(&mut b_events).await, TransportEvent::Frame { .. }));

    a.disconnect(conn);
    assert!(matches!(
        a.send(conn, b"late"),
        Err(TransportError::UnknownConnection(_))
    ));

    loop {
        match next_event(&mut b_events).await {
            TransportEvent::Disconnected(id) => {
                assert_eq!(id, inbound);
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(b.connection_count(), 0);
    b.close();
}
