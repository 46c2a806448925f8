//! End-to-end reconnect scenarios: a client over a mock transport whose
//! stream is torn down mid-flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerstream_client::{ClientParams, ConnectionState, EventClient};
use ledgerstream_core::testing::MockTransport;
use ledgerstream_core::{Dispatcher, DispatcherConfig};

fn new_client(params: ClientParams) -> (EventClient, MockTransport) {
    let transport = MockTransport::new();
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Box::new(transport.clone()));
    let client = EventClient::new(true, dispatcher, params).unwrap();
    (client, transport)
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within {deadline:?}");
}

#[tokio::test]
async fn test_reconnect_recovers_after_stream_failure() {
    let params = ClientParams {
        reconnect: true,
        max_reconnect_attempts: 2,
        time_between_connect_attempts: Duration::from_secs(1),
        ..ClientParams::default()
    };
    let (client, transport) = new_client(params);

    let reconnect_hooks = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&reconnect_hooks);
    client.set_before_reconnect_handler(move || {
        hook_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    // The transport loses its stream after the successful connect.
    let sink = transport.sink().unwrap();
    sink.disconnected("stream lost").await.unwrap();

    wait_until(Duration::from_secs(10), || {
        transport.connect_count() == 2 && client.connection_state() == ConnectionState::Connected
    })
    .await;

    assert_eq!(reconnect_hooks.load(Ordering::Relaxed), 1);
    assert!(!client.stopped());
}

#[tokio::test]
async fn test_reconnect_exhaustion_closes_client() {
    let params = ClientParams {
        reconnect: true,
        max_reconnect_attempts: 3,
        time_between_connect_attempts: Duration::from_secs(1),
        ..ClientParams::default()
    };
    let (client, transport) = new_client(params);

    // First connect succeeds, every reconnect attempt fails.
    transport.script_connect(Ok(()));
    transport.fail_connects("peer down");

    let reconnect_hooks = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&reconnect_hooks);
    client.set_before_reconnect_handler(move || {
        hook_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    client.connect().await.unwrap();
    let (_reg, mut filtered_rx) = client.register_filtered_block_event().await.unwrap();

    let sink = transport.sink().unwrap();
    sink.disconnected("stream lost").await.unwrap();

    wait_until(Duration::from_secs(15), || client.stopped()).await;

    // Initial connect plus the three failed reconnect attempts.
    assert_eq!(transport.connect_count(), 4);
    assert_eq!(reconnect_hooks.load(Ordering::Relaxed), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    // Closing stopped the dispatcher, which closed the subscription.
    let closed = tokio::time::timeout(Duration::from_secs(5), filtered_rx.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_disconnect_without_reconnect_closes_client() {
    let params = ClientParams {
        reconnect: false,
        ..ClientParams::default()
    };
    let (client, transport) = new_client(params);

    client.connect().await.unwrap();
    let sink = transport.sink().unwrap();
    sink.disconnected("stream lost").await.unwrap();

    wait_until(Duration::from_secs(10), || client.stopped()).await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    // No reconnect attempt was made.
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_before_reconnect_hook_error_aborts_reconnect() {
    let params = ClientParams {
        reconnect: true,
        max_reconnect_attempts: 3,
        ..ClientParams::default()
    };
    let (client, transport) = new_client(params);
    client.set_before_reconnect_handler(|| Err("no endpoints available".into()));

    client.connect().await.unwrap();
    let sink = transport.sink().unwrap();
    sink.disconnected("stream lost").await.unwrap();

    wait_until(Duration::from_secs(10), || {
        client.connection_state() == ConnectionState::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The hook aborted the cycle: no new connect, and the client stays
    // open in the disconnected state.
    assert_eq!(transport.connect_count(), 1);
    assert!(!client.stopped());
}

#[tokio::test]
async fn test_external_feed_observes_disconnect_and_reconnect() {
    let params = ClientParams {
        reconnect: true,
        max_reconnect_attempts: 2,
        time_between_connect_attempts: Duration::from_secs(1),
        ..ClientParams::default()
    };
    let (client, transport) = new_client(params);

    let (tx, mut rx) = tokio::sync::mpsc::channel(10);
    client.set_connection_event_channel(tx);

    client.connect().await.unwrap();
    let first = rx.recv().await.unwrap();
    assert!(first.connected);

    let sink = transport.sink().unwrap();
    sink.disconnected("stream lost").await.unwrap();

    let lost = rx.recv().await.unwrap();
    assert!(!lost.connected);
    assert_eq!(lost.error.as_deref(), Some("stream lost"));

    let recovered = rx.recv().await.unwrap();
    assert!(recovered.connected);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}
