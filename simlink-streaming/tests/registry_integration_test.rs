// Integration tests for stream subscriptions over real TCP
//
// Covers:
// - fallback endpoint adoption for tokens without an address
// - no callbacks after unsubscribe
// - unsubscribing from inside a frame handler, own stream or another one
// - several streams multiplexed on one runtime, each in order
// - state channel transitions

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use simlink_streaming::{
    ConnectionOptions, ConnectionState, FallbackAddress, StreamSubscriptionRegistry, StreamToken,
    TcpConnector,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Handle;

/// Frame server: reads the stream id, then sends "<id>:<seq>" frames every
/// few milliseconds until the client goes away.
async fn spawn_frame_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(stream_id) = socket.read_u32_le().await else {
                    return;
                };
                for seq in 0u32.. {
                    let payload = format!("{stream_id}:{seq}");
                    let Ok(len) = u32::try_from(payload.len()) else {
                        return;
                    };
                    if socket.write_u32_le(len).await.is_err()
                        || socket.write_all(payload.as_bytes()).await.is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
    });

    addr
}

fn fast_connector() -> TcpConnector {
    TcpConnector::new(ConnectionOptions {
        connect_timeout: Duration::from_secs(1),
        reconnect_min_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        max_reconnect_attempts: None,
        max_frame_length: 1024,
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fallback_subscription_and_unsubscribe() {
    let server = spawn_frame_server().await;
    let registry = StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::from_endpoint(server),
    );

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let token = StreamToken::new(7, 0);
    registry
        .subscribe(&Handle::current(), token, move |_frame: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(registry.endpoint(7), Some(server));
    wait_until(|| count.load(Ordering::SeqCst) >= 3).await;

    registry.unsubscribe(&token);
    assert!(registry.is_empty());

    let after_unsubscribe = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), after_unsubscribe);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streams_are_multiplexed_in_order() {
    let server = spawn_frame_server().await;
    let registry = StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::new(server.ip()),
    );

    let received: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(vec![Vec::new(); 3]));
    for id in 0..3u32 {
        let sink = Arc::clone(&received);
        registry
            .subscribe(
                &Handle::current(),
                StreamToken::new(id, server.port()),
                move |frame: Bytes| {
                    let text = String::from_utf8_lossy(&frame).into_owned();
                    sink.lock()[id as usize].push(text);
                },
            )
            .unwrap();
    }
    assert_eq!(registry.stream_ids(), vec![0, 1, 2]);

    wait_until(|| received.lock().iter().all(|frames| frames.len() >= 5)).await;
    registry.shutdown();

    for (id, frames) in received.lock().iter().enumerate() {
        for (seq, frame) in frames.iter().enumerate() {
            assert_eq!(frame, &format!("{id}:{seq}"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_channel_reports_lifecycle() {
    let server = spawn_frame_server().await;
    let registry = StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::from_endpoint(server),
    );

    let token = StreamToken::new(11, 0);
    registry.subscribe(&Handle::current(), token, |_frame: Bytes| {}).unwrap();

    let mut state = registry.connection_state(11).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("never connected")
    .unwrap();

    registry.unsubscribe(&token);
    assert_eq!(*state.borrow_and_update(), ConnectionState::Stopped);
    assert!(registry.connection_state(11).is_none());
}

/// Blocks the calling thread until `condition` holds or two seconds pass
fn spin_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_unsubscribes_its_own_stream() {
    let server = spawn_frame_server().await;
    let registry = Arc::new(StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::from_endpoint(server),
    ));

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let weak: Weak<StreamSubscriptionRegistry> = Arc::downgrade(&registry);
    let token = StreamToken::new(13, 0);
    registry
        .subscribe(&Handle::current(), token, move |_frame: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(registry) = weak.upgrade() {
                registry.unsubscribe(&token);
            }
        })
        .unwrap();

    wait_until(|| count.load(Ordering::SeqCst) >= 1 && registry.is_empty()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_unsubscribe_each_other() {
    let server = spawn_frame_server().await;
    let registry = Arc::new(StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::from_endpoint(server),
    ));

    let entered = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let pairs = [
        (StreamToken::new(21, 0), StreamToken::new(22, 0)),
        (StreamToken::new(22, 0), StreamToken::new(21, 0)),
    ];
    for (token, other) in pairs {
        let entered = Arc::clone(&entered);
        let completed = Arc::clone(&completed);
        let weak = Arc::downgrade(&registry);
        let first = AtomicBool::new(true);
        registry
            .subscribe(&Handle::current(), token, move |_frame: Bytes| {
                if !first.swap(false, Ordering::SeqCst) {
                    return;
                }
                // Both handlers are mid-callback before either unsubscribes
                entered.fetch_add(1, Ordering::SeqCst);
                spin_until(|| entered.load(Ordering::SeqCst) == 2);
                if let Some(registry) = weak.upgrade() {
                    registry.unsubscribe(&other);
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until(|| completed.load(Ordering::SeqCst) == 2).await;
    assert_eq!(entered.load(Ordering::SeqCst), 2);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribe_waits_for_slow_handler() {
    let server = spawn_frame_server().await;
    let registry = StreamSubscriptionRegistry::with_connector(
        fast_connector(),
        FallbackAddress::from_endpoint(server),
    );

    let in_flight = Arc::new(AtomicBool::new(false));
    let starts = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (Arc::clone(&in_flight), Arc::clone(&starts));
    let token = StreamToken::new(17, 0);
    registry
        .subscribe(&Handle::current(), token, move |_frame: Bytes| {
            flag.store(true, Ordering::SeqCst);
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            flag.store(false, Ordering::SeqCst);
        })
        .unwrap();

    wait_until(|| in_flight.load(Ordering::SeqCst)).await;
    registry.unsubscribe(&token);

    assert!(!in_flight.load(Ordering::SeqCst));
    let started = starts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(starts.load(Ordering::SeqCst), started);
    assert!(registry.is_empty());
}
