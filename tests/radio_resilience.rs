mod common;

use common::{manager, settle, text_packet, MockFactory, LOCAL_NODE};
use meshlink::radio::{DeviceEvent, DeviceStatus, SessionStatus, TransportKind};
use meshlink::ConnectError;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn subscribes_before_configuring() {
    let factory = MockFactory::new(true);
    let (mgr, model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;

    let device = factory.latest();
    assert_eq!(&device.calls()[..2], &["subscribe", "configure"]);
    let snap = mgr.snapshot();
    assert_eq!(snap.status, SessionStatus::Configured);
    assert_eq!(snap.transport_kind, Some(TransportKind::Tcp));
    assert_eq!(snap.my_node, Some(LOCAL_NODE));
    assert_eq!(model.my_node(), Some(LOCAL_NODE));
    // Network transports get the device-side heartbeat instead of explicit writes.
    assert_eq!(
        *device.heartbeat_interval.lock().unwrap(),
        Some(Duration::from_secs(300))
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_budget_is_spent() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;

    factory.fail_opens.store(true, Ordering::SeqCst);
    let lost_at = Instant::now();
    factory.latest().emit(DeviceEvent::TransportClosed {
        reason: "socket reset".into(),
    });
    settle(200_000).await;

    let opens = factory.open_times();
    assert_eq!(opens.len(), 6, "one connect plus five reconnect attempts");
    let mut prev = lost_at;
    let gaps: Vec<u64> = opens[1..]
        .iter()
        .map(|t| {
            let gap = t.duration_since(prev).as_secs();
            prev = *t;
            gap
        })
        .collect();
    assert_eq!(gaps, vec![2, 4, 8, 16, 32]);
    assert_eq!(factory.resumes.load(Ordering::SeqCst), 5);

    let snap = mgr.snapshot();
    assert_eq!(snap.status, SessionStatus::Disconnected);
    assert_eq!(snap.reconnect_attempt, 0);
    assert!(snap.last_error.is_some());
    assert!(mgr.device().is_none());
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_session_and_resets_attempts() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Serial, Some("/dev/ttyUSB0")).await.unwrap();
    settle(10).await;
    let first = factory.latest();

    first.emit(DeviceEvent::TransportClosed {
        reason: "unplugged".into(),
    });
    settle(1_000).await;
    assert_eq!(mgr.snapshot().status, SessionStatus::Reconnecting);
    assert_eq!(mgr.snapshot().reconnect_attempt, 1);
    assert!(first.closed.load(Ordering::SeqCst));

    settle(1_100).await;
    assert_eq!(factory.open_count(), 2);
    assert_eq!(factory.resumes.load(Ordering::SeqCst), 1);
    let snap = mgr.snapshot();
    assert_eq!(snap.status, SessionStatus::Configured);
    assert_eq!(snap.reconnect_attempt, 0);
    let second = factory.latest();
    assert_eq!(&second.calls()[..2], &["subscribe", "configure"]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_cancels_reconnect() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;

    factory.latest().emit(DeviceEvent::TransportClosed {
        reason: "reset".into(),
    });
    settle(500).await;
    mgr.disconnect().await;
    settle(120_000).await;

    assert_eq!(factory.open_count(), 1);
    assert_eq!(mgr.snapshot().status, SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn new_connect_supersedes_pending_reconnect() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;
    let gen_before = mgr.snapshot().generation;

    factory.latest().emit(DeviceEvent::TransportClosed {
        reason: "reset".into(),
    });
    settle(1_000).await;
    mgr.connect(TransportKind::Tcp, Some("10.0.0.10")).await.unwrap();
    settle(60_000).await;

    // The stale attempt woke at 2 s under an old generation and did nothing.
    assert_eq!(factory.open_count(), 2);
    assert_eq!(factory.resumes.load(Ordering::SeqCst), 0);
    let snap = mgr.snapshot();
    assert_eq!(snap.generation, gen_before + 1);
    assert_eq!(snap.status, SessionStatus::Configured);
}

#[tokio::test(start_paused = true)]
async fn failed_explicit_connect_is_reported_not_retried() {
    let factory = MockFactory::new(true);
    factory.fail_opens.store(true, Ordering::SeqCst);
    let (mgr, _model) = manager(factory.clone());

    let err = mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await;
    assert!(matches!(err, Err(ConnectError::Device(_))));
    settle(60_000).await;

    assert_eq!(factory.open_count(), 1);
    let snap = mgr.snapshot();
    assert_eq!(snap.status, SessionStatus::Disconnected);
    assert!(snap.last_error.unwrap().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn silence_goes_stale_then_dead() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;

    // Exactly at the 60 s threshold the link is still fresh; the next tick flags it.
    settle(60_000).await;
    assert_eq!(mgr.snapshot().status, SessionStatus::Configured);
    settle(16_000).await;
    assert_eq!(mgr.snapshot().status, SessionStatus::Stale);

    factory.latest().emit(DeviceEvent::MeshHeartbeat);
    settle(10).await;
    assert_eq!(mgr.snapshot().status, SessionStatus::Configured);

    // 120 s of silence after the heartbeat: treated as lost and reconnected.
    settle(140_000).await;
    assert_eq!(factory.open_count(), 2);
    assert_eq!(factory.resumes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn ble_heartbeats_every_thirty_seconds() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Ble, Some("AA:BB:CC:DD:EE:FF")).await.unwrap();
    settle(10).await;
    let device = factory.latest();

    settle(61_000).await;
    assert_eq!(device.heartbeats.load(Ordering::SeqCst), 2);
    assert!(device.heartbeat_interval.lock().unwrap().is_none());
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn ble_heartbeat_failure_triggers_reconnect() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Ble, Some("AA:BB:CC:DD:EE:FF")).await.unwrap();
    settle(10).await;
    let device = factory.latest();
    device.fail_heartbeat.store(true, Ordering::SeqCst);

    settle(31_000).await;
    assert_eq!(device.heartbeats.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.snapshot().status, SessionStatus::Reconnecting);
    assert!(mgr
        .snapshot()
        .last_error
        .unwrap()
        .contains("heartbeat failed"));

    settle(2_000).await;
    assert_eq!(factory.open_count(), 2);
    assert_eq!(mgr.snapshot().status, SessionStatus::Configured);
}

#[tokio::test(start_paused = true)]
async fn duplicate_packets_are_delivered_once() {
    let factory = MockFactory::new(true);
    let (mgr, model) = manager(factory.clone());
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;
    let device = factory.latest();

    device.emit(text_packet(77, 0x1234, "first"));
    device.emit(text_packet(77, 0x1234, "first"));
    // Id 0 is never assigned, so it is not deduplicated.
    device.emit(text_packet(0, 0x1234, "a"));
    device.emit(text_packet(0, 0x1234, "b"));
    settle(10).await;

    let texts: Vec<String> = model.messages().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["first", "a", "b"]);
    let node = model.node(0x1234).unwrap();
    assert_eq!(node.snr, Some(8.0));
    assert_eq!(node.hops_away, Some(0));
}

#[tokio::test(start_paused = true)]
async fn device_reported_disconnect_ends_session() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    mgr.connect(TransportKind::Serial, Some("/dev/ttyACM0")).await.unwrap();
    settle(10).await;
    let device = factory.latest();

    device.emit(DeviceEvent::Status(DeviceStatus::Disconnected));
    settle(60_000).await;

    assert_eq!(mgr.snapshot().status, SessionStatus::Disconnected);
    assert!(device.closed.load(Ordering::SeqCst));
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_published_on_watch() {
    let factory = MockFactory::new(true);
    let (mgr, _model) = manager(factory.clone());
    let mut watch = mgr.watch();
    mgr.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();

    let configured = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if watch.borrow_and_update().status == SessionStatus::Configured {
                return true;
            }
            if watch.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap();
    assert!(configured);
}
