use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::MockRealtimeTransport;
use super::*;
use crate::config::{RealtimeConfig, RetrySettings};
use crate::errors::{RemoteError, SyncError};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::observability::SyncMetrics;
use crate::remote::memory::{MemoryDataService, MemoryTransport};
use crate::remote::{DataService, Table};

fn realtime_config() -> RealtimeConfig {
    RealtimeConfig {
        dedup_capacity: 100,
        dedup_ttl_secs: 300,
        resubscribe: RetrySettings {
            timeout_ms: 100,
            max_retries: 2,
            base_delay_ms: 10,
            jitter_ms: 0,
            ..RetrySettings::default()
        },
    }
}

fn executor() -> RequestExecutor {
    let policy = RetryPolicy::default()
        .with_timeout(Duration::from_millis(100))
        .with_base_delay(Duration::from_millis(10))
        .without_jitter();
    RequestExecutor::new(policy, Arc::new(SyncMetrics::new()))
}

fn manager(transport: Arc<MemoryTransport>, data: Option<Arc<MemoryDataService>>) -> RealtimeChannelManager {
    RealtimeChannelManager::new(
        executor(),
        transport,
        data.map(|d| d as Arc<dyn DataService>),
        &realtime_config(),
    )
}

/// Let spawned pumps drain whatever is ready
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn drain(events: &mut mpsc::UnboundedReceiver<RealtimeNotice>) -> Vec<ChangeEvent> {
    let mut received = Vec::new();
    while let Ok(notice) = events.try_recv() {
        match notice {
            RealtimeNotice::Event(event) => received.push(event),
            RealtimeNotice::Error(err) => panic!("unexpected subscription error: {err}"),
        }
    }
    received
}

fn ids(events: &[ChangeEvent]) -> Vec<&str> {
    events.iter().map(|event| event.id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_subscribers_share_one_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");

    let mut board = manager.subscribe(resource.clone()).await.unwrap();
    let mut panel = manager.subscribe(resource.clone()).await.unwrap();
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(manager.ref_count(&resource).await, 2);

    transport.push(&resource, ChangeEvent::insert("m-1", json!({"id": "m-1"})));
    settle().await;
    assert_eq!(ids(&drain(&mut board.events)), vec!["m-1"]);
    assert_eq!(ids(&drain(&mut panel.events)), vec!["m-1"]);

    manager.unsubscribe(board.handle).await;
    assert_eq!(transport.close_calls(), 0);
    assert_eq!(transport.open_channels(&resource), 1);

    transport.push(&resource, ChangeEvent::insert("m-2", json!({"id": "m-2"})));
    settle().await;
    assert_eq!(ids(&drain(&mut panel.events)), vec!["m-2"]);

    manager.unsubscribe(panel.handle).await;
    assert_eq!(transport.close_calls(), 1);
    assert_eq!(transport.open_channels(&resource), 0);
    assert_eq!(manager.active_channels().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscribes_open_once() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task("7");

    let (a, b) = tokio::join!(
        manager.subscribe(resource.clone()),
        manager.subscribe(resource.clone())
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(manager.ref_count(&resource).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_push_delivered_once() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    let event = ChangeEvent::insert("m-1", json!({"id": "m-1", "text": "hello"}));
    transport.push(&resource, event.clone());
    transport.push(&resource, event);
    transport.push(&resource, ChangeEvent::insert("m-2", json!({"id": "m-2"})));
    settle().await;

    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-1", "m-2"]);
    let info = manager.channel_info(&resource).await.unwrap();
    assert_eq!(info.last_seen_id.as_deref(), Some("m-2"));
}

#[tokio::test(start_paused = true)]
async fn test_local_echo_suppresses_server_push() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    let event = ChangeEvent::insert("m-9", json!({"id": "m-9"}));
    manager.publish_local(&resource, event.clone()).await;
    transport.push(&resource, event);
    settle().await;

    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-9"]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_from_last_seen_id() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_resume_supported(true);
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    transport.push(&resource, ChangeEvent::insert("m-1", json!({"id": "m-1"})));
    settle().await;
    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-1"]);

    // m-2 lands while the channel is down
    transport.disconnect(&resource);
    transport.push(&resource, ChangeEvent::insert("m-2", json!({"id": "m-2"})));
    settle().await;

    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-2"]);
    assert_eq!(transport.resume_requests(), vec![None, Some("m-1".to_string())]);
    assert_eq!(manager.ref_count(&resource).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_without_resume_runs_full_resync() {
    let transport = Arc::new(MemoryTransport::new());
    let data = Arc::new(MemoryDataService::with_change_feed(transport.clone()));
    let executor = executor();
    let manager = RealtimeChannelManager::new(
        executor.clone(),
        transport.clone(),
        Some(data.clone() as Arc<dyn DataService>),
        &realtime_config(),
    );
    let resource = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    data.insert(Table::ChatMessages, json!({"id": "m-1", "task_id": "42"}))
        .await
        .unwrap();
    settle().await;
    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-1"]);

    transport.disconnect(&resource);
    data.insert(Table::ChatMessages, json!({"id": "m-2", "task_id": "42"}))
        .await
        .unwrap();
    data.insert(Table::ChatMessages, json!({"id": "other", "task_id": "43"}))
        .await
        .unwrap();
    settle().await;

    let resynced = drain(&mut sub.events);
    assert_eq!(ids(&resynced), vec!["m-2"]);
    assert_eq!(resynced[0].kind, ChangeKind::Snapshot);

    let stats = executor.metrics().snapshot();
    assert_eq!(stats.resyncs, 1);
    // m-1 came back in the snapshot and was dropped
    assert_eq!(stats.duplicates_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_resubscribe_reports_error_once() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");

    let errors = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(AtomicUsize::new(0));
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let handle = manager
        .subscribe_with(
            resource.clone(),
            {
                let events = events.clone();
                move |_event| {
                    events.fetch_add(1, Ordering::SeqCst);
                }
            },
            {
                let errors = errors.clone();
                move |err: SyncError| {
                    errors.fetch_add(1, Ordering::SeqCst);
                    let _ = error_tx.send(err);
                }
            },
        )
        .await
        .unwrap();

    transport.push(&resource, ChangeEvent::insert("m-1", json!({"id": "m-1"})));
    settle().await;
    assert_eq!(events.load(Ordering::SeqCst), 1);

    transport.fail_next_opens(10);
    transport.disconnect(&resource);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = error_rx.recv().await.unwrap();
    assert!(matches!(err, SyncError::Subscription { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(manager.active_channels().await, 0);
    // initial open plus one attempt and two retries
    assert_eq!(transport.open_calls(), 4);

    // releasing the dead handle is harmless
    manager.unsubscribe(handle).await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_open_failure_surfaces_subscription_error() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next_opens(10);
    let manager = manager(transport.clone(), None);

    let err = manager
        .subscribe(ResourceId::task_chat("42"))
        .await
        .unwrap_err();

    match err {
        SyncError::Subscription { resource, reason } => {
            assert_eq!(resource, "chat_messages?task_id=eq.42");
            assert!(reason.contains("3 attempts"));
        }
        other => panic!("expected Subscription error, got {other:?}"),
    }
    assert_eq!(manager.active_channels().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_every_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);

    let _chat = manager.subscribe(ResourceId::task_chat("1")).await.unwrap();
    let _row = manager.subscribe(ResourceId::task("1")).await.unwrap();
    assert_eq!(manager.active_channels().await, 2);

    manager.shutdown().await;
    assert_eq!(manager.active_channels().await, 0);
    assert_eq!(transport.close_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_map_to_remote() {
    let mut transport = MockRealtimeTransport::new();
    transport
        .expect_open()
        .returning(|_, _| Err(RemoteError::Unauthorized("jwt expired".into())));

    let manager = RealtimeChannelManager::new(executor(), Arc::new(transport), None, &realtime_config());
    let err = manager.subscribe(ResourceId::task("9")).await.unwrap_err();
    assert!(matches!(err, SyncError::Subscription { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_resync_delivers_rows_changed_during_gap() {
    let transport = Arc::new(MemoryTransport::new());
    let data = Arc::new(MemoryDataService::with_change_feed(transport.clone()));
    let manager = manager(transport.clone(), Some(data.clone()));
    let resource = ResourceId::task("t-1");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    data.insert(Table::Tasks, json!({"id": "t-1", "status": "pending"}))
        .await
        .unwrap();
    settle().await;
    assert_eq!(ids(&drain(&mut sub.events)), vec!["t-1"]);

    // the status change happens while nothing is listening
    transport.disconnect(&resource);
    data.update(Table::Tasks, &resource.filter, json!({"status": "in_progress"}))
        .await
        .unwrap();
    settle().await;

    let resynced = drain(&mut sub.events);
    assert_eq!(resynced.len(), 1);
    assert_eq!(resynced[0].kind, ChangeKind::Snapshot);
    assert_eq!(resynced[0].record["status"], "in_progress");

    // unchanged row on the next resync
    transport.disconnect(&resource);
    settle().await;
    assert!(drain(&mut sub.events).is_empty());
    assert_eq!(data.select_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_transport_backs_off_then_fails_once() {
    let opens = Arc::new(AtomicUsize::new(0));
    let mut transport = MockRealtimeTransport::new();
    transport.expect_open().returning({
        let opens = opens.clone();
        move |_, _| {
            let n = opens.fetch_add(1, Ordering::SeqCst);
            // accepted, then closed straight away
            Ok(TransportChannel {
                channel_id: format!("ch-{n}"),
                resumed: false,
                messages: futures::stream::empty().boxed(),
            })
        }
    });
    transport.expect_close().returning(|_| Ok(()));

    let manager = RealtimeChannelManager::new(executor(), Arc::new(transport), None, &realtime_config());
    let mut sub = manager.subscribe(ResourceId::task_chat("42")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    // initial open plus max_retries resubscriptions
    assert_eq!(opens.load(Ordering::SeqCst), 3);
    match sub.events.try_recv() {
        Ok(RealtimeNotice::Error(SyncError::Subscription { reason, .. })) => {
            assert!(reason.contains("transport closed"));
        }
        other => panic!("expected one subscription error, got {other:?}"),
    }
    assert!(sub.events.try_recv().is_err());
    assert_eq!(manager.active_channels().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_open_does_not_stall_other_channels() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = manager(transport.clone(), None);
    let chat = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(chat.clone()).await.unwrap();

    transport.delay_next_open(Duration::from_millis(80));
    let opening = tokio::spawn({
        let manager = manager.clone();
        async move { manager.subscribe(ResourceId::task("42")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    transport.push(&chat, ChangeEvent::insert("m-1", json!({"id": "m-1"})));
    settle().await;
    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-1"]);
    assert_eq!(manager.ref_count(&chat).await, 1);
    assert!(!opening.is_finished());

    let row = opening.await.unwrap().unwrap();
    assert_eq!(manager.ref_count(row.handle.resource()).await, 1);
    assert_eq!(transport.open_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_local_echo_does_not_move_resume_point() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_resume_supported(true);
    let manager = manager(transport.clone(), None);
    let resource = ResourceId::task_chat("42");
    let mut sub = manager.subscribe(resource.clone()).await.unwrap();

    transport.push(&resource, ChangeEvent::insert("m-1", json!({"id": "m-1"})));
    settle().await;
    let echo = ChangeEvent::insert("m-9", json!({"id": "m-9"}));
    manager.publish_local(&resource, echo.clone()).await;
    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-1", "m-9"]);

    let info = manager.channel_info(&resource).await.unwrap();
    assert_eq!(info.last_seen_id.as_deref(), Some("m-1"));

    // m-2 was committed before our own m-9 reached the server
    transport.disconnect(&resource);
    transport.push(&resource, ChangeEvent::insert("m-2", json!({"id": "m-2"})));
    transport.push(&resource, echo);
    settle().await;

    assert_eq!(ids(&drain(&mut sub.events)), vec!["m-2"]);
    assert_eq!(transport.resume_requests(), vec![None, Some("m-1".to_string())]);
}
