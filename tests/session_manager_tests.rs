//! Integration tests for the session manager

use flightdeck::agent::memory::MemoryConnector;
use flightdeck::agent::TargetId;
use flightdeck::session::{SessionManager, SessionManagerConfig};
use flightdeck::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::timeout;

fn manager_with(
    targets: &[&str],
    config: SessionManagerConfig,
) -> (Arc<MemoryConnector>, Arc<SessionManager>) {
    let connector = Arc::new(MemoryConnector::new());
    for target in targets {
        connector.add_target(*target);
    }
    let manager = Arc::new(SessionManager::new(connector.clone(), config));
    (connector, manager)
}

fn manager(targets: &[&str]) -> (Arc<MemoryConnector>, Arc<SessionManager>) {
    manager_with(targets, SessionManagerConfig::default())
}

#[tokio::test]
async fn test_session_reused_across_tasks() {
    let (connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");

    for _ in 0..3 {
        let recordings = manager
            .run(&target, |session| async move { session.list_recordings().await })
            .await
            .unwrap();
        assert!(recordings.is_empty());
    }

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(manager.cached_targets(), vec![target]);
}

#[tokio::test]
async fn test_same_target_tasks_never_overlap() {
    let (_connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let target = target.clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            manager
                .run(&target, |_session| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_targets_overlap() {
    let (_connector, manager) = manager(&["alpha:9091", "beta:9091"]);
    let barrier = Arc::new(Barrier::new(2));

    let tasks = ["alpha:9091", "beta:9091"].map(|id| {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            manager
                .run(&TargetId::from(id), |_session| async move {
                    // Both tasks must be inside their leases at once
                    barrier.wait().await;
                    Ok(())
                })
                .await
        })
    });

    for task in tasks {
        timeout(Duration::from_secs(2), task)
            .await
            .expect("tasks for different targets should run concurrently")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_open_failure_is_connection_unavailable() {
    let (connector, manager) = manager(&[]);
    let result = manager
        .run(&TargetId::from("nowhere:9091"), |_session| async move {
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(Error::ConnectionUnavailable { .. })));
    assert!(manager.cached_targets().is_empty());
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_task_error_propagates_and_session_survives() {
    let (connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");

    let result: Result<(), _> = manager
        .run(&target, |_session| async move {
            Err(Error::NameCollision {
                name: "rec1".to_string(),
            })
        })
        .await;
    assert!(matches!(result, Err(Error::NameCollision { ref name }) if name == "rec1"));

    manager
        .run(&target, |_session| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_broken_session_is_discarded() {
    let (connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");
    let memory_target = connector.target(&target).unwrap();

    manager
        .run(&target, |_session| async move {
            memory_target.sever();
            Ok(())
        })
        .await
        .unwrap();
    assert!(manager.cached_targets().is_empty());

    manager
        .run(&target, |session| async move { session.list_recordings().await })
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_disconnected_cached_session_replaced() {
    let (connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");
    let memory_target = connector.target(&target).unwrap();

    manager
        .run(&target, |_session| async move { Ok(()) })
        .await
        .unwrap();
    memory_target.sever();

    // The cached session reports itself disconnected and is replaced
    // before the task runs.
    manager
        .run(&target, |session| async move { session.list_recordings().await })
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_idle_sessions_evicted() {
    let (connector, manager) = manager_with(
        &["localhost:9091"],
        SessionManagerConfig {
            idle_timeout: Duration::ZERO,
            lease_timeout: None,
        },
    );
    let target = TargetId::from("localhost:9091");

    manager
        .run(&target, |_session| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(manager.evict_idle().await, 1);
    assert!(manager.cached_targets().is_empty());
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_lease_timeout_discards_session() {
    let (connector, manager) = manager_with(
        &["localhost:9091"],
        SessionManagerConfig {
            idle_timeout: Duration::from_secs(90),
            lease_timeout: Some(Duration::from_millis(50)),
        },
    );
    let target = TargetId::from("localhost:9091");

    let result = manager
        .run(&target, |_session| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(Error::LeaseTimeout { .. })));
    assert_eq!(connector.disconnect_count(), 1);

    // A waiter is not stalled by the stuck task
    manager
        .run(&target, |_session| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_explicit_disconnect() {
    let (connector, manager) = manager(&["localhost:9091"]);
    let target = TargetId::from("localhost:9091");

    manager
        .run(&target, |_session| async move { Ok(()) })
        .await
        .unwrap();
    assert!(manager.disconnect(&target).await);
    assert!(!manager.disconnect(&target).await);
    assert!(manager.cached_targets().is_empty());
    assert_eq!(connector.disconnect_count(), 1);
}
