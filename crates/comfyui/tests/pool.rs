//! Health checks and selection across several fake backends.

use std::time::{Duration, Instant};

use genorch_comfyui::fake::FakeComfyUI;
use genorch_comfyui::pool::{PoolSettings, ServerPool};
use genorch_comfyui::retry::RetryPolicy;
use genorch_core::backend::{BackendDescriptor, BackendHealth};

fn settings(ping_timeout: Duration) -> PoolSettings {
    PoolSettings {
        policy: RetryPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 0,
            base_delay: Duration::from_millis(10),
        },
        ping_timeout,
        stale_after: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn slow_backend_does_not_delay_the_others() {
    let fast = FakeComfyUI::spawn().await.unwrap();
    let slow = FakeComfyUI::spawn().await.unwrap();
    slow.set_ping_delay(Duration::from_secs(5));

    let pool = ServerPool::new(
        vec![
            BackendDescriptor::local(fast.base_url(), 0),
            BackendDescriptor::remote(1, slow.base_url(), 0),
        ],
        settings(Duration::from_millis(300)),
    )
    .unwrap();

    let started = Instant::now();
    pool.check_health().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let local = pool.status("local").await.unwrap();
    assert_eq!(local.health, BackendHealth::Healthy);
    assert_eq!(local.queue_depth, Some(0));
    assert!(local.last_checked_at.is_some());

    let remote = pool.status("remote-1").await.unwrap();
    assert_eq!(remote.health, BackendHealth::Unhealthy);
    assert!(remote.last_error.is_some());

    assert_eq!(pool.select_best().await.unwrap().id, "local");
}

#[tokio::test]
async fn all_unhealthy_means_no_candidate() {
    let a = FakeComfyUI::spawn().await.unwrap();
    let b = FakeComfyUI::spawn().await.unwrap();
    a.set_down(true);
    b.set_down(true);

    let pool = ServerPool::new(
        vec![
            BackendDescriptor::local(a.base_url(), 0),
            BackendDescriptor::remote(1, b.base_url(), 0),
        ],
        settings(Duration::from_millis(500)),
    )
    .unwrap();

    assert!(pool.select_best_fresh().await.is_none());
    assert!(!pool.is_stale().await);
}

#[tokio::test]
async fn shallower_queue_wins() {
    let busy = FakeComfyUI::spawn().await.unwrap();
    let idle = FakeComfyUI::spawn().await.unwrap();
    busy.set_phantom_depth(3);

    let pool = ServerPool::new(
        vec![
            BackendDescriptor::local(busy.base_url(), 0),
            BackendDescriptor::remote(1, idle.base_url(), 5),
        ],
        settings(Duration::from_millis(500)),
    )
    .unwrap();

    let best = pool.select_best_fresh().await.unwrap();
    assert_eq!(best.id, "remote-1");
    assert_eq!(pool.status("local").await.unwrap().queue_depth, Some(3));
}

#[tokio::test]
async fn recovery_is_picked_up_by_next_check() {
    let fake = FakeComfyUI::spawn().await.unwrap();
    fake.set_down(true);

    let pool = ServerPool::new(
        vec![BackendDescriptor::local(fake.base_url(), 0)],
        settings(Duration::from_millis(500)),
    )
    .unwrap();

    pool.check_health().await;
    assert!(pool.select_best().await.is_none());

    fake.set_down(false);
    pool.check_health().await;
    assert_eq!(pool.select_best().await.unwrap().id, "local");
}
