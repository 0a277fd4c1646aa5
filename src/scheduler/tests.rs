//! Tests for the tokio scheduler.

use super::*;

fn expire(id: &str) -> ScheduledAction {
    ScheduledAction::ExpireAwaiting(id.to_string())
}

// ==================== TokioScheduler tests ====================

#[tokio::test(start_paused = true)]
async fn test_action_fires_after_delay() {
    let (scheduler, mut rx) = TokioScheduler::new(8);
    scheduler.schedule_once("k1", expire("a1"), Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rx.recv().await, Some(expire("a1")));
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_prevents_firing() {
    let (scheduler, mut rx) = TokioScheduler::new(8);
    scheduler.schedule_once("k1", expire("a1"), Duration::from_secs(60));

    assert!(scheduler.cancel("k1"));
    assert!(!scheduler.cancel("k1"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_replaces_timer() {
    let (scheduler, mut rx) = TokioScheduler::new(8);
    scheduler.schedule_once("k1", expire("first"), Duration::from_secs(10));
    scheduler.schedule_once("k1", expire("second"), Duration::from_secs(20));
    assert_eq!(scheduler.pending(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rx.recv().await, Some(expire("second")));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_unknown_key() {
    let (scheduler, _rx) = TokioScheduler::new(8);
    assert!(!scheduler.cancel("missing"));
}
