use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{CancelSignal, StageContext, spawn_deadline};
use crate::error::CancelReason;

#[test]
fn test_cancel_signal_first_reason_wins() {
    let signal = CancelSignal::new();
    assert!(!signal.is_cancelled());
    assert!(signal.reason().is_none());

    assert!(signal.cancel(CancelReason::Requested));
    assert!(!signal.cancel(CancelReason::Deadline));

    assert!(signal.is_cancelled());
    assert_eq!(signal.reason(), Some(CancelReason::Requested));
}

#[test]
fn test_cancel_signal_clones_share_state() {
    let signal = CancelSignal::new();
    let clone = signal.clone();
    clone.cancel(CancelReason::ForceTimeout);
    assert!(signal.is_cancelled());
    assert_eq!(signal.reason(), Some(CancelReason::ForceTimeout));
}

#[test]
fn test_child_signal_follows_parent() {
    let parent = CancellationToken::new();
    let signal = CancelSignal::child_of(&parent);
    parent.cancel();
    assert!(signal.is_cancelled());
    // nothing recorded a reason; the coordinator fills in Shutdown
    assert!(signal.reason().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_after_budget() {
    let signal = CancelSignal::new();
    let timer = spawn_deadline(signal.clone(), Duration::from_millis(500));

    tokio::time::sleep(Duration::from_millis(499)).await;
    assert!(!signal.is_cancelled());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(signal.is_cancelled());
    assert_eq!(signal.reason(), Some(CancelReason::Deadline));
    timer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exits_on_earlier_cancel() {
    let signal = CancelSignal::new();
    let timer = spawn_deadline(signal.clone(), Duration::from_secs(60));
    signal.cancel(CancelReason::Requested);
    timer.await.unwrap();
    assert_eq!(signal.reason(), Some(CancelReason::Requested));
}

#[tokio::test(start_paused = true)]
async fn test_stage_context_remaining_budget() {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let ctx = StageContext::new("p", "square", 1, CancellationToken::new())
        .with_worker(3)
        .with_deadline(Some(deadline));

    let item_ctx = ctx.for_item(9);
    assert_eq!(item_ctx.pipeline_id(), "p");
    assert_eq!(item_ctx.stage(), "square");
    assert_eq!(item_ctx.stage_index(), 1);
    assert_eq!(item_ctx.worker(), 3);
    assert_eq!(item_ctx.item_id(), Some(9));
    assert_eq!(ctx.item_id(), None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let remaining = item_ctx.remaining().unwrap();
    assert!(remaining <= Duration::from_millis(1500));
    assert!(remaining >= Duration::from_millis(1490));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(item_ctx.remaining(), Some(Duration::ZERO));
}

#[test]
fn test_detached_context_has_no_deadline() {
    let ctx = StageContext::detached("tokenize");
    assert_eq!(ctx.stage(), "tokenize");
    assert!(ctx.remaining().is_none());
    assert!(!ctx.is_cancelled());
}
