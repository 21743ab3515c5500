use std::{sync::Arc, time::Duration};

use super::{ErrorPolicy, FnStage, SharedStage, Stage, StageInput, StageTask};
use crate::{
    context::{CancelSignal, StageContext},
    error::{CancelReason, ItemError},
    item::{Envelope, EnvelopeReceiver, channel},
};

fn double() -> SharedStage<u64> {
    Arc::new(FnStage::new("double", |_ctx: &StageContext, n: u64| Ok(n * 2)))
}

fn task(stage: SharedStage<u64>, policy: ErrorPolicy, signal: &CancelSignal) -> StageTask<u64> {
    let ctx = StageContext::new("test", stage.name(), 0, signal.token().clone());
    StageTask::new(stage, ctx, policy, signal.clone())
}

fn feed(values: &[u64]) -> EnvelopeReceiver<u64> {
    let (tx, rx) = channel(values.len().max(1));
    for (i, v) in values.iter().enumerate() {
        tx.try_send(Envelope::new(i as u64, *v)).unwrap();
    }
    rx
}

async fn drain(mut rx: EnvelopeReceiver<u64>) -> Vec<Envelope<u64>> {
    let mut out = Vec::new();
    while let Some(envelope) = rx.recv().await {
        out.push(envelope);
    }
    out
}

#[test]
fn test_fn_stage_process() {
    let stage = FnStage::new("square", |_ctx: &StageContext, n: i64| Ok(n * n));
    assert_eq!(stage.name(), "square");
    let ctx = StageContext::detached("square");
    assert_eq!(stage.process(&ctx, 7).unwrap(), 49);
}

#[tokio::test]
async fn test_single_worker_preserves_order() {
    let signal = CancelSignal::new();
    let (rx, handle) = task(double(), ErrorPolicy::Forward, &signal)
        .spawn(StageInput::Owned(feed(&[1, 2, 3, 4, 5])), 2);

    let values: Vec<u64> = drain(rx)
        .await
        .into_iter()
        .map(|e| e.into_result().value.unwrap())
        .collect();
    assert_eq!(values, vec![2, 4, 6, 8, 10]);

    let summary = handle.await.unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.forwarded, 5);
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn test_errors_are_forwarded_as_data() {
    let signal = CancelSignal::new();
    let stage: SharedStage<u64> = Arc::new(FnStage::new("odd-only", |_ctx: &StageContext, n: u64| {
        if n % 2 == 0 {
            anyhow::bail!("even input {}", n);
        }
        Ok(n)
    }));
    let (rx, handle) = task(stage, ErrorPolicy::Forward, &signal)
        .spawn(StageInput::Owned(feed(&[1, 2, 3, 4])), 4);

    let results: Vec<_> = drain(rx).await.into_iter().map(|e| e.into_result()).collect();
    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert!(!results[1].is_ok());
    assert_eq!(results[1].item_id, 1);
    let message = results[1].error.as_ref().unwrap().to_string();
    assert_eq!(message, "stage odd-only failed: even input 2");
    assert!(results[2].is_ok());
    assert!(!results[3].is_ok());

    let summary = handle.await.unwrap();
    assert_eq!(summary.failed, 2);
    assert!(!signal.is_cancelled());
}

#[tokio::test]
async fn test_panic_becomes_error_result() {
    let signal = CancelSignal::new();
    let stage: SharedStage<u64> = Arc::new(FnStage::new("fragile", |_ctx: &StageContext, n: u64| {
        if n == 3 {
            panic!("cannot handle {}", n);
        }
        Ok(n + 100)
    }));
    let (rx, handle) = task(stage, ErrorPolicy::Forward, &signal)
        .spawn(StageInput::Owned(feed(&[1, 2, 3, 4])), 4);

    let results: Vec<_> = drain(rx).await.into_iter().map(|e| e.into_result()).collect();
    assert_eq!(results.len(), 4);
    match &results[2].error {
        Some(ItemError::Panicked { stage, message }) => {
            assert_eq!(stage, "fragile");
            assert_eq!(message, "cannot handle 3");
        }
        other => panic!("expected panic error, got {:?}", other),
    }
    assert_eq!(results[3].value, Some(104));
    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn test_fatal_error_cancels_pipeline() {
    let signal = CancelSignal::new();
    let stage: SharedStage<u64> = Arc::new(FnStage::new("strict", |_ctx: &StageContext, n: u64| {
        if n == 5 {
            anyhow::bail!("bad item");
        }
        Ok(n)
    }));
    let (rx, handle) = task(stage, ErrorPolicy::Fatal, &signal)
        .spawn(StageInput::Owned(feed(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])), 16);

    let forwarded = drain(rx).await;
    assert!(forwarded.len() <= 4);
    assert!(forwarded.iter().all(|e| e.is_ok()));

    let summary = handle.await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(
        signal.reason(),
        Some(CancelReason::FatalStage {
            stage: "strict".to_string(),
            item_id: 4,
            message: "stage strict failed: bad item".to_string(),
        })
    );
}

#[tokio::test]
async fn test_failed_envelopes_pass_through_untouched() {
    let signal = CancelSignal::new();
    let (tx, rx) = channel(2);
    tx.try_send(Envelope::from_parts(
        0,
        Err(ItemError::Aborted {
            stage: "upstream".to_string(),
        }),
        None,
    ))
    .unwrap();
    tx.try_send(Envelope::new(1, 21)).unwrap();
    drop(tx);

    let (out, handle) = task(double(), ErrorPolicy::Fatal, &signal).spawn(StageInput::Owned(rx), 2);
    let results: Vec<_> = drain(out).await.into_iter().map(|e| e.into_result()).collect();
    assert_eq!(results[0].error.as_ref().unwrap().stage(), "upstream");
    assert_eq!(results[1].value, Some(42));
    // already-failed items never trigger the fatal policy
    assert!(!signal.is_cancelled());
    assert_eq!(handle.await.unwrap().passed_through, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_unblocks_waiting_reader() {
    let signal = CancelSignal::new();
    let (_tx, rx) = channel::<u64>(1);
    let (mut out, handle) = task(double(), ErrorPolicy::Forward, &signal).spawn(StageInput::Owned(rx), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());
    signal.cancel(CancelReason::Requested);

    let summary = tokio::time::timeout(Duration::from_millis(100), handle)
        .await
        .expect("stage read must unblock on cancel")
        .unwrap();
    assert!(summary.cancelled);
    assert!(out.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_unblocks_waiting_writer() {
    let signal = CancelSignal::new();
    let (tx, rx) = channel::<u64>(8);
    for i in 0..8 {
        tx.try_send(Envelope::new(i, i)).unwrap();
    }
    // output capacity 1 and nobody reading: the runner blocks on send
    let (_out, handle) = task(double(), ErrorPolicy::Forward, &signal).spawn(StageInput::Owned(rx), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    signal.cancel(CancelReason::Requested);

    let summary = tokio::time::timeout(Duration::from_millis(100), handle)
        .await
        .expect("stage write must unblock on cancel")
        .unwrap();
    assert_eq!(summary.forwarded, 1);
    drop(tx);
}

#[tokio::test]
async fn test_context_reaches_process() {
    let signal = CancelSignal::new();
    let stage: SharedStage<u64> = Arc::new(FnStage::new("ids", |ctx: &StageContext, _n: u64| {
        Ok(ctx.item_id().unwrap_or(u64::MAX) * 10 + ctx.stage_index() as u64)
    }));
    let ctx = StageContext::new("test", "ids", 2, signal.token().clone());
    let runner = StageTask::new(stage, ctx, ErrorPolicy::Forward, signal.clone());
    let (rx, _) = runner.spawn(StageInput::Owned(feed(&[9, 9, 9])), 3);

    let values: Vec<u64> = drain(rx)
        .await
        .into_iter()
        .map(|e| e.into_result().value.unwrap())
        .collect();
    assert_eq!(values, vec![2, 12, 22]);
}
