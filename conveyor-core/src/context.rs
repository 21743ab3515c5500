use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::CancelReason;

/// Shared, set-once cancellation signal of one pipeline run.
///
/// The first reason recorded wins; later calls only re-cancel the token,
/// which is a no-op.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal tied to a parent scope: cancelling `parent` cancels this one.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Returns true when this call recorded the reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Cancel `signal` with [`CancelReason::Deadline`] once `budget` elapses.
/// The timer exits early if the signal is cancelled for another reason.
pub fn spawn_deadline(signal: CancelSignal, budget: Duration) -> JoinHandle<()> {
    let deadline = Instant::now() + budget;
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if signal.cancel(CancelReason::Deadline) {
                    log::warn!("deadline of {:?} exceeded, cancelling", budget);
                }
            }
        }
    })
}

/// Request-scoped data handed to every `Stage::process` call.
#[derive(Clone, Debug)]
pub struct StageContext {
    pipeline_id: Arc<str>,
    stage: Arc<str>,
    stage_index: usize,
    worker: usize,
    item_id: Option<u64>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(pipeline_id: &str, stage: &str, stage_index: usize, cancel: CancellationToken) -> Self {
        Self {
            pipeline_id: Arc::from(pipeline_id),
            stage: Arc::from(stage),
            stage_index,
            worker: 0,
            item_id: None,
            deadline: None,
            cancel,
        }
    }

    /// Context for calling a stage outside any pipeline (tests, one-off calls).
    pub fn detached(stage: &str) -> Self {
        Self::new("detached", stage, 0, CancellationToken::new())
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn for_item(&self, item_id: u64) -> Self {
        let mut ctx = self.clone();
        ctx.item_id = Some(item_id);
        ctx
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn item_id(&self) -> Option<u64> {
        self.item_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the pipeline deadline, `None` when there is none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Long-running `process` implementations may poll this to stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod context_test;
