use std::{any::Any, marker::PhantomData, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    context::{CancelSignal, StageContext},
    error::{CancelReason, ItemError},
    item::{Envelope, EnvelopeReceiver, EnvelopeSender, send_cancellable},
};

/// A transformation applied to every item that reaches it.
///
/// `process` runs on tokio's blocking pool, so it may do CPU-bound or
/// blocking work. An `Err` is reported for that item only; a panic is
/// caught and reported the same way.
pub trait Stage<T>: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn process(&self, ctx: &StageContext, item: T) -> anyhow::Result<T>;
}

pub type SharedStage<T> = Arc<dyn Stage<T>>;

/// Stage built from a closure.
pub struct FnStage<T, F> {
    name: String,
    f: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> FnStage<T, F>
where
    F: Fn(&StageContext, T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Stage<T> for FnStage<T, F>
where
    T: Send + 'static,
    F: Fn(&StageContext, T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, ctx: &StageContext, item: T) -> anyhow::Result<T> {
        (self.f)(ctx, item)
    }
}

/// What a failing item does to the rest of the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Forward the failure as an error result and keep going.
    #[default]
    Forward,
    /// Cancel the whole pipeline.
    Fatal,
}

/// Where a stage runner pulls items from.
pub enum StageInput<T> {
    Owned(EnvelopeReceiver<T>),
    /// One receiver shared by several workers; each item goes to exactly one.
    Shared(Arc<Mutex<EnvelopeReceiver<T>>>),
}

impl<T> StageInput<T> {
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        match self {
            StageInput::Owned(rx) => rx.recv().await,
            StageInput::Shared(rx) => rx.lock().await.recv().await,
        }
    }
}

/// Per-runner counters, logged when the runner exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub processed: u64,
    pub failed: u64,
    /// Items that arrived already failed and were forwarded untouched.
    pub passed_through: u64,
    pub forwarded: u64,
    pub cancelled: bool,
}

/// Drives one stage over one input: a single worker of the pipeline.
pub struct StageTask<T> {
    stage: SharedStage<T>,
    ctx: StageContext,
    policy: ErrorPolicy,
    signal: CancelSignal,
}

impl<T> Clone for StageTask<T> {
    fn clone(&self) -> Self {
        Self {
            stage: Arc::clone(&self.stage),
            ctx: self.ctx.clone(),
            policy: self.policy,
            signal: self.signal.clone(),
        }
    }
}

impl<T: Send + 'static> StageTask<T> {
    pub fn new(
        stage: SharedStage<T>,
        ctx: StageContext,
        policy: ErrorPolicy,
        signal: CancelSignal,
    ) -> Self {
        Self {
            stage,
            ctx,
            policy,
            signal,
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub(crate) fn for_worker(&self, worker: usize) -> Self {
        let mut task = self.clone();
        task.ctx = task.ctx.with_worker(worker);
        task
    }

    /// Spawn the runner on its own task with a fresh output channel.
    pub fn spawn(
        self,
        input: StageInput<T>,
        capacity: usize,
    ) -> (EnvelopeReceiver<T>, tokio::task::JoinHandle<StageSummary>) {
        let (tx, rx) = crate::item::channel(capacity);
        let handle = tokio::spawn(async move { self.run(input, tx).await });
        (rx, handle)
    }

    /// Consume `input` until it is exhausted or the pipeline is cancelled.
    ///
    /// `output` is dropped on return, which closes it once every other
    /// worker writing to it has returned as well.
    pub async fn run(self, mut input: StageInput<T>, output: EnvelopeSender<T>) -> StageSummary {
        let token = self.signal.token().clone();
        let mut summary = StageSummary::default();
        log::debug!(
            "stage {}[{}]: started",
            self.stage.name(),
            self.ctx.worker()
        );

        loop {
            let envelope = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = input.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if token.is_cancelled() {
                break;
            }
            let Some(envelope) = self.process(envelope, &mut summary).await else {
                break;
            };
            if token.is_cancelled() {
                break;
            }
            if send_cancellable(&output, envelope, &token).await.is_err() {
                break;
            }
            summary.forwarded += 1;
        }

        drop(output);
        summary.cancelled = token.is_cancelled();
        log::debug!(
            "stage {}[{}]: finished {:?}",
            self.stage.name(),
            self.ctx.worker(),
            summary
        );
        summary
    }

    /// Run `process` for one envelope. `None` means the item was abandoned
    /// because the pipeline is cancelled.
    async fn process(
        &self,
        envelope: Envelope<T>,
        summary: &mut StageSummary,
    ) -> Option<Envelope<T>> {
        let (id, payload, guard) = envelope.into_parts();
        let value = match payload {
            Ok(value) => value,
            Err(e) => {
                summary.passed_through += 1;
                return Some(Envelope::from_parts(id, Err(e), guard));
            }
        };

        let name = self.stage.name().to_string();
        let stage = Arc::clone(&self.stage);
        let ctx = self.ctx.for_item(id);
        let handle = tokio::task::spawn_blocking(move || stage.process(&ctx, value));

        let joined = tokio::select! {
            biased;
            // the blocking call keeps running detached; its output is dropped
            _ = self.signal.cancelled() => return None,
            joined = handle => joined,
        };
        summary.processed += 1;

        let payload = match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ItemError::Process {
                stage: name,
                source,
            }),
            Err(e) if e.is_panic() => Err(ItemError::Panicked {
                stage: name,
                message: panic_message(e.into_panic()),
            }),
            Err(_) => Err(ItemError::Aborted { stage: name }),
        };

        if let Err(e) = &payload {
            summary.failed += 1;
            // panics stay per-item under every policy
            if self.policy == ErrorPolicy::Fatal && matches!(e, ItemError::Process { .. }) {
                log::error!("stage {}: item {} failed fatally: {}", self.stage.name(), id, e);
                self.signal.cancel(CancelReason::FatalStage {
                    stage: self.stage.name().to_string(),
                    item_id: id,
                    message: e.to_string(),
                });
                return None;
            }
            log::warn!("stage {}: item {} failed: {}", self.stage.name(), id, e);
        } else {
            log::trace!("stage {}: item {} done", self.stage.name(), id);
        }

        Some(Envelope::from_parts(id, payload, guard))
    }
}

fn panic_message(payload: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;
